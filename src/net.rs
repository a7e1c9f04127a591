//! PTP multicast socket plumbing and interface selection.

use anyhow::{anyhow, Result};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};

use crate::ptp::PTP_PRIMARY_MULTICAST;

/// Pick an interface for the PTP port: the named one, or the first usable
/// IPv4 interface when none is given.
pub fn select_interface(name: Option<&str>) -> Result<(String, Ipv4Addr)> {
    let interfaces = if_addrs::get_if_addrs()
        .map_err(|e| anyhow!("cannot enumerate network interfaces: {}", e))?;

    let mut fallback = None;
    for iface in &interfaces {
        if iface.is_loopback() {
            continue;
        }
        let ip = match iface.addr.ip() {
            std::net::IpAddr::V4(v4) => v4,
            _ => continue,
        };
        match name {
            Some(wanted) if iface.name == wanted => return Ok((iface.name.clone(), ip)),
            Some(_) => continue,
            None => {
                if fallback.is_none() {
                    fallback = Some((iface.name.clone(), ip));
                }
            }
        }
    }

    match (name, fallback) {
        (Some(wanted), _) => Err(anyhow!("interface {} has no usable IPv4 address", wanted)),
        (None, Some(found)) => Ok(found),
        (None, None) => Err(anyhow!("no usable network interface found")),
    }
}

/// One of the two PTP sockets (event 319 / general 320), multicast-joined
/// and configured for link-local distribution.
pub fn create_multicast_socket(port: u16, interface_ip: Ipv4Addr) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;

    socket.set_reuse_address(true)?;

    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket.bind(&addr.into())?;

    let multi_addr: Ipv4Addr = PTP_PRIMARY_MULTICAST.parse()?;
    socket.join_multicast_v4(&multi_addr, &interface_ip)?;
    socket.set_multicast_if_v4(&interface_ip)?;
    socket.set_multicast_loop_v4(false)?;
    socket.set_multicast_ttl_v4(1)?;
    socket.set_nonblocking(true)?;

    Ok(socket.into())
}

/// MAC address from sysfs, for deriving the PTP clock identity.
#[cfg(unix)]
pub fn interface_mac(name: &str) -> Option<[u8; 6]> {
    let path = format!("/sys/class/net/{}/address", name);
    let text = std::fs::read_to_string(path).ok()?;
    parse_mac(text.trim())
}

fn parse_mac(text: &str) -> Option<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut parts = text.split(':');
    for byte in mac.iter_mut() {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(mac)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mac() {
        assert_eq!(
            parse_mac("aa:bb:cc:00:11:22"),
            Some([0xAA, 0xBB, 0xCC, 0x00, 0x11, 0x22])
        );
        assert_eq!(parse_mac("aa:bb:cc:00:11"), None);
        assert_eq!(parse_mac("aa:bb:cc:00:11:22:33"), None);
        assert_eq!(parse_mac("not a mac"), None);
        assert_eq!(parse_mac(""), None);
    }
}
