#![cfg(unix)]

//! RFC 2783 PPS device access (`/dev/ppsN`, Linux `pps-gpio`/`pps-ldisc`).
//!
//! The kernel timestamps each assert edge in interrupt context and hands
//! it out through the `PPS_FETCH` ioctl, which blocks until the next edge
//! (or a caller-supplied timeout). Note the historical quirk: the PPS
//! ioctl numbers are defined with *pointer* argument types, so the size
//! encoded in the request is the pointer size, not the struct size.

use anyhow::{anyhow, Result};
use nix::{ioctl_readwrite_bad, request_code_readwrite};
use std::fs::File;
use std::mem;
use std::os::unix::io::AsRawFd;
use std::time::Duration;

const NS_PER_SEC: i64 = 1_000_000_000;

// linux/pps.h
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct PpsKtime {
    pub sec: i64,
    pub nsec: i32,
    pub flags: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct PpsKinfo {
    pub assert_sequence: u32,
    pub clear_sequence: u32,
    pub assert_tu: PpsKtime,
    pub clear_tu: PpsKtime,
    pub current_mode: i32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct PpsFdata {
    pub info: PpsKinfo,
    pub timeout: PpsKtime,
}

// PPS_FETCH = _IOWR('p', 0xa4, struct pps_fdata *)
const PPS_FETCH_REQUEST: libc::c_ulong =
    request_code_readwrite!(b'p', 0xa4, mem::size_of::<*mut PpsFdata>()) as libc::c_ulong;
ioctl_readwrite_bad!(pps_fetch_ioctl, PPS_FETCH_REQUEST, PpsFdata);

/// One captured assert edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PpsEdge {
    /// Kernel event counter; increments once per pulse.
    pub sequence: u32,
    /// CLOCK_REALTIME timestamp of the edge (ns).
    pub assert_real_ns: i64,
}

pub struct PpsSource {
    file: File,
    path: String,
}

impl PpsSource {
    pub fn open(path: &str) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| anyhow!("cannot open PPS device {}: {}", path, e))?;
        Ok(PpsSource {
            file,
            path: path.to_string(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Block until the next assert edge. `Ok(None)` on deadline expiry.
    pub fn fetch(&mut self, deadline: Duration) -> Result<Option<PpsEdge>> {
        let mut data = PpsFdata {
            timeout: PpsKtime {
                sec: deadline.as_secs() as i64,
                nsec: deadline.subsec_nanos() as i32,
                flags: 0,
            },
            ..Default::default()
        };

        let ret = unsafe { pps_fetch_ioctl(self.file.as_raw_fd(), &mut data) };
        match ret {
            Ok(_) => Ok(Some(edge_from_info(&data.info))),
            Err(nix::errno::Errno::ETIMEDOUT) => Ok(None),
            Err(nix::errno::Errno::EINTR) => Ok(None),
            Err(e) => Err(anyhow!("PPS_FETCH on {} failed: {}", self.path, e)),
        }
    }

    /// Non-blocking look at the most recent edge, if any arrived since the
    /// previous fetch. Used for secondary tick sources (RTC square wave).
    pub fn try_fetch(&mut self) -> Result<Option<PpsEdge>> {
        self.fetch(Duration::ZERO)
    }
}

fn edge_from_info(info: &PpsKinfo) -> PpsEdge {
    PpsEdge {
        sequence: info.assert_sequence,
        assert_real_ns: info.assert_tu.sec * NS_PER_SEC + info.assert_tu.nsec as i64,
    }
}

// ============================================================================
// TESTS
// ============================================================================
