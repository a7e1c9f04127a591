#![cfg(unix)]

//! GPS reference provider: kernel PPS edges paired with NMEA sentences
//! from the receiver's serial port.
//!
//! Timing model per tick: the PPS edge marks the second boundary with
//! sub-microsecond accuracy; the sentence naming that second trails it by
//! tens to hundreds of milliseconds on the wire. `next_tick` therefore
//! blocks on the edge first, then reads the serial stream until a time
//! sentence shows up (or the admissible latency window closes). The
//! association lock downstream decides whether the pairing is credible;
//! this module only reports what it saw and when.

use anyhow::{anyhow, Result};
use log::{debug, warn};
use nix::sys::termios::{self, BaudRate, SetArg, SpecialCharacterIndices};
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::time::Duration;

use crate::controller::monotonic_now_ns;
use crate::nmea;
use crate::pps::PpsSource;
use crate::traits::{ReferenceSource, ReferenceTick};

/// How long past the PPS edge a sentence may still arrive. Slightly wider
/// than the association lock's own band so the lock, not the provider,
/// makes the call.
const SENTENCE_WAIT_MS: u64 = 900;

/// The PPS wake must happen well inside the pulse-to-sentence gap.
const WAKE_SLA_NS: i64 = 10_000_000;

fn realtime_now_ns() -> i64 {
    match nix::time::clock_gettime(nix::time::ClockId::CLOCK_REALTIME) {
        Ok(ts) => ts.tv_sec() * 1_000_000_000 + ts.tv_nsec(),
        Err(_) => 0,
    }
}

pub struct GpsReference {
    pps: PpsSource,
    serial: File,
    line_buf: Vec<u8>,
    pps_seq: u64,
    last_kernel_seq: Option<u32>,
}

impl GpsReference {
    pub fn open(pps_path: &str, serial_path: &str, baud: u32) -> Result<Self> {
        let pps = PpsSource::open(pps_path)?;
        let serial = open_serial(serial_path, baud)?;
        Ok(GpsReference {
            pps,
            serial,
            line_buf: Vec::with_capacity(256),
            pps_seq: 0,
            last_kernel_seq: None,
        })
    }

    /// Read serial data until a usable time sentence arrives or the wait
    /// budget is spent. Returns (utc_sec, arrival_mono_ns, fix_valid).
    fn await_sentence(&mut self, edge_mono_ns: i64) -> Option<(u64, i64, bool)> {
        let budget_ns = SENTENCE_WAIT_MS as i64 * 1_000_000;
        let mut chunk = [0u8; 256];

        loop {
            if monotonic_now_ns() - edge_mono_ns > budget_ns {
                debug!("[GPS] no time sentence within {}ms of the edge", SENTENCE_WAIT_MS);
                return None;
            }

            // VMIN=0/VTIME bounds each read to 200ms; zero bytes = timeout.
            let n = match self.serial.read(&mut chunk) {
                Ok(n) => n,
                Err(e) => {
                    warn!("[GPS] serial read error: {}", e);
                    return None;
                }
            };
            self.line_buf.extend_from_slice(&chunk[..n]);

            while let Some(line) = take_line(&mut self.line_buf) {
                if let Some(time) = nmea::parse_sentence(&line) {
                    return Some((time.utc_sec, monotonic_now_ns(), time.fix_valid));
                }
            }
        }
    }
}

impl ReferenceSource for GpsReference {
    fn next_tick(&mut self, deadline: Duration) -> Result<Option<ReferenceTick>> {
        let edge = match self.pps.fetch(deadline)? {
            Some(e) => e,
            None => return Ok(None),
        };

        // The kernel stamped the edge in interrupt context; everything we
        // measure is referenced back to it. The fetch wake-up itself must
        // stay inside the RT budget.
        let wake_ns = realtime_now_ns() - edge.assert_real_ns;
        if wake_ns > WAKE_SLA_NS {
            warn!(
                "[GPS] woke {}ms after the PPS edge (RT scheduling degraded?)",
                wake_ns / 1_000_000
            );
        }
        let mono_capture_ns = monotonic_now_ns() - wake_ns.max(0);

        self.pps_seq = extend_sequence(self.pps_seq, self.last_kernel_seq, edge.sequence);
        self.last_kernel_seq = Some(edge.sequence);

        let (nmea_utc_sec, nmea_arrival_mono_ns, fix_valid) =
            match self.await_sentence(mono_capture_ns) {
                Some((utc, arrival, fix)) => (Some(utc), Some(arrival), fix),
                None => (None, None, false),
            };

        Ok(Some(ReferenceTick {
            pps_seq: self.pps_seq,
            mono_capture_ns,
            nmea_utc_sec,
            nmea_arrival_mono_ns,
            fix_valid,
        }))
    }
}

/// Widen the kernel's 32-bit event counter into a monotone 64-bit one.
fn extend_sequence(current: u64, last_kernel: Option<u32>, kernel_seq: u32) -> u64 {
    match last_kernel {
        Some(prev) => current + kernel_seq.wrapping_sub(prev) as u64,
        None => current.max(1),
    }
}

/// Pop one complete line (without the terminator) off the buffer.
fn take_line(buf: &mut Vec<u8>) -> Option<String> {
    let pos = buf.iter().position(|&b| b == b'\n')?;
    let line: Vec<u8> = buf.drain(..=pos).collect();
    Some(String::from_utf8_lossy(&line).trim_end().to_string())
}

fn open_serial(path: &str, baud: u32) -> Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .open(path)
        .map_err(|e| anyhow!("cannot open serial port {}: {}", path, e))?;

    let baud = match baud {
        4800 => BaudRate::B4800,
        9600 => BaudRate::B9600,
        19200 => BaudRate::B19200,
        38400 => BaudRate::B38400,
        57600 => BaudRate::B57600,
        115200 => BaudRate::B115200,
        other => return Err(anyhow!("unsupported baud rate {}", other)),
    };

    let mut tio = termios::tcgetattr(&file)
        .map_err(|e| anyhow!("tcgetattr on {} failed: {}", path, e))?;
    termios::cfmakeraw(&mut tio);
    termios::cfsetspeed(&mut tio, baud)
        .map_err(|e| anyhow!("cannot set baud rate on {}: {}", path, e))?;
    // Bounded reads: return whatever arrived within 200ms.
    tio.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
    tio.control_chars[SpecialCharacterIndices::VTIME as usize] = 2;
    termios::tcsetattr(&file, SetArg::TCSANOW, &tio)
        .map_err(|e| anyhow!("tcsetattr on {} failed: {}", path, e))?;

    Ok(file)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_line_splits_and_trims() {
        let mut buf = b"$GPRMC,a*00\r\n$GPZDA".to_vec();
        assert_eq!(take_line(&mut buf).as_deref(), Some("$GPRMC,a*00"));
        assert_eq!(take_line(&mut buf), None, "partial line stays buffered");
        assert_eq!(buf, b"$GPZDA");
    }

    #[test]
    fn test_take_line_multiple() {
        let mut buf = b"one\ntwo\nthr".to_vec();
        assert_eq!(take_line(&mut buf).as_deref(), Some("one"));
        assert_eq!(take_line(&mut buf).as_deref(), Some("two"));
        assert_eq!(take_line(&mut buf), None);
    }

    #[test]
    fn test_extend_sequence_monotone_across_wrap() {
        // Normal increment.
        assert_eq!(extend_sequence(10, Some(100), 101), 11);
        // Dropout: two pulses missing.
        assert_eq!(extend_sequence(10, Some(100), 103), 13);
        // 32-bit counter wrap must not reset the 64-bit sequence.
        assert_eq!(extend_sequence(500, Some(u32::MAX), 0), 501);
        // First edge seeds the sequence.
        assert_eq!(extend_sequence(0, None, 42), 1);
    }
}
