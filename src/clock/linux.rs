#![cfg(unix)]

//! Linux clock adapters: the NIC's PTP hardware clock (`/dev/ptpN`) and a
//! CLOCK_REALTIME fallback for machines without a PHC.
//!
//! Frequency plumbing: `clock_adjtime`/`adjtimex` take the adjustment in
//! 16.16 fixed-point ppm ("scaled ppm"), so ppb * 65.536 with rounding.

use anyhow::{anyhow, Result};
use libc::{adjtimex, timex, ADJ_FREQUENCY};
use nix::ioctl_read;
use std::fs::OpenOptions;
use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};

use crate::traits::ClockDevice;

/// CLOCK_REALTIME honors at most +/-500 ppm through adjtimex.
const REALTIME_MAX_PPB: i32 = 500_000;

fn ppb_to_scaled_ppm(ppb: i32) -> i64 {
    // scaled_ppm = ppm * 2^16 = ppb * 65536 / 1000
    (ppb as i64 * 65536) / 1000
}

fn fd_to_clockid(fd: RawFd) -> libc::clockid_t {
    // Dynamic posix clock ids: ((~fd) << 3) | CLOCKFD (3).
    ((!(fd as libc::clockid_t)) << 3) | 3
}

fn read_clock(clockid: libc::clockid_t) -> Result<(u64, u32)> {
    let mut ts: libc::timespec = unsafe { mem::zeroed() };
    let ret = unsafe { libc::clock_gettime(clockid, &mut ts) };
    if ret < 0 {
        return Err(anyhow!(
            "clock_gettime failed: {}",
            std::io::Error::last_os_error()
        ));
    }
    Ok((ts.tv_sec as u64, ts.tv_nsec as u32))
}

fn set_clock(clockid: libc::clockid_t, seconds: u64, nanoseconds: u32) -> Result<()> {
    let ts = libc::timespec {
        tv_sec: seconds as libc::time_t,
        tv_nsec: nanoseconds as libc::c_long,
    };
    let ret = unsafe { libc::clock_settime(clockid, &ts) };
    if ret < 0 {
        return Err(anyhow!(
            "clock_settime failed (are you root?): {}",
            std::io::Error::last_os_error()
        ));
    }
    Ok(())
}

fn adjust_clock_frequency(clockid: libc::clockid_t, ppb: i32) -> Result<()> {
    let mut tx: timex = unsafe { mem::zeroed() };
    tx.modes = ADJ_FREQUENCY;
    tx.freq = ppb_to_scaled_ppm(ppb);

    let ret = unsafe { libc::syscall(libc::SYS_clock_adjtime, clockid, &mut tx) };
    if ret < 0 {
        return Err(anyhow!(
            "clock_adjtime failed: {}",
            std::io::Error::last_os_error()
        ));
    }
    Ok(())
}

// ============================================================================
// PHC (/dev/ptpN)
// ============================================================================

// linux/ptp_clock.h: PTP_CLOCK_GETCAPS = _IOR('=', 1, struct ptp_clock_caps)
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct PtpClockCaps {
    max_adj: i32,
    n_alarm: i32,
    n_ext_ts: i32,
    n_per_out: i32,
    pps: i32,
    n_pins: i32,
    cross_timestamping: i32,
    adjust_phase: i32,
    max_phase_adj: i32,
    rsv: [i32; 11],
}

ioctl_read!(ptp_clock_getcaps, b'=', 1, PtpClockCaps);

/// The network interface's hardware clock. The file handle must stay open
/// for as long as the derived clockid is used.
pub struct PhcClock {
    _file: std::fs::File,
    clockid: libc::clockid_t,
    max_adj_ppb: i32,
}

impl PhcClock {
    pub fn open(path: &str) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| anyhow!("cannot open PHC {}: {}", path, e))?;

        let mut caps = PtpClockCaps::default();
        unsafe { ptp_clock_getcaps(file.as_raw_fd(), &mut caps) }
            .map_err(|e| anyhow!("PTP_CLOCK_GETCAPS on {} failed: {}", path, e))?;
        if caps.max_adj <= 0 {
            return Err(anyhow!("{} reports no frequency adjustment range", path));
        }

        let clockid = fd_to_clockid(file.as_raw_fd());
        log::info!(
            "PHC {} opened: max adjustment {}ppb{}",
            path,
            caps.max_adj,
            if caps.pps != 0 { ", PPS capable" } else { "" }
        );

        Ok(PhcClock {
            _file: file,
            clockid,
            max_adj_ppb: caps.max_adj,
        })
    }
}

impl ClockDevice for PhcClock {
    fn read(&mut self) -> Result<(u64, u32)> {
        read_clock(self.clockid)
    }

    fn step(&mut self, seconds: u64, nanoseconds: u32) -> Result<()> {
        set_clock(self.clockid, seconds, nanoseconds)
    }

    fn adjust_frequency(&mut self, ppb: i32) -> Result<()> {
        let clamped = ppb.clamp(-self.max_adj_ppb, self.max_adj_ppb);
        adjust_clock_frequency(self.clockid, clamped)
    }

    fn max_adjustment_ppb(&self) -> i32 {
        self.max_adj_ppb
    }
}

impl Drop for PhcClock {
    fn drop(&mut self) {
        // Leave the oscillator free-running rather than steered by a dead
        // process.
        let _ = adjust_clock_frequency(self.clockid, 0);
    }
}

// ============================================================================
// CLOCK_REALTIME fallback
// ============================================================================

/// Steers the system clock through adjtimex when no PHC is available.
pub struct SystemRealtimeClock {
    original_freq: i64,
}

impl SystemRealtimeClock {
    pub fn new() -> Result<Self> {
        let mut tx: timex = unsafe { mem::zeroed() };
        tx.modes = 0; // query

        let ret = unsafe { adjtimex(&mut tx) };
        if ret < 0 {
            return Err(anyhow!("adjtimex failed (are you root?)"));
        }

        Ok(SystemRealtimeClock {
            original_freq: tx.freq,
        })
    }
}

impl ClockDevice for SystemRealtimeClock {
    fn read(&mut self) -> Result<(u64, u32)> {
        read_clock(libc::CLOCK_REALTIME)
    }

    fn step(&mut self, seconds: u64, nanoseconds: u32) -> Result<()> {
        set_clock(libc::CLOCK_REALTIME, seconds, nanoseconds)
    }

    fn adjust_frequency(&mut self, ppb: i32) -> Result<()> {
        let clamped = ppb.clamp(-REALTIME_MAX_PPB, REALTIME_MAX_PPB);
        let mut tx: timex = unsafe { mem::zeroed() };
        tx.modes = ADJ_FREQUENCY;
        tx.freq = ppb_to_scaled_ppm(clamped);

        let ret = unsafe { adjtimex(&mut tx) };
        if ret < 0 {
            return Err(anyhow!("adjtimex failed to set frequency"));
        }
        Ok(())
    }

    fn max_adjustment_ppb(&self) -> i32 {
        REALTIME_MAX_PPB
    }
}

impl Drop for SystemRealtimeClock {
    fn drop(&mut self) {
        let mut tx: timex = unsafe { mem::zeroed() };
        tx.modes = ADJ_FREQUENCY;
        tx.freq = self.original_freq;
        unsafe { adjtimex(&mut tx) };
    }
}

// ============================================================================
// TESTS
// ============================================================================
