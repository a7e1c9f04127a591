#![cfg(unix)]

//! DS3231-class RTC adapter.
//!
//! Three kernel interfaces make up the device:
//! - `/dev/rtcN` for reading/setting the calendar time (whole seconds);
//! - the SQW pin's 1 Hz edge, exposed as a PPS device via `pps-gpio`,
//!   which gives the sub-second phase of the seconds rollover;
//! - the raw I2C register file for the aging-offset register (0x10),
//!   which the rtc-ds1307 kernel driver does not expose.
//!
//! Without the SQW wire the adapter still works, but `read()` is limited
//! to whole seconds and the drift observer against the RTC stays in
//! warm-up forever (which simply leaves the aging register alone).

use anyhow::{anyhow, Result};
use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use nix::{ioctl_read, ioctl_write_ptr};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;

use crate::pps::PpsSource;
use crate::traits::RtcDevice;

const NS_PER_SEC: i64 = 1_000_000_000;

/// DS3231 I2C bus address and aging-offset register.
const DS3231_I2C_ADDR: libc::c_ulong = 0x68;
const DS3231_AGING_REG: u8 = 0x10;

/// linux/i2c-dev.h
const I2C_SLAVE: libc::c_ulong = 0x0703;

// Linux RTC time struct (linux/rtc.h).
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct RtcTime {
    pub tm_sec: i32,
    pub tm_min: i32,
    pub tm_hour: i32,
    pub tm_mday: i32,
    pub tm_mon: i32,
    pub tm_year: i32,
    pub tm_wday: i32,
    pub tm_yday: i32,
    pub tm_isdst: i32,
}

// Magic 'p', RTC_RD_TIME 0x09 / RTC_SET_TIME 0x0a
const RTC_MAGIC: u8 = b'p';
ioctl_read!(rtc_rd_time, RTC_MAGIC, 0x09, RtcTime);
ioctl_write_ptr!(rtc_set_time, RTC_MAGIC, 0x0a, RtcTime);

fn rtc_time_to_unix(t: &RtcTime) -> Result<u64> {
    let dt = Utc
        .with_ymd_and_hms(
            t.tm_year + 1900,
            (t.tm_mon + 1) as u32,
            t.tm_mday as u32,
            t.tm_hour as u32,
            t.tm_min as u32,
            t.tm_sec as u32,
        )
        .single()
        .ok_or_else(|| anyhow!("RTC returned an impossible date: {:?}", t))?;
    u64::try_from(dt.timestamp()).map_err(|_| anyhow!("RTC time predates the epoch"))
}

fn unix_to_rtc_time(seconds: u64) -> RtcTime {
    let dt: DateTime<Utc> = Utc
        .timestamp_opt(seconds as i64, 0)
        .single()
        .unwrap_or_else(|| Utc.timestamp_opt(0, 0).unwrap());
    RtcTime {
        tm_sec: dt.second() as i32,
        tm_min: dt.minute() as i32,
        tm_hour: dt.hour() as i32,
        tm_mday: dt.day() as i32,
        tm_mon: dt.month0() as i32,       // 0-11
        tm_year: dt.year() - 1900,        // years since 1900
        tm_wday: 0,                       // ignored by RTC_SET_TIME
        tm_yday: 0,                       // ignored
        tm_isdst: 0,
    }
}

fn clamp_aging(value: i32) -> i8 {
    value.clamp(-127, 127) as i8
}

pub struct Ds3231Rtc {
    dev: File,
    i2c: Option<File>,
    /// SQW pin routed to a PPS device; gives sub-second phase.
    sqw: Option<PpsSource>,
    last_sqw_edge_real_ns: Option<i64>,
}

impl Ds3231Rtc {
    pub fn open(rtc_path: &str, i2c_path: Option<&str>, sqw_path: Option<&str>) -> Result<Self> {
        let dev = OpenOptions::new()
            .read(true)
            .write(true)
            .open(rtc_path)
            .map_err(|e| anyhow!("cannot open RTC {}: {}", rtc_path, e))?;

        let i2c = match i2c_path {
            Some(path) => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(path)
                    .map_err(|e| anyhow!("cannot open I2C bus {}: {}", path, e))?;
                let ret = unsafe { libc::ioctl(file.as_raw_fd(), I2C_SLAVE, DS3231_I2C_ADDR) };
                if ret < 0 {
                    return Err(anyhow!(
                        "I2C_SLAVE 0x{:02x} on {} failed: {}",
                        DS3231_I2C_ADDR,
                        path,
                        std::io::Error::last_os_error()
                    ));
                }
                Some(file)
            }
            None => {
                log::warn!("No I2C bus given; aging-offset discipline disabled");
                None
            }
        };

        let sqw = match sqw_path {
            Some(path) => Some(PpsSource::open(path)?),
            None => {
                log::warn!("No SQW PPS device given; RTC reads limited to whole seconds");
                None
            }
        };

        Ok(Ds3231Rtc {
            dev,
            i2c,
            sqw,
            last_sqw_edge_real_ns: None,
        })
    }

    fn i2c(&mut self) -> Result<&mut File> {
        self.i2c
            .as_mut()
            .ok_or_else(|| anyhow!("no I2C bus configured for the RTC"))
    }

    /// Sub-second phase of the running RTC second, from the SQW edge.
    fn subsecond_phase_ns(&mut self) -> u32 {
        let fresh_edge = match self.sqw.as_mut() {
            Some(s) => s.try_fetch().ok().flatten(),
            None => return 0,
        };
        if let Some(edge) = fresh_edge {
            self.last_sqw_edge_real_ns = Some(edge.assert_real_ns);
        }
        let edge_ns = match self.last_sqw_edge_real_ns {
            Some(e) => e,
            None => return 0,
        };

        let mut now: libc::timespec = unsafe { std::mem::zeroed() };
        if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) } < 0 {
            return 0;
        }
        let now_ns = now.tv_sec as i64 * NS_PER_SEC + now.tv_nsec as i64;
        let phase = now_ns - edge_ns;
        if (0..NS_PER_SEC).contains(&phase) {
            phase as u32
        } else {
            // Edge information is stale; fall back to whole seconds.
            0
        }
    }
}

impl RtcDevice for Ds3231Rtc {
    fn read(&mut self) -> Result<(u64, u32)> {
        let phase_ns = self.subsecond_phase_ns();

        let mut t = RtcTime::default();
        unsafe { rtc_rd_time(self.dev.as_raw_fd(), &mut t) }
            .map_err(|e| anyhow!("RTC_RD_TIME failed: {}", e))?;
        Ok((rtc_time_to_unix(&t)?, phase_ns))
    }

    fn set_time(&mut self, seconds: u64, _nanoseconds: u32) -> Result<()> {
        // Register resolution is one second; callers set on a boundary.
        let t = unix_to_rtc_time(seconds);
        unsafe { rtc_set_time(self.dev.as_raw_fd(), &t) }
            .map_err(|e| anyhow!("RTC_SET_TIME failed: {}", e))?;
        Ok(())
    }

    fn read_aging_offset(&mut self) -> Result<i8> {
        let i2c = self.i2c()?;
        i2c.write_all(&[DS3231_AGING_REG])
            .map_err(|e| anyhow!("I2C register select failed: {}", e))?;
        let mut buf = [0u8; 1];
        i2c.read_exact(&mut buf)
            .map_err(|e| anyhow!("I2C aging read failed: {}", e))?;
        Ok(buf[0] as i8)
    }

    fn write_aging_offset(&mut self, offset: i8) -> Result<()> {
        let i2c = self.i2c()?;
        i2c.write_all(&[DS3231_AGING_REG, offset as u8])
            .map_err(|e| anyhow!("I2C aging write failed: {}", e))?;
        Ok(())
    }

    fn adjust_aging_offset(&mut self, delta_lsb: i8) -> Result<i8> {
        let current = self.read_aging_offset()?;
        let new = clamp_aging(current as i32 + delta_lsb as i32);
        if new != current {
            self.write_aging_offset(new)?;
        }
        Ok(new)
    }
}

// ============================================================================
// TESTS
// ============================================================================
