use anyhow::Result;
use std::time::Duration;

/// One PPS edge as delivered by the reference provider.
///
/// `nmea_utc_sec` / `nmea_arrival_mono_ns` are `None` when no sentence has
/// been matched to this edge yet (serial data trails the pulse by tens to
/// hundreds of milliseconds).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReferenceTick {
    pub pps_seq: u64,
    pub mono_capture_ns: i64,
    pub nmea_utc_sec: Option<u64>,
    pub nmea_arrival_mono_ns: Option<i64>,
    pub fix_valid: bool,
}

#[cfg_attr(test, mockall::automock)]
pub trait ReferenceSource {
    /// Block until the next PPS edge. Returns Ok(None) on deadline expiry
    /// (the caller marks the tick as missing and carries on).
    fn next_tick(&mut self, deadline: Duration) -> Result<Option<ReferenceTick>>;
}

#[cfg_attr(test, mockall::automock)]
pub trait ClockDevice {
    /// Current clock reading as (seconds, nanoseconds).
    fn read(&mut self) -> Result<(u64, u32)>;

    /// Jump the clock to an absolute target time.
    fn step(&mut self, seconds: u64, nanoseconds: u32) -> Result<()>;

    /// Set the frequency offset in parts per billion. Absolute, not a
    /// delta: each call replaces the previous adjustment entirely.
    fn adjust_frequency(&mut self, ppb: i32) -> Result<()>;

    /// Largest |ppb| the hardware accepts.
    fn max_adjustment_ppb(&self) -> i32;
}

/// Downstream time distribution (the PTP port). Called once per tick with
/// the steered time; `healthy` distinguishes locked operation from
/// holdover so the advertised clock quality can degrade.
#[cfg_attr(test, mockall::automock)]
pub trait TimePublisher {
    fn publish_tick(&mut self, utc_sec: u64, utc_ns: u32, healthy: bool) -> Result<()>;
}

/// Battery-backed RTC with a trimmable oscillator (DS3231-class aging
/// register, [-127, +127] LSB, ~0.1 ppm per LSB).
#[cfg_attr(test, mockall::automock)]
pub trait RtcDevice {
    fn read(&mut self) -> Result<(u64, u32)>;

    fn set_time(&mut self, seconds: u64, nanoseconds: u32) -> Result<()>;

    fn read_aging_offset(&mut self) -> Result<i8>;

    fn write_aging_offset(&mut self, offset: i8) -> Result<()>;

    /// Read-modify-write with clamping to the register range.
    /// Returns the value actually written.
    fn adjust_aging_offset(&mut self, delta_lsb: i8) -> Result<i8>;
}
