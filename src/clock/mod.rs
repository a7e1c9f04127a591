//! Steerable clock back-ends implementing [`crate::traits::ClockDevice`].

use anyhow::Result;

use crate::traits::ClockDevice;

#[cfg(unix)]
mod linux;

#[cfg(unix)]
pub use linux::{PhcClock, SystemRealtimeClock};

/// Whichever steerable clock the host offers: the NIC's PHC when one is
/// given, CLOCK_REALTIME otherwise.
#[cfg(unix)]
pub enum PlatformClock {
    Phc(PhcClock),
    System(SystemRealtimeClock),
}

#[cfg(unix)]
impl PlatformClock {
    pub fn open(phc_path: Option<&str>) -> Result<Self> {
        match phc_path {
            Some(path) => Ok(PlatformClock::Phc(PhcClock::open(path)?)),
            None => {
                log::warn!("No PHC given; steering CLOCK_REALTIME instead");
                Ok(PlatformClock::System(SystemRealtimeClock::new()?))
            }
        }
    }
}

#[cfg(unix)]
impl ClockDevice for PlatformClock {
    fn read(&mut self) -> Result<(u64, u32)> {
        match self {
            PlatformClock::Phc(c) => c.read(),
            PlatformClock::System(c) => c.read(),
        }
    }

    fn step(&mut self, seconds: u64, nanoseconds: u32) -> Result<()> {
        match self {
            PlatformClock::Phc(c) => c.step(seconds, nanoseconds),
            PlatformClock::System(c) => c.step(seconds, nanoseconds),
        }
    }

    fn adjust_frequency(&mut self, ppb: i32) -> Result<()> {
        match self {
            PlatformClock::Phc(c) => c.adjust_frequency(ppb),
            PlatformClock::System(c) => c.adjust_frequency(ppb),
        }
    }

    fn max_adjustment_ppb(&self) -> i32 {
        match self {
            PlatformClock::Phc(c) => c.max_adjustment_ppb(),
            PlatformClock::System(c) => c.max_adjustment_ppb(),
        }
    }
}
