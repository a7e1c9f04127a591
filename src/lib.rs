pub mod association;
pub mod clock;
pub mod config;
pub mod controller;
pub mod disciplinor;
pub mod net;
pub mod nmea;
pub mod observer;
pub mod ptp;
pub mod rtc_discipline;
pub mod status;
pub mod traits;

#[cfg(unix)]
pub mod gps;

#[cfg(unix)]
pub mod pps;

#[cfg(unix)]
pub mod rtc;
