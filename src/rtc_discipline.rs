//! RTC aging-offset discipline.
//!
//! The holdover RTC (DS3231-class) exposes an "aging offset" register that
//! trims its crystal in ~0.1 ppm steps. This module watches the GPS<->RTC
//! pair through its own drift observer and occasionally nudges that
//! register so the RTC keeps time as well as it can when GPS is gone.
//!
//! The register is written rarely (default at most every 20 minutes) and
//! in small clamped steps: aging trim is a slow thermal-scale correction,
//! not a servo. The decision is separated from the device write so no
//! back-pointer to the adapter exists; the controller applies the returned
//! delta and then confirms with `adjustment_applied`.

use log::{debug, info};

use crate::config::{ObserverConfig, RtcDisciplineConfig};
use crate::observer::{DriftObserver, Estimate, ObserverEvent};

/// A pending register correction. Sign convention: lowering the register
/// slows the oscillator, so a clock running fast (positive drift) is
/// cancelled by *decreasing* the register by `delta_lsb`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtcAdjustment {
    pub delta_lsb: i8,
}

#[derive(Debug)]
pub struct RtcDiscipline {
    cfg: RtcDisciplineConfig,
    observer: DriftObserver,
    /// Seconds of operation (one tick per PPS edge).
    ticks: u64,
    last_adjust_tick: Option<u64>,
    adjustments_applied: u64,
}

impl RtcDiscipline {
    pub fn new(cfg: RtcDisciplineConfig, observer_cfg: ObserverConfig) -> Self {
        RtcDiscipline {
            cfg,
            observer: DriftObserver::new("gps-rtc", observer_cfg),
            ticks: 0,
            last_adjust_tick: None,
            adjustments_applied: 0,
        }
    }

    pub fn estimate(&self) -> Estimate {
        self.observer.estimate()
    }

    pub fn notify(&mut self, event: ObserverEvent) {
        self.observer.notify(event);
    }

    pub fn adjustments_applied(&self) -> u64 {
        self.adjustments_applied
    }

    /// Feed one GPS/RTC tick pair; returns a register correction when one
    /// is due.
    pub fn update(&mut self, reference_utc_ns: i64, rtc_ns: i64) -> Option<RtcAdjustment> {
        self.ticks += 1;
        self.observer.update(reference_utc_ns, rtc_ns);

        let est = self.observer.estimate();
        if !est.trustworthy {
            return None;
        }
        if est.drift_ppm.abs() < self.cfg.threshold_ppm {
            return None;
        }
        if est.total_samples < self.cfg.min_samples_before_first_adjustment {
            return None;
        }
        let elapsed = self.ticks - self.last_adjust_tick.unwrap_or(0);
        if elapsed < self.cfg.min_interval_s {
            return None;
        }

        let raw = (est.drift_ppm / self.cfg.ppm_per_lsb).round() as i32;
        let max = self.cfg.max_lsb_delta as i32;
        let delta_lsb = raw.clamp(-max, max) as i8;
        if delta_lsb == 0 {
            return None;
        }

        debug!(
            "[RTC] drift {:+.3}ppm over {} samples -> aging delta {:+} LSB",
            est.drift_ppm, est.valid_samples, delta_lsb
        );
        Some(RtcAdjustment { delta_lsb })
    }

    /// Confirm that the controller wrote the register. Restarts the
    /// adjustment interval and invalidates the observer history (the RTC
    /// frequency just changed).
    pub fn adjustment_applied(&mut self, adjustment: RtcAdjustment) {
        self.last_adjust_tick = Some(self.ticks);
        self.adjustments_applied += 1;

        let trim_ppb = -(adjustment.delta_lsb as f64) * self.cfg.ppm_per_lsb * 1000.0;
        info!(
            "[RTC] aging offset adjusted by {:+} LSB ({:+.0}ppb trim)",
            -adjustment.delta_lsb, trim_ppb
        );
        self.observer.notify(ObserverEvent::FrequencyAdjusted {
            ppb: trim_ppb as i32,
        });
    }
}

// ============================================================================
// TESTS
// ============================================================================
