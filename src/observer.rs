//! Drift observer: a moving-window frequency estimator over a clock pair.
//!
//! ## The Problem
//! Per-tick offsets between a reference (GPS PPS, RTC square wave) and a
//! disciplined clock carry jitter from interrupt latency, scheduler
//! preemption and serial timing. Worse, the observed history becomes
//! meaningless the moment the clock is stepped or its frequency changed:
//! samples from before the event describe a different clock.
//!
//! ## The Solution
//! - Keep samples in a fixed ring tagged with an *epoch id*; any
//!   invalidating event (step, frequency adjust, reference change) bumps
//!   the epoch and clears the ring, so statistics never mix regimes.
//! - A *holdoff* settle timer forces the estimate untrustworthy for a few
//!   ticks after each event while transients drain.
//! - Median Absolute Deviation (MAD) rejects jitter spikes without
//!   normality assumptions; rejected samples stay in the ring, flagged,
//!   for diagnostics.
//! - The frequency estimate is a least-squares slope over the surviving
//!   samples (or a MAD-filtered mean of per-tick deltas, selectable).
//!
//! The observer is deliberately ignorant of what the two clocks are: it is
//! instantiated once per pair (GPS<->NIC, GPS<->RTC, ...) under a
//! human-readable name and never aborts; bad input only downgrades the
//! reported trust.

use log::{debug, info};
use std::collections::VecDeque;

use crate::config::ObserverConfig;

const NS_PER_SEC: i64 = 1_000_000_000;

/// Minimum valid drift values in the window before MAD rejection engages.
const MAD_WARMUP_SAMPLES: usize = 5;

// ============================================================================
// SAMPLE AND FLAG TYPES
// ============================================================================

/// Per-sample condition flags, kept as a bitmask for cheap telemetry.
pub mod sample_flags {
    pub const OFFSET_SPIKE: u16 = 1 << 0;
    pub const DRIFT_SPIKE: u16 = 1 << 1;
    pub const DT_REFERENCE_INVALID: u16 = 1 << 2;
    pub const DT_CLOCK_INVALID: u16 = 1 << 3;
    pub const EPOCH_BOUNDARY: u16 = 1 << 4;
    pub const IN_HOLDOFF: u16 = 1 << 5;
    pub const MAD_OUTLIER: u16 = 1 << 6;
}

/// Estimate-level health conditions.
pub mod health_flags {
    pub const REFERENCE_BAD: u16 = 1 << 0;
    pub const IN_HOLDOFF: u16 = 1 << 1;
    pub const HIGH_VARIANCE: u16 = 1 << 2;
    pub const HIGH_INVALID_RATIO: u16 = 1 << 3;
    pub const MISSING_TICKS: u16 = 1 << 4;
    pub const WARMING_UP: u16 = 1 << 5;
}

#[derive(Debug, Clone, Copy)]
pub struct DriftSample {
    pub seq: u64,
    pub epoch_id: u32,
    pub reference_ns: i64,
    pub clock_ns: i64,
    /// clock - reference.
    pub offset_ns: i64,
    pub dt_reference_ns: i64,
    pub dt_clock_ns: i64,
    pub drift_ns_per_s: f64,
    pub valid: bool,
    pub flags: u16,
}

/// Events the owner must forward so the observer can invalidate history.
/// No back-pointer exists from the observer to any adapter: the caller
/// applies a command and then tells every observer what it did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ObserverEvent {
    ReferenceChanged,
    ReferenceLost,
    ReferenceRecovered,
    ClockStepped { magnitude_ns: i64 },
    ClockSlewed { magnitude_ns: i64 },
    FrequencyAdjusted { ppb: i32 },
    ServoModeChanged,
    WarmStartRequested,
}

/// Published view of the window. All statistics are computed exclusively
/// over samples of the current epoch with `valid == true`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Estimate {
    pub ready: bool,
    pub trustworthy: bool,
    pub offset_mean_ns: f64,
    pub offset_stddev_ns: f64,
    pub offset_median_ns: f64,
    pub drift_ppm: f64,
    pub drift_stddev_ppm: f64,
    pub jitter_rms_ns: f64,
    pub health_flags: u16,
    pub total_samples: u64,
    pub valid_samples: usize,
    pub current_epoch: u32,
    pub ticks_in_epoch: u64,
    pub ticks_in_holdoff: u32,
}

// ============================================================================
// OBSERVER
// ============================================================================

#[derive(Debug)]
pub struct DriftObserver {
    name: String,
    cfg: ObserverConfig,

    window: VecDeque<DriftSample>,
    seq: u64,
    epoch: u32,
    ticks_in_epoch: u64,
    holdoff: u32,
    reference_good: bool,
    dropout_pending: bool,

    /// Newest sample of the current epoch, for delta computation.
    prev: Option<DriftSample>,

    total_samples: u64,
    rejected_samples: u64,
}

impl DriftObserver {
    pub fn new(name: &str, cfg: ObserverConfig) -> Self {
        let capacity = cfg.window_size.max(MAD_WARMUP_SAMPLES);
        DriftObserver {
            name: name.to_string(),
            cfg,
            window: VecDeque::with_capacity(capacity + 1),
            seq: 0,
            epoch: 0,
            ticks_in_epoch: 0,
            holdoff: 0,
            reference_good: true,
            dropout_pending: false,
            prev: None,
            total_samples: 0,
            rejected_samples: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Record one `(reference, clock)` pair. Called exactly once per tick.
    pub fn update(&mut self, reference_ns: i64, clock_ns: i64) {
        self.total_samples += 1;

        if !self.reference_good {
            // Estimate is frozen until the reference recovers; the window
            // is intentionally left intact.
            debug!("[{}] sample ignored, reference bad", self.name);
            return;
        }

        self.ticks_in_epoch += 1;
        let in_holdoff = self.holdoff > 0;

        let seq = self.seq;
        self.seq += 1;

        let offset_ns = clock_ns - reference_ns;
        let mut flags = 0u16;
        if in_holdoff {
            flags |= sample_flags::IN_HOLDOFF;
        }

        let sample = match self.prev {
            None => {
                // First sample of the epoch: nothing to difference against.
                DriftSample {
                    seq,
                    epoch_id: self.epoch,
                    reference_ns,
                    clock_ns,
                    offset_ns,
                    dt_reference_ns: 0,
                    dt_clock_ns: 0,
                    drift_ns_per_s: 0.0,
                    valid: false,
                    flags: flags | sample_flags::EPOCH_BOUNDARY,
                }
            }
            Some(prev) => {
                let dt_reference_ns = reference_ns - prev.reference_ns;
                let dt_clock_ns = clock_ns - prev.clock_ns;
                let drift_ns_per_s = (offset_ns - prev.offset_ns) as f64;
                let mut valid = true;

                if (dt_reference_ns - NS_PER_SEC).abs() > self.cfg.max_dt_ref_deviation_ns {
                    flags |= sample_flags::DT_REFERENCE_INVALID;
                    valid = false;
                }
                if (dt_clock_ns - NS_PER_SEC).abs() > self.cfg.max_dt_ref_deviation_ns {
                    flags |= sample_flags::DT_CLOCK_INVALID;
                    valid = false;
                }

                if (offset_ns - prev.offset_ns).abs() > self.cfg.max_offset_step_ns {
                    // An offset jump this large is not drift; somebody moved
                    // the clock underneath us. Belt-and-suspenders: treat it
                    // exactly like a commanded step.
                    info!(
                        "[{}] uncommanded step detected: offset jumped {:+}ns",
                        self.name,
                        offset_ns - prev.offset_ns
                    );
                    self.rejected_samples += 1;
                    self.notify(ObserverEvent::ClockStepped {
                        magnitude_ns: offset_ns - prev.offset_ns,
                    });
                    return;
                }

                if drift_ns_per_s.abs() > self.cfg.max_plausible_drift_ns_per_s {
                    flags |= sample_flags::DRIFT_SPIKE;
                    valid = false;
                }

                if valid && self.is_mad_outlier(drift_ns_per_s) {
                    flags |= sample_flags::MAD_OUTLIER;
                    valid = false;
                    self.rejected_samples += 1;
                    debug!(
                        "[{}] MAD outlier rejected: {:+.1}ns/s",
                        self.name, drift_ns_per_s
                    );
                }

                DriftSample {
                    seq,
                    epoch_id: self.epoch,
                    reference_ns,
                    clock_ns,
                    offset_ns,
                    dt_reference_ns,
                    dt_clock_ns,
                    drift_ns_per_s,
                    valid,
                    flags,
                }
            }
        };

        if sample.valid {
            self.dropout_pending = false;
        }

        self.window.push_back(sample);
        while self.window.len() > self.cfg.window_size {
            self.window.pop_front();
        }
        self.prev = Some(sample);

        if in_holdoff {
            self.holdoff -= 1;
        }
    }

    /// Event ingestion; policies per event kind.
    pub fn notify(&mut self, event: ObserverEvent) {
        match event {
            ObserverEvent::ClockStepped { magnitude_ns } => {
                debug!(
                    "[{}] clock stepped {:+}ns: epoch {} -> {}",
                    self.name,
                    magnitude_ns,
                    self.epoch,
                    self.epoch + 1
                );
                self.bump_epoch(self.cfg.holdoff_after_step_ticks);
            }
            ObserverEvent::FrequencyAdjusted { ppb } => {
                debug!("[{}] frequency adjusted to {:+}ppb", self.name, ppb);
                self.bump_epoch(self.cfg.holdoff_after_freq_ticks);
            }
            ObserverEvent::ReferenceChanged => {
                self.bump_epoch(self.cfg.holdoff_after_ref_ticks);
            }
            ObserverEvent::ReferenceLost => {
                self.reference_good = false;
            }
            ObserverEvent::ReferenceRecovered => {
                self.reference_good = true;
            }
            ObserverEvent::ClockSlewed { magnitude_ns: _ } => {
                // Slews are gentle; one settle tick, history stays.
                self.holdoff = self.holdoff.max(1);
            }
            ObserverEvent::ServoModeChanged => {
                self.bump_epoch(0);
            }
            ObserverEvent::WarmStartRequested => {
                self.reset();
            }
        }
    }

    /// Mark that one or more ticks never arrived (sequence gap upstream).
    /// Sticky until the next valid sample.
    pub fn mark_dropout(&mut self) {
        self.dropout_pending = true;
    }

    /// Clear window, bump epoch, force warm-up.
    pub fn reset(&mut self) {
        self.bump_epoch(0);
        self.reference_good = true;
        self.dropout_pending = false;
    }

    pub fn last_sample(&self) -> Option<&DriftSample> {
        self.window.back()
    }

    pub fn estimate(&self) -> Estimate {
        let mut est = Estimate {
            current_epoch: self.epoch,
            ticks_in_epoch: self.ticks_in_epoch,
            ticks_in_holdoff: self.holdoff,
            total_samples: self.total_samples,
            ..Default::default()
        };

        let epoch_count = self
            .window
            .iter()
            .filter(|s| s.epoch_id == self.epoch)
            .count();
        let valid: Vec<&DriftSample> = self
            .window
            .iter()
            .filter(|s| s.epoch_id == self.epoch && s.valid)
            .collect();
        est.valid_samples = valid.len();
        est.ready = valid.len() >= self.cfg.min_valid_samples;

        if !self.reference_good {
            est.health_flags |= health_flags::REFERENCE_BAD;
        }
        if self.dropout_pending {
            est.health_flags |= health_flags::MISSING_TICKS;
        }
        if !est.ready {
            est.health_flags |= health_flags::WARMING_UP;
        }

        let newest_in_holdoff = self
            .window
            .back()
            .map(|s| s.flags & sample_flags::IN_HOLDOFF != 0)
            .unwrap_or(false);
        if self.holdoff > 0 || newest_in_holdoff {
            est.health_flags |= health_flags::IN_HOLDOFF;
        }

        if valid.is_empty() {
            return est;
        }

        // Offset statistics.
        let n = valid.len() as f64;
        let offsets: Vec<f64> = valid.iter().map(|s| s.offset_ns as f64).collect();
        est.offset_mean_ns = offsets.iter().sum::<f64>() / n;
        est.offset_stddev_ns = stddev(&offsets, est.offset_mean_ns);
        est.offset_median_ns = median(&offsets);

        // Drift statistics (ns/s == ppb; /1000 -> ppm).
        let drifts: Vec<f64> = valid.iter().map(|s| s.drift_ns_per_s).collect();
        let drift_mean = drifts.iter().sum::<f64>() / n;
        est.drift_stddev_ppm = stddev(&drifts, drift_mean) / 1000.0;

        if self.cfg.use_linear_regression && valid.len() >= 2 {
            let (slope_ns_per_s, rms_ns) = regress(&offsets);
            est.drift_ppm = slope_ns_per_s / 1000.0;
            est.jitter_rms_ns = rms_ns;
        } else {
            est.drift_ppm = drift_mean / 1000.0;
            est.jitter_rms_ns = est.offset_stddev_ns;
        }

        let invalid_ratio = if epoch_count > 0 {
            (epoch_count - valid.len()) as f64 / epoch_count as f64
        } else {
            0.0
        };
        if invalid_ratio > self.cfg.max_invalid_ratio {
            est.health_flags |= health_flags::HIGH_INVALID_RATIO;
        }
        if est.drift_stddev_ppm > self.cfg.max_drift_stddev_ppm {
            est.health_flags |= health_flags::HIGH_VARIANCE;
        }

        est.trustworthy = est.ready
            && self.holdoff == 0
            && !newest_in_holdoff
            && invalid_ratio <= self.cfg.max_invalid_ratio
            && est.drift_stddev_ppm <= self.cfg.max_drift_stddev_ppm
            && self.reference_good;

        est
    }

    /// Lifetime counters: (samples seen, samples rejected).
    pub fn stats(&self) -> (u64, u64) {
        (self.total_samples, self.rejected_samples)
    }

    fn bump_epoch(&mut self, holdoff: u32) {
        self.epoch = self.epoch.wrapping_add(1);
        self.window.clear();
        self.prev = None;
        self.ticks_in_epoch = 0;
        self.holdoff = holdoff;
    }

    fn is_mad_outlier(&self, drift_ns_per_s: f64) -> bool {
        let drifts: Vec<f64> = self
            .window
            .iter()
            .filter(|s| s.epoch_id == self.epoch && s.valid)
            .map(|s| s.drift_ns_per_s)
            .collect();
        if drifts.len() < MAD_WARMUP_SAMPLES {
            return false;
        }

        let med = median(&drifts);
        let deviations: Vec<f64> = drifts.iter().map(|d| (d - med).abs()).collect();
        let mad = median(&deviations).max(self.cfg.outlier_mad_floor_ns_per_s);

        (drift_ns_per_s - med).abs() > self.cfg.outlier_mad_sigma * mad
    }
}

// ============================================================================
// SMALL STATISTICS HELPERS
// ============================================================================

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    sorted[sorted.len() / 2]
}

fn stddev(values: &[f64], mean: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let variance =
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

/// Least-squares fit of offset against sample index (1 index = 1 second).
/// Returns (slope in ns/s, RMS residual in ns).
fn regress(offsets: &[f64]) -> (f64, f64) {
    let n = offsets.len() as f64;
    let t_mean = (n - 1.0) / 2.0;
    let y_mean = offsets.iter().sum::<f64>() / n;

    let mut num = 0.0;
    let mut den = 0.0;
    for (i, y) in offsets.iter().enumerate() {
        let dt = i as f64 - t_mean;
        num += dt * (y - y_mean);
        den += dt * dt;
    }
    if den == 0.0 {
        return (0.0, 0.0);
    }
    let slope = num / den;
    let intercept = y_mean - slope * t_mean;

    let sq_resid: f64 = offsets
        .iter()
        .enumerate()
        .map(|(i, y)| {
            let fit = intercept + slope * i as f64;
            (y - fit).powi(2)
        })
        .sum();

    (slope, (sq_resid / n).sqrt())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn small_cfg() -> ObserverConfig {
        // Shrunk thresholds so tests don't need 30+ samples everywhere.
        ObserverConfig {
            window_size: 40,
            min_valid_samples: 5,
            ..ObserverConfig::default()
        }
    }

    /// Feed `n` perfectly spaced ticks with constant drift (ns/s).
    fn feed_linear(obs: &mut DriftObserver, n: usize, start_offset_ns: i64, drift_ns_per_s: i64) {
        for i in 0..n as i64 {
            let reference = i * 1_000_000_000;
            let clock = reference + start_offset_ns + i * drift_ns_per_s;
            obs.update(reference, clock);
        }
    }

    #[test]
    fn test_first_sample_is_epoch_boundary() {
        let mut obs = DriftObserver::new("gps-nic", small_cfg());
        obs.update(0, 500);

        let s = obs.last_sample().unwrap();
        assert!(!s.valid);
        assert_ne!(s.flags & sample_flags::EPOCH_BOUNDARY, 0);
        assert_eq!(s.offset_ns, 500);
    }

    #[test]
    fn test_ready_after_min_valid_samples() {
        let mut obs = DriftObserver::new("gps-nic", small_cfg());

        // First sample is the boundary, so min_valid_samples + 1 ticks.
        feed_linear(&mut obs, 5, 1000, 10);
        assert!(!obs.estimate().ready);

        feed_linear_continue(&mut obs, 5);
        assert!(obs.estimate().ready);
    }

    fn feed_linear_continue(obs: &mut DriftObserver, n: usize) {
        let last = *obs.last_sample().unwrap();
        for i in 1..=n as i64 {
            let reference = last.reference_ns + i * 1_000_000_000;
            let drift = last.drift_ns_per_s as i64;
            let clock = reference + last.offset_ns + i * drift;
            obs.update(reference, clock);
        }
    }

    #[test]
    fn test_mean_of_deltas_estimate() {
        let mut cfg = small_cfg();
        cfg.use_linear_regression = false;
        let mut obs = DriftObserver::new("gps-nic", cfg);

        // +250 ns/s == +0.25 ppm.
        feed_linear(&mut obs, 20, 0, 250);
        let est = obs.estimate();
        assert!(est.ready);
        assert!(
            (est.drift_ppm - 0.25).abs() < 1e-9,
            "drift {} != 0.25ppm",
            est.drift_ppm
        );
    }

    #[test]
    fn test_regression_slope_matches_known_drift() {
        let mut obs = DriftObserver::new("gps-nic", small_cfg());

        // +50 ppm == +50_000 ns/s; also exceeds nothing (offset step gate
        // is 1ms, per-tick delta here is 50us).
        feed_linear(&mut obs, 20, 0, 50_000);
        let est = obs.estimate();
        assert!(est.ready);
        assert!(
            (est.drift_ppm - 50.0).abs() < 1e-6,
            "regression slope {}ppm != 50ppm",
            est.drift_ppm
        );
        // Perfect line: no residual jitter.
        assert!(est.jitter_rms_ns < 1e-6);
    }

    #[test]
    fn test_regression_slope_with_noise_stays_close() {
        let mut obs = DriftObserver::new("gps-nic", small_cfg());

        // 20 ppm with +/-2us deterministic ripple.
        for i in 0..30i64 {
            let reference = i * 1_000_000_000;
            let ripple = if i % 2 == 0 { 2_000 } else { -2_000 };
            let clock = reference + i * 20_000 + ripple;
            obs.update(reference, clock);
        }
        let est = obs.estimate();
        assert!((est.drift_ppm - 20.0).abs() < 1.0);
        assert!(est.jitter_rms_ns > 0.0);
    }

    #[test]
    fn test_dt_reference_deviation_invalidates_sample() {
        let mut obs = DriftObserver::new("gps-nic", small_cfg());
        obs.update(0, 0);
        obs.update(1_000_000_000, 1_000_000_000);

        // Reference delta of 1.01s: 10ms beyond the 2ms band.
        obs.update(2_010_000_000, 2_010_000_100);
        let s = obs.last_sample().unwrap();
        assert!(!s.valid);
        assert_ne!(s.flags & sample_flags::DT_REFERENCE_INVALID, 0);
    }

    #[test]
    fn test_offset_jump_auto_notifies_clock_stepped() {
        let mut obs = DriftObserver::new("gps-nic", small_cfg());
        feed_linear(&mut obs, 10, 0, 10);
        let epoch_before = obs.estimate().current_epoch;

        // +50ms jump, far beyond max_offset_step_ns (1ms).
        obs.update(10_000_000_000, 10_050_000_000);

        let est = obs.estimate();
        assert_eq!(est.current_epoch, epoch_before + 1, "epoch must bump");
        assert_eq!(est.valid_samples, 0, "window must clear");
        assert_eq!(est.ticks_in_holdoff, ObserverConfig::default().holdoff_after_step_ticks);
    }

    #[test]
    fn test_drift_spike_flagged_invalid() {
        let mut cfg = small_cfg();
        cfg.max_offset_step_ns = 10_000_000; // keep the step detector out of the way
        cfg.max_plausible_drift_ns_per_s = 1000.0;
        let mut obs = DriftObserver::new("gps-nic", cfg);

        obs.update(0, 0);
        obs.update(1_000_000_000, 1_000_000_000);
        // 5000 ns/s jump: implausible for a crystal between two seconds.
        obs.update(2_000_000_000, 2_000_005_000);

        let s = obs.last_sample().unwrap();
        assert!(!s.valid);
        assert_ne!(s.flags & sample_flags::DRIFT_SPIKE, 0);
    }

    #[test]
    fn test_mad_outlier_excluded_but_retained() {
        let mut cfg = small_cfg();
        cfg.outlier_mad_floor_ns_per_s = 10.0;
        let mut obs = DriftObserver::new("gps-nic", cfg);

        // Stable pattern around ~20ns/s of alternating sign.
        for i in 0..20i64 {
            let reference = i * 1_000_000_000;
            let wiggle = if i % 2 == 0 { 20 } else { -20 };
            obs.update(reference, reference + wiggle);
        }
        let before = obs.estimate();

        // A 5us/s excursion: way past 4.5 sigma of that population but
        // below the offset-step and plausibility gates.
        let last = *obs.last_sample().unwrap();
        obs.update(
            last.reference_ns + 1_000_000_000,
            last.clock_ns + 1_000_000_000 + 5_000,
        );

        let s = obs.last_sample().unwrap();
        assert!(!s.valid, "outlier must not count as valid");
        assert_ne!(s.flags & sample_flags::MAD_OUTLIER, 0);

        // Still present in the ring, and the estimate barely moved.
        let after = obs.estimate();
        assert!((after.drift_ppm - before.drift_ppm).abs() < 0.1);
    }

    #[test]
    fn test_holdoff_untrusted_for_exact_tick_count() {
        let mut obs = DriftObserver::new("gps-nic", small_cfg());
        feed_linear(&mut obs, 12, 0, 10);
        assert!(obs.estimate().trustworthy, "precondition: trusted before event");

        obs.notify(ObserverEvent::ClockStepped { magnitude_ns: 1_000_000 });

        // holdoff_after_step_ticks = 5: estimates after updates 1..=5 are
        // untrustworthy even once enough samples exist again.
        let mut reference = 100_000_000_000;
        for tick in 1..=12 {
            reference += 1_000_000_000;
            obs.update(reference, reference + 10 * tick as i64);
            let est = obs.estimate();
            if tick <= 5 {
                assert!(
                    !est.trustworthy,
                    "tick {} within holdoff must be untrusted",
                    tick
                );
            }
        }
        // Enough samples and holdoff long expired.
        assert!(obs.estimate().trustworthy);
    }

    #[test]
    fn test_frequency_adjust_epoch_and_short_holdoff() {
        let mut obs = DriftObserver::new("gps-nic", small_cfg());
        feed_linear(&mut obs, 10, 0, 10);
        let epoch = obs.estimate().current_epoch;

        obs.notify(ObserverEvent::FrequencyAdjusted { ppb: -50_000 });
        let est = obs.estimate();
        assert_eq!(est.current_epoch, epoch + 1);
        assert_eq!(est.ticks_in_holdoff, 2);
        assert_eq!(est.valid_samples, 0);
    }

    #[test]
    fn test_reference_lost_freezes_without_clearing() {
        let mut obs = DriftObserver::new("gps-nic", small_cfg());
        feed_linear(&mut obs, 12, 0, 10);
        let before = obs.estimate();
        assert!(before.trustworthy);

        obs.notify(ObserverEvent::ReferenceLost);
        let during = obs.estimate();
        assert!(!during.trustworthy);
        assert_ne!(during.health_flags & health_flags::REFERENCE_BAD, 0);
        // Window intact: same statistics, same sample count.
        assert_eq!(during.valid_samples, before.valid_samples);
        assert!((during.drift_ppm - before.drift_ppm).abs() < 1e-12);

        // Updates while lost are ignored, not accumulated.
        obs.update(999_000_000_000, 999_000_000_000);
        assert_eq!(obs.estimate().valid_samples, before.valid_samples);

        obs.notify(ObserverEvent::ReferenceRecovered);
        assert!(obs.estimate().trustworthy);
    }

    #[test]
    fn test_reference_change_long_holdoff() {
        let mut obs = DriftObserver::new("gps-nic", small_cfg());
        feed_linear(&mut obs, 10, 0, 10);
        let epoch = obs.estimate().current_epoch;

        obs.notify(ObserverEvent::ReferenceChanged);
        let est = obs.estimate();
        assert_eq!(est.current_epoch, epoch + 1);
        assert_eq!(
            est.ticks_in_holdoff,
            ObserverConfig::default().holdoff_after_ref_ticks,
            "a new reference needs the longest settle time"
        );
        assert_eq!(est.valid_samples, 0);
    }

    #[test]
    fn test_clock_slew_keeps_history() {
        let mut obs = DriftObserver::new("gps-nic", small_cfg());
        feed_linear(&mut obs, 12, 0, 10);
        let before = obs.estimate();

        obs.notify(ObserverEvent::ClockSlewed { magnitude_ns: 500 });
        let est = obs.estimate();
        // No epoch bump, samples survive; only a short settle.
        assert_eq!(est.current_epoch, before.current_epoch);
        assert_eq!(est.valid_samples, before.valid_samples);
        assert_eq!(est.ticks_in_holdoff, 1);
        assert!(!est.trustworthy);
    }

    #[test]
    fn test_servo_mode_change_clears_window() {
        let mut obs = DriftObserver::new("gps-nic", small_cfg());
        feed_linear(&mut obs, 10, 0, 10);

        obs.notify(ObserverEvent::ServoModeChanged);
        let est = obs.estimate();
        assert_eq!(est.valid_samples, 0);
        assert_eq!(est.ticks_in_holdoff, 0);
    }

    #[test]
    fn test_warm_start_resets() {
        let mut obs = DriftObserver::new("gps-nic", small_cfg());
        feed_linear(&mut obs, 10, 0, 10);
        obs.notify(ObserverEvent::ReferenceLost);

        obs.notify(ObserverEvent::WarmStartRequested);
        let est = obs.estimate();
        assert_eq!(est.valid_samples, 0);
        assert_eq!(est.health_flags & health_flags::REFERENCE_BAD, 0);
    }

    #[test]
    fn test_trusted_statistics_single_epoch_only() {
        let mut obs = DriftObserver::new("gps-nic", small_cfg());
        feed_linear(&mut obs, 10, 0, 10);
        obs.notify(ObserverEvent::ServoModeChanged);

        // New regime with a very different drift.
        for i in 0..12i64 {
            let reference = 500_000_000_000 + i * 1_000_000_000;
            obs.update(reference, reference + i * 100);
        }

        let est = obs.estimate();
        // Every contributing sample has the current epoch: the estimate
        // reflects only the 100ns/s regime.
        assert!((est.drift_ppm - 0.1).abs() < 0.01, "drift {}", est.drift_ppm);
    }

    #[test]
    fn test_high_variance_blocks_trust() {
        let mut cfg = small_cfg();
        cfg.max_drift_stddev_ppm = 0.001;
        cfg.outlier_mad_sigma = 100.0; // let noisy samples through
        let mut obs = DriftObserver::new("gps-nic", cfg);

        for i in 0..15i64 {
            let reference = i * 1_000_000_000;
            let noise = if i % 2 == 0 { 400 } else { -400 };
            obs.update(reference, reference + noise);
        }

        let est = obs.estimate();
        assert!(est.ready);
        assert!(!est.trustworthy);
        assert_ne!(est.health_flags & health_flags::HIGH_VARIANCE, 0);
    }

    #[test]
    fn test_window_wraps_by_oldest() {
        let mut cfg = small_cfg();
        cfg.window_size = 8;
        let mut obs = DriftObserver::new("gps-nic", cfg);

        feed_linear(&mut obs, 30, 0, 10);
        let est = obs.estimate();
        // Ring holds at most window_size samples; seq keeps counting.
        assert!(est.valid_samples <= 8);
        assert_eq!(est.total_samples, 30);
        assert_eq!(obs.last_sample().unwrap().seq, 29);
    }

    #[test]
    fn test_dropout_flag_sticky_until_valid_sample() {
        let mut obs = DriftObserver::new("gps-nic", small_cfg());
        feed_linear(&mut obs, 6, 0, 10);

        obs.mark_dropout();
        assert_ne!(
            obs.estimate().health_flags & health_flags::MISSING_TICKS,
            0
        );

        feed_linear_continue(&mut obs, 1);
        assert_eq!(
            obs.estimate().health_flags & health_flags::MISSING_TICKS,
            0
        );
    }

    #[test]
    fn test_estimate_empty_window() {
        let obs = DriftObserver::new("gps-nic", small_cfg());
        let est = obs.estimate();
        assert!(!est.ready);
        assert!(!est.trustworthy);
        assert_eq!(est.valid_samples, 0);
        assert_ne!(est.health_flags & health_flags::WARMING_UP, 0);
    }

    #[test]
    fn test_regress_helper_exact() {
        // y = 7 + 3t
        let ys: Vec<f64> = (0..10).map(|t| 7.0 + 3.0 * t as f64).collect();
        let (slope, rms) = regress(&ys);
        assert!((slope - 3.0).abs() < 1e-12);
        assert!(rms < 1e-9);
    }
}
