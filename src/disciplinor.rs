//! Time disciplinor: the operating-mode state machine.
//!
//! Modes and transitions:
//!
//! ```text
//!   (start) -> ACQ --aligned--> BIAS --measured--> TRACK --emergency--> ACQ
//!       ACQ/BIAS/TRACK --ref loss--> HOLD --ref back--> REACQ --> ACQ | BIAS
//! ```
//!
//! - **ACQ** (acquire alignment): step the local clock onto the reference.
//! - **BIAS** (capture frequency bias): a protected window of exactly
//!   `bias_capture_pulses` edges during which neither stepping nor steering
//!   is permitted; the raw frequency error is measured from the endpoints.
//! - **TRACK** (track and correct drift): cumulative frequency steering
//!   from the observer's estimate, never stepping except in emergencies.
//! - **HOLD** (holdover): reference gone; steering frozen (or decaying,
//!   per configuration).
//! - **REACQ**: transient router after reference recovery.
//!
//! The disciplinor is pure decision logic: it owns no device. Every tick
//! it returns one command and the controller applies it through the clock
//! adapter, then notifies the observers of what was done.

use log::{debug, info, warn};

use crate::config::DisciplinorConfig;
use crate::observer::Estimate;

const NS_PER_SEC: i64 = 1_000_000_000;

/// Reference-interval tolerance inside a bias-capture window, per pulse.
const BIAS_DT_TOLERANCE_NS_PER_PULSE: i64 = 2_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServoMode {
    AcquireAlignment,
    CaptureFrequencyBias,
    TrackAndCorrectDrift,
    Holdover,
    Reacquire,
}

impl ServoMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServoMode::AcquireAlignment => "ACQ",
            ServoMode::CaptureFrequencyBias => "BIAS",
            ServoMode::TrackAndCorrectDrift => "TRACK",
            ServoMode::Holdover => "HOLD",
            ServoMode::Reacquire => "REACQ",
        }
    }
}

/// What the controller should do with the local clock this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServoCommand {
    /// Jump the clock to this absolute UTC time (nanoseconds).
    Step { target_ns: i64 },
    /// Set the absolute frequency adjustment. Replaces, never adds.
    AdjustFrequency { ppb: i32 },
    /// Leave the clock alone (previous command stays in effect).
    Hold,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BiasRejectReason {
    PulseDropout,
    AssociationLost,
    DriftImplausible,
    DurationOutOfTolerance,
}

/// Everything the disciplinor needs about one tick.
#[derive(Debug, Clone, Copy)]
pub struct TickInput {
    pub pps_seq: u64,
    pub association_locked: bool,
    /// False when the controller saw a sequence gap this tick.
    pub pulse_continuous: bool,
    /// Pure NMEA+PPS-derived UTC label (no step bookkeeping folded in).
    pub reference_utc_ns: Option<i64>,
    pub local_clock_ns: i64,
    pub estimate: Estimate,
}

#[derive(Debug, Clone, Copy)]
struct BiasWindow {
    start_seq: u64,
    last_seq: u64,
    t0_reference_ns: i64,
    t0_local_ns: i64,
}

#[derive(Debug)]
pub struct TimeDisciplinor {
    cfg: DisciplinorConfig,
    /// Hardware steering range, from the clock adapter.
    max_adjustment_ppb: i32,

    mode: ServoMode,
    /// Set once the first alignment step has been taken.
    aligned_once: bool,

    /// Frequency error measured in the protected window (ppb; positive
    /// means the local clock runs fast).
    captured_bias_ppb: f64,
    /// Total learned frequency error: captured bias plus every residual
    /// folded in by commanded adjustments.
    learned_bias_ppb: f64,
    /// EMA of the residual drift reported by the observer since the last
    /// commanded adjustment.
    filtered_drift_ppb: f64,
    ema_seeded: bool,
    /// Optional integral trim on residual phase error.
    pi_correction_ppb: f64,
    /// Last absolute value commanded through the adapter.
    frequency_steering_ppb: i32,

    stabilization_guard: u32,
    skip_samples: u32,
    bias_window: Option<BiasWindow>,
    bias_retries: u32,
    last_bias_reject: Option<BiasRejectReason>,

    holdover_ticks: u64,
    last_offset_ns: i64,
}

impl TimeDisciplinor {
    pub fn new(cfg: DisciplinorConfig, max_adjustment_ppb: i32) -> Self {
        TimeDisciplinor {
            cfg,
            max_adjustment_ppb,
            mode: ServoMode::AcquireAlignment,
            aligned_once: false,
            captured_bias_ppb: 0.0,
            learned_bias_ppb: 0.0,
            filtered_drift_ppb: 0.0,
            ema_seeded: false,
            pi_correction_ppb: 0.0,
            frequency_steering_ppb: 0,
            stabilization_guard: 0,
            skip_samples: 0,
            bias_window: None,
            bias_retries: 0,
            last_bias_reject: None,
            holdover_ticks: 0,
            last_offset_ns: 0,
        }
    }

    pub fn mode(&self) -> ServoMode {
        self.mode
    }

    pub fn frequency_steering_ppb(&self) -> i32 {
        self.frequency_steering_ppb
    }

    pub fn captured_bias_ppb(&self) -> f64 {
        self.captured_bias_ppb
    }

    pub fn filtered_drift_ppb(&self) -> f64 {
        self.filtered_drift_ppb
    }

    pub fn last_offset_ns(&self) -> i64 {
        self.last_offset_ns
    }

    pub fn last_bias_reject(&self) -> Option<BiasRejectReason> {
        self.last_bias_reject
    }

    pub fn holdover_ticks(&self) -> u64 {
        self.holdover_ticks
    }

    /// One iteration per PPS tick.
    pub fn advance(&mut self, input: &TickInput) -> ServoCommand {
        if !input.association_locked {
            return self.tick_without_reference();
        }

        if self.mode == ServoMode::Holdover {
            info!(
                "[Servo] Reference recovered after {}s of holdover",
                self.holdover_ticks
            );
            self.mode = ServoMode::Reacquire;
        }

        let reference_ns = match input.reference_utc_ns {
            Some(r) => r,
            None => return ServoCommand::Hold,
        };
        let offset_ns = input.local_clock_ns - reference_ns;
        self.last_offset_ns = offset_ns;

        if self.mode == ServoMode::Reacquire {
            self.route_reacquire(offset_ns);
        }

        match self.mode {
            ServoMode::AcquireAlignment => self.tick_acquire(offset_ns, reference_ns),
            ServoMode::CaptureFrequencyBias => self.tick_capture(input, reference_ns),
            ServoMode::TrackAndCorrectDrift => self.tick_track(input, offset_ns, reference_ns),
            // Holdover/Reacquire were resolved above.
            _ => ServoCommand::Hold,
        }
    }

    // ========================================================================
    // HOLDOVER / REACQUIRE
    // ========================================================================

    fn tick_without_reference(&mut self) -> ServoCommand {
        match self.mode {
            ServoMode::AcquireAlignment if !self.aligned_once => {
                // Cold start without a lock yet: nothing to hold over.
                ServoCommand::Hold
            }
            ServoMode::Holdover => self.tick_holdover(),
            _ => {
                if self.bias_window.take().is_some() {
                    self.last_bias_reject = Some(BiasRejectReason::AssociationLost);
                    warn!("[Servo] Bias capture abandoned: association lost mid-window");
                }
                self.bias_retries = 0;
                self.holdover_ticks = 0;
                info!(
                    "[Servo] Holdover entered, steering frozen at {:+}ppb",
                    self.frequency_steering_ppb
                );
                self.mode = ServoMode::Holdover;
                self.tick_holdover()
            }
        }
    }

    fn tick_holdover(&mut self) -> ServoCommand {
        self.holdover_ticks += 1;

        let decay = self.cfg.holdover_decay_ppb_per_s;
        if decay > 0 && self.frequency_steering_ppb != 0 {
            let magnitude = self.frequency_steering_ppb.unsigned_abs().min(decay as u32) as i32;
            let next = self.frequency_steering_ppb - magnitude * self.frequency_steering_ppb.signum();
            self.frequency_steering_ppb = next;
            return ServoCommand::AdjustFrequency { ppb: next };
        }
        ServoCommand::Hold
    }

    fn route_reacquire(&mut self, offset_ns: i64) {
        if offset_ns.abs() > self.cfg.run_step_threshold_ns {
            info!(
                "[Servo] Reacquire: offset {:+}us, re-aligning",
                offset_ns / 1000
            );
            self.mode = ServoMode::AcquireAlignment;
        } else {
            info!(
                "[Servo] Reacquire: offset {:+}us, re-measuring bias",
                offset_ns / 1000
            );
            self.begin_bias_capture();
        }
    }

    // ========================================================================
    // ACQUIRE ALIGNMENT
    // ========================================================================

    fn tick_acquire(&mut self, offset_ns: i64, reference_ns: i64) -> ServoCommand {
        if self.stabilization_guard > 0 {
            self.stabilization_guard -= 1;
            return ServoCommand::Hold;
        }

        if offset_ns.abs() > self.cfg.startup_step_threshold_ns {
            info!(
                "[Servo] Stepping clock by {:+}us to align with reference",
                -offset_ns / 1000
            );
            self.aligned_once = true;
            self.stabilization_guard = self.cfg.stabilization_guard_ticks;
            self.skip_samples = self.cfg.skip_samples_after_step;
            return ServoCommand::Step {
                target_ns: reference_ns,
            };
        }

        if offset_ns.abs() < self.cfg.capture_range_ns {
            if self.skip_samples > 0 {
                self.skip_samples -= 1;
                return ServoCommand::Hold;
            }
            self.aligned_once = true;
            self.begin_bias_capture();
        }
        ServoCommand::Hold
    }

    // ========================================================================
    // CAPTURE FREQUENCY BIAS
    // ========================================================================

    fn begin_bias_capture(&mut self) {
        if self.mode != ServoMode::CaptureFrequencyBias {
            info!(
                "[Servo] Measuring frequency bias over {} pulses (steering held at {:+}ppb)",
                self.cfg.bias_capture_pulses, self.frequency_steering_ppb
            );
        }
        self.mode = ServoMode::CaptureFrequencyBias;
        self.bias_window = None;
    }

    fn tick_capture(&mut self, input: &TickInput, reference_ns: i64) -> ServoCommand {
        let window = match self.bias_window {
            None => {
                self.bias_window = Some(BiasWindow {
                    start_seq: input.pps_seq,
                    last_seq: input.pps_seq,
                    t0_reference_ns: reference_ns,
                    t0_local_ns: input.local_clock_ns,
                });
                return ServoCommand::Hold;
            }
            Some(w) => w,
        };

        if input.pps_seq != window.last_seq + 1 || !input.pulse_continuous {
            return self.reject_bias(BiasRejectReason::PulseDropout);
        }

        let elapsed = input.pps_seq - window.start_seq;
        if elapsed < self.cfg.bias_capture_pulses {
            self.bias_window = Some(BiasWindow {
                last_seq: input.pps_seq,
                ..window
            });
            return ServoCommand::Hold;
        }

        // Window complete: measure from the endpoints.
        let ref_delta = reference_ns - window.t0_reference_ns;
        let local_delta = input.local_clock_ns - window.t0_local_ns;

        let expected = self.cfg.bias_capture_pulses as i64 * NS_PER_SEC;
        let tolerance = self.cfg.bias_capture_pulses as i64 * BIAS_DT_TOLERANCE_NS_PER_PULSE;
        if (ref_delta - expected).abs() > tolerance {
            return self.reject_bias(BiasRejectReason::DurationOutOfTolerance);
        }

        let bias_ppb = (local_delta - ref_delta) as f64 / ref_delta as f64 * 1e9;
        let bias_ppm = bias_ppb / 1000.0;
        if bias_ppm.abs() > self.cfg.drift_hard_ppm {
            return self.reject_bias(BiasRejectReason::DriftImplausible);
        }
        if bias_ppm.abs() > self.cfg.drift_soft_ppm {
            warn!(
                "[Servo] Captured bias {:+.1}ppm is unusually large for a NIC oscillator",
                bias_ppm
            );
        }

        info!(
            "[Servo] Frequency bias captured: {:+.3}ppm over {} pulses",
            bias_ppm, self.cfg.bias_capture_pulses
        );
        self.enter_tracking(bias_ppb)
    }

    fn reject_bias(&mut self, reason: BiasRejectReason) -> ServoCommand {
        self.last_bias_reject = Some(reason);
        self.bias_window = None;
        self.bias_retries += 1;

        if self.bias_retries > self.cfg.bias_capture_max_retries {
            warn!(
                "[Servo] Bias capture failed {} times ({:?}); tracking with zero bias",
                self.bias_retries, reason
            );
            return self.enter_tracking(0.0);
        }

        warn!(
            "[Servo] Bias capture rejected ({:?}), retry {}/{}",
            reason, self.bias_retries, self.cfg.bias_capture_max_retries
        );
        ServoCommand::Hold
    }

    fn enter_tracking(&mut self, bias_ppb: f64) -> ServoCommand {
        self.captured_bias_ppb = bias_ppb;
        // The window measured the clock under whatever steering was held:
        // observed = natural + steering, so natural = observed - steering.
        self.learned_bias_ppb = bias_ppb - self.frequency_steering_ppb as f64;
        self.filtered_drift_ppb = 0.0;
        self.ema_seeded = false;
        self.pi_correction_ppb = 0.0;
        self.bias_window = None;
        self.bias_retries = 0;
        self.mode = ServoMode::TrackAndCorrectDrift;

        if self.cfg.preapply_captured_bias && bias_ppb.abs() >= self.cfg.min_freq_update_ppb as f64
        {
            let target = self.clamp_steering(-self.learned_bias_ppb);
            self.frequency_steering_ppb = target;
            info!("[Servo] Tracking: pre-applied steering {:+}ppb", target);
            return ServoCommand::AdjustFrequency { ppb: target };
        }
        info!("[Servo] Tracking with steering {:+}ppb", self.frequency_steering_ppb);
        ServoCommand::Hold
    }

    // ========================================================================
    // TRACK AND CORRECT DRIFT
    // ========================================================================

    fn tick_track(&mut self, input: &TickInput, offset_ns: i64, reference_ns: i64) -> ServoCommand {
        if offset_ns.abs() > self.cfg.emergency_step_threshold_ns {
            warn!(
                "[Servo] Emergency: offset {:+}ms exceeds tracking range, re-aligning",
                offset_ns / 1_000_000
            );
            self.mode = ServoMode::AcquireAlignment;
            self.stabilization_guard = self.cfg.stabilization_guard_ticks;
            self.skip_samples = self.cfg.skip_samples_after_step;
            self.ema_seeded = false;
            self.filtered_drift_ppb = 0.0;
            return ServoCommand::Step {
                target_ns: reference_ns,
            };
        }

        if !input.pulse_continuous {
            debug!("[Servo] Pulse discontinuity, steering frozen this tick");
            return ServoCommand::Hold;
        }

        let est = &input.estimate;
        if !est.trustworthy {
            return ServoCommand::Hold;
        }

        // Residual drift under the currently applied steering, smoothed.
        let raw_ppb = est.drift_ppm * 1000.0;
        if self.ema_seeded {
            self.filtered_drift_ppb += self.cfg.ema_alpha * (raw_ppb - self.filtered_drift_ppb);
        } else {
            self.filtered_drift_ppb = raw_ppb;
            self.ema_seeded = true;
        }

        if self.cfg.integral_trim_enabled {
            self.pi_correction_ppb += self.cfg.integral_gain_ppb_per_ns * offset_ns as f64;
        }

        let desired_total = self.learned_bias_ppb + self.filtered_drift_ppb;
        let mut target = self.clamp_steering(-(desired_total + self.pi_correction_ppb));

        // Per-tick slew limit.
        let delta = target - self.frequency_steering_ppb;
        if delta.abs() > self.cfg.max_freq_step_ppb {
            target = self.frequency_steering_ppb + self.cfg.max_freq_step_ppb * delta.signum();
        }

        if (target - self.frequency_steering_ppb).abs() < self.cfg.min_freq_update_ppb {
            return ServoCommand::Hold;
        }

        // Fold the residual we are about to correct into the learned bias;
        // the observer restarts its epoch at the new steering, so the next
        // residual is measured from scratch.
        self.learned_bias_ppb = -(target as f64) - self.pi_correction_ppb;
        self.filtered_drift_ppb = 0.0;
        self.ema_seeded = false;
        self.frequency_steering_ppb = target;

        debug!(
            "[Servo] TRACK drift {:+.1}ppb -> steering {:+}ppb",
            raw_ppb, target
        );
        ServoCommand::AdjustFrequency { ppb: target }
    }

    fn clamp_steering(&self, ppb: f64) -> i32 {
        let max = self.max_adjustment_ppb as f64;
        ppb.clamp(-max, max) as i32
    }
}

// ============================================================================
// TESTS
// ============================================================================
