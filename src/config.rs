use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub association: AssociationConfig,
    pub observer: ObserverConfig,
    pub disciplinor: DisciplinorConfig,
    pub rtc_discipline: RtcDisciplineConfig,
}

/// PPS-to-UTC association lock (pulse labelling).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssociationConfig {
    /// Consecutive consistent pulses required to assert the lock.
    pub lock_confirmation_count: usize,
    /// Admissible NMEA-behind-PPS latency band (sentence arrival minus edge).
    pub nmea_latency_min_ms: u64,
    pub nmea_latency_max_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObserverConfig {
    /// Ring capacity, preallocated. One sample per PPS tick.
    pub window_size: usize,
    /// Valid samples required before the estimate reports ready.
    pub min_valid_samples: usize,
    /// Tolerated deviation of the reference delta from exactly 1 s.
    pub max_dt_ref_deviation_ns: i64,
    /// Offset jump above this is treated as an uncommanded clock step.
    pub max_offset_step_ns: i64,
    /// Instantaneous drift beyond this is physically implausible.
    pub max_plausible_drift_ns_per_s: f64,
    /// MAD multiplier for outlier rejection.
    pub outlier_mad_sigma: f64,
    /// MAD floor, keeps the gate sane on ultra-quiet clock pairs.
    pub outlier_mad_floor_ns_per_s: f64,
    /// Least-squares slope over the window (true) or MAD-filtered
    /// mean-of-deltas (false).
    pub use_linear_regression: bool,
    pub holdoff_after_step_ticks: u32,
    pub holdoff_after_freq_ticks: u32,
    pub holdoff_after_ref_ticks: u32,
    /// Invalid-sample ratio above which the estimate is untrusted.
    pub max_invalid_ratio: f64,
    /// Drift spread above which the estimate is untrusted.
    pub max_drift_stddev_ppm: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisciplinorConfig {
    /// Offset above which the initial alignment step fires.
    pub startup_step_threshold_ns: i64,
    /// Offset above which a steady-state re-alignment step fires.
    pub run_step_threshold_ns: i64,
    /// Offset forcing an emergency re-alignment during tracking.
    pub emergency_step_threshold_ns: i64,
    /// Alignment is considered done below this offset.
    pub capture_range_ns: i64,
    /// Ticks after a step during which drift measurement is suppressed.
    pub stabilization_guard_ticks: u32,
    pub skip_samples_after_step: u32,
    /// Length of the protected bias-capture window, in PPS pulses.
    pub bias_capture_pulses: u64,
    pub bias_capture_max_retries: u32,
    /// Apply the negated captured bias immediately on capture exit.
    pub preapply_captured_bias: bool,
    /// Warn above soft, reject bias measurements above hard.
    pub drift_soft_ppm: f64,
    pub drift_hard_ppm: f64,
    /// EMA smoothing factor for the tracked drift.
    pub ema_alpha: f64,
    /// Per-tick cap on the steering delta.
    pub max_freq_step_ppb: i32,
    /// Steering deltas below this are not worth an adapter call.
    pub min_freq_update_ppb: i32,
    /// Optional integral trim on residual phase error (off by default).
    pub integral_trim_enabled: bool,
    pub integral_gain_ppb_per_ns: f64,
    /// Steering decay toward zero while in holdover; 0 freezes.
    pub holdover_decay_ppb_per_s: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RtcDisciplineConfig {
    /// Oscillator trim granularity of the aging register.
    pub ppm_per_lsb: f64,
    /// Drift below this is left to accumulate rather than chased.
    pub threshold_ppm: f64,
    /// Per-adjustment clamp on the register delta.
    pub max_lsb_delta: i8,
    /// Minimum spacing between register writes.
    pub min_interval_s: u64,
    pub min_samples_before_first_adjustment: u64,
}

impl Default for SystemConfig {
    fn default() -> Self {
        SystemConfig {
            association: AssociationConfig::default(),
            observer: ObserverConfig::default(),
            disciplinor: DisciplinorConfig::default(),
            rtc_discipline: RtcDisciplineConfig::default(),
        }
    }
}

impl Default for AssociationConfig {
    fn default() -> Self {
        AssociationConfig {
            lock_confirmation_count: 5,
            nmea_latency_min_ms: 20,
            nmea_latency_max_ms: 800,
        }
    }
}

impl Default for ObserverConfig {
    fn default() -> Self {
        ObserverConfig {
            window_size: 120,
            min_valid_samples: 30,
            max_dt_ref_deviation_ns: 2_000_000,
            max_offset_step_ns: 1_000_000,
            max_plausible_drift_ns_per_s: 500_000.0, // 500 ppm
            outlier_mad_sigma: 4.5,
            outlier_mad_floor_ns_per_s: 50.0,
            use_linear_regression: true,
            holdoff_after_step_ticks: 5,
            holdoff_after_freq_ticks: 2,
            holdoff_after_ref_ticks: 10,
            max_invalid_ratio: 0.25,
            max_drift_stddev_ppm: 5.0,
        }
    }
}

impl Default for DisciplinorConfig {
    fn default() -> Self {
        DisciplinorConfig {
            startup_step_threshold_ns: 100_000_000,    // 100 ms
            run_step_threshold_ns: 1_000_000_000,      // 1 s
            emergency_step_threshold_ns: 500_000_000,  // 500 ms
            // Equal to the startup step threshold so there is no offset
            // band where alignment can neither step nor complete.
            capture_range_ns: 100_000_000,
            stabilization_guard_ticks: 3,
            skip_samples_after_step: 3,
            bias_capture_pulses: 20,
            bias_capture_max_retries: 3,
            preapply_captured_bias: true,
            drift_soft_ppm: 200.0,
            drift_hard_ppm: 2000.0,
            ema_alpha: 0.1,
            max_freq_step_ppb: 20_000,
            min_freq_update_ppb: 1,
            integral_trim_enabled: false,
            integral_gain_ppb_per_ns: 0.001,
            holdover_decay_ppb_per_s: 0,
        }
    }
}

impl Default for RtcDisciplineConfig {
    fn default() -> Self {
        RtcDisciplineConfig {
            ppm_per_lsb: 0.1,
            threshold_ppm: 0.1,
            max_lsb_delta: 3,
            min_interval_s: 1200,
            min_samples_before_first_adjustment: 60,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let cfg = SystemConfig::default();
        assert_eq!(cfg.association.lock_confirmation_count, 5);
        assert_eq!(cfg.association.nmea_latency_min_ms, 20);
        assert_eq!(cfg.association.nmea_latency_max_ms, 800);
        assert_eq!(cfg.observer.window_size, 120);
        assert_eq!(cfg.observer.min_valid_samples, 30);
        assert!(cfg.observer.use_linear_regression);
        assert_eq!(cfg.disciplinor.bias_capture_pulses, 20);
        assert_eq!(cfg.disciplinor.max_freq_step_ppb, 20_000);
        assert!(!cfg.disciplinor.integral_trim_enabled);
        assert_eq!(cfg.rtc_discipline.min_interval_s, 1200);
        assert_eq!(cfg.rtc_discipline.max_lsb_delta, 3);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        // A config file that only overrides one knob must still produce a
        // complete config.
        let json = r#"{ "observer": { "window_size": 60 } }"#;
        let cfg: SystemConfig = serde_json::from_str(json).expect("parse failed");
        assert_eq!(cfg.observer.window_size, 60);
        assert_eq!(cfg.observer.min_valid_samples, 30);
        assert_eq!(cfg.disciplinor.bias_capture_pulses, 20);
    }

    #[test]
    fn test_serde_roundtrip() {
        let mut cfg = SystemConfig::default();
        cfg.disciplinor.ema_alpha = 0.2;
        cfg.rtc_discipline.threshold_ppm = 0.05;

        let json = serde_json::to_string(&cfg).expect("serialize failed");
        let restored: SystemConfig = serde_json::from_str(&json).expect("deserialize failed");

        assert!((restored.disciplinor.ema_alpha - 0.2).abs() < f64::EPSILON);
        assert!((restored.rtc_discipline.threshold_ppm - 0.05).abs() < f64::EPSILON);
    }

    #[test]
    fn test_config_file_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");

        let mut cfg = SystemConfig::default();
        cfg.observer.window_size = 240;
        std::fs::write(&path, serde_json::to_string_pretty(&cfg).unwrap()).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let restored: SystemConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(restored.observer.window_size, 240);
    }
}
