use serde::{Deserialize, Serialize};

/// Grandmaster status snapshot, shared for display and monitoring.
///
/// Mirrors the per-tick telemetry record: one instance lives behind an
/// `Arc<RwLock<_>>` and is refreshed by the worker thread after every tick.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct GrandmasterStatus {
    /// Sequence number of the last processed PPS edge.
    pub pps_seq: u64,

    /// True when the last tick followed a sequence gap.
    pub dropout: bool,

    /// UTC label of the last edge (ns), when the association is locked.
    pub reference_utc_ns: Option<i64>,

    /// Local clock reading at the last edge (ns).
    pub local_clock_ns: i64,

    /// clock - reference at the last edge (ns).
    pub offset_ns: i64,

    /// Unsmoothed per-tick drift (ppb).
    pub drift_ppb_raw: f64,

    /// EMA-filtered drift the servo acts on (ppb).
    pub drift_ppb_filtered: f64,

    /// Frequency bias measured in the capture window (ppb).
    pub frequency_bias_ppb: f64,

    /// Total steering currently commanded on the hardware (ppb).
    pub frequency_total_ppb: i32,

    /// Servo mode: "ACQ", "BIAS", "TRACK", "HOLD", "REACQ".
    pub servo_mode: String,

    /// True while the PPS-to-UTC association holds.
    pub association_locked: bool,

    /// Observer health bitmask (see `observer::health_flags`).
    pub observer_health: u16,

    pub estimate_ready: bool,
    pub estimate_trustworthy: bool,

    /// Current RTC aging-offset register value, when known.
    pub rtc_aging_offset: Option<i8>,

    /// Unix timestamp of the last status refresh.
    pub updated_ts: u64,
}

impl Default for GrandmasterStatus {
    fn default() -> Self {
        GrandmasterStatus {
            pps_seq: 0,
            dropout: false,
            reference_utc_ns: None,
            local_clock_ns: 0,
            offset_ns: 0,
            drift_ppb_raw: 0.0,
            drift_ppb_filtered: 0.0,
            frequency_bias_ppb: 0.0,
            frequency_total_ppb: 0,
            servo_mode: "ACQ".to_string(),
            association_locked: false,
            observer_health: 0,
            estimate_ready: false,
            estimate_trustworthy: false,
            rtc_aging_offset: None,
            updated_ts: 0,
        }
    }
}
