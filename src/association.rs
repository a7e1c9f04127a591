//! PPS-to-UTC association lock.
//!
//! A PPS edge on its own is just "some second boundary"; the NMEA stream
//! names the second but arrives late and jittery. This module binds the two:
//! it watches consecutive (pulse, sentence) pairs and asserts a lock once
//! the pulse sequence, the UTC seconds and the sentence latency have all
//! been consistent for `lock_confirmation_count` pulses. While locked, every
//! pulse gets its UTC label from an immutable base pair, never from the
//! jittery per-sentence data.

use log::{info, warn};
use std::collections::VecDeque;

use crate::config::AssociationConfig;
use crate::traits::ReferenceTick;

const NS_PER_SEC: i64 = 1_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Locked,
    Unlocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossReason {
    PulseGap,
    TimeJump,
    FixLost,
    LatencyOutOfBand,
    SentenceMissing,
}

/// The frozen base pair. For any later pulse,
/// `utc_sec(pps_seq) = base_utc_sec + (pps_seq - base_pps_seq)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Association {
    pub base_pps_seq: u64,
    pub base_utc_sec: u64,
}

#[derive(Debug, Clone, Copy)]
struct PulseEntry {
    pps_seq: u64,
    utc_sec: u64,
    latency_ns: i64,
}

#[derive(Debug)]
pub struct AssociationLock {
    cfg: AssociationConfig,
    history: VecDeque<PulseEntry>,
    base: Option<Association>,
    last_loss: Option<LossReason>,
    lock_count: u64,
    loss_count: u64,
}

impl AssociationLock {
    pub fn new(cfg: AssociationConfig) -> Self {
        let depth = cfg.lock_confirmation_count.max(2);
        AssociationLock {
            cfg,
            history: VecDeque::with_capacity(depth + 1),
            base: None,
            last_loss: None,
            lock_count: 0,
            loss_count: 0,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.base.is_some()
    }

    pub fn association(&self) -> Option<Association> {
        self.base
    }

    pub fn last_loss(&self) -> Option<LossReason> {
        self.last_loss
    }

    /// UTC label for a pulse, in nanoseconds. Defined only while locked.
    pub fn utc_for(&self, pps_seq: u64) -> Option<i64> {
        let base = self.base?;
        let delta = pps_seq as i64 - base.base_pps_seq as i64;
        Some((base.base_utc_sec as i64 + delta) * NS_PER_SEC)
    }

    /// Feed one PPS edge with its (possibly absent) matched sentence data.
    pub fn ingest(&mut self, tick: &ReferenceTick) -> LockState {
        if self.base.is_some() {
            match self.check_continuation(tick) {
                Ok(entry) => {
                    self.push_entry(entry);
                    return LockState::Locked;
                }
                Err(reason) => {
                    self.lose_lock(reason);
                    // A failed pulse never contributes to reacquisition:
                    // the fault it carries would poison the fresh history.
                    return LockState::Unlocked;
                }
            }
        }

        self.ingest_unlocked(tick)
    }

    /// Drop the lock for an externally detected fault (e.g. the provider
    /// reported a timeout and the pulse never arrived).
    pub fn invalidate(&mut self, reason: LossReason) {
        if self.base.is_some() {
            self.lose_lock(reason);
        } else {
            self.history.clear();
        }
    }

    pub fn stats(&self) -> (u64, u64) {
        (self.lock_count, self.loss_count)
    }

    fn check_continuation(&self, tick: &ReferenceTick) -> Result<PulseEntry, LossReason> {
        if !tick.fix_valid {
            return Err(LossReason::FixLost);
        }
        let (utc_sec, arrival) = match (tick.nmea_utc_sec, tick.nmea_arrival_mono_ns) {
            (Some(u), Some(a)) => (u, a),
            // An unverifiable pulse must not keep the lock alive.
            _ => return Err(LossReason::SentenceMissing),
        };
        let latency_ns = arrival - tick.mono_capture_ns;
        if !self.latency_admissible(latency_ns) {
            return Err(LossReason::LatencyOutOfBand);
        }
        if let Some(prev) = self.history.back() {
            if tick.pps_seq != prev.pps_seq + 1 {
                return Err(LossReason::PulseGap);
            }
            if utc_sec != prev.utc_sec + 1 {
                return Err(LossReason::TimeJump);
            }
        }
        Ok(PulseEntry {
            pps_seq: tick.pps_seq,
            utc_sec,
            latency_ns,
        })
    }

    fn ingest_unlocked(&mut self, tick: &ReferenceTick) -> LockState {
        let (utc_sec, arrival) = match (tick.nmea_utc_sec, tick.nmea_arrival_mono_ns) {
            (Some(u), Some(a)) if tick.fix_valid => (u, a),
            _ => {
                self.history.clear();
                return LockState::Unlocked;
            }
        };

        let latency_ns = arrival - tick.mono_capture_ns;
        if !self.latency_admissible(latency_ns) {
            self.history.clear();
            return LockState::Unlocked;
        }

        if let Some(prev) = self.history.back() {
            if tick.pps_seq != prev.pps_seq + 1 || utc_sec != prev.utc_sec + 1 {
                self.history.clear();
            }
        }

        self.push_entry(PulseEntry {
            pps_seq: tick.pps_seq,
            utc_sec,
            latency_ns,
        });

        if self.history.len() >= self.cfg.lock_confirmation_count {
            let newest = *self.history.back().expect("history non-empty");
            self.base = Some(Association {
                base_pps_seq: newest.pps_seq,
                base_utc_sec: newest.utc_sec,
            });
            self.last_loss = None;
            self.lock_count += 1;
            info!(
                "[Assoc] Locked: pulse {} = UTC {}s (confirmed over {} pulses, latency {}ms)",
                newest.pps_seq,
                newest.utc_sec,
                self.history.len(),
                newest.latency_ns / 1_000_000
            );
            return LockState::Locked;
        }

        LockState::Unlocked
    }

    fn lose_lock(&mut self, reason: LossReason) {
        self.base = None;
        self.history.clear();
        self.last_loss = Some(reason);
        self.loss_count += 1;
        warn!("[Assoc] Lock lost: {:?}", reason);
    }

    fn push_entry(&mut self, entry: PulseEntry) {
        self.history.push_back(entry);
        while self.history.len() > self.cfg.lock_confirmation_count {
            self.history.pop_front();
        }
    }

    fn latency_admissible(&self, latency_ns: i64) -> bool {
        let min = self.cfg.nmea_latency_min_ms as i64 * 1_000_000;
        let max = self.cfg.nmea_latency_max_ms as i64 * 1_000_000;
        (min..=max).contains(&latency_ns)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(seq: u64, utc: u64) -> ReferenceTick {
        // 100ms sentence latency, well inside the default band.
        let edge = seq as i64 * 1_000_000_000;
        ReferenceTick {
            pps_seq: seq,
            mono_capture_ns: edge,
            nmea_utc_sec: Some(utc),
            nmea_arrival_mono_ns: Some(edge + 100_000_000),
            fix_valid: true,
        }
    }

    fn lock_after_k(lock: &mut AssociationLock, start_seq: u64, start_utc: u64) {
        for i in 0..5 {
            let state = lock.ingest(&tick(start_seq + i, start_utc + i));
            if i < 4 {
                assert_eq!(state, LockState::Unlocked, "locked too early at pulse {}", i);
            } else {
                assert_eq!(state, LockState::Locked);
            }
        }
    }

    #[test]
    fn test_locks_after_confirmation_count() {
        let mut lock = AssociationLock::new(AssociationConfig::default());
        lock_after_k(&mut lock, 100, 1_700_000_000);
        assert!(lock.is_locked());

        let assoc = lock.association().unwrap();
        assert_eq!(assoc.base_pps_seq, 104);
        assert_eq!(assoc.base_utc_sec, 1_700_000_004);
    }

    #[test]
    fn test_utc_labels_are_one_second_apart() {
        let mut lock = AssociationLock::new(AssociationConfig::default());
        lock_after_k(&mut lock, 10, 5000);

        for seq in 15..40 {
            let a = lock.utc_for(seq).unwrap();
            let b = lock.utc_for(seq - 1).unwrap();
            assert_eq!(a - b, 1_000_000_000);
        }
    }

    #[test]
    fn test_base_frozen_while_locked() {
        let mut lock = AssociationLock::new(AssociationConfig::default());
        lock_after_k(&mut lock, 0, 1000);
        let base = lock.association().unwrap();

        // 50 more consistent pulses must not re-anchor the mapping.
        for i in 5..55 {
            assert_eq!(lock.ingest(&tick(i, 1000 + i)), LockState::Locked);
            assert_eq!(lock.association().unwrap(), base);
        }
    }

    #[test]
    fn test_pulse_gap_drops_lock() {
        let mut lock = AssociationLock::new(AssociationConfig::default());
        lock_after_k(&mut lock, 0, 1000);

        // Pulse 5 missing, pulse 6 arrives.
        assert_eq!(lock.ingest(&tick(6, 1006)), LockState::Unlocked);
        assert!(!lock.is_locked());
        assert_eq!(lock.last_loss(), Some(LossReason::PulseGap));
        assert_eq!(lock.utc_for(7), None);
    }

    #[test]
    fn test_time_jump_drops_lock() {
        let mut lock = AssociationLock::new(AssociationConfig::default());
        lock_after_k(&mut lock, 0, 1000);

        // UTC skips two seconds on a contiguous pulse.
        assert_eq!(lock.ingest(&tick(5, 1007)), LockState::Unlocked);
        assert_eq!(lock.last_loss(), Some(LossReason::TimeJump));
    }

    #[test]
    fn test_fix_drop_drops_lock() {
        let mut lock = AssociationLock::new(AssociationConfig::default());
        lock_after_k(&mut lock, 0, 1000);

        let mut t = tick(5, 1005);
        t.fix_valid = false;
        assert_eq!(lock.ingest(&t), LockState::Unlocked);
        assert_eq!(lock.last_loss(), Some(LossReason::FixLost));
    }

    #[test]
    fn test_latency_outside_band_drops_lock() {
        let mut lock = AssociationLock::new(AssociationConfig::default());
        lock_after_k(&mut lock, 0, 1000);

        let mut t = tick(5, 1005);
        // Sentence arrives 950ms after the edge: beyond the 800ms ceiling,
        // it probably describes the wrong pulse.
        t.nmea_arrival_mono_ns = Some(t.mono_capture_ns + 950_000_000);
        assert_eq!(lock.ingest(&t), LockState::Unlocked);
        assert_eq!(lock.last_loss(), Some(LossReason::LatencyOutOfBand));
    }

    #[test]
    fn test_latency_too_small_prevents_lock() {
        let mut lock = AssociationLock::new(AssociationConfig::default());

        // A sentence 5ms after the edge is faster than a serial GPS can
        // produce; it must belong to the previous pulse.
        for i in 0..10 {
            let mut t = tick(i, 1000 + i);
            t.nmea_arrival_mono_ns = Some(t.mono_capture_ns + 5_000_000);
            assert_eq!(lock.ingest(&t), LockState::Unlocked);
        }
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_missing_sentence_while_locked() {
        let mut lock = AssociationLock::new(AssociationConfig::default());
        lock_after_k(&mut lock, 0, 1000);

        let mut t = tick(5, 1005);
        t.nmea_utc_sec = None;
        t.nmea_arrival_mono_ns = None;
        assert_eq!(lock.ingest(&t), LockState::Unlocked);
        assert_eq!(lock.last_loss(), Some(LossReason::SentenceMissing));
    }

    #[test]
    fn test_relock_after_loss_uses_new_base() {
        let mut lock = AssociationLock::new(AssociationConfig::default());
        lock_after_k(&mut lock, 0, 1000);
        lock.ingest(&tick(7, 1007)); // gap -> loss

        // Clean run from pulse 8 re-locks with a fresh anchor.
        for i in 0..5 {
            lock.ingest(&tick(8 + i, 1008 + i));
        }
        assert!(lock.is_locked());
        let assoc = lock.association().unwrap();
        assert_eq!(assoc.base_pps_seq, 12);
        assert_eq!(assoc.base_utc_sec, 1012);
        assert_eq!(lock.utc_for(13), Some(1013 * 1_000_000_000));
    }

    #[test]
    fn test_failed_ingest_preserves_no_mapping() {
        let mut lock = AssociationLock::new(AssociationConfig::default());

        // Broken stream: alternating gaps never let the history fill.
        for i in 0..20 {
            let state = lock.ingest(&tick(i * 2, 1000 + i));
            assert_eq!(state, LockState::Unlocked);
            assert_eq!(lock.utc_for(i * 2), None);
        }
    }

    #[test]
    fn test_invalidate_counts_as_loss() {
        let mut lock = AssociationLock::new(AssociationConfig::default());
        lock_after_k(&mut lock, 0, 1000);

        lock.invalidate(LossReason::PulseGap);
        assert!(!lock.is_locked());
        let (locks, losses) = lock.stats();
        assert_eq!(locks, 1);
        assert_eq!(losses, 1);
    }
}
