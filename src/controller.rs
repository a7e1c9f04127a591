//! Grandmaster controller: sequences the core components once per PPS tick.
//!
//! Two-thread layout:
//! - The **tick thread** (real-time, pinned) blocks on the reference
//!   source, samples the local clock and the RTC as close to the edge as
//!   possible, and publishes a `TickRecord` into the shared slot. It never
//!   allocates and never touches user-level I/O.
//! - The **worker thread** drains the slot and runs association lock ->
//!   observer -> disciplinor -> adapter command -> RTC discipline ->
//!   status/telemetry. If the worker falls behind, the slot keeps only the
//!   latest record and the gap shows up as a sequence discontinuity.
//!
//! The controller contains no timing logic of its own; every decision
//! lives in the components it drives.

use anyhow::{anyhow, Result};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::{Duration, SystemTime};

use crate::association::{AssociationLock, LockState, LossReason};
use crate::config::SystemConfig;
use crate::disciplinor::{ServoCommand, ServoMode, TickInput, TimeDisciplinor};
use crate::observer::{DriftObserver, ObserverEvent};
use crate::rtc_discipline::RtcDiscipline;
use crate::status::GrandmasterStatus;
use crate::traits::{ClockDevice, ReferenceSource, RtcDevice, TimePublisher};

const NS_PER_SEC: i64 = 1_000_000_000;

/// Clock samples are back-dated to the PPS edge; past this sampling delay
/// the back-dating error (delay times inter-clock frequency error) is no
/// longer negligible and the whole tick is suspect.
const SAMPLING_LATENCY_WARN_NS: i64 = 1_200_000_000;

/// Consecutive adapter command failures before the fault is fatal.
const MAX_COMMAND_FAILURES: u32 = 5;

/// How long the tick thread waits for an edge before reporting a miss.
const TICK_DEADLINE: Duration = Duration::from_millis(1500);

// ============================================================================
// SHARED TICK SLOT
// ============================================================================

/// One PPS edge with the clock readings back-dated to it.
#[derive(Debug, Clone, Copy)]
pub struct TickRecord {
    pub tick: crate::traits::ReferenceTick,
    pub local_clock_ns: i64,
    pub rtc_clock_ns: Option<i64>,
    /// How long after the edge the clocks were actually sampled.
    pub sampling_latency_ns: i64,
}

/// Single-record mailbox between the tick thread and the worker. The tick
/// thread overwrites; the worker always sees only the newest record.
#[derive(Default)]
pub struct TickSlot {
    inner: Mutex<SlotState>,
    cond: Condvar,
}

#[derive(Default)]
struct SlotState {
    latest: Option<TickRecord>,
    closed: bool,
}

impl TickSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, record: TickRecord) {
        let mut state = self.inner.lock().expect("tick slot poisoned");
        if state.latest.is_some() {
            debug!("[GM] worker behind, overwriting unconsumed tick");
        }
        state.latest = Some(record);
        self.cond.notify_one();
    }

    /// Blocks until a record is available, the slot closes, or `timeout`.
    pub fn take(&self, timeout: Duration) -> Option<TickRecord> {
        let mut state = self.inner.lock().expect("tick slot poisoned");
        loop {
            if let Some(rec) = state.latest.take() {
                return Some(rec);
            }
            if state.closed {
                return None;
            }
            let (next, res) = self
                .cond
                .wait_timeout(state, timeout)
                .expect("tick slot poisoned");
            state = next;
            if res.timed_out() {
                return state.latest.take();
            }
        }
    }

    pub fn close(&self) {
        let mut state = self.inner.lock().expect("tick slot poisoned");
        state.closed = true;
        self.cond.notify_all();
    }
}

#[cfg(unix)]
pub(crate) fn monotonic_now_ns() -> i64 {
    match nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC) {
        Ok(ts) => ts.tv_sec() * NS_PER_SEC + ts.tv_nsec(),
        Err(_) => 0,
    }
}

// ============================================================================
// TICK THREAD
// ============================================================================

/// Body of the real-time tick thread. Waits for edges and publishes fresh
/// records until `running` clears.
pub fn tick_thread_loop<R, C, T>(
    mut source: R,
    clock: Arc<Mutex<C>>,
    rtc: Option<Arc<Mutex<T>>>,
    slot: Arc<TickSlot>,
    running: Arc<AtomicBool>,
) where
    R: ReferenceSource,
    C: ClockDevice,
    T: RtcDevice,
{
    while running.load(Ordering::SeqCst) {
        let tick = match source.next_tick(TICK_DEADLINE) {
            Ok(Some(t)) => t,
            Ok(None) => continue, // deadline; the worker's own timeout reports it
            Err(e) => {
                error!("[GM] reference source error: {}", e);
                std::thread::sleep(Duration::from_millis(100));
                continue;
            }
        };

        // The provider returns once the edge's sentence has arrived (or its
        // window closed), which is well after the edge itself. Back-date
        // every reading to the edge using the monotonic clock; the residual
        // error is delay times the inter-clock frequency difference, which
        // shrinks as the servo cancels the bias.
        #[cfg(unix)]
        let sampling_latency_ns = (monotonic_now_ns() - tick.mono_capture_ns).max(0);
        #[cfg(not(unix))]
        let sampling_latency_ns = 0;

        let local_clock_ns = {
            let mut clock = clock.lock().expect("clock adapter poisoned");
            match clock.read() {
                Ok((s, n)) => s as i64 * NS_PER_SEC + n as i64 - sampling_latency_ns,
                Err(e) => {
                    warn!("[GM] local clock read failed: {}", e);
                    continue;
                }
            }
        };

        let rtc_clock_ns = rtc.as_ref().and_then(|rtc| {
            let mut rtc = rtc.lock().expect("rtc adapter poisoned");
            match rtc.read() {
                Ok((s, n)) => Some(s as i64 * NS_PER_SEC + n as i64 - sampling_latency_ns),
                Err(e) => {
                    debug!("[GM] rtc read failed: {}", e);
                    None
                }
            }
        });

        slot.publish(TickRecord {
            tick,
            local_clock_ns,
            rtc_clock_ns,
            sampling_latency_ns,
        });
    }
    slot.close();
}

// ============================================================================
// WORKER / CONTROLLER
// ============================================================================

pub struct GrandmasterController<C, T, P>
where
    C: ClockDevice,
    T: RtcDevice,
    P: TimePublisher,
{
    clock: Arc<Mutex<C>>,
    rtc: Option<Arc<Mutex<T>>>,
    publisher: Option<P>,

    association: AssociationLock,
    observer: DriftObserver,
    disciplinor: TimeDisciplinor,
    rtc_discipline: RtcDiscipline,

    prev_seq: Option<u64>,
    was_locked_once: bool,
    command_failures: u32,
    rtc_aging_offset: Option<i8>,

    status_shared: Arc<RwLock<GrandmasterStatus>>,
}

impl<C, T, P> GrandmasterController<C, T, P>
where
    C: ClockDevice,
    T: RtcDevice,
    P: TimePublisher,
{
    pub fn new(
        clock: Arc<Mutex<C>>,
        rtc: Option<Arc<Mutex<T>>>,
        publisher: Option<P>,
        status_shared: Arc<RwLock<GrandmasterStatus>>,
        config: SystemConfig,
    ) -> Self {
        let max_adj_ppb = clock
            .lock()
            .expect("clock adapter poisoned")
            .max_adjustment_ppb();

        info!("=== Grandmaster Controller ===");
        info!(
            "Steering range {}ppb, observer window {} ticks, bias window {} pulses",
            max_adj_ppb, config.observer.window_size, config.disciplinor.bias_capture_pulses
        );

        GrandmasterController {
            clock,
            rtc,
            publisher,
            association: AssociationLock::new(config.association.clone()),
            observer: DriftObserver::new("gps-nic", config.observer.clone()),
            disciplinor: TimeDisciplinor::new(config.disciplinor.clone(), max_adj_ppb),
            rtc_discipline: RtcDiscipline::new(
                config.rtc_discipline.clone(),
                config.observer.clone(),
            ),
            prev_seq: None,
            was_locked_once: false,
            command_failures: 0,
            rtc_aging_offset: None,
            status_shared: status_shared.clone(),
        }
    }

    pub fn get_status_shared(&self) -> Arc<RwLock<GrandmasterStatus>> {
        self.status_shared.clone()
    }

    pub fn servo_mode(&self) -> ServoMode {
        self.disciplinor.mode()
    }

    /// The worker never received a tick within the deadline: the pulse
    /// itself is missing, which the association treats as a gap.
    pub fn on_tick_timeout(&mut self) {
        if self.association.is_locked() {
            warn!("[GM] PPS edge missed (deadline expired)");
            self.association.invalidate(LossReason::PulseGap);
            self.observer.notify(ObserverEvent::ReferenceLost);
            self.rtc_discipline.notify(ObserverEvent::ReferenceLost);
        }
        self.observer.mark_dropout();
    }

    /// Full per-tick sequence. Errors are fatal faults only (adapter gone);
    /// all data-quality problems degrade trust instead.
    pub fn process_record(&mut self, rec: TickRecord) -> Result<()> {
        let seq = rec.tick.pps_seq;

        if rec.sampling_latency_ns > SAMPLING_LATENCY_WARN_NS {
            warn!(
                "[GM] clocks sampled {}ms after the edge; tick quality degraded",
                rec.sampling_latency_ns / 1_000_000
            );
        }

        let pulse_continuous = match self.prev_seq {
            Some(prev) => seq == prev + 1,
            None => true,
        };
        if !pulse_continuous {
            debug!("[GM] pulse gap: {} -> {}", self.prev_seq.unwrap_or(0), seq);
            self.observer.mark_dropout();
        }
        self.prev_seq = Some(seq);

        // Association lock transitions drive the reference-good state of
        // every observer.
        let was_locked = self.association.is_locked();
        let lock_state = self.association.ingest(&rec.tick);
        match (was_locked, lock_state) {
            (true, LockState::Unlocked) => {
                self.observer.notify(ObserverEvent::ReferenceLost);
                self.rtc_discipline.notify(ObserverEvent::ReferenceLost);
            }
            (false, LockState::Locked) => {
                if self.was_locked_once {
                    self.observer.notify(ObserverEvent::ReferenceRecovered);
                    self.rtc_discipline.notify(ObserverEvent::ReferenceRecovered);
                }
                self.was_locked_once = true;
            }
            _ => {}
        }

        let reference_utc_ns = self.association.utc_for(seq);

        if let Some(reference_ns) = reference_utc_ns {
            self.observer.update(reference_ns, rec.local_clock_ns);
        }
        let estimate = self.observer.estimate();

        let mode_before = self.disciplinor.mode();
        let command = self.disciplinor.advance(&TickInput {
            pps_seq: seq,
            association_locked: self.association.is_locked(),
            pulse_continuous,
            reference_utc_ns,
            local_clock_ns: rec.local_clock_ns,
            estimate,
        });
        let mode_after = self.disciplinor.mode();
        if mode_after != mode_before {
            info!(
                "[GM] servo mode {} -> {}",
                mode_before.as_str(),
                mode_after.as_str()
            );
            // Holdover/reacquire transitions are governed by the reference
            // lost/recovered events, which deliberately keep the window.
            let reference_transition = |m: ServoMode| {
                matches!(m, ServoMode::Holdover | ServoMode::Reacquire)
            };
            if !reference_transition(mode_before) && !reference_transition(mode_after) {
                self.observer.notify(ObserverEvent::ServoModeChanged);
            }
        }

        self.apply_command(command, rec.local_clock_ns)?;

        // The RTC runs its own discipline against the same reference.
        if let (Some(reference_ns), Some(rtc_ns)) = (reference_utc_ns, rec.rtc_clock_ns) {
            self.run_rtc_discipline(reference_ns, rtc_ns);
        }

        self.publish_time(rec.local_clock_ns)?;
        self.update_shared_status(&rec, reference_utc_ns, &estimate, !pulse_continuous);
        self.log_tick(&rec, reference_utc_ns);
        Ok(())
    }

    // ========================================================================
    // COMMAND APPLICATION
    // ========================================================================

    fn apply_command(&mut self, command: ServoCommand, local_clock_ns: i64) -> Result<()> {
        let result = match command {
            ServoCommand::Hold => Ok(()),
            ServoCommand::Step { target_ns } => {
                let sec = (target_ns / NS_PER_SEC) as u64;
                let ns = (target_ns % NS_PER_SEC) as u32;
                let res = self
                    .clock
                    .lock()
                    .expect("clock adapter poisoned")
                    .step(sec, ns);
                if res.is_ok() {
                    info!("[GM] clock stepped by {:+}us", (target_ns - local_clock_ns) / 1000);
                    self.observer.notify(ObserverEvent::ClockStepped {
                        magnitude_ns: target_ns - local_clock_ns,
                    });
                }
                res
            }
            ServoCommand::AdjustFrequency { ppb } => {
                let res = self
                    .clock
                    .lock()
                    .expect("clock adapter poisoned")
                    .adjust_frequency(ppb);
                if res.is_ok() {
                    self.observer.notify(ObserverEvent::FrequencyAdjusted { ppb });
                }
                res
            }
        };

        match result {
            Ok(()) => {
                self.command_failures = 0;
                Ok(())
            }
            Err(e) => {
                self.command_failures += 1;
                warn!(
                    "[GM] clock command failed ({}/{}): {}",
                    self.command_failures, MAX_COMMAND_FAILURES, e
                );
                if self.command_failures >= MAX_COMMAND_FAILURES {
                    Err(anyhow!(
                        "clock adapter unusable after {} consecutive failures: {}",
                        self.command_failures,
                        e
                    ))
                } else {
                    Ok(())
                }
            }
        }
    }

    fn run_rtc_discipline(&mut self, reference_ns: i64, rtc_ns: i64) {
        let adjustment = match self.rtc_discipline.update(reference_ns, rtc_ns) {
            Some(adj) => adj,
            None => return,
        };
        let rtc = match &self.rtc {
            Some(rtc) => rtc,
            None => return,
        };

        let mut dev = rtc.lock().expect("rtc adapter poisoned");
        let before = match dev.read_aging_offset() {
            Ok(v) => v,
            Err(e) => {
                warn!("[RTC] aging offset read failed: {}", e);
                return;
            }
        };
        match dev.adjust_aging_offset(-adjustment.delta_lsb) {
            Ok(after) => {
                info!("[RTC] aging offset {} -> {}", before, after);
                self.rtc_aging_offset = Some(after);
                self.rtc_discipline.adjustment_applied(adjustment);
            }
            Err(e) => warn!("[RTC] aging offset write failed: {}", e),
        }
    }

    fn publish_time(&mut self, local_clock_ns: i64) -> Result<()> {
        if let Some(publisher) = &mut self.publisher {
            let healthy = self.association.is_locked()
                && self.disciplinor.mode() == ServoMode::TrackAndCorrectDrift;
            let sec = (local_clock_ns / NS_PER_SEC) as u64;
            let ns = (local_clock_ns % NS_PER_SEC) as u32;
            if let Err(e) = publisher.publish_tick(sec, ns, healthy) {
                warn!("[GM] time publish failed: {}", e);
            }
        }
        Ok(())
    }

    // ========================================================================
    // STATUS AND TELEMETRY
    // ========================================================================

    fn update_shared_status(
        &self,
        rec: &TickRecord,
        reference_utc_ns: Option<i64>,
        estimate: &crate::observer::Estimate,
        dropout: bool,
    ) {
        if let Ok(mut status) = self.status_shared.write() {
            status.pps_seq = rec.tick.pps_seq;
            status.dropout = dropout;
            status.reference_utc_ns = reference_utc_ns;
            status.local_clock_ns = rec.local_clock_ns;
            status.offset_ns = self.disciplinor.last_offset_ns();
            status.drift_ppb_raw = self
                .observer
                .last_sample()
                .map(|s| s.drift_ns_per_s)
                .unwrap_or(0.0);
            status.drift_ppb_filtered = self.disciplinor.filtered_drift_ppb();
            status.frequency_bias_ppb = self.disciplinor.captured_bias_ppb();
            status.frequency_total_ppb = self.disciplinor.frequency_steering_ppb();
            status.servo_mode = self.disciplinor.mode().as_str().to_string();
            status.association_locked = self.association.is_locked();
            status.observer_health = estimate.health_flags;
            status.estimate_ready = estimate.ready;
            status.estimate_trustworthy = estimate.trustworthy;
            status.rtc_aging_offset = self.rtc_aging_offset;
            status.updated_ts = SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
        }
    }

    fn log_tick(&self, rec: &TickRecord, reference_utc_ns: Option<i64>) {
        match reference_utc_ns {
            Some(_) => debug!(
                "[GM] {:5} seq={} off={:+}ns drift={:+.1}ppb adj={:+}ppb",
                self.disciplinor.mode().as_str(),
                rec.tick.pps_seq,
                self.disciplinor.last_offset_ns(),
                self.disciplinor.filtered_drift_ppb(),
                self.disciplinor.frequency_steering_ppb()
            ),
            None => debug!(
                "[GM] {:5} seq={} (no association)",
                self.disciplinor.mode().as_str(),
                rec.tick.pps_seq
            ),
        }
    }
}

/// Worker loop: drain the slot until shutdown.
pub fn worker_loop<C, T, P>(
    controller: &mut GrandmasterController<C, T, P>,
    slot: Arc<TickSlot>,
    running: Arc<AtomicBool>,
) -> Result<()>
where
    C: ClockDevice,
    T: RtcDevice,
    P: TimePublisher,
{
    while running.load(Ordering::SeqCst) {
        match slot.take(TICK_DEADLINE) {
            Some(rec) => controller.process_record(rec)?,
            None => controller.on_tick_timeout(),
        }
    }
    info!("[GM] worker exiting");
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{
        MockClockDevice, MockRtcDevice, MockTimePublisher, ReferenceTick,
    };
    use anyhow::anyhow;

    const MAX_ADJ: i32 = 32_768_000;

    fn make_tick(seq: u64, utc: u64) -> ReferenceTick {
        let edge = seq as i64 * 1_000_000_000;
        ReferenceTick {
            pps_seq: seq,
            mono_capture_ns: edge,
            nmea_utc_sec: Some(utc),
            nmea_arrival_mono_ns: Some(edge + 100_000_000),
            fix_valid: true,
        }
    }

    fn make_record(seq: u64, utc: u64, local_clock_ns: i64) -> TickRecord {
        TickRecord {
            tick: make_tick(seq, utc),
            local_clock_ns,
            rtc_clock_ns: None,
            sampling_latency_ns: 500_000,
        }
    }

    fn controller_with_clock(
        clock: MockClockDevice,
    ) -> GrandmasterController<MockClockDevice, MockRtcDevice, MockTimePublisher> {
        let status = Arc::new(RwLock::new(GrandmasterStatus::default()));
        GrandmasterController::new(
            Arc::new(Mutex::new(clock)),
            None,
            None,
            status,
            SystemConfig::default(),
        )
    }

    #[test]
    fn test_step_issued_once_association_locks() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut clock = MockClockDevice::new();
        clock.expect_max_adjustment_ppb().return_const(MAX_ADJ);
        // Local runs 3s ahead of UTC: one step to the pure reference time.
        clock
            .expect_step()
            .withf(|sec, ns| *sec == 1004 && *ns == 0)
            .times(1)
            .returning(|_, _| Ok(()));

        let mut c = controller_with_clock(clock);
        for seq in 0..=5u64 {
            let local = (1000 + seq + 3) as i64 * 1_000_000_000;
            c.process_record(make_record(seq, 1000 + seq, local)).unwrap();
        }
        // Lock asserted on the fifth pulse (seq 4); the step fires the same
        // tick and targets that pulse's UTC label.
        assert!(c.get_status_shared().read().unwrap().association_locked);
    }

    #[test]
    fn test_no_commands_before_lock() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut clock = MockClockDevice::new();
        clock.expect_max_adjustment_ppb().return_const(MAX_ADJ);
        // No step/adjust expectations: any call would panic the mock.

        let mut c = controller_with_clock(clock);
        for seq in 0..3u64 {
            let local = 12_345 + seq as i64 * 1_000_000_000;
            c.process_record(make_record(seq, 1000 + seq, local)).unwrap();
        }
        assert!(!c.get_status_shared().read().unwrap().association_locked);
    }

    #[test]
    fn test_command_failures_become_fatal() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut clock = MockClockDevice::new();
        clock.expect_max_adjustment_ppb().return_const(MAX_ADJ);
        clock
            .expect_step()
            .returning(|_, _| Err(anyhow!("device detached")));

        let mut c = controller_with_clock(clock);

        // Establish the lock; the failing step then repeats each tick while
        // alignment keeps demanding it.
        let mut fatal = false;
        for seq in 0..30u64 {
            let local = (1000 + seq + 3) as i64 * 1_000_000_000;
            match c.process_record(make_record(seq, 1000 + seq, local)) {
                Ok(()) => {}
                Err(_) => {
                    fatal = true;
                    break;
                }
            }
        }
        assert!(fatal, "persistent adapter failure must become fatal");
    }

    #[test]
    fn test_dropout_reported_in_status() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut clock = MockClockDevice::new();
        clock.expect_max_adjustment_ppb().return_const(MAX_ADJ);

        let mut c = controller_with_clock(clock);
        c.process_record(make_record(0, 1000, 0)).unwrap();
        // seq jumps 0 -> 2.
        c.process_record(make_record(2, 1002, 2_000_000_000)).unwrap();

        let status = c.get_status_shared().read().unwrap().clone();
        assert!(status.dropout);
        assert!(!status.association_locked, "gap must also prevent the lock");
    }

    #[test]
    fn test_publisher_called_every_tick() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut clock = MockClockDevice::new();
        clock.expect_max_adjustment_ppb().return_const(MAX_ADJ);

        let mut publisher = MockTimePublisher::new();
        publisher
            .expect_publish_tick()
            .times(3)
            .returning(|_, _, _| Ok(()));

        let status = Arc::new(RwLock::new(GrandmasterStatus::default()));
        let mut c: GrandmasterController<MockClockDevice, MockRtcDevice, MockTimePublisher> =
            GrandmasterController::new(
                Arc::new(Mutex::new(clock)),
                None,
                Some(publisher),
                status,
                SystemConfig::default(),
            );

        for seq in 0..3u64 {
            c.process_record(make_record(seq, 1000 + seq, seq as i64 * 1_000_000_000))
                .unwrap();
        }
    }

    #[test]
    fn test_tick_slot_overwrites_and_closes() {
        let slot = TickSlot::new();
        slot.publish(make_record(1, 1000, 0));
        slot.publish(make_record(2, 1001, 0));

        // Only the newest survives.
        let rec = slot.take(Duration::from_millis(10)).unwrap();
        assert_eq!(rec.tick.pps_seq, 2);

        assert!(slot.take(Duration::from_millis(10)).is_none());

        slot.close();
        assert!(slot.take(Duration::from_secs(5)).is_none(), "closed slot returns fast");
    }
}
