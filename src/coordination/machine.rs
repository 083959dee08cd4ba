// Bilateral Firmware - Bilateral Coordination State Machine
//
// One loop per node. The SERVER's ACTIVE starts define the motor epoch; the
// CLIENT runs half a period behind in synchronized time and trims its
// schedule once per INACTIVE interval. Every phase change goes through
// `safe_stop`, which is the only way to obtain the `SafeStop` token that
// `transition` demands.

use std::collections::VecDeque;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::config::*;
use crate::coordination::correction::{
    correct, schedule_error_us, CorrectionBounds, CorrectionOutcome, SkipReason,
};
use crate::coordination::phase::Phase;
use crate::coordination::wait::{WaitOutcome, Waiter};
use crate::drivers::{Actuator, EpochSink, Indicator, NoopIndicator, NoopWatchdog, Watchdog};
use crate::error::CoreError;
use crate::events::{CoordinationMsg, Role, SessionCondition, Telemetry, TelemetryEvent};
use crate::params::{MotorEpoch, MotorParams};
use crate::sync::{ClockSnapshot, SyncReader, SyncStatus};

/// Proof that the actuator was switched off and the indicator cleared.
/// Only `Coordinator::safe_stop` can make one.
pub struct SafeStop {
    _private: (),
}

/// Externally visible view of the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinationState {
    pub phase: Phase,
    pub active_ms: u32,
    pub inactive_ms: u32,
    /// Synchronized time at which the current phase is due to end.
    pub target_transition_us: u64,
    pub last_correction_ms: i64,
}

#[derive(Debug, Default)]
struct Schedule {
    /// Synchronized time of the next (or current) ACTIVE start.
    next_active_us: Option<u64>,
    /// Whether `next_active_us` was derived from an epoch.
    aligned: bool,
    /// Sync session the schedule was built in.
    session: u32,
    /// CLIENT already evaluated a correction in this INACTIVE interval.
    corrected: bool,
    target_us: u64,
    last_correction_us: i64,
}

pub struct Coordinator {
    role: Option<Role>,
    phase: Phase,
    params: MotorParams,
    waiter: Waiter,
    reader: SyncReader,
    actuator: Box<dyn Actuator>,
    indicator: Box<dyn Indicator>,
    epoch_sink: Option<Box<dyn EpochSink>>,
    telemetry: Telemetry,
    pending: VecDeque<CoordinationMsg>,
    shutdown_requested: bool,
    failure: Option<CoreError>,
    paired: bool,
    pairing_deadline_us: Option<u64>,
    schedule: Schedule,
    epoch_generation: u8,
    skip_next_correction: bool,
    awaiting_fresh_epoch: bool,
    stale_generation: Option<u8>,
    /// Generation of the epoch the CLIENT schedule last followed.
    epoch_in_use: Option<u8>,
    last_quality: u8,
}

// ---------------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------------
pub struct CoordinatorBuilder {
    clock: Arc<dyn Clock>,
    reader: SyncReader,
    inbox: Receiver<CoordinationMsg>,
    actuator: Box<dyn Actuator>,
    role: Option<Role>,
    params: MotorParams,
    indicator: Box<dyn Indicator>,
    watchdog: Box<dyn Watchdog>,
    epoch_sink: Option<Box<dyn EpochSink>>,
    telemetry: Telemetry,
    checkpoint: Duration,
}

impl CoordinatorBuilder {
    pub fn role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }

    pub fn params(mut self, params: MotorParams) -> Self {
        self.params = params;
        self
    }

    pub fn indicator(mut self, indicator: Box<dyn Indicator>) -> Self {
        self.indicator = indicator;
        self
    }

    pub fn watchdog(mut self, watchdog: Box<dyn Watchdog>) -> Self {
        self.watchdog = watchdog;
        self
    }

    pub fn epoch_sink(mut self, sink: impl EpochSink + 'static) -> Self {
        self.epoch_sink = Some(Box::new(sink));
        self
    }

    pub fn telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn checkpoint(mut self, checkpoint: Duration) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    pub fn build(self) -> Coordinator {
        let waiter = Waiter::new(self.clock, self.inbox, self.watchdog).with_checkpoint(self.checkpoint);
        Coordinator {
            role: self.role,
            phase: Phase::CheckMessages,
            params: self.params,
            waiter,
            reader: self.reader,
            actuator: self.actuator,
            indicator: self.indicator,
            epoch_sink: self.epoch_sink,
            telemetry: self.telemetry,
            pending: VecDeque::new(),
            shutdown_requested: false,
            failure: None,
            paired: false,
            pairing_deadline_us: None,
            schedule: Schedule::default(),
            epoch_generation: 0,
            skip_next_correction: false,
            awaiting_fresh_epoch: false,
            stale_generation: None,
            epoch_in_use: None,
            last_quality: 0,
        }
    }
}

impl Coordinator {
    pub fn builder(
        clock: Arc<dyn Clock>,
        reader: SyncReader,
        inbox: Receiver<CoordinationMsg>,
        actuator: Box<dyn Actuator>,
    ) -> CoordinatorBuilder {
        CoordinatorBuilder {
            clock,
            reader,
            inbox,
            actuator,
            role: None,
            params: MotorParams::default(),
            indicator: Box::new(NoopIndicator),
            watchdog: Box::new(NoopWatchdog),
            epoch_sink: None,
            telemetry: Telemetry::disabled(),
            checkpoint: Duration::from_millis(CHECKPOINT_MS),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn params(&self) -> MotorParams {
        self.params
    }

    pub fn state(&self) -> CoordinationState {
        CoordinationState {
            phase: self.phase,
            active_ms: self.params.active_ms,
            inactive_ms: self.params.inactive_ms,
            target_transition_us: self.schedule.target_us,
            last_correction_ms: self.schedule.last_correction_us / 1000,
        }
    }

    /// Run until SHUTDOWN. Returns `SyncExpired` if the session ended because
    /// the peer never came back.
    pub fn run(&mut self) -> Result<(), CoreError> {
        log::info!(target: "coordination", "coordination loop started ({:?})", self.role);
        while !self.phase.is_terminal() {
            self.step();
        }
        log::info!(target: "coordination", "coordination loop stopped");
        match self.failure.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Execute the current phase once and return the phase it left us in.
    pub fn step(&mut self) -> Phase {
        match self.phase {
            Phase::CheckMessages => self.check_messages(),
            Phase::PairingWait => self.pairing_wait(),
            Phase::Active => self.active(),
            Phase::Inactive => self.inactive(),
            Phase::Shutdown => {}
        }
        self.phase
    }

    // ---- Safe transitions --------------------------------------------------

    fn safe_stop(&mut self) -> SafeStop {
        self.actuator.actuator_off();
        self.indicator.clear();
        SafeStop { _private: () }
    }

    fn transition(&mut self, requested: Phase, _stop: SafeStop) {
        let from = self.phase;
        if from.is_terminal() {
            return;
        }
        let mut next = if self.shutdown_requested { Phase::Shutdown } else { requested };
        if !from.can_transition_to(next) {
            log::error!(target: "coordination", "illegal transition {} -> {}, returning to hub", from, next);
            next = Phase::CheckMessages;
        }
        self.phase = next;
        if from != next {
            let at_us = self.waiter.clock().now_us();
            log::debug!(target: "coordination", "{} -> {}", from, next);
            self.telemetry.emit(TelemetryEvent::PhaseChanged { from, to: next, at_us });
        }
    }

    fn enter(&mut self, next: Phase) {
        let stop = self.safe_stop();
        self.transition(next, stop);
    }

    // ---- Helpers -----------------------------------------------------------

    /// Snapshot, local time, monotonic synchronized time.
    fn observe(&mut self) -> (ClockSnapshot, u64, u64) {
        let local_us = self.waiter.clock().now_us();
        let snapshot = self.reader.snapshot();
        let now_us = self.reader.monotonic(snapshot.synchronized_time(local_us));
        (snapshot, local_us, now_us)
    }

    fn interrupt(&mut self, msg: CoordinationMsg) {
        if msg == CoordinationMsg::Shutdown {
            log::info!(target: "coordination", "shutdown requested");
            self.shutdown_requested = true;
        } else {
            self.pending.push_back(msg);
        }
    }

    /// Common handling for the early returns of a phase wait.
    fn after_wait(&mut self, outcome: WaitOutcome) {
        match outcome {
            WaitOutcome::Message(msg) => self.interrupt(msg),
            WaitOutcome::InboxClosed => {
                log::warn!(target: "coordination", "inbox closed, shutting down");
                self.shutdown_requested = true;
            }
            WaitOutcome::Condition | WaitOutcome::Elapsed { .. } => {}
        }
        self.enter(Phase::CheckMessages);
    }

    fn drain_inbox(&mut self) {
        loop {
            match self.waiter.poll() {
                Ok(Some(msg)) => self.interrupt(msg),
                Ok(None) => break,
                Err(_) => {
                    if !self.shutdown_requested {
                        log::warn!(target: "coordination", "inbox closed, shutting down");
                    }
                    self.shutdown_requested = true;
                    break;
                }
            }
        }
    }

    fn publish_epoch(&mut self, epoch_us: u64) {
        self.epoch_generation = self.epoch_generation.wrapping_add(1);
        let epoch = MotorEpoch::new(epoch_us, &self.params, self.epoch_generation);
        log::info!(
            target: "coordination",
            "publishing epoch gen {} at {} us ({} / {} ms)",
            epoch.generation,
            epoch.epoch_us,
            epoch.active_ms,
            epoch.period_ms
        );
        if let Some(sink) = self.epoch_sink.as_mut() {
            sink.publish(epoch);
        }
    }

    fn reset_schedule(&mut self) {
        self.schedule.next_active_us = None;
        self.schedule.aligned = false;
        self.schedule.corrected = false;
    }

    fn apply(&mut self, msg: CoordinationMsg) {
        match msg {
            CoordinationMsg::Shutdown => self.shutdown_requested = true,
            CoordinationMsg::RoleAssigned(role) => {
                if self.role != Some(role) {
                    log::info!(target: "coordination", "role assigned: {}", role);
                    self.role = Some(role);
                    self.paired = false;
                    self.pairing_deadline_us = None;
                    self.reset_schedule();
                }
            }
            CoordinationMsg::RoleSwapped => {
                log::warn!(target: "coordination", "peer swapped roles, re-pairing");
                self.telemetry
                    .emit(TelemetryEvent::Session(SessionCondition::RoleSwapDetected));
                self.paired = false;
                self.pairing_deadline_us = None;
                self.awaiting_fresh_epoch = false;
                self.skip_next_correction = false;
                self.reset_schedule();
            }
            CoordinationMsg::PeerReconnected => {
                log::info!(target: "coordination", "peer reconnected");
                if self.role == Some(Role::Server) {
                    if let Some(next) = self.schedule.next_active_us {
                        self.publish_epoch(next);
                    }
                }
            }
            CoordinationMsg::Params(update) => match MotorParams::from_update(&update) {
                Err(err) => {
                    log::warn!(target: "coordination", "parameter update rejected: {}", err);
                    self.telemetry
                        .emit(TelemetryEvent::Session(SessionCondition::InvalidParameter(err)));
                }
                Ok(params) if params == self.params => {}
                Ok(params) => self.apply_params(params),
            },
        }
    }

    fn apply_params(&mut self, params: MotorParams) {
        log::info!(
            target: "coordination",
            "parameters {} / {} ms -> {} / {} ms at {}%",
            self.params.active_ms,
            self.params.period_ms,
            params.active_ms,
            params.period_ms,
            params.intensity_pct
        );
        self.params = params;
        match self.role {
            Some(Role::Server) => {
                // The new schedule takes over from the next ACTIVE start.
                if let Some(next) = self.schedule.next_active_us {
                    self.publish_epoch(next);
                }
            }
            Some(Role::Client) => {
                // The SERVER's republished epoch may already be in the
                // snapshot; only the one we were following is stale.
                self.skip_next_correction = true;
                self.awaiting_fresh_epoch = true;
                self.stale_generation = self.epoch_in_use;
            }
            None => {}
        }
    }

    fn expire(&mut self, snapshot: &ClockSnapshot, local_us: u64) {
        let elapsed_ms = match snapshot.status {
            SyncStatus::Disconnected { since_us } => local_us.saturating_sub(since_us) / 1000,
            _ => DISCONNECT_GRACE_MS,
        };
        log::error!(
            target: "coordination",
            "peer gone for {} ms, stopping actuator",
            elapsed_ms
        );
        self.telemetry.emit(TelemetryEvent::Session(SessionCondition::SyncExpired));
        self.failure = Some(CoreError::SyncExpired { elapsed_ms, grace_ms: DISCONNECT_GRACE_MS });
        self.shutdown_requested = true;
        self.enter(Phase::Shutdown);
    }

    /// Skip whole cycles the loop has fallen behind by, keeping phase. A start
    /// inside the current window still runs (shortened).
    fn catch_up(&mut self, now_us: u64) {
        let Some(mut next) = self.schedule.next_active_us else {
            return;
        };
        let period = self.params.period_us();
        if now_us > next {
            let mut skipped = (now_us - next) / period;
            next += skipped * period;
            if now_us >= next + self.params.active_us() {
                next += period;
                skipped += 1;
            }
            if skipped > 0 {
                log::warn!(target: "coordination", "fell behind, skipping {} cycle(s)", skipped);
            }
        }
        self.schedule.next_active_us = Some(next);
    }

    /// Epoch-aligned CLIENT start, if the clock and epoch can be trusted.
    fn aligned_client_start(&self, snapshot: &ClockSnapshot, local_us: u64, now_us: u64) -> Option<u64> {
        let epoch = snapshot.epoch.filter(|e| e.is_valid() && e.matches(&self.params))?;
        if !snapshot.is_usable(local_us) || snapshot.quality() < MIN_CORRECTION_QUALITY {
            return None;
        }
        if self.awaiting_fresh_epoch && Some(epoch.generation) == self.stale_generation {
            return None;
        }
        Some(epoch.next_aligned(now_us, self.params.half_period_us()))
    }

    // ---- Phases ------------------------------------------------------------

    fn check_messages(&mut self) {
        self.drain_inbox();
        while let Some(msg) = self.pending.pop_front() {
            self.apply(msg);
        }
        if self.shutdown_requested {
            return self.enter(Phase::Shutdown);
        }

        let (snapshot, local_us, now_us) = self.observe();
        if snapshot.quality() != self.last_quality {
            self.telemetry.emit(TelemetryEvent::QualityChanged {
                from: self.last_quality,
                to: snapshot.quality(),
            });
            self.last_quality = snapshot.quality();
        }
        if snapshot.is_expired(local_us) {
            return self.expire(&snapshot, local_us);
        }

        let Some(role) = self.role else {
            // Nothing to schedule until the pairing layer assigns a role.
            let outcome = self.waiter.wait_until(&mut self.reader, now_us + IDLE_WAIT_MS * 1000, |_, _| false);
            if !matches!(outcome, WaitOutcome::Elapsed { .. }) {
                self.after_wait(outcome);
            }
            return;
        };

        if !self.paired {
            return self.enter(Phase::PairingWait);
        }

        match role {
            Role::Server => {
                if self.schedule.next_active_us.is_none() {
                    self.schedule.next_active_us = Some(now_us);
                    self.schedule.aligned = true;
                    self.publish_epoch(now_us);
                }
            }
            Role::Client => {
                if snapshot.session != self.schedule.session {
                    if self.schedule.next_active_us.is_some() {
                        log::info!(target: "coordination", "sync session changed, re-aligning");
                    }
                    self.schedule.session = snapshot.session;
                    self.reset_schedule();
                }
                let aligned = self.aligned_client_start(&snapshot, local_us, now_us);
                if self.schedule.next_active_us.is_some() && aligned.is_some() {
                    if self.awaiting_fresh_epoch {
                        // The new period starts from the fresh epoch, not from the old lattice.
                        log::info!(target: "coordination", "fresh epoch after parameter change, re-anchoring");
                        self.awaiting_fresh_epoch = false;
                        self.reset_schedule();
                    } else if !self.schedule.aligned {
                        log::info!(target: "coordination", "epoch acquired, aligning to it");
                        self.reset_schedule();
                    }
                }
                if self.schedule.next_active_us.is_none() {
                    match aligned {
                        Some(start) => {
                            self.schedule.next_active_us = Some(start);
                            self.schedule.aligned = true;
                            self.awaiting_fresh_epoch = false;
                            self.epoch_in_use = snapshot.epoch.map(|e| e.generation);
                        }
                        None => {
                            log::info!(target: "coordination", "no usable epoch, starting on nominal timing");
                            self.schedule.next_active_us = Some(now_us + self.params.half_period_us());
                            self.schedule.aligned = false;
                        }
                    }
                }
            }
        }

        self.catch_up(now_us);
        let next_active = self.schedule.next_active_us.unwrap_or(now_us);
        if now_us + ACTIVE_START_TOLERANCE_US >= next_active {
            self.enter(Phase::Active);
        } else {
            self.enter(Phase::Inactive);
        }
    }

    fn pairing_wait(&mut self) {
        let (_, _, now_us) = self.observe();
        let deadline = *self
            .pairing_deadline_us
            .get_or_insert(now_us + HANDSHAKE_TIMEOUT_MS * 1000);
        let needs_epoch = self.role == Some(Role::Client);
        log::info!(target: "coordination", "waiting for time sync");

        let outcome = self.waiter.wait_until(&mut self.reader, deadline, move |snap, local| {
            snap.is_expired(local)
                || (snap.status == SyncStatus::Synced && (!needs_epoch || snap.epoch.is_some()))
        });
        match outcome {
            WaitOutcome::Condition => {
                log::info!(target: "coordination", "time sync ready");
                self.paired = true;
                self.pairing_deadline_us = None;
                self.enter(Phase::CheckMessages);
            }
            WaitOutcome::Elapsed { .. } => {
                let err = CoreError::ClockNotReady { waited_ms: HANDSHAKE_TIMEOUT_MS };
                log::warn!(target: "coordination", "{}", err);
                self.telemetry.emit(TelemetryEvent::Session(SessionCondition::ClockNotReady));
                self.paired = true;
                self.pairing_deadline_us = None;
                self.enter(Phase::CheckMessages);
            }
            other => self.after_wait(other),
        }
    }

    /// Latest instant a CLIENT window starting at `start_us` may run to: the
    /// SERVER's next ACTIVE start on the newest epoch the snapshot carries.
    fn client_window_limit(&self, snapshot: &ClockSnapshot, local_us: u64, start_us: u64) -> Option<u64> {
        if self.role != Some(Role::Client) || !snapshot.is_usable(local_us) {
            return None;
        }
        let epoch = snapshot.epoch.filter(|e| e.is_valid())?;
        Some(epoch.next_aligned(start_us + 1, 0))
    }

    fn active(&mut self) {
        let (snapshot, local_us, now_us) = self.observe();
        let start = self.schedule.next_active_us.unwrap_or(now_us);
        let mut end = start + self.params.active_us();
        if let Some(limit) = self.client_window_limit(&snapshot, local_us, start) {
            if limit < end {
                log::debug!(target: "coordination", "window cut {} us short of the peer's start", end - limit);
                end = limit;
            }
        }
        self.schedule.corrected = false;
        if end <= now_us {
            // Nothing left of this window before the peer turns on.
            self.schedule.next_active_us = Some(start + self.params.period_us());
            return self.enter(Phase::Inactive);
        }
        self.schedule.target_us = end;

        self.actuator.actuator_on(self.params.intensity_pct);
        if let Some(role) = self.role {
            self.indicator.show(role);
        }

        let outcome = self.waiter.wait_until(&mut self.reader, end, |snap, local| snap.is_expired(local));
        match outcome {
            WaitOutcome::Elapsed { .. } => {
                self.schedule.next_active_us = Some(start + self.params.period_us());
                self.enter(Phase::Inactive);
            }
            other => self.after_wait(other),
        }
    }

    fn inactive(&mut self) {
        let (snapshot, local_us, now_us) = self.observe();
        if self.role == Some(Role::Client) && !self.schedule.corrected {
            self.schedule.corrected = true;
            let outcome = self.evaluate_correction(&snapshot, local_us);
            self.apply_correction(outcome, now_us);
        }
        let target = self.schedule.next_active_us.unwrap_or(now_us);
        self.schedule.target_us = target;

        let outcome = self.waiter.wait_until(&mut self.reader, target, |snap, local| snap.is_expired(local));
        self.after_wait(outcome);
    }

    fn evaluate_correction(&mut self, snapshot: &ClockSnapshot, local_us: u64) -> CorrectionOutcome {
        if self.skip_next_correction {
            self.skip_next_correction = false;
            return CorrectionOutcome::Skipped(SkipReason::ParameterChange);
        }
        if !snapshot.is_usable(local_us) {
            return CorrectionOutcome::Skipped(SkipReason::ClockUnusable);
        }
        if snapshot.quality() < MIN_CORRECTION_QUALITY {
            return CorrectionOutcome::Skipped(SkipReason::LowQuality(snapshot.quality()));
        }
        let Some(epoch) = snapshot.epoch.filter(|e| e.is_valid()) else {
            return CorrectionOutcome::Skipped(SkipReason::NoEpoch);
        };
        if !epoch.matches(&self.params)
            || (self.awaiting_fresh_epoch && Some(epoch.generation) == self.stale_generation)
        {
            return CorrectionOutcome::Skipped(SkipReason::AwaitingFreshEpoch);
        }
        if self.awaiting_fresh_epoch {
            log::info!(target: "coordination", "fresh epoch gen {}, correction resumes", epoch.generation);
            self.awaiting_fresh_epoch = false;
        }
        self.epoch_in_use = Some(epoch.generation);
        let Some(scheduled) = self.schedule.next_active_us else {
            return CorrectionOutcome::Skipped(SkipReason::ClockUnusable);
        };
        let error_us = schedule_error_us(&epoch, scheduled);
        correct(error_us, CorrectionBounds::for_inactive(self.params.inactive_ms))
    }

    fn apply_correction(&mut self, outcome: CorrectionOutcome, now_us: u64) {
        match outcome {
            CorrectionOutcome::Applied { error_us, applied_us } => {
                if let Some(next) = self.schedule.next_active_us {
                    let corrected = (next as i64 + applied_us).max(now_us as i64) as u64;
                    self.schedule.next_active_us = Some(corrected);
                }
                self.schedule.last_correction_us = applied_us;
                log::debug!(
                    target: "coordination",
                    "schedule error {} us, corrected {} us",
                    error_us,
                    applied_us
                );
                self.telemetry.emit(TelemetryEvent::CorrectionApplied { error_us, applied_us });
            }
            CorrectionOutcome::WithinDeadband { error_us } => {
                self.schedule.last_correction_us = 0;
                log::trace!(target: "coordination", "schedule error {} us within deadband", error_us);
            }
            CorrectionOutcome::Skipped(reason) => {
                self.schedule.last_correction_us = 0;
                log::debug!(target: "coordination", "correction skipped: {:?}", reason);
                self.telemetry.emit(TelemetryEvent::CorrectionSkipped(reason));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::drivers::RecordingActuator;
    use crate::events::PeerIdentity;
    use crate::sync::TimeSyncEngine;
    use std::sync::mpsc;

    fn synced_server() -> TimeSyncEngine {
        let mut server = TimeSyncEngine::new(Role::Server);
        let mut client = TimeSyncEngine::new(Role::Client);
        server.on_connect(PeerIdentity { address: [1; 6], role: Role::Client }, 0);
        let request = server.initiate_handshake(0).unwrap();
        let reply = client.answer_handshake(&request, 1_000, 1_100).unwrap();
        server.complete_handshake(&reply, 2_100).unwrap();
        server
    }

    #[test]
    fn server_runs_epoch_aligned_windows() {
        let engine = synced_server();
        let clock = Arc::new(ManualClock::starting_at(1_000_000));
        let (tx, rx) = mpsc::sync_channel(8);
        let actuator = RecordingActuator::new(clock.clone());
        let log = actuator.log();
        let epochs = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink_epochs = Arc::clone(&epochs);

        let mut coordinator = Coordinator::builder(clock.clone(), engine.sync_handle().reader(), rx, Box::new(actuator))
            .role(Role::Server)
            .epoch_sink(move |epoch: MotorEpoch| sink_epochs.lock().unwrap().push(epoch))
            .build();

        while clock.now_us() < 3_000_000 {
            coordinator.step();
        }
        tx.send(CoordinationMsg::Shutdown).unwrap();
        coordinator.run().unwrap();

        let windows = log.windows();
        assert_eq!(&windows[..2], &[(1_000_000, 1_500_000), (2_000_000, 2_500_000)]);
        assert_eq!(epochs.lock().unwrap()[0].epoch_us, 1_000_000);
        assert_eq!(coordinator.phase(), Phase::Shutdown);
        assert!(!log.is_on());
    }

    #[test]
    fn invalid_params_are_rejected_and_previous_kept() {
        let engine = synced_server();
        let clock = Arc::new(ManualClock::starting_at(0));
        let (tx, rx) = mpsc::sync_channel(8);
        let (tel_tx, tel_rx) = mpsc::sync_channel(64);
        let actuator = RecordingActuator::new(clock.clone());
        let mut coordinator = Coordinator::builder(clock.clone(), engine.sync_handle().reader(), rx, Box::new(actuator))
            .role(Role::Server)
            .telemetry(Telemetry::new(tel_tx))
            .build();

        tx.send(CoordinationMsg::Params(crate::params::ParamUpdate {
            frequency_hz: 1.0,
            duty_cycle: 1.5,
            intensity_pct: 50,
        }))
        .unwrap();
        coordinator.step();
        assert_eq!(coordinator.params(), MotorParams::default());
        assert!(tel_rx.try_iter().any(|e| matches!(
            e,
            TelemetryEvent::Session(SessionCondition::InvalidParameter(_))
        )));
    }

    #[test]
    fn without_role_the_loop_idles_in_check_messages() {
        let clock = Arc::new(ManualClock::starting_at(0));
        let (tx, rx) = mpsc::sync_channel(8);
        let handle = crate::sync::SyncHandle::new();
        let actuator = RecordingActuator::new(clock.clone());
        let log = actuator.log();
        let mut coordinator = Coordinator::builder(clock.clone(), handle.reader(), rx, Box::new(actuator)).build();
        assert_eq!(coordinator.step(), Phase::CheckMessages);
        assert_eq!(clock.now_us(), IDLE_WAIT_MS * 1000);
        tx.send(CoordinationMsg::Shutdown).unwrap();
        assert_eq!(coordinator.step(), Phase::Shutdown);
        assert!(log.events().is_empty());
    }

    #[test]
    fn pairing_falls_back_to_nominal_after_timeout() {
        let clock = Arc::new(ManualClock::starting_at(0));
        let (_tx, rx) = mpsc::sync_channel(8);
        let handle = crate::sync::SyncHandle::new();
        let actuator = RecordingActuator::new(clock.clone());
        let log = actuator.log();
        let mut coordinator = Coordinator::builder(clock.clone(), handle.reader(), rx, Box::new(actuator))
            .role(Role::Client)
            .build();
        assert_eq!(coordinator.step(), Phase::PairingWait);
        assert_eq!(coordinator.step(), Phase::CheckMessages);
        assert_eq!(clock.now_us(), HANDSHAKE_TIMEOUT_MS * 1000);
        // Nominal CLIENT start: half a period after the fallback.
        assert_eq!(coordinator.step(), Phase::Inactive);
        assert_eq!(coordinator.step(), Phase::CheckMessages);
        assert_eq!(coordinator.step(), Phase::Active);
        assert_eq!(log.events().len(), 0);
        coordinator.step();
        assert_eq!(log.windows(), vec![(5_500_000, 6_000_000)]);
    }
}
