// Bilateral Firmware - Time Synchronization Engine
//
// Turns four-timestamp handshakes and one-way beacons into a shared clock.
// The SERVER is the reference (offset 0, stratum 0); the CLIENT estimates
// its offset to the SERVER. Every operation takes explicit local timestamps,
// so the engine itself never reads a clock and is fully deterministic.

use crate::config::*;
use crate::error::SyncError;
use crate::events::{PeerIdentity, Role};
use crate::params::MotorEpoch;
use crate::sequence::{missed_between, sequence_greater_than};
use crate::sync::filter::{OffsetFilter, RttStats};
use crate::sync::state::{ClockSnapshot, ClockState, SyncHandle, SyncStatus};
use crate::sync::wire::{BeaconMessage, ExchangeTimestamps, MessageKind};

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Discrepancy beyond the outlier threshold plus drift allowance.
    Implausible { discrepancy_us: i64, limit_us: i64 },
    /// Sender is too many hops from the reference.
    Stratum(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeaconOutcome {
    Accepted { correction_us: i64, missed: u8 },
    /// Same sequence as the last beacon seen; nothing changed.
    Duplicate,
    /// Older than the last beacon seen; discarded.
    Stale,
    Rejected(RejectReason),
    /// Too many consecutive rejections. A resync has been requested.
    ResyncRequired,
    /// No handshake has bootstrapped this session yet.
    NotSynced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeOutcome {
    /// First exchange of a session; offset taken directly.
    Bootstrapped { offset_us: i64, round_trip_us: i64 },
    /// Periodic refresh folded into the estimator.
    Refreshed { correction_us: i64, round_trip_us: i64 },
    Rejected(RejectReason),
}

/// Result of dispatching one received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    Reply(BeaconMessage),
    Beacon(BeaconOutcome),
    Exchange(ExchangeOutcome),
    /// SERVER side of a completed handshake; the completion goes back out.
    Completed { reply: BeaconMessage, round_trip_us: i64 },
    Ignored,
}

/// Work the task layer must do after a `tick`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    Send(BeaconMessage),
    HandshakeTimedOut { attempts: u8, bootstrapped: bool },
    BeaconMissed { consecutive: u32 },
    Expired,
}

#[derive(Debug, Clone, Copy)]
struct PendingHandshake {
    sequence: u8,
    t1: u64,
    started_us: u64,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------
pub struct TimeSyncEngine {
    role: Role,
    handle: SyncHandle,
    state: ClockState,
    status: SyncStatus,
    epoch: Option<MotorEpoch>,
    session: u32,
    bootstrapped: bool,
    filter: OffsetFilter,
    rtt: RttStats,
    peer: Option<PeerIdentity>,

    // Handshake (SERVER initiates, CLIENT answers)
    pending: Option<PendingHandshake>,
    handshake_sequence: u8,
    handshake_attempts: u8,
    next_handshake_us: Option<u64>,
    client_handshake_started_us: Option<u64>,

    // SERVER beacon cadence
    beacon_sequence: u8,
    beacon_interval_ms: u32,
    beacons_at_interval: u32,
    beacons_since_refresh: u32,
    next_beacon_us: Option<u64>,

    // CLIENT reception
    last_seen_sequence: Option<u8>,
    announced_interval_ms: u32,
    beacon_deadline_us: Option<u64>,
    consecutive_misses: u32,
    consecutive_rejects: u32,
    request_interval_ms: u32,
    next_request_us: Option<u64>,
    resync_pending: bool,
    expiry_reported: bool,
}

impl TimeSyncEngine {
    pub fn new(role: Role) -> Self {
        Self::with_handle(role, SyncHandle::new())
    }

    pub fn with_handle(role: Role, handle: SyncHandle) -> Self {
        let mut engine = Self {
            role,
            handle,
            state: ClockState::default(),
            status: SyncStatus::Unsynced,
            epoch: None,
            session: 0,
            bootstrapped: false,
            filter: OffsetFilter::default(),
            rtt: RttStats::default(),
            peer: None,
            pending: None,
            handshake_sequence: 0,
            handshake_attempts: 0,
            next_handshake_us: None,
            client_handshake_started_us: None,
            beacon_sequence: 0,
            beacon_interval_ms: BEACON_INTERVAL_MIN_MS,
            beacons_at_interval: 0,
            beacons_since_refresh: 0,
            next_beacon_us: None,
            last_seen_sequence: None,
            announced_interval_ms: BEACON_INTERVAL_MIN_MS,
            beacon_deadline_us: None,
            consecutive_misses: 0,
            consecutive_rejects: 0,
            request_interval_ms: BEACON_REQUEST_MAX_MS,
            next_request_us: None,
            resync_pending: false,
            expiry_reported: false,
        };
        engine.commit();
        engine
    }

    // ---- Read side --------------------------------------------------------

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn sync_handle(&self) -> SyncHandle {
        self.handle.clone()
    }

    pub fn status(&self) -> SyncStatus {
        self.status
    }

    pub fn clock_state(&self) -> ClockState {
        self.state
    }

    pub fn epoch(&self) -> Option<MotorEpoch> {
        self.epoch
    }

    pub fn quality(&self) -> u8 {
        self.state.quality
    }

    pub fn session(&self) -> u32 {
        self.session
    }

    pub fn rtt(&self) -> &RttStats {
        &self.rtt
    }

    pub fn beacon_interval_ms(&self) -> u32 {
        self.beacon_interval_ms
    }

    pub fn request_interval_ms(&self) -> u32 {
        self.request_interval_ms
    }

    pub fn has_peer(&self) -> bool {
        self.peer.is_some()
    }

    pub fn synchronized_time(&self, local_us: u64) -> u64 {
        self.state.synchronized_time(local_us)
    }

    pub fn snapshot(&self) -> ClockSnapshot {
        ClockSnapshot {
            state: self.state,
            status: self.status,
            epoch: self.epoch,
            session: self.session,
        }
    }

    fn commit(&self) {
        self.handle.publish(self.snapshot());
    }

    fn require(&self, role: Role) -> Result<(), SyncError> {
        if self.role == role {
            Ok(())
        } else {
            Err(SyncError::WrongRole(role))
        }
    }

    // ---- Connection lifecycle ---------------------------------------------

    /// First connection of a session. The SERVER schedules a handshake.
    pub fn on_connect(&mut self, peer: PeerIdentity, now_us: u64) {
        log::info!(target: "time_sync", "{} connected to {} peer", self.role, peer.role);
        self.peer = Some(peer);
        self.expiry_reported = false;
        if self.role == Role::Server {
            self.handshake_attempts = 0;
            self.next_handshake_us = Some(now_us);
        }
        self.commit();
    }

    /// Freeze the model and start the grace timer. Offset and drift are kept;
    /// round-trip and handshake state are not.
    pub fn on_disconnect(&mut self, now_us: u64) {
        self.pending = None;
        self.client_handshake_started_us = None;
        self.next_handshake_us = None;
        self.next_beacon_us = None;
        self.beacon_deadline_us = None;
        self.next_request_us = None;
        self.rtt.reset();

        // Nodes running on nominal timing get the same grace as synced ones.
        self.status = match self.status {
            SyncStatus::Disconnected { .. } | SyncStatus::Expired => self.status,
            _ if self.peer.is_some() => SyncStatus::Disconnected { since_us: now_us },
            other => other,
        };
        if self.bootstrapped {
            log::warn!(
                target: "time_sync",
                "peer disconnected, continuing on frozen clock (offset {} us, drift {:.2} ppm)",
                self.state.offset_us,
                self.state.drift_ppm
            );
        } else {
            log::warn!(target: "time_sync", "peer disconnected before the clock was synchronized");
        }
        self.commit();
    }

    /// Peer is back. Same role inside the grace period resumes the frozen
    /// model; a role swap or an expired session forces a fresh handshake.
    pub fn on_reconnect(&mut self, peer: PeerIdentity, now_us: u64) -> Result<(), SyncError> {
        let previous = self.peer.replace(peer);
        self.expiry_reported = false;

        if let Some(previous) = previous {
            if previous.role != peer.role {
                let new_role = peer.role.peer();
                log::warn!(
                    target: "time_sync",
                    "role swap on reconnect: peer {} -> {}, now acting as {}",
                    previous.role,
                    peer.role,
                    new_role
                );
                self.role = new_role;
                self.invalidate(now_us, true);
                return Err(SyncError::RoleSwapDetected {
                    previous: previous.role,
                    current: peer.role,
                });
            }
        }

        if let SyncStatus::Disconnected { since_us } = self.status {
            let elapsed_ms = now_us.saturating_sub(since_us) / 1000;
            if elapsed_ms >= DISCONNECT_GRACE_MS {
                self.status = SyncStatus::Expired;
            } else {
                log::info!(target: "time_sync", "peer reconnected after {} ms, resuming", elapsed_ms);
                self.status = if self.bootstrapped { SyncStatus::Synced } else { SyncStatus::Unsynced };
                self.resume(now_us);
                return Ok(());
            }
        }

        if self.status == SyncStatus::Expired {
            log::warn!(target: "time_sync", "reconnect after expiry, fresh handshake required");
            self.invalidate(now_us, false);
            return Err(SyncError::SyncExpired { elapsed_ms: DISCONNECT_GRACE_MS });
        }

        self.resume(now_us);
        Ok(())
    }

    fn resume(&mut self, now_us: u64) {
        match self.role {
            Role::Server => {
                self.reset_cadence(now_us);
                // RTT statistics were dropped on disconnect; refresh them.
                self.handshake_attempts = 0;
                self.next_handshake_us = Some(now_us);
            }
            Role::Client => {
                self.announced_interval_ms = BEACON_INTERVAL_MIN_MS;
                self.beacon_deadline_us = Some(now_us + miss_window_us(BEACON_INTERVAL_MIN_MS));
            }
        }
        self.commit();
    }

    /// Drop the clock model (and with `drop_epoch` the epoch) and start over.
    fn invalidate(&mut self, now_us: u64, drop_epoch: bool) {
        self.state = ClockState::default();
        self.status = SyncStatus::Unsynced;
        self.bootstrapped = false;
        self.filter.reset();
        self.rtt.reset();
        self.pending = None;
        self.client_handshake_started_us = None;
        self.last_seen_sequence = None;
        self.consecutive_misses = 0;
        self.consecutive_rejects = 0;
        self.resync_pending = false;
        self.request_interval_ms = BEACON_REQUEST_MAX_MS;
        self.next_request_us = None;
        self.beacon_deadline_us = None;
        self.next_beacon_us = None;
        if drop_epoch {
            self.epoch = None;
        }
        self.session = self.session.wrapping_add(1);
        self.handshake_attempts = 0;
        self.next_handshake_us = match self.role {
            Role::Server => Some(now_us),
            Role::Client => None,
        };
        self.commit();
    }

    // ---- Handshake --------------------------------------------------------

    /// SERVER: open a four-timestamp exchange. Returns the request to send.
    pub fn initiate_handshake(&mut self, now_us: u64) -> Result<BeaconMessage, SyncError> {
        self.require(Role::Server)?;
        self.handshake_sequence = self.handshake_sequence.wrapping_add(1);
        self.pending = Some(PendingHandshake {
            sequence: self.handshake_sequence,
            t1: now_us,
            started_us: now_us,
        });
        self.next_handshake_us = None;
        if self.status == SyncStatus::Unsynced {
            self.status = SyncStatus::Handshaking;
        }
        log::debug!(target: "time_sync", "handshake #{} sent", self.handshake_sequence);
        self.commit();

        Ok(BeaconMessage {
            t1: now_us,
            stratum: self.state.stratum,
            quality: self.state.quality,
            ..BeaconMessage::new(MessageKind::HandshakeRequest, self.handshake_sequence)
        })
    }

    /// CLIENT: stamp T2/T3 on a request and hand back the reply.
    pub fn answer_handshake(
        &mut self,
        request: &BeaconMessage,
        local_rx_us: u64,
        local_tx_us: u64,
    ) -> Result<BeaconMessage, SyncError> {
        self.require(Role::Client)?;
        if self.status == SyncStatus::Unsynced {
            self.status = SyncStatus::Handshaking;
        }
        self.client_handshake_started_us = Some(local_rx_us);
        self.commit();

        Ok(BeaconMessage {
            t1: request.t1,
            t2: local_rx_us,
            t3: local_tx_us.max(local_rx_us),
            ..BeaconMessage::new(MessageKind::HandshakeReply, request.sequence)
        })
    }

    /// SERVER: add T4, finish the exchange, and build the completion that
    /// carries all four timestamps and the current epoch to the CLIENT.
    pub fn complete_handshake(
        &mut self,
        reply: &BeaconMessage,
        local_rx_us: u64,
    ) -> Result<(BeaconMessage, i64), SyncError> {
        self.require(Role::Server)?;
        let pending = match self.pending {
            Some(p) if p.sequence == reply.sequence && p.t1 == reply.t1 => p,
            _ => return Err(SyncError::NoPendingExchange),
        };
        self.pending = None;

        let exchange = ExchangeTimestamps { t4: local_rx_us, ..reply.timestamps() };
        if let Err(err) = check_exchange(&exchange) {
            log::warn!(target: "time_sync", "handshake #{} rejected: {}", pending.sequence, err);
            self.schedule_handshake_retry(local_rx_us);
            self.commit();
            return Err(err);
        }

        let round_trip_us = exchange.round_trip_us();
        self.rtt.record(round_trip_us);
        self.handshake_attempts = 0;
        self.next_handshake_us = None;

        if !self.bootstrapped {
            self.bootstrapped = true;
            self.session = self.session.wrapping_add(1);
            self.state = ClockState {
                offset_us: 0,
                drift_ppm: 0.0,
                quality: QUALITY_EXCELLENT,
                stratum: 0,
                sequence: self.beacon_sequence,
                last_update_us: local_rx_us,
            };
            self.reset_cadence(local_rx_us);
        }
        self.status = SyncStatus::Synced;
        log::info!(
            target: "time_sync",
            "handshake #{} complete: rtt {} us, peer offset {} us",
            pending.sequence,
            round_trip_us,
            exchange.offset_us()
        );
        self.commit();

        let complete = BeaconMessage {
            t1: exchange.t1,
            t2: exchange.t2,
            t3: exchange.t3,
            t4: exchange.t4,
            stratum: self.state.stratum,
            quality: self.state.quality,
            interval_ms: self.beacon_interval_ms,
            epoch: self.epoch,
            ..BeaconMessage::new(MessageKind::HandshakeComplete, pending.sequence)
        };
        Ok((complete, round_trip_us))
    }

    /// CLIENT: apply a completed exchange. The first one of a session sets the
    /// offset outright; later ones are bounded estimator samples.
    pub fn apply_exchange(
        &mut self,
        complete: &BeaconMessage,
        local_rx_us: u64,
    ) -> Result<ExchangeOutcome, SyncError> {
        self.require(Role::Client)?;
        let exchange = complete.timestamps();
        check_exchange(&exchange)?;

        self.client_handshake_started_us = None;
        let round_trip_us = exchange.round_trip_us();
        self.rtt.record(round_trip_us);

        // Server minus client, measured at the midpoint of our turnaround.
        let measured = -exchange.offset_us();
        let anchor_us = exchange.t2 + (exchange.t3 - exchange.t2) / 2;

        let outcome = if !self.bootstrapped {
            self.bootstrapped = true;
            self.resync_pending = false;
            self.session = self.session.wrapping_add(1);
            self.filter.reset();
            self.state = ClockState {
                offset_us: measured,
                drift_ppm: 0.0,
                quality: QUALITY_EXCELLENT,
                stratum: complete.stratum.saturating_add(1),
                sequence: self.state.sequence,
                last_update_us: anchor_us,
            };
            self.consecutive_misses = 0;
            self.consecutive_rejects = 0;
            self.request_interval_ms = BEACON_REQUEST_MAX_MS;
            self.next_request_us = None;
            log::info!(
                target: "time_sync",
                "clock bootstrapped: offset {} us, rtt {} us (session {})",
                measured,
                round_trip_us,
                self.session
            );
            ExchangeOutcome::Bootstrapped { offset_us: measured, round_trip_us }
        } else {
            let discrepancy_us = measured - self.state.offset_at(anchor_us);
            let limit_us = self
                .filter
                .plausibility_limit_us(anchor_us.saturating_sub(self.state.last_update_us));
            if discrepancy_us.abs() > limit_us {
                log::warn!(
                    target: "time_sync",
                    "refresh discarded: discrepancy {} us exceeds {} us",
                    discrepancy_us,
                    limit_us
                );
                self.commit();
                return Ok(ExchangeOutcome::Rejected(RejectReason::Implausible {
                    discrepancy_us,
                    limit_us,
                }));
            }
            let stability = self.rtt.stability();
            let correction_us = self.filter.update(&mut self.state, discrepancy_us, anchor_us, stability);
            self.recover_quality(discrepancy_us);
            ExchangeOutcome::Refreshed { correction_us, round_trip_us }
        };

        self.status = SyncStatus::Synced;
        self.announced_interval_ms = complete.interval_ms.max(BEACON_INTERVAL_MIN_MS);
        self.beacon_deadline_us = Some(local_rx_us + miss_window_us(self.announced_interval_ms));
        if let Some(epoch) = complete.epoch {
            self.adopt_epoch(epoch);
        }
        self.commit();
        Ok(outcome)
    }

    fn schedule_handshake_retry(&mut self, now_us: u64) {
        self.handshake_attempts = self.handshake_attempts.saturating_add(1);
        self.next_handshake_us = if self.handshake_attempts < HANDSHAKE_MAX_ATTEMPTS {
            Some(now_us)
        } else {
            Some(now_us + HANDSHAKE_RETRY_INTERVAL_MS * 1000)
        };
    }

    // ---- Beacons ----------------------------------------------------------

    /// CLIENT: fold a steady-state beacon into the model.
    pub fn process_beacon(&mut self, msg: &BeaconMessage, local_rx_us: u64) -> BeaconOutcome {
        if self.role != Role::Client {
            return BeaconOutcome::NotSynced;
        }
        if !self.bootstrapped {
            return BeaconOutcome::NotSynced;
        }

        // Ordering first: duplicates and stragglers never touch anything.
        let mut missed = 0u8;
        if let Some(last) = self.last_seen_sequence {
            if msg.sequence == last {
                return BeaconOutcome::Duplicate;
            }
            if !sequence_greater_than(msg.sequence, last) {
                log::debug!(target: "time_sync", "stale beacon #{} after #{}", msg.sequence, last);
                return BeaconOutcome::Stale;
            }
            missed = missed_between(last, msg.sequence).unwrap_or(0);
        }
        self.last_seen_sequence = Some(msg.sequence);
        self.announced_interval_ms = msg.interval_ms.max(BEACON_INTERVAL_MIN_MS);
        self.beacon_deadline_us = Some(local_rx_us + miss_window_us(self.announced_interval_ms));
        for _ in 0..missed {
            self.register_miss(local_rx_us);
        }

        if msg.stratum >= MAX_STRATUM {
            log::warn!(target: "time_sync", "beacon #{} stratum {} unusable", msg.sequence, msg.stratum);
            return self.reject(RejectReason::Stratum(msg.stratum), local_rx_us);
        }

        let sample_us = msg.t1 as i64 + self.rtt.one_way_delay_us() - local_rx_us as i64;
        let discrepancy_us = sample_us - self.state.offset_at(local_rx_us);
        let limit_us = self
            .filter
            .plausibility_limit_us(local_rx_us.saturating_sub(self.state.last_update_us));
        if discrepancy_us.abs() > limit_us {
            log::warn!(
                target: "time_sync",
                "beacon #{} discarded: discrepancy {} us exceeds {} us",
                msg.sequence,
                discrepancy_us,
                limit_us
            );
            return self.reject(RejectReason::Implausible { discrepancy_us, limit_us }, local_rx_us);
        }

        let stability = self.rtt.stability();
        let correction_us = self.filter.update(&mut self.state, discrepancy_us, local_rx_us, stability);
        self.state.sequence = msg.sequence;
        self.state.stratum = msg.stratum.saturating_add(1);
        self.consecutive_rejects = 0;
        self.recover_quality(discrepancy_us);
        if let Some(epoch) = msg.epoch {
            self.adopt_epoch(epoch);
        }
        log::trace!(
            target: "time_sync",
            "beacon #{} error {} us, step {} us, quality {}",
            msg.sequence,
            discrepancy_us,
            correction_us,
            self.state.quality
        );
        self.commit();
        BeaconOutcome::Accepted { correction_us, missed }
    }

    fn reject(&mut self, reason: RejectReason, now_us: u64) -> BeaconOutcome {
        self.consecutive_rejects += 1;
        self.register_miss(now_us);
        if self.consecutive_rejects >= REJECT_RESYNC_COUNT && !self.resync_pending {
            log::warn!(
                target: "time_sync",
                "{} consecutive beacons rejected, requesting resync",
                self.consecutive_rejects
            );
            self.resync_pending = true;
            // The next completed exchange bootstraps a new session.
            self.bootstrapped = false;
            self.commit();
            return BeaconOutcome::ResyncRequired;
        }
        self.commit();
        BeaconOutcome::Rejected(reason)
    }

    /// Halve quality; a burst of misses drops it to zero and speeds up the
    /// beacon request cadence.
    fn register_miss(&mut self, now_us: u64) {
        self.consecutive_misses += 1;
        self.state.quality /= 2;
        if self.consecutive_misses >= MISS_BURST {
            self.state.quality = 0;
        }
        if self.state.quality < QUALITY_FAIR {
            if self.next_request_us.is_none() {
                self.next_request_us = Some(now_us);
            } else {
                self.request_interval_ms = (self.request_interval_ms / 2).max(BEACON_REQUEST_MIN_MS);
            }
        }
    }

    /// Move quality toward the band score for `error_us`: down at once, up by
    /// at most `QUALITY_RECOVERY_STEP`.
    fn recover_quality(&mut self, error_us: i64) {
        let target = quality_for_error(error_us);
        let current = self.state.quality;
        self.state.quality = if target > current {
            current.saturating_add(QUALITY_RECOVERY_STEP).min(target)
        } else {
            target
        };
        self.consecutive_misses = 0;
        if self.state.quality >= QUALITY_FAIR {
            self.request_interval_ms = BEACON_REQUEST_MAX_MS;
            self.next_request_us = None;
        }
    }

    fn adopt_epoch(&mut self, epoch: MotorEpoch) {
        if !epoch.is_valid() {
            log::warn!(target: "time_sync", "malformed epoch discarded: {:?}", epoch);
            return;
        }
        if self.epoch != Some(epoch) {
            log::info!(
                target: "time_sync",
                "epoch gen {} at {} us ({} / {} ms)",
                epoch.generation,
                epoch.epoch_us,
                epoch.active_ms,
                epoch.period_ms
            );
            self.epoch = Some(epoch);
        }
    }

    /// SERVER: store a new epoch, attach it to beacons, and beacon at the
    /// fast cadence so the CLIENT learns it quickly.
    pub fn publish_epoch(&mut self, epoch: MotorEpoch, now_us: u64) -> Result<(), SyncError> {
        self.require(Role::Server)?;
        if !epoch.is_valid() {
            log::warn!(target: "time_sync", "refusing to publish malformed epoch {:?}", epoch);
            return Ok(());
        }
        self.epoch = Some(epoch);
        if self.status == SyncStatus::Synced {
            self.reset_cadence(now_us);
        }
        self.commit();
        Ok(())
    }

    fn reset_cadence(&mut self, now_us: u64) {
        self.beacon_interval_ms = BEACON_INTERVAL_MIN_MS;
        self.beacons_at_interval = 0;
        self.next_beacon_us = Some(now_us);
    }

    /// SERVER: build the next beacon and advance the cadence.
    pub fn beacon_now(&mut self, now_us: u64) -> Result<BeaconMessage, SyncError> {
        self.require(Role::Server)?;
        self.beacon_sequence = self.beacon_sequence.wrapping_add(1);
        self.state.sequence = self.beacon_sequence;

        self.beacons_at_interval += 1;
        if self.beacons_at_interval >= BEACON_BACKOFF_AFTER {
            self.beacons_at_interval = 0;
            self.beacon_interval_ms = (self.beacon_interval_ms * 2).min(BEACON_INTERVAL_MAX_MS);
        }
        self.beacons_since_refresh += 1;
        self.next_beacon_us = Some(now_us + self.beacon_interval_ms as u64 * 1000);
        self.commit();

        Ok(BeaconMessage {
            t1: self.synchronized_time(now_us),
            stratum: self.state.stratum,
            quality: self.state.quality,
            interval_ms: self.beacon_interval_ms,
            epoch: self.epoch,
            ..BeaconMessage::new(MessageKind::Beacon, self.beacon_sequence)
        })
    }

    /// Whether a CLIENT beacon request is due at `now_us`.
    pub fn beacon_request_due(&self, now_us: u64) -> bool {
        self.role == Role::Client
            && self.bootstrapped
            && self.status == SyncStatus::Synced
            && self.state.quality < QUALITY_FAIR
            && self.next_request_us.map_or(false, |at| now_us >= at)
    }

    // ---- Dispatch ---------------------------------------------------------

    /// Route one received message. `local_rx_us` is the receipt timestamp,
    /// `now_us` the time any reply is stamped with.
    pub fn handle(
        &mut self,
        msg: &BeaconMessage,
        local_rx_us: u64,
        now_us: u64,
    ) -> Result<Handled, SyncError> {
        match (self.role, msg.kind) {
            (Role::Client, MessageKind::HandshakeRequest) => {
                Ok(Handled::Reply(self.answer_handshake(msg, local_rx_us, now_us)?))
            }
            (Role::Server, MessageKind::HandshakeReply) => {
                let (reply, round_trip_us) = self.complete_handshake(msg, local_rx_us)?;
                Ok(Handled::Completed { reply, round_trip_us })
            }
            (Role::Client, MessageKind::HandshakeComplete) => {
                Ok(Handled::Exchange(self.apply_exchange(msg, local_rx_us)?))
            }
            (Role::Client, MessageKind::Beacon) => {
                Ok(Handled::Beacon(self.process_beacon(msg, local_rx_us)))
            }
            (Role::Server, MessageKind::BeaconRequest) if self.status == SyncStatus::Synced => {
                log::debug!(target: "time_sync", "beacon requested by peer");
                self.reset_cadence(now_us);
                Ok(Handled::Reply(self.beacon_now(now_us)?))
            }
            (Role::Server, MessageKind::ResyncRequest) => {
                log::info!(target: "time_sync", "peer requested resync");
                self.handshake_attempts = 0;
                Ok(Handled::Reply(self.initiate_handshake(now_us)?))
            }
            (role, kind) => {
                log::debug!(target: "time_sync", "{} ignoring {:?}", role, kind);
                Ok(Handled::Ignored)
            }
        }
    }

    // ---- Timers -----------------------------------------------------------

    /// Advance timers: handshake timeouts and retries, beacon cadence and
    /// refreshes, beacon timeouts and requests, expiry.
    pub fn tick(&mut self, now_us: u64) -> Vec<SyncAction> {
        let mut actions = Vec::new();

        if let SyncStatus::Disconnected { since_us } = self.status {
            if now_us.saturating_sub(since_us) >= DISCONNECT_GRACE_MS * 1000 {
                self.status = SyncStatus::Expired;
                self.commit();
            }
        }
        if self.status == SyncStatus::Expired {
            if !self.expiry_reported {
                self.expiry_reported = true;
                log::error!(target: "time_sync", "sync expired: peer gone for {} ms", DISCONNECT_GRACE_MS);
                actions.push(SyncAction::Expired);
            }
            return actions;
        }
        if matches!(self.status, SyncStatus::Disconnected { .. }) || self.peer.is_none() {
            return actions;
        }

        match self.role {
            Role::Server => self.tick_server(now_us, &mut actions),
            Role::Client => self.tick_client(now_us, &mut actions),
        }
        actions
    }

    fn tick_server(&mut self, now_us: u64, actions: &mut Vec<SyncAction>) {
        if let Some(pending) = self.pending {
            if now_us.saturating_sub(pending.started_us) >= HANDSHAKE_TIMEOUT_MS * 1000 {
                self.pending = None;
                self.schedule_handshake_retry(now_us);
                if !self.bootstrapped {
                    self.status = SyncStatus::Unsynced;
                    self.state.quality = 0;
                }
                log::warn!(
                    target: "time_sync",
                    "handshake #{} timed out (attempt {})",
                    pending.sequence,
                    self.handshake_attempts
                );
                self.commit();
                actions.push(SyncAction::HandshakeTimedOut {
                    attempts: self.handshake_attempts,
                    bootstrapped: self.bootstrapped,
                });
            }
        }

        if self.pending.is_none() && self.next_handshake_us.map_or(false, |at| now_us >= at) {
            if let Ok(request) = self.initiate_handshake(now_us) {
                actions.push(SyncAction::Send(request));
            }
        }

        if self.status != SyncStatus::Synced {
            return;
        }
        if self.next_beacon_us.map_or(false, |at| now_us >= at) {
            if let Ok(beacon) = self.beacon_now(now_us) {
                actions.push(SyncAction::Send(beacon));
            }
            if self.beacons_since_refresh >= REFRESH_EVERY_BEACONS && self.pending.is_none() {
                self.beacons_since_refresh = 0;
                if let Ok(request) = self.initiate_handshake(now_us) {
                    actions.push(SyncAction::Send(request));
                }
            }
        }
    }

    fn tick_client(&mut self, now_us: u64, actions: &mut Vec<SyncAction>) {
        if let Some(started) = self.client_handshake_started_us {
            if now_us.saturating_sub(started) >= HANDSHAKE_TIMEOUT_MS * 1000 {
                self.client_handshake_started_us = None;
                if self.status == SyncStatus::Handshaking {
                    self.status = SyncStatus::Unsynced;
                }
                self.commit();
                actions.push(SyncAction::HandshakeTimedOut {
                    attempts: 1,
                    bootstrapped: self.bootstrapped,
                });
            }
        }

        if self.resync_pending {
            self.resync_pending = false;
            let request = BeaconMessage::new(MessageKind::ResyncRequest, self.state.sequence);
            actions.push(SyncAction::Send(request));
        }

        if self.status != SyncStatus::Synced {
            return;
        }

        if let Some(deadline) = self.beacon_deadline_us {
            if now_us >= deadline {
                self.beacon_deadline_us = Some(now_us + self.announced_interval_ms as u64 * 1000);
                self.register_miss(now_us);
                log::debug!(
                    target: "time_sync",
                    "beacon overdue ({} consecutive), quality {}",
                    self.consecutive_misses,
                    self.state.quality
                );
                self.commit();
                actions.push(SyncAction::BeaconMissed { consecutive: self.consecutive_misses });
            }
        }

        if self.beacon_request_due(now_us) {
            self.next_request_us = Some(now_us + self.request_interval_ms as u64 * 1000);
            let request = BeaconMessage {
                quality: self.state.quality,
                ..BeaconMessage::new(MessageKind::BeaconRequest, self.state.sequence)
            };
            actions.push(SyncAction::Send(request));
        }
    }
}

fn miss_window_us(interval_ms: u32) -> u64 {
    interval_ms as u64 * 1000 * MISS_FACTOR_PCT / 100
}

fn check_exchange(exchange: &ExchangeTimestamps) -> Result<(), SyncError> {
    let round_trip_us = exchange.round_trip_us();
    let offset_us = exchange.offset_us();
    if !(0..=HANDSHAKE_MAX_RTT_US).contains(&round_trip_us)
        || offset_us.abs() > HANDSHAKE_MAX_OFFSET_US
        || exchange.t3 < exchange.t2
    {
        return Err(SyncError::ImplausibleExchange { round_trip_us, offset_us });
    }
    Ok(())
}

/// Quality band for a prediction error.
pub fn quality_for_error(error_us: i64) -> u8 {
    match error_us.unsigned_abs() {
        e if e < 1_000 => QUALITY_EXCELLENT,
        e if e < 5_000 => QUALITY_GOOD,
        e if e < 15_000 => QUALITY_FAIR,
        e if e < 30_000 => QUALITY_POOR,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SKEW_US: u64 = 250_000;
    const LATENCY_US: u64 = 3_000;

    fn peer(role: Role) -> PeerIdentity {
        PeerIdentity { address: [0x24, 0x0A, 0xC4, 0, 0, 1], role }
    }

    /// SERVER clock at `t`, CLIENT clock at `t + SKEW_US`.
    fn bootstrap_pair(t: u64) -> (TimeSyncEngine, TimeSyncEngine) {
        let mut server = TimeSyncEngine::new(Role::Server);
        let mut client = TimeSyncEngine::new(Role::Client);
        server.on_connect(peer(Role::Client), t);
        client.on_connect(peer(Role::Server), t + SKEW_US);

        let request = server.initiate_handshake(t).unwrap();
        let c_rx = t + LATENCY_US + SKEW_US;
        let reply = client.answer_handshake(&request, c_rx, c_rx + 500).unwrap();
        let s_rx = t + 2 * LATENCY_US + 500;
        let (complete, rtt) = server.complete_handshake(&reply, s_rx).unwrap();
        assert_eq!(rtt, 2 * LATENCY_US as i64);
        let outcome = client.apply_exchange(&complete, s_rx + LATENCY_US + SKEW_US).unwrap();
        assert!(matches!(outcome, ExchangeOutcome::Bootstrapped { .. }));
        (server, client)
    }

    #[test]
    fn handshake_recovers_skew_and_round_trip() {
        let (server, client) = bootstrap_pair(1_000_000);
        assert_eq!(server.status(), SyncStatus::Synced);
        assert_eq!(client.status(), SyncStatus::Synced);
        assert_eq!(client.clock_state().offset_us, -(SKEW_US as i64));
        assert_eq!(client.clock_state().stratum, 1);
        assert_eq!(client.quality(), QUALITY_EXCELLENT);
        assert_eq!(client.rtt().one_way_delay_us(), LATENCY_US as i64);
        // Same instant reads the same on both nodes.
        let server_local = 5_000_000;
        assert_eq!(
            client.synchronized_time(server_local + SKEW_US),
            server.synchronized_time(server_local)
        );
    }

    #[test]
    fn role_checks() {
        let mut client = TimeSyncEngine::new(Role::Client);
        assert_eq!(client.initiate_handshake(0), Err(SyncError::WrongRole(Role::Server)));
        let mut server = TimeSyncEngine::new(Role::Server);
        let reply = BeaconMessage::new(MessageKind::HandshakeReply, 9);
        assert_eq!(server.complete_handshake(&reply, 0), Err(SyncError::NoPendingExchange));
    }

    #[test]
    fn implausible_exchange_is_rejected() {
        let mut client = TimeSyncEngine::new(Role::Client);
        let complete = BeaconMessage {
            t1: 1_000,
            t2: 500,
            t3: 600,
            t4: 900, // negative round trip
            ..BeaconMessage::new(MessageKind::HandshakeComplete, 1)
        };
        assert!(matches!(
            client.apply_exchange(&complete, 1_000),
            Err(SyncError::ImplausibleExchange { .. })
        ));
        assert_eq!(client.status(), SyncStatus::Unsynced);
    }

    fn beacon_from(server: &mut TimeSyncEngine, server_now: u64) -> BeaconMessage {
        server.beacon_now(server_now).unwrap()
    }

    #[test]
    fn duplicate_beacon_is_idempotent() {
        let (mut server, mut client) = bootstrap_pair(1_000_000);
        let beacon = beacon_from(&mut server, 2_000_000);
        let rx = 2_000_000 + LATENCY_US + SKEW_US;
        assert!(matches!(client.process_beacon(&beacon, rx), BeaconOutcome::Accepted { .. }));
        let before = client.snapshot();
        assert_eq!(client.process_beacon(&beacon, rx + 10_000), BeaconOutcome::Duplicate);
        assert_eq!(client.snapshot(), before);
    }

    #[test]
    fn sequence_wrap_is_neither_stale_nor_missed() {
        let (mut server, mut client) = bootstrap_pair(1_000_000);
        for (i, sequence) in [254u8, 255, 0, 1].into_iter().enumerate() {
            let t = 2_000_000 + i as u64 * 1_000_000;
            let mut beacon = beacon_from(&mut server, t);
            beacon.sequence = sequence;
            let outcome = client.process_beacon(&beacon, t + LATENCY_US + SKEW_US);
            assert!(
                matches!(outcome, BeaconOutcome::Accepted { missed: 0, .. }),
                "#{} gave {:?}",
                sequence,
                outcome
            );
        }
        assert_eq!(client.clock_state().sequence, 1);
        assert_eq!(client.quality(), QUALITY_EXCELLENT);
    }

    #[test]
    fn reordered_beacon_is_stale() {
        let (mut server, mut client) = bootstrap_pair(1_000_000);
        let first = beacon_from(&mut server, 2_000_000);
        let second = beacon_from(&mut server, 3_000_000);
        let rx = |t: u64| t + LATENCY_US + SKEW_US;
        assert!(matches!(client.process_beacon(&second, rx(3_000_000)), BeaconOutcome::Accepted { .. }));
        let before = client.snapshot();
        assert_eq!(client.process_beacon(&first, rx(3_000_100)), BeaconOutcome::Stale);
        assert_eq!(client.snapshot(), before);
    }

    #[test]
    fn implausible_beacon_leaves_model_untouched() {
        let (mut server, mut client) = bootstrap_pair(1_000_000);
        let mut beacon = beacon_from(&mut server, 2_000_000);
        beacon.t1 += 400_000;
        let before = client.clock_state();
        let outcome = client.process_beacon(&beacon, 2_000_000 + LATENCY_US + SKEW_US);
        assert!(matches!(outcome, BeaconOutcome::Rejected(RejectReason::Implausible { .. })));
        let after = client.clock_state();
        assert_eq!(after.offset_us, before.offset_us);
        assert_eq!(after.drift_ppm, before.drift_ppm);
        assert_eq!(after.last_update_us, before.last_update_us);
    }

    #[test]
    fn miss_burst_zeroes_quality_and_two_beacons_recover() {
        let (mut server, mut client) = bootstrap_pair(1_000_000);
        let rx = |t: u64| t + LATENCY_US + SKEW_US;
        let first = beacon_from(&mut server, 2_000_000);
        client.process_beacon(&first, rx(2_000_000));
        // Three beacons lost on the air.
        for t in [3_000_000, 4_000_000, 5_000_000] {
            beacon_from(&mut server, t);
        }
        let next = beacon_from(&mut server, 6_000_000);
        assert!(matches!(
            client.process_beacon(&next, rx(6_000_000)),
            BeaconOutcome::Accepted { missed: 3, .. }
        ));
        // Burst drove it to 0, then one good beacon recovered one step.
        assert_eq!(client.quality(), QUALITY_RECOVERY_STEP);
        let again = beacon_from(&mut server, 7_000_000);
        client.process_beacon(&again, rx(7_000_000));
        assert_eq!(client.quality(), QUALITY_EXCELLENT);
    }

    #[test]
    fn resync_after_consecutive_rejections() {
        let (mut server, mut client) = bootstrap_pair(1_000_000);
        let mut last = BeaconOutcome::NotSynced;
        for i in 0..REJECT_RESYNC_COUNT as u64 {
            let t = 2_000_000 + i * 1_000_000;
            let mut beacon = beacon_from(&mut server, t);
            beacon.t1 += 500_000;
            last = client.process_beacon(&beacon, t + LATENCY_US + SKEW_US);
        }
        assert_eq!(last, BeaconOutcome::ResyncRequired);
        let actions = client.tick(7_000_000 + SKEW_US);
        assert!(actions.iter().any(|a| matches!(
            a,
            SyncAction::Send(BeaconMessage { kind: MessageKind::ResyncRequest, .. })
        )));
    }

    #[test]
    fn server_cadence_doubles_and_caps() {
        let (mut server, _client) = bootstrap_pair(0);
        let mut interval = BEACON_INTERVAL_MIN_MS;
        for _ in 0..40 {
            let beacon = beacon_from(&mut server, 0);
            assert!(beacon.interval_ms >= interval);
            interval = beacon.interval_ms;
        }
        assert_eq!(server.beacon_interval_ms(), BEACON_INTERVAL_MAX_MS);
        let epoch = MotorEpoch { epoch_us: 0, period_ms: 1000, active_ms: 500, generation: 1 };
        server.publish_epoch(epoch, 100).unwrap();
        assert_eq!(server.beacon_interval_ms(), BEACON_INTERVAL_MIN_MS);
        let beacon = beacon_from(&mut server, 100);
        assert_eq!(beacon.epoch, Some(epoch));
    }

    #[test]
    fn client_keeps_last_valid_epoch() {
        let (mut server, mut client) = bootstrap_pair(0);
        let good = MotorEpoch { epoch_us: 10, period_ms: 1000, active_ms: 500, generation: 1 };
        server.publish_epoch(good, 1_000_000).unwrap();
        let beacon = beacon_from(&mut server, 1_000_000);
        client.process_beacon(&beacon, 1_000_000 + LATENCY_US + SKEW_US);
        assert_eq!(client.epoch(), Some(good));

        let mut bad = beacon_from(&mut server, 2_000_000);
        bad.epoch = Some(MotorEpoch { period_ms: 0, ..good });
        client.process_beacon(&bad, 2_000_000 + LATENCY_US + SKEW_US);
        assert_eq!(client.epoch(), Some(good));
    }

    #[test]
    fn disconnect_freezes_and_reconnect_resumes() {
        let (_server, mut client) = bootstrap_pair(0);
        let before = client.clock_state();
        client.on_disconnect(10_000_000);
        assert_eq!(client.status(), SyncStatus::Disconnected { since_us: 10_000_000 });
        assert_eq!(client.clock_state(), before);
        assert!(client.on_reconnect(peer(Role::Server), 70_000_000).is_ok());
        assert_eq!(client.status(), SyncStatus::Synced);
        assert_eq!(client.clock_state().offset_us, before.offset_us);
    }

    #[test]
    fn unsynced_node_gets_the_same_grace() {
        let mut client = TimeSyncEngine::new(Role::Client);
        client.on_connect(peer(Role::Server), 0);
        client.on_disconnect(1_000_000);
        assert_eq!(client.status(), SyncStatus::Disconnected { since_us: 1_000_000 });
        assert_eq!(client.quality(), 0);

        // Back inside the grace: still needs its first handshake.
        assert!(client.on_reconnect(peer(Role::Server), 2_000_000).is_ok());
        assert_eq!(client.status(), SyncStatus::Unsynced);

        client.on_disconnect(3_000_000);
        let expire_at = 3_000_000 + DISCONNECT_GRACE_MS * 1000;
        assert!(client.snapshot().is_expired(expire_at));
        assert_eq!(client.tick(expire_at), vec![SyncAction::Expired]);
    }

    #[test]
    fn disconnect_before_any_peer_changes_nothing() {
        let mut server = TimeSyncEngine::new(Role::Server);
        server.on_disconnect(1_000_000);
        assert_eq!(server.status(), SyncStatus::Unsynced);
    }

    #[test]
    fn expiry_then_reconnect_requires_handshake() {
        let (_server, mut client) = bootstrap_pair(0);
        client.on_disconnect(1_000_000);
        let expire_at = 1_000_000 + DISCONNECT_GRACE_MS * 1000;
        assert!(client.tick(expire_at - 1).is_empty());
        assert_eq!(client.tick(expire_at), vec![SyncAction::Expired]);
        assert!(client.tick(expire_at + 1).is_empty());
        assert!(matches!(
            client.on_reconnect(peer(Role::Server), expire_at + 5),
            Err(SyncError::SyncExpired { .. })
        ));
        assert_eq!(client.status(), SyncStatus::Unsynced);
    }

    #[test]
    fn role_swap_invalidates_clock_and_epoch() {
        let (mut server, _client) = bootstrap_pair(0);
        let epoch = MotorEpoch { epoch_us: 10, period_ms: 1000, active_ms: 500, generation: 1 };
        server.publish_epoch(epoch, 0).unwrap();
        server.on_disconnect(1_000_000);
        let err = server.on_reconnect(peer(Role::Server), 2_000_000).unwrap_err();
        assert_eq!(
            err,
            SyncError::RoleSwapDetected { previous: Role::Client, current: Role::Server }
        );
        assert_eq!(server.role(), Role::Client);
        assert_eq!(server.epoch(), None);
        assert_eq!(server.status(), SyncStatus::Unsynced);
    }

    #[test]
    fn server_handshake_retries_then_slows_down() {
        let mut server = TimeSyncEngine::new(Role::Server);
        server.on_connect(peer(Role::Client), 0);
        let mut now = 0;
        let mut sent = 0;
        for _ in 0..HANDSHAKE_MAX_ATTEMPTS {
            let actions = server.tick(now);
            sent += actions.iter().filter(|a| matches!(a, SyncAction::Send(_))).count();
            now += HANDSHAKE_TIMEOUT_MS * 1000;
        }
        assert_eq!(sent, HANDSHAKE_MAX_ATTEMPTS as usize);
        let actions = server.tick(now);
        assert!(actions.contains(&SyncAction::HandshakeTimedOut {
            attempts: HANDSHAKE_MAX_ATTEMPTS,
            bootstrapped: false
        }));
        assert!(!actions.iter().any(|a| matches!(a, SyncAction::Send(_))));
        let later = server.tick(now + HANDSHAKE_RETRY_INTERVAL_MS * 1000);
        assert!(later.iter().any(|a| matches!(a, SyncAction::Send(_))));
    }

    #[test]
    fn quality_bands() {
        assert_eq!(quality_for_error(999), 95);
        assert_eq!(quality_for_error(-4_999), 75);
        assert_eq!(quality_for_error(14_999), 50);
        assert_eq!(quality_for_error(29_999), 25);
        assert_eq!(quality_for_error(30_000), 0);
    }
}
