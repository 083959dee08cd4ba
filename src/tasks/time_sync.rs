// Bilateral Firmware - Time Sync Task
//
// Owns the engine (single writer of the clock model). Each pass applies
// queued commands, drains received frames, ticks the engine timers, then
// sleeps one poll interval.

use std::sync::mpsc::{Receiver, SyncSender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::clock::Clock;
use crate::config::*;
use crate::error::{CoreError, SyncError, TransportError};
use crate::events::{
    offer_default, CoordinationMsg, SessionCondition, SyncCommand, Telemetry, TelemetryEvent,
};
use crate::sync::{BeaconMessage, BeaconOutcome, Handled, SyncAction, TimeSyncEngine};
use crate::transport::{Received, Transport};

pub struct TimeSyncTask<T> {
    engine: TimeSyncEngine,
    transport: T,
    clock: Arc<dyn Clock>,
    commands: Receiver<SyncCommand>,
    coordination: SyncSender<CoordinationMsg>,
    telemetry: Telemetry,
    poll: Duration,
    consecutive_failures: u32,
    degraded_reported: bool,
}

impl<T: Transport> TimeSyncTask<T> {
    pub fn new(
        engine: TimeSyncEngine,
        transport: T,
        clock: Arc<dyn Clock>,
        commands: Receiver<SyncCommand>,
        coordination: SyncSender<CoordinationMsg>,
    ) -> Self {
        Self {
            engine,
            transport,
            clock,
            commands,
            coordination,
            telemetry: Telemetry::disabled(),
            poll: Duration::from_millis(TIME_SYNC_POLL_MS),
            consecutive_failures: 0,
            degraded_reported: false,
        }
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    pub fn engine(&self) -> &TimeSyncEngine {
        &self.engine
    }

    pub fn run(mut self) -> Result<(), CoreError> {
        log::info!(target: "time_sync", "time sync task started as {}", self.engine.role());
        loop {
            if !self.run_once() {
                break;
            }
            self.clock.sleep(self.poll);
        }
        log::info!(target: "time_sync", "time sync task stopped");
        Ok(())
    }

    /// One pass. Returns `false` once a shutdown command was seen or every
    /// command sender is gone.
    pub fn run_once(&mut self) -> bool {
        loop {
            match self.commands.try_recv() {
                Ok(SyncCommand::Shutdown) => return false,
                Ok(command) => self.apply(command),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return false,
            }
        }

        while let Some(frame) = self.receive() {
            self.dispatch(frame);
        }

        let quality_before = self.engine.quality();
        for action in self.engine.tick(self.clock.now_us()) {
            self.perform(action);
        }
        let quality_after = self.engine.quality();
        if quality_after != quality_before {
            self.telemetry.emit(TelemetryEvent::QualityChanged {
                from: quality_before,
                to: quality_after,
            });
        }
        true
    }

    fn apply(&mut self, command: SyncCommand) {
        let now = self.clock.now_us();
        match command {
            SyncCommand::PeerConnected(peer) if self.engine.has_peer() => {
                match self.engine.on_reconnect(peer, now) {
                    Ok(()) => self.notify(CoordinationMsg::PeerReconnected),
                    Err(SyncError::RoleSwapDetected { previous, current }) => {
                        log::warn!(target: "time_sync", "peer role {} -> {}", previous, current);
                        self.notify(CoordinationMsg::RoleSwapped);
                        self.notify(CoordinationMsg::RoleAssigned(self.engine.role()));
                    }
                    Err(err) => log::warn!(target: "time_sync", "reconnect: {}", err),
                }
            }
            SyncCommand::PeerConnected(peer) => self.engine.on_connect(peer, now),
            SyncCommand::PeerDisconnected => self.engine.on_disconnect(now),
            SyncCommand::PublishEpoch(epoch) => {
                if let Err(err) = self.engine.publish_epoch(epoch, now) {
                    log::warn!(target: "time_sync", "epoch not published: {}", err);
                }
            }
            SyncCommand::Shutdown => {}
        }
    }

    fn notify(&self, msg: CoordinationMsg) {
        if offer_default(&self.coordination, msg).is_err() {
            log::warn!(target: "time_sync", "coordination inbox unavailable, dropped {:?}", msg);
        }
    }

    fn receive(&mut self) -> Option<Received> {
        match self.transport.try_recv() {
            Ok(Some(frame)) => {
                self.transport_ok();
                Some(frame)
            }
            Ok(None) => None,
            Err(err) => {
                self.transport_failed(err);
                None
            }
        }
    }

    fn dispatch(&mut self, frame: Received) {
        let msg = match BeaconMessage::decode(&frame.payload) {
            Ok(msg) => msg,
            Err(err) => {
                log::debug!(target: "transport", "discarding frame: {}", err);
                return self.transport_failed(err);
            }
        };
        match self.engine.handle(&msg, frame.local_rx_us, self.clock.now_us()) {
            Ok(Handled::Reply(reply)) => self.send(&reply),
            Ok(Handled::Completed { reply, .. }) => self.send(&reply),
            Ok(Handled::Beacon(BeaconOutcome::ResyncRequired)) => {
                log::warn!(target: "time_sync", "clock model lost, resync requested");
            }
            Ok(_) => {}
            Err(err) => log::warn!(target: "time_sync", "{:?} not applied: {}", msg.kind, err),
        }
    }

    fn perform(&mut self, action: SyncAction) {
        match action {
            SyncAction::Send(msg) => self.send(&msg),
            SyncAction::HandshakeTimedOut { attempts, bootstrapped } => {
                log::warn!(
                    target: "time_sync",
                    "handshake timed out (attempt {}, {})",
                    attempts,
                    if bootstrapped { "keeping current model" } else { "clock not ready" }
                );
            }
            SyncAction::BeaconMissed { consecutive } => {
                log::debug!(target: "time_sync", "beacon missed ({} in a row)", consecutive);
            }
            SyncAction::Expired => {
                log::error!(target: "time_sync", "sync session expired");
            }
        }
    }

    fn send(&mut self, msg: &BeaconMessage) {
        match self.transport.send(&msg.encode()) {
            Ok(()) => self.transport_ok(),
            Err(err) => {
                log::debug!(target: "transport", "send {:?} failed: {}", msg.kind, err);
                self.transport_failed(err);
            }
        }
    }

    fn transport_ok(&mut self) {
        if self.degraded_reported {
            log::info!(target: "transport", "link recovered");
        }
        self.consecutive_failures = 0;
        self.degraded_reported = false;
    }

    fn transport_failed(&mut self, err: TransportError) {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= TRANSPORT_FAILURE_LIMIT && !self.degraded_reported {
            self.degraded_reported = true;
            log::warn!(
                target: "transport",
                "{} consecutive transport failures, last: {}",
                self.consecutive_failures,
                err
            );
            self.telemetry.emit(TelemetryEvent::Session(SessionCondition::TransportDegraded {
                consecutive_failures: self.consecutive_failures,
            }));
        }
    }
}

/// Run the sync task on its own named thread.
pub fn spawn<T: Transport + 'static>(
    task: TimeSyncTask<T>,
) -> Result<JoinHandle<Result<(), CoreError>>, CoreError> {
    thread::Builder::new()
        .name("time_sync".into())
        .stack_size(STACK_TIME_SYNC)
        .spawn(move || task.run())
        .map_err(|source| CoreError::Spawn { task: "time_sync", source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::{PeerIdentity, Role};
    use std::sync::mpsc;

    /// Transport that fails every send and never receives.
    struct DeadLink;

    impl Transport for DeadLink {
        fn send(&mut self, _payload: &[u8]) -> Result<(), TransportError> {
            Err(TransportError::Closed)
        }

        fn try_recv(&mut self) -> Result<Option<Received>, TransportError> {
            Ok(None)
        }
    }

    #[test]
    fn persistent_send_failures_surface_once() {
        let clock = Arc::new(ManualClock::starting_at(0));
        let (cmd_tx, cmd_rx) = mpsc::sync_channel(8);
        let (coord_tx, _coord_rx) = mpsc::sync_channel(8);
        let (tel_tx, tel_rx) = mpsc::sync_channel(64);
        let mut task = TimeSyncTask::new(
            TimeSyncEngine::new(Role::Server),
            DeadLink,
            clock.clone(),
            cmd_rx,
            coord_tx,
        )
        .with_telemetry(Telemetry::new(tel_tx));

        cmd_tx
            .send(SyncCommand::PeerConnected(PeerIdentity { address: [2; 6], role: Role::Client }))
            .unwrap();
        // Every handshake attempt fails to send; retries come every timeout
        // and then every retry interval.
        for _ in 0..(TRANSPORT_FAILURE_LIMIT * 3) {
            assert!(task.run_once());
            clock.advance(Duration::from_millis(HANDSHAKE_RETRY_INTERVAL_MS));
        }
        let degraded = tel_rx
            .try_iter()
            .filter(|e| matches!(e, TelemetryEvent::Session(SessionCondition::TransportDegraded { .. })))
            .count();
        assert_eq!(degraded, 1);

        cmd_tx.send(SyncCommand::Shutdown).unwrap();
        assert!(!task.run_once());
    }

    #[test]
    fn garbage_frames_are_discarded() {
        struct Noise(u32);
        impl Transport for Noise {
            fn send(&mut self, _payload: &[u8]) -> Result<(), TransportError> {
                Ok(())
            }
            fn try_recv(&mut self) -> Result<Option<Received>, TransportError> {
                if self.0 == 0 {
                    return Ok(None);
                }
                self.0 -= 1;
                Ok(Some(Received { payload: vec![0xAA; 12], local_rx_us: 0 }))
            }
        }

        let clock = Arc::new(ManualClock::starting_at(0));
        let (_cmd_tx, cmd_rx) = mpsc::sync_channel(8);
        let (coord_tx, _coord_rx) = mpsc::sync_channel(8);
        let mut task = TimeSyncTask::new(TimeSyncEngine::new(Role::Client), Noise(3), clock, cmd_rx, coord_tx);
        let before = task.engine().snapshot();
        assert!(task.run_once());
        assert_eq!(task.engine().snapshot(), before);
    }
}
