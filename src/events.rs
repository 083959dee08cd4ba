// Bilateral Firmware - System Events & Data Types
//
// Everything that crosses a thread boundary: roles, inbox messages for the
// coordination loop, commands for the sync task, and telemetry.

use std::fmt;
use std::sync::mpsc::{SyncSender, TrySendError};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::*;
use crate::coordination::{Phase, SkipReason};
use crate::error::ParamError;
use crate::params::{MotorEpoch, ParamUpdate};

// ---------------------------------------------------------------------------
// Role
// ---------------------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Timing reference. Owns and publishes the motor epoch.
    Server,
    /// Follows the SERVER half a period behind.
    Client,
}

impl Role {
    pub fn peer(self) -> Self {
        match self {
            Self::Server => Self::Client,
            Self::Client => Self::Server,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Server => "SERVER",
            Self::Client => "CLIENT",
        })
    }
}

/// Who is on the other end of the link, as reported by the pairing layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerIdentity {
    pub address: [u8; 6],
    pub role: Role,
}

// ---------------------------------------------------------------------------
// Coordination inbox (bounded, read by the wait primitive)
// ---------------------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CoordinationMsg {
    /// Role for this session, from the pairing layer.
    RoleAssigned(Role),
    /// New frequency / duty / intensity from the configuration surface.
    Params(ParamUpdate),
    /// Peer came back within the grace period with the same role.
    PeerReconnected,
    /// Peer came back with a swapped role; clock and epoch were invalidated.
    RoleSwapped,
    /// Terminal. Overrides everything queued behind it.
    Shutdown,
}

// ---------------------------------------------------------------------------
// Sync task commands
// ---------------------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SyncCommand {
    PeerConnected(PeerIdentity),
    PeerDisconnected,
    PublishEpoch(MotorEpoch),
    Shutdown,
}

// ---------------------------------------------------------------------------
// Telemetry
// ---------------------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SessionCondition {
    ClockNotReady,
    SyncExpired,
    RoleSwapDetected,
    TransportDegraded { consecutive_failures: u32 },
    InvalidParameter(ParamError),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TelemetryEvent {
    PhaseChanged { from: Phase, to: Phase, at_us: u64 },
    CorrectionApplied { error_us: i64, applied_us: i64 },
    CorrectionSkipped(SkipReason),
    QualityChanged { from: u8, to: u8 },
    Session(SessionCondition),
}

/// Optional bounded telemetry sink. Events are logged regardless; the channel
/// only ever sees a `try_send`, so a slow consumer loses events, not time.
#[derive(Debug, Clone, Default)]
pub struct Telemetry {
    tx: Option<SyncSender<TelemetryEvent>>,
}

impl Telemetry {
    pub fn new(tx: SyncSender<TelemetryEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: TelemetryEvent) {
        match &event {
            TelemetryEvent::Session(condition) => {
                log::warn!(target: "coordination", "session condition: {:?}", condition)
            }
            other => log::debug!(target: "coordination", "{:?}", other),
        }
        if let Some(tx) = &self.tx {
            let _ = tx.try_send(event);
        }
    }
}

// ---------------------------------------------------------------------------
// Bounded best-effort send
// ---------------------------------------------------------------------------

/// Try to enqueue `msg`, retrying briefly while the queue is full. Gives up
/// after `timeout` and hands the message back.
pub fn offer<T>(tx: &SyncSender<T>, msg: T, timeout: Duration) -> Result<(), TrySendError<T>> {
    let deadline = Instant::now() + timeout;
    let mut msg = msg;
    loop {
        match tx.try_send(msg) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Full(back)) if Instant::now() < deadline => {
                msg = back;
                thread::sleep(Duration::from_millis(QUEUE_SEND_RETRY_MS));
            }
            Err(err) => return Err(err),
        }
    }
}

/// `offer` with the default queue send timeout.
pub fn offer_default<T>(tx: &SyncSender<T>, msg: T) -> Result<(), TrySendError<T>> {
    offer(tx, msg, Duration::from_millis(QUEUE_SEND_TIMEOUT_MS))
}
