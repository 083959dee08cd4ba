// Bilateral Firmware - Error Kinds
//
// Timing-math recoveries stay local to the engine and the state machine; the
// types here are what crosses a module boundary.

use thiserror::Error;

use crate::events::Role;

/// Session-level failures surfaced by the coordination loop and the tasks.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error("clock not ready after {waited_ms} ms, running on nominal timing")]
    ClockNotReady { waited_ms: u64 },

    #[error("peer disconnected for {elapsed_ms} ms, past the {grace_ms} ms grace period")]
    SyncExpired { elapsed_ms: u64, grace_ms: u64 },

    #[error("peer role changed from {previous:?} to {current:?}")]
    RoleSwapDetected { previous: Role, current: Role },

    #[error("invalid parameter: {0}")]
    InvalidParameter(#[from] ParamError),

    #[error("time sync: {0}")]
    Sync(SyncError),

    #[error("failed to spawn {task} task: {source}")]
    Spawn {
        task: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Frame-level errors. A frame that fails any check is discarded whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("frame truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("bad frame magic {0:#06x}")]
    BadMagic(u16),

    #[error("unknown message kind {0:#04x}")]
    UnknownKind(u8),

    #[error("checksum mismatch: frame says {expected:#06x}, computed {actual:#06x}")]
    ChecksumMismatch { expected: u16, actual: u16 },

    #[error("link closed")]
    Closed,

    #[error("send queue full")]
    Full,

    #[error("radio driver error {0}")]
    Driver(i32),
}

/// Engine-level errors returned by the time sync operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("operation requires the {0:?} role")]
    WrongRole(Role),

    #[error("no handshake in flight")]
    NoPendingExchange,

    #[error("exchange rejected: round trip {round_trip_us} us, offset {offset_us} us")]
    ImplausibleExchange { round_trip_us: i64, offset_us: i64 },

    #[error("peer role changed from {previous:?} to {current:?}")]
    RoleSwapDetected { previous: Role, current: Role },

    #[error("sync session expired after {elapsed_ms} ms without the peer")]
    SyncExpired { elapsed_ms: u64 },
}

impl From<SyncError> for CoreError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::RoleSwapDetected { previous, current } => {
                CoreError::RoleSwapDetected { previous, current }
            }
            SyncError::SyncExpired { elapsed_ms } => CoreError::SyncExpired {
                elapsed_ms,
                grace_ms: crate::config::DISCONNECT_GRACE_MS,
            },
            other => CoreError::Sync(other),
        }
    }
}

/// Rejected parameter updates. The previous parameters stay in force.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum ParamError {
    #[error("frequency {0} Hz does not give a positive period")]
    NonPositivePeriod(f64),

    #[error("duty cycle {0} outside (0, 1)")]
    DutyOutOfRange(f64),

    #[error("intensity {0}% above 100%")]
    IntensityOutOfRange(u8),

    #[error("active window {active_ms} ms rounds to nothing in a {period_ms} ms period")]
    EmptyWindow { period_ms: u32, active_ms: u32 },
}
