// Bilateral Firmware - Clock State & Snapshots
//
// The engine is the single writer of `ClockState`. It publishes whole
// `ClockSnapshot` values into a mutex; readers copy them out with a try-lock
// so the coordination loop never blocks on the sync task.

use std::sync::{Arc, Mutex, TryLockError};

use crate::config::*;
use crate::params::MotorEpoch;

// ---------------------------------------------------------------------------
// Clock model
// ---------------------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ClockState {
    /// Shared time minus local time, anchored at `last_update_us`.
    pub offset_us: i64,
    /// Rate of change of the offset (parts per million).
    pub drift_ppm: f64,
    /// Confidence, 0-100.
    pub quality: u8,
    /// Hops from the reference: 0 on the SERVER, beacon stratum + 1 on the CLIENT.
    pub stratum: u8,
    /// Last accepted beacon sequence.
    pub sequence: u8,
    /// Local time at which `offset_us` was measured.
    pub last_update_us: u64,
}

impl ClockState {
    /// Offset extrapolated with the drift estimate to `local_us`.
    pub fn offset_at(&self, local_us: u64) -> i64 {
        let elapsed = local_us as i64 - self.last_update_us as i64;
        self.offset_us + (self.drift_ppm * elapsed as f64 / 1e6) as i64
    }

    pub fn synchronized_time(&self, local_us: u64) -> u64 {
        (local_us as i64 + self.offset_at(local_us)).max(0) as u64
    }
}

// ---------------------------------------------------------------------------
// Session status
// ---------------------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// No handshake has completed in this session.
    Unsynced,
    /// A handshake is in flight and no earlier one completed.
    Handshaking,
    Synced,
    /// Peer gone; the frozen model (or nominal timing, if the clock never
    /// synchronized) carries on until the grace elapses.
    Disconnected { since_us: u64 },
    /// Grace elapsed without reconnection.
    Expired,
}

/// What readers see. Copied whole out of the shared cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockSnapshot {
    pub state: ClockState,
    pub status: SyncStatus,
    pub epoch: Option<MotorEpoch>,
    /// Bumped whenever the offset is bootstrapped from scratch.
    pub session: u32,
}

impl Default for ClockSnapshot {
    fn default() -> Self {
        Self {
            state: ClockState::default(),
            status: SyncStatus::Unsynced,
            epoch: None,
            session: 0,
        }
    }
}

impl ClockSnapshot {
    /// Status as of `local_us`. A disconnect past its grace reads as expired
    /// even if the engine has not ticked since.
    pub fn status_at(&self, local_us: u64) -> SyncStatus {
        match self.status {
            SyncStatus::Disconnected { since_us }
                if local_us.saturating_sub(since_us) >= DISCONNECT_GRACE_MS * 1000 =>
            {
                SyncStatus::Expired
            }
            status => status,
        }
    }

    pub fn is_expired(&self, local_us: u64) -> bool {
        self.status_at(local_us) == SyncStatus::Expired
    }

    /// Synced, or disconnected but still inside the grace period.
    pub fn is_usable(&self, local_us: u64) -> bool {
        matches!(
            self.status_at(local_us),
            SyncStatus::Synced | SyncStatus::Disconnected { .. }
        )
    }

    pub fn quality(&self) -> u8 {
        self.state.quality
    }

    pub fn synchronized_time(&self, local_us: u64) -> u64 {
        self.state.synchronized_time(local_us)
    }

    /// Inverse of `synchronized_time` under the current model.
    pub fn local_time_for(&self, sync_us: u64) -> u64 {
        // The drift term moves the offset by < 1 us per ms, one refinement
        // pass is plenty.
        let guess = (sync_us as i64 - self.state.offset_at(sync_us)).max(0) as u64;
        (sync_us as i64 - self.state.offset_at(guess)).max(0) as u64
    }
}

// ---------------------------------------------------------------------------
// Shared cell
// ---------------------------------------------------------------------------

/// Writer side, held by the engine. Cloning hands out more readers.
#[derive(Debug, Clone, Default)]
pub struct SyncHandle {
    shared: Arc<Mutex<ClockSnapshot>>,
}

impl SyncHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn publish(&self, snapshot: ClockSnapshot) {
        let mut guard = match self.shared.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = snapshot;
    }

    pub fn reader(&self) -> SyncReader {
        SyncReader {
            shared: Arc::clone(&self.shared),
            cached: ClockSnapshot::default(),
            floor_us: 0,
            session: 0,
        }
    }
}

/// Non-blocking reader. Never hands out a synchronized time lower than one it
/// already returned in the same sync session.
#[derive(Debug)]
pub struct SyncReader {
    shared: Arc<Mutex<ClockSnapshot>>,
    cached: ClockSnapshot,
    floor_us: u64,
    session: u32,
}

impl SyncReader {
    /// Latest snapshot, or the cached one if the writer holds the lock.
    pub fn snapshot(&mut self) -> ClockSnapshot {
        match self.shared.try_lock() {
            Ok(guard) => self.cached = *guard,
            Err(TryLockError::Poisoned(poisoned)) => self.cached = *poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {}
        }
        if self.cached.session != self.session {
            self.session = self.cached.session;
            self.floor_us = 0;
        }
        self.cached
    }

    /// Synchronized time for `local_us`, clamped to be monotonic per session.
    pub fn now(&mut self, local_us: u64) -> u64 {
        let snapshot = self.snapshot();
        self.monotonic(snapshot.synchronized_time(local_us))
    }

    pub(crate) fn monotonic(&mut self, sync_us: u64) -> u64 {
        let t = sync_us.max(self.floor_us);
        self.floor_us = t;
        t
    }
}
