// Bilateral Firmware - Bounded Checkpointed Wait
//
// The only way the coordination loop passes time. Sleeps in slices of at
// most one checkpoint, and at every checkpoint drains one inbox message,
// evaluates the caller's condition, and feeds the watchdog.

use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::config::*;
use crate::drivers::Watchdog;
use crate::events::CoordinationMsg;
use crate::sync::{ClockSnapshot, SyncReader};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WaitOutcome {
    /// Deadline reached. Carries the synchronized time it was observed at.
    Elapsed { now_sync_us: u64 },
    Message(CoordinationMsg),
    /// The caller's condition became true.
    Condition,
    /// Every sender is gone; nothing can reach this loop any more.
    InboxClosed,
}

pub struct Waiter {
    clock: Arc<dyn Clock>,
    inbox: Receiver<CoordinationMsg>,
    watchdog: Box<dyn Watchdog>,
    checkpoint: Duration,
}

impl Waiter {
    pub fn new(
        clock: Arc<dyn Clock>,
        inbox: Receiver<CoordinationMsg>,
        watchdog: Box<dyn Watchdog>,
    ) -> Self {
        Self {
            clock,
            inbox,
            watchdog,
            checkpoint: Duration::from_millis(CHECKPOINT_MS),
        }
    }

    pub fn with_checkpoint(mut self, checkpoint: Duration) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Non-blocking inbox read.
    pub fn poll(&mut self) -> Result<Option<CoordinationMsg>, TryRecvError> {
        match self.inbox.try_recv() {
            Ok(msg) => Ok(Some(msg)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Wait until `deadline_sync_us` in synchronized time, returning early on
    /// an inbox message or once `condition(snapshot, local_now)` holds.
    pub fn wait_until<F>(
        &mut self,
        reader: &mut SyncReader,
        deadline_sync_us: u64,
        mut condition: F,
    ) -> WaitOutcome
    where
        F: FnMut(&ClockSnapshot, u64) -> bool,
    {
        loop {
            match self.poll() {
                Ok(Some(msg)) => return WaitOutcome::Message(msg),
                Ok(None) => {}
                Err(_) => return WaitOutcome::InboxClosed,
            }

            let local_us = self.clock.now_us();
            let snapshot = reader.snapshot();
            if condition(&snapshot, local_us) {
                return WaitOutcome::Condition;
            }
            self.watchdog.feed();

            let now_sync_us = reader.monotonic(snapshot.synchronized_time(local_us));
            if now_sync_us >= deadline_sync_us {
                return WaitOutcome::Elapsed { now_sync_us };
            }

            let remaining = Duration::from_micros(deadline_sync_us - now_sync_us);
            self.clock.sleep(remaining.min(self.checkpoint));
        }
    }
}
