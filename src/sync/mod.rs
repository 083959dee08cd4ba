// Bilateral Firmware - Time Synchronization
//
// `engine` owns the clock model and is the single writer; `state` holds the
// snapshot types readers see; `wire` is the frame codec; `filter` is the
// offset/drift estimator.

pub mod engine;
pub mod filter;
pub mod state;
pub mod wire;

pub use engine::{BeaconOutcome, ExchangeOutcome, Handled, RejectReason, SyncAction, TimeSyncEngine};
pub use state::{ClockSnapshot, ClockState, SyncHandle, SyncReader, SyncStatus};
pub use wire::{BeaconMessage, ExchangeTimestamps, MessageKind};
