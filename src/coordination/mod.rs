// Bilateral Firmware - Bilateral Coordination
//
// `machine` is the per-node control loop; `phase` its closed state set and
// transition table; `wait` the one bounded wait it uses; `correction` the
// CLIENT's bounded drift correction.

pub mod correction;
pub mod machine;
pub mod phase;
pub mod wait;

pub use correction::{CorrectionBounds, CorrectionOutcome, SkipReason};
pub use machine::{CoordinationState, Coordinator, CoordinatorBuilder, SafeStop};
pub use phase::Phase;
pub use wait::{WaitOutcome, Waiter};
