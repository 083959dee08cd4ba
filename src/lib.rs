// Bilateral Firmware - Core Library
//
// Hardware-independent core of the two-node bilateral stimulation firmware:
// the time synchronization engine, the anti-phase coordination state machine,
// and the seams (clock, transport, drivers) they run behind. The ESP-IDF
// binary and the host simulation both link against this crate.

pub mod clock;
pub mod config;
pub mod coordination;
pub mod drivers;
pub mod error;
pub mod events;
pub mod params;
pub mod sequence;
pub mod sync;
pub mod tasks;
pub mod transport;

pub use crate::clock::{Clock, ManualClock, SystemClock};
pub use crate::coordination::{Coordinator, CoordinationState, Phase};
pub use crate::error::{CoreError, ParamError, SyncError, TransportError};
pub use crate::events::{CoordinationMsg, PeerIdentity, Role, TelemetryEvent};
pub use crate::params::{MotorEpoch, MotorParams, ParamUpdate};
pub use crate::sync::{SyncHandle, SyncReader, TimeSyncEngine};
