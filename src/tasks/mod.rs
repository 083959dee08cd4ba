pub mod motor;
pub mod time_sync;

pub use time_sync::TimeSyncTask;
