// Bilateral Firmware - Motor Task
//
// Hosts the coordination loop. The watchdog is created on the motor thread
// itself because task watchdog subscription is per-thread.

use std::thread::{self, JoinHandle};

use crate::config::STACK_MOTOR;
use crate::coordination::CoordinatorBuilder;
use crate::drivers::Watchdog;
use crate::error::CoreError;

pub fn spawn<F>(
    builder: CoordinatorBuilder,
    watchdog: F,
) -> Result<JoinHandle<Result<(), CoreError>>, CoreError>
where
    F: FnOnce() -> Box<dyn Watchdog> + Send + 'static,
{
    thread::Builder::new()
        .name("motor".into())
        .stack_size(STACK_MOTOR)
        .spawn(move || {
            let mut coordinator = builder.watchdog(watchdog()).build();
            log::info!(target: "coordination", "motor task started ({:?})", coordinator.role());
            let result = coordinator.run();
            match &result {
                Ok(()) => log::info!(target: "coordination", "motor task stopped"),
                Err(e) => log::error!(target: "coordination", "motor task stopped: {}", e),
            }
            result
        })
        .map_err(|source| CoreError::Spawn { task: "motor", source })
}
