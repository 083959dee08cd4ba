// Bilateral Firmware - Driver Seams
//
// The coordination loop only sees these traits. On target they are backed by
// LEDC / GPIO / task-watchdog drivers; on the host by recording and no-op
// stand-ins.

pub mod recording;

#[cfg(target_os = "espidf")]
pub mod haptic;
#[cfg(target_os = "espidf")]
pub mod status_led;
#[cfg(target_os = "espidf")]
pub mod watchdog;

pub use recording::{overlap_us, ActuatorEvent, ActuatorLog, RecordingActuator};

use crate::events::Role;
use crate::params::MotorEpoch;

pub trait Actuator: Send {
    /// Drive the actuator at `intensity_pct` (0-100).
    fn actuator_on(&mut self, intensity_pct: u8);
    /// Must always succeed in leaving the output de-energised.
    fn actuator_off(&mut self);
}

pub trait Indicator: Send {
    fn show(&mut self, role: Role);
    fn clear(&mut self);
}

pub trait Watchdog: Send {
    fn feed(&mut self);
}

/// Where the SERVER's coordination loop publishes new motor epochs (normally
/// the sync task's command queue).
pub trait EpochSink: Send {
    fn publish(&mut self, epoch: MotorEpoch);
}

impl<F> EpochSink for F
where
    F: FnMut(MotorEpoch) + Send,
{
    fn publish(&mut self, epoch: MotorEpoch) {
        self(epoch)
    }
}

impl<T: Actuator + ?Sized> Actuator for Box<T> {
    fn actuator_on(&mut self, intensity_pct: u8) {
        (**self).actuator_on(intensity_pct)
    }

    fn actuator_off(&mut self) {
        (**self).actuator_off()
    }
}

// ---------------------------------------------------------------------------
// Host stand-ins
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopIndicator;

impl Indicator for NoopIndicator {
    fn show(&mut self, _role: Role) {}
    fn clear(&mut self) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopWatchdog;

impl Watchdog for NoopWatchdog {
    fn feed(&mut self) {}
}
