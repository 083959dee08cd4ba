// Bilateral Firmware - Recording Actuator
//
// Timestamps every on/off edge against a reference clock. Tests and the host
// simulation use it to measure windows and overlap between the two nodes.

use std::sync::{Arc, Mutex};

use crate::clock::Clock;
use crate::drivers::Actuator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActuatorEvent {
    pub at_us: u64,
    pub on: bool,
    pub intensity_pct: u8,
}

/// Shared, cloneable view of the recorded edges.
#[derive(Debug, Clone, Default)]
pub struct ActuatorLog {
    events: Arc<Mutex<Vec<ActuatorEvent>>>,
}

impl ActuatorLog {
    pub fn events(&self) -> Vec<ActuatorEvent> {
        match self.events.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn push(&self, event: ActuatorEvent) {
        let mut guard = match self.events.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.push(event);
    }

    /// Closed `[on, off)` windows. A window still open at the end is dropped.
    pub fn windows(&self) -> Vec<(u64, u64)> {
        let mut windows = Vec::new();
        let mut opened: Option<u64> = None;
        for event in self.events() {
            match (event.on, opened) {
                (true, None) => opened = Some(event.at_us),
                (false, Some(start)) => {
                    windows.push((start, event.at_us));
                    opened = None;
                }
                _ => {}
            }
        }
        windows
    }

    pub fn is_on(&self) -> bool {
        self.events().last().map_or(false, |e| e.on)
    }

    /// Time of the first ON edge at or after `at_us`.
    pub fn first_on_after(&self, at_us: u64) -> Option<u64> {
        self.events()
            .into_iter()
            .find(|e| e.on && e.at_us >= at_us)
            .map(|e| e.at_us)
    }
}

/// Total time both logs had their actuator on simultaneously.
pub fn overlap_us(a: &[(u64, u64)], b: &[(u64, u64)]) -> u64 {
    let mut total = 0;
    for &(a_start, a_end) in a {
        for &(b_start, b_end) in b {
            let start = a_start.max(b_start);
            let end = a_end.min(b_end);
            if end > start {
                total += end - start;
            }
        }
    }
    total
}

pub struct RecordingActuator {
    clock: Arc<dyn Clock>,
    log: ActuatorLog,
    on: bool,
}

impl RecordingActuator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock, log: ActuatorLog::default(), on: false }
    }

    pub fn log(&self) -> ActuatorLog {
        self.log.clone()
    }
}

impl Actuator for RecordingActuator {
    fn actuator_on(&mut self, intensity_pct: u8) {
        if !self.on {
            self.on = true;
            self.log.push(ActuatorEvent { at_us: self.clock.now_us(), on: true, intensity_pct });
        }
    }

    fn actuator_off(&mut self) {
        // Only edges are recorded; repeated safe-stops are no-ops.
        if self.on {
            self.on = false;
            self.log.push(ActuatorEvent { at_us: self.clock.now_us(), on: false, intensity_pct: 0 });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration;

    #[test]
    fn records_edges_and_windows() {
        let clock = Arc::new(ManualClock::starting_at(0));
        let mut actuator = RecordingActuator::new(clock.clone());
        let log = actuator.log();
        actuator.actuator_off();
        actuator.actuator_on(75);
        actuator.actuator_on(75);
        clock.advance(Duration::from_millis(500));
        actuator.actuator_off();
        clock.advance(Duration::from_millis(500));
        actuator.actuator_on(75);
        assert_eq!(log.events().len(), 3);
        assert_eq!(log.windows(), vec![(0, 500_000)]);
        assert!(log.is_on());
        assert_eq!(log.first_on_after(1), Some(1_000_000));
    }

    #[test]
    fn overlap_of_interleaved_windows() {
        let a = [(0, 500), (1000, 1500)];
        let b = [(500, 1000), (1400, 2000)];
        assert_eq!(overlap_us(&a, &b), 100);
    }
}
