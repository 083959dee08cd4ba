// Bilateral Firmware - In-Memory Loopback Link
//
// Two endpoints joined by a lossy, jittery, bounded channel. Delivery times
// are scheduled on a shared reference clock; each endpoint stamps receipt on
// its own (possibly skewed) local clock, back-dated to the delivery instant
// the way a radio receive callback would stamp it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::clock::Clock;
use crate::config::*;
use crate::error::TransportError;
use crate::transport::{Received, Transport};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkConfig {
    pub latency_us: u64,
    /// Uniform extra delay in `[0, jitter_us]` per frame.
    pub jitter_us: u64,
    /// Probability in `[0, 1]` that a frame is lost.
    pub loss: f64,
    pub seed: u64,
    pub capacity: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            latency_us: 2_000,
            jitter_us: 0,
            loss: 0.0,
            seed: 0x5EED,
            capacity: QUEUE_DEPTH * 4,
        }
    }
}

#[derive(Debug)]
struct InFlight {
    deliver_at_us: u64,
    payload: Vec<u8>,
}

type Lane = Arc<Mutex<VecDeque<InFlight>>>;

/// Takes the link up or down for both directions.
#[derive(Debug, Clone)]
pub struct LinkControl {
    up: Arc<AtomicBool>,
}

impl LinkControl {
    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }

    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }
}

pub struct LoopbackEndpoint {
    config: LinkConfig,
    reference: Arc<dyn Clock>,
    local: Arc<dyn Clock>,
    outbound: Lane,
    inbound: Lane,
    up: Arc<AtomicBool>,
    rng: StdRng,
}

/// Build two linked endpoints. `reference` schedules delivery; `clock_a` and
/// `clock_b` are the endpoints' local clocks.
pub fn pair(
    config: LinkConfig,
    reference: Arc<dyn Clock>,
    clock_a: Arc<dyn Clock>,
    clock_b: Arc<dyn Clock>,
) -> (LoopbackEndpoint, LoopbackEndpoint, LinkControl) {
    let a_to_b: Lane = Arc::default();
    let b_to_a: Lane = Arc::default();
    let up = Arc::new(AtomicBool::new(true));
    let a = LoopbackEndpoint {
        config,
        reference: Arc::clone(&reference),
        local: clock_a,
        outbound: Arc::clone(&a_to_b),
        inbound: Arc::clone(&b_to_a),
        up: Arc::clone(&up),
        rng: StdRng::seed_from_u64(config.seed),
    };
    let b = LoopbackEndpoint {
        config,
        reference,
        local: clock_b,
        outbound: b_to_a,
        inbound: a_to_b,
        up: Arc::clone(&up),
        rng: StdRng::seed_from_u64(config.seed.wrapping_add(1)),
    };
    (a, b, LinkControl { up })
}

fn lock(lane: &Lane) -> std::sync::MutexGuard<'_, VecDeque<InFlight>> {
    match lane.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Transport for LoopbackEndpoint {
    fn send(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        if !self.up.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if self.config.loss > 0.0 && self.rng.gen_bool(self.config.loss.clamp(0.0, 1.0)) {
            log::trace!(target: "transport", "frame dropped on the air");
            return Ok(());
        }
        let jitter = if self.config.jitter_us > 0 {
            self.rng.gen_range(0..=self.config.jitter_us)
        } else {
            0
        };
        let deliver_at_us = self.reference.now_us() + self.config.latency_us + jitter;

        let mut lane = lock(&self.outbound);
        if lane.len() >= self.config.capacity {
            return Err(TransportError::Full);
        }
        lane.push_back(InFlight { deliver_at_us, payload: payload.to_vec() });
        Ok(())
    }

    fn try_recv(&mut self) -> Result<Option<Received>, TransportError> {
        let now_ref = self.reference.now_us();
        let local_now = self.local.now_us();
        let mut lane = lock(&self.inbound);
        if !self.up.load(Ordering::SeqCst) {
            // Frames in flight when the link went down are lost.
            lane.clear();
            return Ok(None);
        }

        // Jitter can reorder frames; deliver the earliest due one.
        let due = lane
            .iter()
            .enumerate()
            .filter(|(_, f)| f.deliver_at_us <= now_ref)
            .min_by_key(|(_, f)| f.deliver_at_us)
            .map(|(i, _)| i);
        let Some(index) = due else {
            return Ok(None);
        };
        let Some(frame) = lane.remove(index) else {
            return Ok(None);
        };
        let late_by = now_ref - frame.deliver_at_us;
        Ok(Some(Received {
            payload: frame.payload,
            local_rx_us: local_now.saturating_sub(late_by),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration;

    fn clocks() -> (Arc<ManualClock>, Arc<dyn Clock>) {
        let reference = Arc::new(ManualClock::starting_at(1_000_000));
        let dyn_ref: Arc<dyn Clock> = reference.clone();
        (reference, dyn_ref)
    }

    #[test]
    fn delivers_after_latency_with_backdated_stamp() {
        let (reference, dyn_ref) = clocks();
        let config = LinkConfig { latency_us: 3_000, ..LinkConfig::default() };
        let (mut a, mut b, _) = pair(config, dyn_ref.clone(), dyn_ref.clone(), dyn_ref);
        a.send(b"hello").unwrap();
        assert_eq!(b.try_recv().unwrap(), None);
        reference.advance(Duration::from_millis(10));
        let frame = b.try_recv().unwrap().unwrap();
        assert_eq!(frame.payload, b"hello".to_vec());
        assert_eq!(frame.local_rx_us, 1_003_000);
        assert_eq!(b.try_recv().unwrap(), None);
    }

    #[test]
    fn link_down_fails_sends_and_drops_in_flight() {
        let (reference, dyn_ref) = clocks();
        let (mut a, mut b, control) = pair(LinkConfig::default(), dyn_ref.clone(), dyn_ref.clone(), dyn_ref);
        a.send(b"x").unwrap();
        control.set_up(false);
        assert_eq!(a.send(b"y"), Err(TransportError::Closed));
        reference.advance(Duration::from_millis(10));
        assert_eq!(b.try_recv().unwrap(), None);
        control.set_up(true);
        assert_eq!(b.try_recv().unwrap(), None);
    }

    #[test]
    fn full_lane_reports_full() {
        let (_reference, dyn_ref) = clocks();
        let config = LinkConfig { capacity: 2, ..LinkConfig::default() };
        let (mut a, _b, _) = pair(config, dyn_ref.clone(), dyn_ref.clone(), dyn_ref);
        a.send(b"1").unwrap();
        a.send(b"2").unwrap();
        assert_eq!(a.send(b"3"), Err(TransportError::Full));
    }

    #[test]
    fn total_loss_delivers_nothing() {
        let (reference, dyn_ref) = clocks();
        let config = LinkConfig { loss: 1.0, ..LinkConfig::default() };
        let (mut a, mut b, _) = pair(config, dyn_ref.clone(), dyn_ref.clone(), dyn_ref);
        for _ in 0..10 {
            a.send(b"lost").unwrap();
        }
        reference.advance(Duration::from_secs(1));
        assert_eq!(b.try_recv().unwrap(), None);
    }
}
