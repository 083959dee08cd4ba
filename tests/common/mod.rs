// Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::sync::mpsc::SyncSender;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bilateral::sync::{ExchangeOutcome, SyncStatus};
use bilateral::{Clock, CoordinationMsg, ManualClock, MotorEpoch, PeerIdentity, Role, TimeSyncEngine};

/// CLIENT crystal reads this much ahead of the SERVER's.
pub const SKEW_US: u64 = 250_000;
/// One-way radio latency used by the scripted exchanges.
pub const LATENCY_US: u64 = 3_000;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn peer(role: Role) -> PeerIdentity {
    let last = match role {
        Role::Server => 0x01,
        Role::Client => 0x02,
    };
    PeerIdentity { address: [0x02, 0, 0, 0, 0, last], role }
}

/// Run one handshake by hand. SERVER clock reads `t`, CLIENT clock reads
/// `t + SKEW_US` at the same instant, latency is symmetric.
pub fn bootstrap_pair(t: u64) -> (TimeSyncEngine, TimeSyncEngine) {
    let mut server = TimeSyncEngine::new(Role::Server);
    let mut client = TimeSyncEngine::new(Role::Client);
    server.on_connect(peer(Role::Client), t);
    client.on_connect(peer(Role::Server), t + SKEW_US);

    let request = server.initiate_handshake(t).unwrap();
    let c_rx = t + LATENCY_US + SKEW_US;
    let reply = client.answer_handshake(&request, c_rx, c_rx + 400).unwrap();
    let s_rx = t + 2 * LATENCY_US + 400;
    let (complete, _) = server.complete_handshake(&reply, s_rx).unwrap();
    let outcome = client.apply_exchange(&complete, s_rx + LATENCY_US + SKEW_US).unwrap();
    assert!(matches!(outcome, ExchangeOutcome::Bootstrapped { .. }));
    assert_eq!(server.status(), SyncStatus::Synced);
    assert_eq!(client.status(), SyncStatus::Synced);
    (server, client)
}

/// Publish `epoch` on the SERVER and deliver the resulting beacon to the
/// CLIENT as if it crossed the link at SERVER time `server_now`.
pub fn deliver_epoch(server: &mut TimeSyncEngine, client: &mut TimeSyncEngine, epoch: MotorEpoch, server_now: u64) {
    server.publish_epoch(epoch, server_now).unwrap();
    let beacon = server.beacon_now(server_now).unwrap();
    let rx = server_now + LATENCY_US + SKEW_US;
    client.handle(&beacon, rx, rx).unwrap();
}

/// Reads another clock shifted back by a fixed amount. Lets a skewed node
/// stamp its actuator edges in the reference timebase.
pub struct ShiftedClock {
    inner: Arc<dyn Clock>,
    back_us: u64,
}

impl ShiftedClock {
    pub fn new(inner: Arc<dyn Clock>, back_us: u64) -> Self {
        Self { inner, back_us }
    }
}

impl Clock for ShiftedClock {
    fn now_us(&self) -> u64 {
        self.inner.now_us().saturating_sub(self.back_us)
    }

    fn sleep(&self, duration: Duration) {
        self.inner.sleep(duration);
    }
}

/// Virtual clock that delivers scripted inbox messages when a sleep crosses
/// their due time, the way another task would while this one waits.
pub struct ScriptedClock {
    time: ManualClock,
    script: Mutex<Vec<(u64, SyncSender<CoordinationMsg>, CoordinationMsg)>>,
}

impl ScriptedClock {
    pub fn starting_at(now_us: u64) -> Self {
        Self { time: ManualClock::starting_at(now_us), script: Mutex::new(Vec::new()) }
    }

    pub fn at(&self, due_us: u64, inbox: &SyncSender<CoordinationMsg>, msg: CoordinationMsg) {
        self.script.lock().unwrap().push((due_us, inbox.clone(), msg));
    }

    fn deliver_due(&self) {
        let now = self.time.now_us();
        let mut script = self.script.lock().unwrap();
        script.retain(|(due, inbox, msg)| {
            if *due <= now {
                inbox.try_send(*msg).unwrap();
                false
            } else {
                true
            }
        });
    }
}

impl Clock for ScriptedClock {
    fn now_us(&self) -> u64 {
        self.time.now_us()
    }

    fn sleep(&self, duration: Duration) {
        self.time.advance(duration);
        self.deliver_due();
    }
}
