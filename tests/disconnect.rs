// Peer loss: keep stimulating on the frozen clock for the grace period, then
// stop the actuator and report the expired session.

mod common;

use std::sync::mpsc;
use std::sync::Arc;

use bilateral::config::{DISCONNECT_GRACE_MS, HANDSHAKE_TIMEOUT_MS};
use bilateral::drivers::RecordingActuator;
use bilateral::sync::SyncStatus;
use bilateral::{Clock, CoordinationMsg, Coordinator, CoreError, MotorEpoch, MotorParams, Role, TimeSyncEngine};
use common::*;

#[test]
fn frozen_clock_runs_for_the_grace_period_then_expires() {
    init_logging();
    let (mut server, mut client) = bootstrap_pair(900_000);
    let epoch = MotorEpoch::new(1_000_000, &MotorParams::default(), 1);
    deliver_epoch(&mut server, &mut client, epoch, 1_000_000);

    let clock = Arc::new(ScriptedClock::starting_at(1_000_000 + SKEW_US));
    let (_inbox, rx) = mpsc::sync_channel::<CoordinationMsg>(8);
    let actuator = RecordingActuator::new(Arc::new(ShiftedClock::new(clock.clone(), SKEW_US)));
    let log = actuator.log();
    let mut coordinator = Coordinator::builder(clock.clone(), client.sync_handle().reader(), rx, Box::new(actuator))
        .role(Role::Client)
        .build();

    while clock.now_us() < 3_000_000 + SKEW_US {
        coordinator.step();
    }
    let lost_at = clock.now_us();
    client.on_disconnect(lost_at);
    assert!(matches!(client.status(), SyncStatus::Disconnected { .. }));

    let result = coordinator.run();
    match result {
        Err(CoreError::SyncExpired { elapsed_ms, grace_ms }) => {
            assert_eq!(grace_ms, DISCONNECT_GRACE_MS);
            assert!(elapsed_ms >= DISCONNECT_GRACE_MS);
        }
        other => panic!("expected SyncExpired, got {:?}", other),
    }
    let stopped = clock.now_us() - lost_at;
    assert!(stopped >= DISCONNECT_GRACE_MS * 1000);
    assert!(stopped <= DISCONNECT_GRACE_MS * 1000 + 100_000);
    assert!(!log.is_on());

    // Anti-phase windows kept coming on the frozen model the whole time.
    let grace_end = lost_at - SKEW_US + DISCONNECT_GRACE_MS * 1000;
    let during: Vec<_> = log
        .windows()
        .into_iter()
        .filter(|&(on, _)| on >= lost_at - SKEW_US)
        .collect();
    assert!(during.len() as u64 >= DISCONNECT_GRACE_MS / 1000 - 1);
    for &(on, off) in &during {
        assert_eq!((on - 1_500_000) % 1_000_000, 0);
        assert!(off - on <= 500_000);
        assert!(off <= grace_end + 100_000);
    }
}

#[test]
fn reconnect_inside_grace_keeps_the_schedule() {
    init_logging();
    let (_server, mut client) = bootstrap_pair(900_000);
    let before = client.synchronized_time(5_000_000);
    client.on_disconnect(2_000_000);
    client
        .on_reconnect(peer(Role::Server), 2_000_000 + DISCONNECT_GRACE_MS * 500)
        .unwrap();
    assert_eq!(client.status(), SyncStatus::Synced);
    assert_eq!(client.synchronized_time(5_000_000), before);
}

#[test]
fn nominal_run_also_expires_after_peer_loss() {
    init_logging();
    // Peer seen, but no handshake ever completed.
    let mut client = TimeSyncEngine::new(Role::Client);
    client.on_connect(peer(Role::Server), 0);

    let clock = Arc::new(ScriptedClock::starting_at(0));
    let (_inbox, rx) = mpsc::sync_channel::<CoordinationMsg>(8);
    let actuator = RecordingActuator::new(clock.clone());
    let log = actuator.log();
    let mut coordinator = Coordinator::builder(clock.clone(), client.sync_handle().reader(), rx, Box::new(actuator))
        .role(Role::Client)
        .build();

    while clock.now_us() < 20_000_000 {
        coordinator.step();
    }
    // Nominal timing after the pairing bound: windows from 5.5 s on.
    assert_eq!(log.windows()[0], (HANDSHAKE_TIMEOUT_MS * 1000 + 500_000, HANDSHAKE_TIMEOUT_MS * 1000 + 1_000_000));

    let lost_at = clock.now_us();
    client.on_disconnect(lost_at);
    let result = coordinator.run();
    assert!(matches!(result, Err(CoreError::SyncExpired { .. })), "got {:?}", result);

    let stopped = clock.now_us() - lost_at;
    assert!(stopped >= DISCONNECT_GRACE_MS * 1000);
    assert!(stopped <= DISCONNECT_GRACE_MS * 1000 + 100_000);
    assert!(!log.is_on());
    let (_, last_off) = *log.windows().last().unwrap();
    assert!(last_off <= lost_at + DISCONNECT_GRACE_MS * 1000 + 100_000);
}
