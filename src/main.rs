// Bilateral Firmware - Entry Point
//
// On target: one node of the pair. The role and peer MAC are baked in at
// build time (BILATERAL_ROLE=server|client, BILATERAL_PEER_MAC=AA:BB:..),
// ESP-NOW carries the sync traffic, LEDC drives the motor.
//
// On the host: both nodes in one process over a lossy loopback link, the
// CLIENT on a skewed crystal. Prints how much the two actuators overlapped.

use std::sync::mpsc;
use std::sync::Arc;

use bilateral::config::*;
use bilateral::events::SyncCommand;
use bilateral::tasks::{motor, time_sync};
use bilateral::{Clock, Coordinator, CoordinationMsg, PeerIdentity, Role, TimeSyncEngine};
use bilateral::tasks::TimeSyncTask;

// ---------------------------------------------------------------------------
// Main (target)
// ---------------------------------------------------------------------------
#[cfg(target_os = "espidf")]
fn main() -> anyhow::Result<()> {
    use std::thread;
    use std::time::Duration;

    use esp_idf_hal::gpio::{OutputPin, PinDriver};
    use esp_idf_hal::ledc::{config::TimerConfig, LedcDriver, LedcTimerDriver};
    use esp_idf_hal::prelude::*;
    use esp_idf_svc::eventloop::EspSystemEventLoop;
    use esp_idf_svc::nvs::EspDefaultNvsPartition;
    use esp_idf_svc::wifi::{BlockingWifi, ClientConfiguration, Configuration, EspWifi};

    use bilateral::drivers::haptic::HapticDriver;
    use bilateral::drivers::status_led::StatusLed;
    use bilateral::drivers::watchdog::TaskWatchdog;
    use bilateral::drivers::Watchdog;
    use bilateral::transport::espnow::EspNowLink;
    use bilateral::SystemClock;

    esp_idf_svc::sys::link_patches();
    esp_idf_svc::log::EspLogger::initialize_default();

    let role = match option_env!("BILATERAL_ROLE") {
        Some(r) if r.eq_ignore_ascii_case("client") => Role::Client,
        _ => Role::Server,
    };
    let peer_mac = option_env!("BILATERAL_PEER_MAC")
        .and_then(parse_mac)
        .unwrap_or(BROADCAST_MAC);
    log::info!("bilateral node starting as {}", role);

    // ---- Peripherals ------------------------------------------------------
    let peripherals = Peripherals::take()?;
    let sysloop = EspSystemEventLoop::take()?;
    let nvs = EspDefaultNvsPartition::take()?;

    // ESP-NOW needs the radio up in STA mode; we never associate.
    let mut wifi = BlockingWifi::wrap(
        EspWifi::new(peripherals.modem, sysloop.clone(), Some(nvs))?,
        sysloop,
    )?;
    wifi.set_configuration(&Configuration::Client(ClientConfiguration::default()))?;
    wifi.start()?;

    // Haptic PWM on PIN_HAPTIC, status LED on PIN_STATUS_LED.
    let timer = LedcTimerDriver::new(
        peripherals.ledc.timer0,
        &TimerConfig::new().frequency(HAPTIC_PWM_HZ.Hz().into()),
    )?;
    let pwm = LedcDriver::new(peripherals.ledc.channel0, timer, peripherals.pins.gpio19)?;
    let led = PinDriver::output(peripherals.pins.gpio15.downgrade_output())?;

    let link = EspNowLink::new(peer_mac)?;

    // ---- Channels ---------------------------------------------------------
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let engine = TimeSyncEngine::new(role);
    let reader = engine.sync_handle().reader();
    let (sync_tx, sync_rx) = mpsc::sync_channel(QUEUE_DEPTH);
    let (coord_tx, coord_rx) = mpsc::sync_channel(QUEUE_DEPTH);

    // ---- Spawn tasks ------------------------------------------------------
    let _sync = time_sync::spawn(TimeSyncTask::new(
        engine,
        link,
        Arc::clone(&clock),
        sync_rx,
        coord_tx.clone(),
    ))?;

    let epoch_tx = sync_tx.clone();
    let builder = Coordinator::builder(clock, reader, coord_rx, Box::new(HapticDriver::new(pwm)))
        .role(role)
        .indicator(Box::new(StatusLed::new(led)))
        .epoch_sink(move |epoch| {
            if epoch_tx.try_send(SyncCommand::PublishEpoch(epoch)).is_err() {
                log::warn!("epoch {} not handed to sync task", epoch.generation);
            }
        });
    let _motor = motor::spawn(builder, || Box::new(TaskWatchdog::subscribe_current()) as Box<dyn Watchdog>)?;

    // ESP-NOW is connectionless: the peer counts as connected from boot.
    sync_tx.send(SyncCommand::PeerConnected(PeerIdentity { address: peer_mac, role: role.peer() }))?;
    coord_tx.send(CoordinationMsg::RoleAssigned(role))?;

    // Keep `wifi` alive; all work happens in the spawned tasks.
    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

#[cfg(target_os = "espidf")]
fn parse_mac(text: &str) -> Option<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut parts = text.split(':');
    for byte in mac.iter_mut() {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    parts.next().is_none().then_some(mac)
}

// ---------------------------------------------------------------------------
// Main (host simulation)
// ---------------------------------------------------------------------------
#[cfg(not(target_os = "espidf"))]
const SIM_CLIENT_OFFSET_US: u64 = 250_000;
#[cfg(not(target_os = "espidf"))]
const SIM_CLIENT_DRIFT_PPM: f64 = 40.0;
#[cfg(not(target_os = "espidf"))]
const SIM_PHASE_SECS: u64 = 10;

#[cfg(not(target_os = "espidf"))]
fn main() -> anyhow::Result<()> {
    use std::thread;
    use std::time::Duration;

    use bilateral::drivers::overlap_us;
    use bilateral::transport::{pair, LinkConfig};
    use bilateral::{clock::SkewedClock, ParamUpdate, SystemClock};

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    log::info!("bilateral host simulation starting");

    let reference: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let client_clock: Arc<dyn Clock> = Arc::new(SkewedClock::new(
        Arc::clone(&reference),
        SIM_CLIENT_OFFSET_US,
        SIM_CLIENT_DRIFT_PPM,
    ));
    let link = LinkConfig { latency_us: 3_000, jitter_us: 2_000, loss: 0.05, ..LinkConfig::default() };
    let (server_link, client_link, _control) = pair(
        link,
        Arc::clone(&reference),
        Arc::clone(&reference),
        Arc::clone(&client_clock),
    );

    let server = sim::Node::start(Role::Server, Arc::clone(&reference), Arc::clone(&reference), server_link)?;
    let client = sim::Node::start(Role::Client, client_clock, Arc::clone(&reference), client_link)?;

    thread::sleep(Duration::from_secs(SIM_PHASE_SECS));
    let slower = ParamUpdate { frequency_hz: 0.5, ..ParamUpdate::default() };
    log::info!("changing parameters: {:?}", slower);
    server.notify(CoordinationMsg::Params(slower));
    client.notify(CoordinationMsg::Params(slower));
    thread::sleep(Duration::from_secs(SIM_PHASE_SECS));

    let server_windows = server.stop()?.windows();
    let client_windows = client.stop()?.windows();
    let overlap = overlap_us(&server_windows, &client_windows);
    log::info!(
        "server windows: {}, client windows: {}, total overlap: {} us",
        server_windows.len(),
        client_windows.len(),
        overlap
    );
    Ok(())
}

#[cfg(not(target_os = "espidf"))]
mod sim {
    use std::sync::mpsc::SyncSender;
    use std::thread::JoinHandle;

    use super::*;
    use bilateral::drivers::{ActuatorLog, NoopWatchdog, RecordingActuator, Watchdog};
    use bilateral::events::offer_default;
    use bilateral::transport::LoopbackEndpoint;
    use bilateral::CoreError;

    /// One simulated node: its sync task and motor task.
    pub struct Node {
        role: Role,
        coordination: SyncSender<CoordinationMsg>,
        commands: SyncSender<SyncCommand>,
        sync: JoinHandle<Result<(), CoreError>>,
        motor: JoinHandle<Result<(), CoreError>>,
        log: ActuatorLog,
    }

    impl Node {
        /// `local` is the node's own crystal; actuator edges are stamped on
        /// `reference` so the two logs are comparable.
        pub fn start(
            role: Role,
            local: Arc<dyn Clock>,
            reference: Arc<dyn Clock>,
            link: LoopbackEndpoint,
        ) -> anyhow::Result<Self> {
            let engine = TimeSyncEngine::new(role);
            let reader = engine.sync_handle().reader();
            let (commands, command_rx) = mpsc::sync_channel(QUEUE_DEPTH);
            let (coordination, coordination_rx) = mpsc::sync_channel(QUEUE_DEPTH);

            let sync = time_sync::spawn(TimeSyncTask::new(
                engine,
                link,
                Arc::clone(&local),
                command_rx,
                coordination.clone(),
            ))?;

            let actuator = RecordingActuator::new(reference);
            let log = actuator.log();
            let epoch_tx = commands.clone();
            let builder = Coordinator::builder(local, reader, coordination_rx, Box::new(actuator))
                .role(role)
                .epoch_sink(move |epoch| {
                    let _ = epoch_tx.try_send(SyncCommand::PublishEpoch(epoch));
                });
            let motor = motor::spawn(builder, || Box::new(NoopWatchdog) as Box<dyn Watchdog>)?;

            commands.send(SyncCommand::PeerConnected(PeerIdentity {
                address: address_of(role.peer()),
                role: role.peer(),
            }))?;
            Ok(Self { role, coordination, commands, sync, motor, log })
        }

        pub fn notify(&self, msg: CoordinationMsg) {
            if offer_default(&self.coordination, msg).is_err() {
                log::warn!("{} inbox full, dropped {:?}", self.role, msg);
            }
        }

        /// Shut both tasks down and hand back the actuator log.
        pub fn stop(self) -> anyhow::Result<ActuatorLog> {
            self.notify(CoordinationMsg::Shutdown);
            let _ = self.commands.send(SyncCommand::Shutdown);
            self.motor
                .join()
                .map_err(|_| anyhow::anyhow!("{} motor task panicked", self.role))??;
            self.sync
                .join()
                .map_err(|_| anyhow::anyhow!("{} sync task panicked", self.role))??;
            Ok(self.log)
        }
    }

    fn address_of(role: Role) -> [u8; 6] {
        match role {
            Role::Server => [0x02, 0, 0, 0, 0, 0x01],
            Role::Client => [0x02, 0, 0, 0, 0, 0x02],
        }
    }
}
