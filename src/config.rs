// Bilateral Firmware - Timing & Synchronization Configuration
// Target: ESP32-C6 pair (RISC-V), one actuator per node

// ---------------------------------------------------------------------------
// GPIO Pin Definitions (only used by the on-target drivers)
// ---------------------------------------------------------------------------
pub const PIN_HAPTIC: i32 = 19;     // H-bridge IN (LEDC PWM output)
pub const PIN_STATUS_LED: i32 = 15; // On-board status LED (active HIGH)
pub const HAPTIC_PWM_HZ: u32 = 20_000;  // Above audible range for the ERM

// ---------------------------------------------------------------------------
// Peer Link
// ---------------------------------------------------------------------------
pub const BROADCAST_MAC: [u8; 6] = [0xFF; 6]; // Accept any sender until a peer MAC is flashed

// ---------------------------------------------------------------------------
// Task Stack Sizes (bytes)
// ---------------------------------------------------------------------------
pub const STACK_MOTOR: usize = 4096;
pub const STACK_TIME_SYNC: usize = 4096;

// ---------------------------------------------------------------------------
// Bounded waits & channels
// ---------------------------------------------------------------------------
pub const CHECKPOINT_MS: u64 = 20;             // Max sleep between inbox/watchdog checks
pub const IDLE_WAIT_MS: u64 = 250;             // CHECK_MESSAGES wait while no role is assigned
pub const QUEUE_DEPTH: usize = 8;              // Every inter-task channel is bounded
pub const QUEUE_SEND_TIMEOUT_MS: u64 = 100;    // Producer-side send timeout (best effort)
pub const QUEUE_SEND_RETRY_MS: u64 = 5;
pub const TIME_SYNC_POLL_MS: u64 = 10;         // Sync task transport poll interval

// ---------------------------------------------------------------------------
// Handshake (four-timestamp exchange)
// ---------------------------------------------------------------------------
pub const HANDSHAKE_TIMEOUT_MS: u64 = 5_000;            // Per attempt, and the PAIRING_WAIT bound
pub const HANDSHAKE_MAX_ATTEMPTS: u8 = 3;               // Back-to-back attempts before slowing down
pub const HANDSHAKE_RETRY_INTERVAL_MS: u64 = 10_000;    // Retry cadence once attempts are exhausted
pub const HANDSHAKE_MAX_RTT_US: i64 = 10_000_000;       // Reject exchanges with RTT < 0 or > 10 s
pub const HANDSHAKE_MAX_OFFSET_US: i64 = 50_000_000_000; // Reject absurd offsets (> ~14 h)

// ---------------------------------------------------------------------------
// Beacons
// ---------------------------------------------------------------------------
pub const BEACON_INTERVAL_MIN_MS: u32 = 1_000;     // Fast cadence after (re)start
pub const BEACON_INTERVAL_MAX_MS: u32 = 60_000;    // Steady-state cadence
pub const BEACON_BACKOFF_AFTER: u32 = 3;           // Beacons per cadence step before doubling
pub const BEACON_REQUEST_MAX_MS: u32 = 2_000;      // CLIENT request cadence when quality is poor
pub const BEACON_REQUEST_MIN_MS: u32 = 250;        // Fastest request cadence during a miss burst
pub const REFRESH_EVERY_BEACONS: u32 = 6;          // Two-way RTT refresh every Nth beacon
pub const MISS_FACTOR_PCT: u64 = 150;              // Beacon overdue after 150% of the announced interval
pub const MAX_STRATUM: u8 = 15;                    // Beacons at or above this stratum are unusable

// ---------------------------------------------------------------------------
// Offset / drift estimator (complementary filter)
// ---------------------------------------------------------------------------
pub const FILTER_ALPHA_FAST: f64 = 0.30;           // Offset gain for the first samples
pub const FILTER_ALPHA_SLOW: f64 = 0.10;           // Offset gain once converged
pub const FAST_ATTACK_SAMPLES: u32 = 12;
pub const DRIFT_GAIN: f64 = 0.05;                  // Fraction of residual rate folded into drift
pub const MAX_DRIFT_PPM: f64 = 100.0;              // Two ±10 ppm crystals with generous margin
pub const CRYSTAL_DRIFT_PPM: f64 = 10.0;           // ESP32-C6 datasheet
pub const MAX_OFFSET_STEP_US: i64 = 10_000;        // Largest single beacon correction
pub const OUTLIER_THRESHOLD_US: i64 = 100_000;     // Steady-state plausibility bound
pub const OUTLIER_THRESHOLD_FAST_US: i64 = 50_000; // Tighter bound during fast attack
pub const RTT_JITTER_REF_US: f64 = 10_000.0;       // Jitter at which beacon weight halves
pub const MIN_STABILITY_WEIGHT: f64 = 0.25;
pub const RTT_EWMA_ALPHA: f64 = 0.25;
pub const DEFAULT_ONE_WAY_DELAY_US: i64 = 10_000;  // Used until an RTT has been measured
pub const REJECT_RESYNC_COUNT: u32 = 5;            // Consecutive implausible beacons before resync

// ---------------------------------------------------------------------------
// Quality (0-100)
// ---------------------------------------------------------------------------
pub const QUALITY_EXCELLENT: u8 = 95;    // Prediction error < 1 ms
pub const QUALITY_GOOD: u8 = 75;         // < 5 ms
pub const QUALITY_FAIR: u8 = 50;         // < 15 ms
pub const QUALITY_POOR: u8 = 25;         // < 30 ms
pub const QUALITY_RECOVERY_STEP: u8 = 50;
pub const MISS_BURST: u32 = 3;           // Consecutive misses that force quality to 0
pub const MIN_CORRECTION_QUALITY: u8 = QUALITY_POOR;

// ---------------------------------------------------------------------------
// Drift correction (CLIENT, per INACTIVE interval)
// ---------------------------------------------------------------------------
pub const CORRECTION_MAX_FLOOR_MS: u32 = 50;
pub const CORRECTION_MAX_PCT: u32 = 20;
pub const CORRECTION_DEADBAND_FLOOR_MS: u32 = 25;
pub const CORRECTION_DEADBAND_PCT: u32 = 10;
pub const ACTIVE_START_TOLERANCE_US: u64 = 1_000; // CHECK_MESSAGES starts ACTIVE this close to target

// ---------------------------------------------------------------------------
// Disconnect handling
// ---------------------------------------------------------------------------
pub const DISCONNECT_GRACE_MS: u64 = 120_000;   // Frozen-clock continuation window
pub const TRANSPORT_FAILURE_LIMIT: u32 = 20;    // Consecutive failures before surfacing

// ---------------------------------------------------------------------------
// Motor parameters
// ---------------------------------------------------------------------------
pub const DEFAULT_FREQUENCY_HZ: f64 = 1.0;
pub const DEFAULT_DUTY_CYCLE: f64 = 0.5;
pub const DEFAULT_INTENSITY_PCT: u8 = 75;
pub const MAX_PERIOD_MS: u32 = 60_000;          // Anything slower is treated as a bad frequency
