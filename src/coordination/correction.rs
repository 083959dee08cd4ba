// Bilateral Firmware - CLIENT Drift Correction
//
// Once per INACTIVE interval the CLIENT compares its scheduled ACTIVE start
// with the epoch-derived target and nudges the schedule by a bounded amount.
// Bounds scale with the inactive interval so slow modes can catch up in
// fewer cycles while fast modes stay smooth.

use crate::config::*;
use crate::params::MotorEpoch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorrectionBounds {
    pub max_us: i64,
    pub deadband_us: i64,
}

impl CorrectionBounds {
    /// max = max(50 ms, 20 % of inactive), deadband = max(25 ms, 10 % of inactive).
    pub fn for_inactive(inactive_ms: u32) -> Self {
        let max_ms = (inactive_ms * CORRECTION_MAX_PCT / 100).max(CORRECTION_MAX_FLOOR_MS);
        let deadband_ms =
            (inactive_ms * CORRECTION_DEADBAND_PCT / 100).max(CORRECTION_DEADBAND_FLOOR_MS);
        Self {
            max_us: max_ms as i64 * 1000,
            deadband_us: deadband_ms as i64 * 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// First INACTIVE after a parameter change runs on nominal timing.
    ParameterChange,
    NoEpoch,
    /// Parameters changed and the SERVER has not published a matching epoch yet.
    AwaitingFreshEpoch,
    LowQuality(u8),
    /// Clock not synchronized (or expired).
    ClockUnusable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrectionOutcome {
    Applied { error_us: i64, applied_us: i64 },
    WithinDeadband { error_us: i64 },
    Skipped(SkipReason),
}

impl CorrectionOutcome {
    pub fn applied_us(&self) -> i64 {
        match self {
            Self::Applied { applied_us, .. } => *applied_us,
            _ => 0,
        }
    }
}

/// Wrap a delta into `(-period/2, period/2]`.
pub fn wrap_half_period(delta_us: i64, period_us: i64) -> i64 {
    if period_us <= 0 {
        return delta_us;
    }
    let r = delta_us.rem_euclid(period_us);
    if r > period_us / 2 {
        r - period_us
    } else {
        r
    }
}

/// Signed distance from `scheduled_us` to the nearest CLIENT ACTIVE start
/// (`epoch + period/2 + k * period`).
pub fn schedule_error_us(epoch: &MotorEpoch, scheduled_us: u64) -> i64 {
    let period_us = epoch.period_us() as i64;
    let target = epoch.epoch_us as i64 + period_us / 2;
    wrap_half_period(target - scheduled_us as i64, period_us)
}

/// Bounded correction for `error_us`.
pub fn correct(error_us: i64, bounds: CorrectionBounds) -> CorrectionOutcome {
    if error_us.abs() <= bounds.deadband_us {
        return CorrectionOutcome::WithinDeadband { error_us };
    }
    CorrectionOutcome::Applied {
        error_us,
        applied_us: error_us.clamp(-bounds.max_us, bounds.max_us),
    }
}
