// Bilateral Firmware - Motor Parameters & Epoch
//
// A `ParamUpdate` is what the configuration surface sends; `MotorParams` is
// the validated millisecond schedule derived from it. `MotorEpoch` is the
// SERVER's published anchor that both nodes align their windows to.

use crate::config::*;
use crate::error::ParamError;

// ---------------------------------------------------------------------------
// Requested parameters (as received)
// ---------------------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamUpdate {
    pub frequency_hz: f64,
    pub duty_cycle: f64,
    pub intensity_pct: u8,
}

impl Default for ParamUpdate {
    fn default() -> Self {
        Self {
            frequency_hz: DEFAULT_FREQUENCY_HZ,
            duty_cycle: DEFAULT_DUTY_CYCLE,
            intensity_pct: DEFAULT_INTENSITY_PCT,
        }
    }
}

// ---------------------------------------------------------------------------
// Validated schedule
// ---------------------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotorParams {
    pub period_ms: u32,
    pub active_ms: u32,
    pub inactive_ms: u32,
    pub intensity_pct: u8,
}

impl MotorParams {
    /// Validate an update. The active window is capped at half the period so
    /// the two nodes' windows can never overlap.
    pub fn from_update(update: &ParamUpdate) -> Result<Self, ParamError> {
        let ParamUpdate { frequency_hz, duty_cycle, intensity_pct } = *update;

        if !frequency_hz.is_finite() || frequency_hz <= 0.0 {
            return Err(ParamError::NonPositivePeriod(frequency_hz));
        }
        let period = (1000.0 / frequency_hz).round();
        if period < 1.0 || period > MAX_PERIOD_MS as f64 {
            return Err(ParamError::NonPositivePeriod(frequency_hz));
        }
        if !duty_cycle.is_finite() || duty_cycle <= 0.0 || duty_cycle >= 1.0 {
            return Err(ParamError::DutyOutOfRange(duty_cycle));
        }
        if intensity_pct > 100 {
            return Err(ParamError::IntensityOutOfRange(intensity_pct));
        }

        let period_ms = period as u32;
        let active_ms = ((period * duty_cycle).round() as u32).min(period_ms / 2);
        if active_ms == 0 {
            return Err(ParamError::EmptyWindow { period_ms, active_ms });
        }

        Ok(Self {
            period_ms,
            active_ms,
            inactive_ms: period_ms - active_ms,
            intensity_pct,
        })
    }

    pub fn period_us(&self) -> u64 {
        self.period_ms as u64 * 1000
    }

    pub fn active_us(&self) -> u64 {
        self.active_ms as u64 * 1000
    }

    /// The CLIENT runs this far behind the SERVER, in microseconds.
    pub fn half_period_us(&self) -> u64 {
        self.period_us() / 2
    }
}

impl Default for MotorParams {
    fn default() -> Self {
        // 1 Hz, 50 % duty, 75 % intensity: 500 ms on, 500 ms off.
        Self {
            period_ms: 1000,
            active_ms: 500,
            inactive_ms: 500,
            intensity_pct: DEFAULT_INTENSITY_PCT,
        }
    }
}

// ---------------------------------------------------------------------------
// Motor epoch (SERVER-owned anchor in synchronized time)
// ---------------------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotorEpoch {
    /// Synchronized time of a SERVER ACTIVE start.
    pub epoch_us: u64,
    pub period_ms: u32,
    pub active_ms: u32,
    /// Bumped on every republish so the CLIENT can tell epochs apart.
    pub generation: u8,
}

impl MotorEpoch {
    pub fn new(epoch_us: u64, params: &MotorParams, generation: u8) -> Self {
        Self {
            epoch_us,
            period_ms: params.period_ms,
            active_ms: params.active_ms,
            generation,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.period_ms > 0 && self.active_ms > 0 && self.active_ms < self.period_ms
    }

    /// Whether this epoch describes the same schedule as `params`.
    pub fn matches(&self, params: &MotorParams) -> bool {
        self.period_ms == params.period_ms && self.active_ms == params.active_ms
    }

    pub fn period_us(&self) -> u64 {
        self.period_ms as u64 * 1000
    }

    /// Earliest instant `>= at_us` of the form `epoch + phase + k * period`,
    /// for any integer `k`.
    pub fn next_aligned(&self, at_us: u64, phase_us: u64) -> u64 {
        let period = self.period_us() as i128;
        if period == 0 {
            return at_us;
        }
        let base = self.epoch_us as i128 + phase_us as i128;
        let diff = at_us as i128 - base;
        let mut k = diff.div_euclid(period);
        if diff.rem_euclid(period) != 0 {
            k += 1;
        }
        (base + k * period).max(0) as u64
    }
}
