// Bilateral Firmware - Offset / Drift Estimator
//
// Complementary filter: every accepted sample moves the offset a bounded
// fraction of the way toward the measurement, and folds the residual rate
// into the drift estimate. The gain is high for the first samples of a
// session (fast attack) and scaled down when round trips are jittery.

use crate::config::*;
use crate::sync::state::ClockState;

/// Round-trip statistics. The one-way delay estimate is half the mean RTT.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RttStats {
    mean_us: Option<f64>,
    jitter_us: f64,
}

impl RttStats {
    pub fn record(&mut self, round_trip_us: i64) {
        let rtt = round_trip_us.max(0) as f64;
        match self.mean_us {
            None => {
                self.mean_us = Some(rtt);
                self.jitter_us = 0.0;
            }
            Some(mean) => {
                let deviation = (rtt - mean).abs();
                self.mean_us = Some(mean + RTT_EWMA_ALPHA * (rtt - mean));
                self.jitter_us += RTT_EWMA_ALPHA * (deviation - self.jitter_us);
            }
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn mean_us(&self) -> Option<f64> {
        self.mean_us
    }

    pub fn jitter_us(&self) -> f64 {
        self.jitter_us
    }

    pub fn one_way_delay_us(&self) -> i64 {
        match self.mean_us {
            Some(mean) => (mean / 2.0).round() as i64,
            None => DEFAULT_ONE_WAY_DELAY_US,
        }
    }

    /// `1 / (1 + jitter / RTT_JITTER_REF_US)`, clamped to `[MIN_STABILITY_WEIGHT, 1]`.
    pub fn stability(&self) -> f64 {
        (1.0 / (1.0 + self.jitter_us / RTT_JITTER_REF_US)).clamp(MIN_STABILITY_WEIGHT, 1.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OffsetFilter {
    accepted: u32,
}

impl OffsetFilter {
    pub fn reset(&mut self) {
        self.accepted = 0;
    }

    pub fn accepted(&self) -> u32 {
        self.accepted
    }

    pub fn in_fast_attack(&self) -> bool {
        self.accepted < FAST_ATTACK_SAMPLES
    }

    /// Plausibility bound for a discrepancy measured `elapsed_us` after the
    /// last anchor: outlier threshold plus what two crystals can drift apart.
    pub fn plausibility_limit_us(&self, elapsed_us: u64) -> i64 {
        let threshold = if self.in_fast_attack() {
            OUTLIER_THRESHOLD_FAST_US
        } else {
            OUTLIER_THRESHOLD_US
        };
        let allowance = 2.0 * CRYSTAL_DRIFT_PPM * elapsed_us as f64 / 1e6;
        threshold + allowance as i64
    }

    pub fn gain(&self, stability: f64) -> f64 {
        let base = if self.in_fast_attack() { FILTER_ALPHA_FAST } else { FILTER_ALPHA_SLOW };
        base * stability
    }

    /// Fold one sample into `state`. `discrepancy_us` is measured minus
    /// predicted offset at `local_us`. Returns the offset step applied.
    pub fn update(
        &mut self,
        state: &mut ClockState,
        discrepancy_us: i64,
        local_us: u64,
        stability: f64,
    ) -> i64 {
        let gain = self.gain(stability);
        let elapsed_us = local_us.saturating_sub(state.last_update_us);

        let step = ((discrepancy_us as f64 * gain).round() as i64)
            .clamp(-MAX_OFFSET_STEP_US, MAX_OFFSET_STEP_US);
        // The discrepancy was measured against the old drift.
        let predicted = state.offset_at(local_us);

        // Drift only learns over spans long enough for the rate to mean something.
        if elapsed_us >= 100_000 {
            let residual_ppm = discrepancy_us as f64 / elapsed_us as f64 * 1e6;
            let term = (DRIFT_GAIN * stability * residual_ppm).clamp(-MAX_DRIFT_PPM, MAX_DRIFT_PPM);
            state.drift_ppm = (state.drift_ppm + term).clamp(-MAX_DRIFT_PPM, MAX_DRIFT_PPM);
        }

        state.offset_us = predicted + step;
        state.last_update_us = local_us;
        self.accepted = self.accepted.saturating_add(1);
        step
    }
}
