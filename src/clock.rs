// Bilateral Firmware - Local Monotonic Clock
//
// Everything that reads "now" or sleeps goes through `Clock`, so the
// coordination loop can run against virtual time in tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub trait Clock: Send + Sync {
    /// Microseconds since an arbitrary, fixed origin. Never goes backwards.
    fn now_us(&self) -> u64;

    /// Block the calling thread for `duration`.
    fn sleep(&self, duration: Duration);
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now_us(&self) -> u64 {
        (**self).now_us()
    }

    fn sleep(&self, duration: Duration) {
        (**self).sleep(duration)
    }
}

// ---------------------------------------------------------------------------
// SystemClock: esp_timer on target, Instant on host
// ---------------------------------------------------------------------------
#[derive(Debug, Clone)]
pub struct SystemClock {
    #[cfg(not(target_os = "espidf"))]
    origin: std::time::Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            #[cfg(not(target_os = "espidf"))]
            origin: std::time::Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    #[cfg(target_os = "espidf")]
    fn now_us(&self) -> u64 {
        // esp_timer counts from boot and is monotonic.
        unsafe { esp_idf_sys::esp_timer_get_time() as u64 }
    }

    #[cfg(not(target_os = "espidf"))]
    fn now_us(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

// ---------------------------------------------------------------------------
// SkewedClock: a crystal that runs fast or slow relative to its inner clock
// ---------------------------------------------------------------------------

/// Wraps another clock with a fixed start offset and a rate error in ppm.
/// Used by the host simulation to give the two nodes independent timebases.
pub struct SkewedClock<C> {
    inner: C,
    offset_us: u64,
    drift_ppm: f64,
}

impl<C: Clock> SkewedClock<C> {
    pub fn new(inner: C, offset_us: u64, drift_ppm: f64) -> Self {
        Self { inner, offset_us, drift_ppm }
    }
}

impl<C: Clock> Clock for SkewedClock<C> {
    fn now_us(&self) -> u64 {
        let base = self.inner.now_us();
        let skew = (base as f64 * self.drift_ppm / 1e6) as i64;
        (base as i64 + skew).max(0) as u64 + self.offset_us
    }

    fn sleep(&self, duration: Duration) {
        self.inner.sleep(duration);
    }
}

// ---------------------------------------------------------------------------
// ManualClock: virtual time, sleeping advances it
// ---------------------------------------------------------------------------

/// Deterministic clock for tests. `sleep` returns immediately after moving
/// virtual time forward by the requested duration.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    pub fn starting_at(now_us: u64) -> Self {
        Self { now: AtomicU64::new(now_us) }
    }

    pub fn advance(&self, duration: Duration) {
        self.now.fetch_add(duration.as_micros() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, now_us: u64) {
        self.now.fetch_max(now_us, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_us(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_sleep_advances_virtual_time() {
        let clock = ManualClock::starting_at(1_000);
        clock.sleep(Duration::from_millis(20));
        assert_eq!(clock.now_us(), 21_000);
    }

    #[test]
    fn manual_clock_set_never_goes_backwards() {
        let clock = ManualClock::starting_at(5_000);
        clock.set(1_000);
        assert_eq!(clock.now_us(), 5_000);
        clock.set(9_000);
        assert_eq!(clock.now_us(), 9_000);
    }

    #[test]
    fn skewed_clock_applies_offset_and_rate() {
        let inner = Arc::new(ManualClock::starting_at(1_000_000));
        let skewed = SkewedClock::new(Arc::clone(&inner), 250_000, 100.0);
        // 1 s at +100 ppm gains 100 us.
        assert_eq!(skewed.now_us(), 1_000_000 + 100 + 250_000);
        skewed.sleep(Duration::from_secs(1));
        assert_eq!(inner.now_us(), 2_000_000);
    }
}
