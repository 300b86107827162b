//! Monotonic microsecond clock.
//!
//! Wraps `quanta` for a high-precision monotonic source (TSC-backed on
//! x86) and exposes a single `now_us()` entry point, plus a deterministic
//! [`TestClock`] used only by tests. `Clock` is a trait so the timer
//! wheel can be driven by either implementation without knowing which one
//! it has.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonic microsecond time source.
pub trait Clock: fmt::Debug + Send + Sync {
    /// Current time in microseconds, monotonic for the lifetime of the clock.
    fn now_us(&self) -> u64;
}

/// Real wall-clock implementation backed by `quanta`.
///
/// Monotonic clocks never go backwards in practice, but a defensive
/// high-water mark is kept anyway: any observed decrease is treated as a
/// zero delta rather than propagated, per the source design.
pub struct SystemClock {
    inner: quanta::Clock,
    epoch: quanta::Instant,
    high_water: AtomicU64,
}

impl SystemClock {
    pub fn new() -> Self {
        let inner = quanta::Clock::new();
        let epoch = inner.now();
        Self {
            inner,
            epoch,
            high_water: AtomicU64::new(0),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SystemClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemClock").finish_non_exhaustive()
    }
}

impl Clock for SystemClock {
    fn now_us(&self) -> u64 {
        let elapsed = self.inner.now().duration_since(self.epoch).as_micros() as u64;
        let mut prev = self.high_water.load(Ordering::Relaxed);
        loop {
            if elapsed <= prev {
                return prev;
            }
            match self.high_water.compare_exchange_weak(
                prev,
                elapsed,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return elapsed,
                Err(actual) => prev = actual,
            }
        }
    }
}

/// Deterministic clock for tests: time only moves when [`TestClock::advance`]
/// is called.
#[derive(Debug, Default)]
pub struct TestClock {
    us: AtomicU64,
}

impl TestClock {
    pub fn new() -> Self {
        Self {
            us: AtomicU64::new(0),
        }
    }

    /// Moves time forward by `delta_us` and returns the new value.
    pub fn advance(&self, delta_us: u64) -> u64 {
        self.us.fetch_add(delta_us, Ordering::SeqCst) + delta_us
    }

    pub fn set(&self, us: u64) {
        self.us.store(us, Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn now_us(&self) -> u64 {
        self.us.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let mut prev = clock.now_us();
        for _ in 0..1000 {
            let now = clock.now_us();
            assert!(now >= prev);
            prev = now;
        }
    }

    #[test]
    fn test_clock_only_moves_on_advance() {
        let clock = TestClock::new();
        assert_eq!(clock.now_us(), 0);
        assert_eq!(clock.advance(100), 100);
        assert_eq!(clock.now_us(), 100);
        assert_eq!(clock.now_us(), 100);
    }
}
