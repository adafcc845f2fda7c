//! Millisecond wall clock with an injectable implementation.
//!
//! The acquisition loop and the simulated data logger both measure time in
//! milliseconds since the Unix epoch and suspend through [`Clock::sleep`].
//! [`SystemClock`] uses the real clock; [`ManualClock`] advances only when
//! slept on, which lets multi-second acquisition blocks run instantly in tests.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Source of wall-clock time and cooperative sleeps.
pub trait Clock {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> i64;

    /// Suspend the calling thread for `duration`.
    fn sleep(&self, duration: Duration);
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn current_epoch_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// The real system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        current_epoch_millis()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// A clock that only moves when slept on or explicitly advanced.
///
/// Clones share the same underlying time, so a test can hand one clone to the
/// simulated device and another to the acquisition loop.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now_us: Arc<AtomicI64>,
}

impl ManualClock {
    /// Create a clock reading `start_ms`.
    pub fn new(start_ms: i64) -> Self {
        Self {
            now_us: Arc::new(AtomicI64::new(start_ms * 1000)),
        }
    }

    /// Move the clock forward by `duration`.
    pub fn advance(&self, duration: Duration) {
        self.now_us
            .fetch_add(duration.as_micros() as i64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_us.load(Ordering::SeqCst) / 1000
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now_ms(&self) -> i64 {
        (**self).now_ms()
    }

    fn sleep(&self, duration: Duration) {
        (**self).sleep(duration)
    }
}
