//! Wall-clock abstraction
//!
//! Timeouts, breaker cooldowns and health windows read time through a
//! [`Clock`] so tests can drive time by hand with [`ManualClock`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Source of monotonic time in microseconds
pub trait Clock: Send + Sync {
    /// Microseconds since an arbitrary fixed origin
    fn now_micros(&self) -> u64;

    /// Elapsed microseconds since `earlier`
    fn elapsed_since(&self, earlier: u64) -> u64 {
        self.now_micros().saturating_sub(earlier)
    }
}

/// Clock backed by [`Instant`], with the origin at first use
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

fn origin() -> Instant {
    static ORIGIN: OnceLock<Instant> = OnceLock::new();
    *ORIGIN.get_or_init(Instant::now)
}

impl Clock for SystemClock {
    fn now_micros(&self) -> u64 {
        // Offset by one so that zero is never a valid reading
        origin().elapsed().as_micros() as u64 + 1
    }
}

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Create a clock starting at `start` microseconds
    pub fn new(start: u64) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    /// Move time forward
    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_micros() as u64, Ordering::SeqCst);
    }

    /// Move time forward by milliseconds
    pub fn advance_ms(&self, ms: u64) {
        self.advance(Duration::from_millis(ms));
    }

    /// Jump to an absolute time
    pub fn set(&self, micros: u64) {
        self.now.store(micros, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_micros(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
