//! Time source for last-access bookkeeping.
//!
//! Access times are stored as file-time ticks (100 ns units since the Unix
//! epoch) so they compare directly with serialized directory snapshots. The
//! trait exists so tests can drive time manually.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;

/// A source of "now" in file-time ticks.
pub trait Clock: Send + Sync + 'static {
    /// Current UTC time in 100 ns ticks since the Unix epoch.
    fn now_ticks(&self) -> i64;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ticks(&self) -> i64 {
        Utc::now().timestamp_micros() * 10
    }
}

/// A manually advanced clock for tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    ticks: AtomicI64,
}

impl ManualClock {
    /// Creates a clock starting at the given tick.
    pub fn new(start: i64) -> Self {
        Self {
            ticks: AtomicI64::new(start),
        }
    }

    /// Advances the clock by `delta` ticks.
    pub fn advance(&self, delta: i64) {
        self.ticks.fetch_add(delta, Ordering::SeqCst);
    }

    /// Sets the clock to an absolute tick.
    pub fn set(&self, ticks: i64) {
        self.ticks.store(ticks, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ticks(&self) -> i64 {
        self.ticks.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_monotone_enough() {
        let clock = SystemClock;
        let a = clock.now_ticks();
        let b = clock.now_ticks();
        assert!(b >= a);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(100);
        assert_eq!(clock.now_ticks(), 100);
        clock.advance(5);
        assert_eq!(clock.now_ticks(), 105);
        clock.set(1);
        assert_eq!(clock.now_ticks(), 1);
    }
}
