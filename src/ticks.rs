//! Monotonic tick counting for packet and timestamp expiry.
use std::sync::atomic::{AtomicU64, Ordering};

use nix::time::{clock_gettime, ClockId};

/// Source of a monotonically increasing tick count.
pub trait TickSource: Send + Sync {
    fn now(&self) -> u64;
}

/// Whether `deadline` has been reached at tick `now`.
pub fn reached(now: u64, deadline: u64) -> bool {
    now >= deadline
}

/// Ticks of `CLOCK_MONOTONIC` at a fixed rate.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicTicks {
    hz: u32,
}

impl MonotonicTicks {
    pub fn new(hz: u32) -> Self {
        Self { hz: hz.max(1) }
    }
}

impl TickSource for MonotonicTicks {
    fn now(&self) -> u64 {
        // a failed read counts as tick zero
        let Ok(ts) = clock_gettime(ClockId::CLOCK_MONOTONIC) else {
            return 0;
        };
        let hz = u64::from(self.hz);
        ts.tv_sec() as u64 * hz + ts.tv_nsec() as u64 * hz / 1_000_000_000
    }
}

/// Tick source advanced by hand.
#[derive(Debug, Default)]
pub struct ManualTicks(AtomicU64);

impl ManualTicks {
    pub fn new(start: u64) -> Self {
        Self(AtomicU64::new(start))
    }

    pub fn advance(&self, ticks: u64) {
        self.0.fetch_add(ticks, Ordering::SeqCst);
    }
}

impl TickSource for ManualTicks {
    fn now(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_does_not_go_backwards() {
        let ticks = MonotonicTicks::new(1000);
        let a = ticks.now();
        let b = ticks.now();
        assert!(b >= a);
        assert_ne!(a, 0);
    }

    #[test]
    fn manual_ticks() {
        let ticks = ManualTicks::new(10);
        ticks.advance(3);
        assert_eq!(ticks.now(), 13);
        assert!(reached(ticks.now(), 13));
        assert!(!reached(ticks.now(), 14));
    }
}
