//! Monotonic time source for acquisition timestamps

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use nix::time::{clock_gettime, ClockId};

use crate::error::{CaptureError, Result};

/// Microsecond clock in the same domain as producer frame timestamps
pub trait Clock {
    fn now_us(&self) -> Result<u64>;
}

/// CLOCK_MONOTONIC
#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now_us(&self) -> Result<u64> {
        let ts = clock_gettime(ClockId::CLOCK_MONOTONIC).map_err(CaptureError::Clock)?;
        Ok(ts.tv_sec() as u64 * 1_000_000 + ts.tv_nsec() as u64 / 1_000)
    }
}

/// Settable clock shared between a test producer and the session
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_us: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start_us)),
        }
    }

    pub fn set(&self, now_us: u64) {
        self.now.store(now_us, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_us: u64) {
        self.now.fetch_add(delta_us, Ordering::SeqCst);
    }

    pub fn get(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

impl Clock for ManualClock {
    fn now_us(&self) -> Result<u64> {
        Ok(self.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_clock_does_not_go_backwards() {
        let clock = MonotonicClock;
        let a = clock.now_us().unwrap();
        let b = clock.now_us().unwrap();
        assert!(b >= a);
    }

    #[test]
    fn manual_clock_clones_share_time() {
        let clock = ManualClock::new(1_000);
        let view = clock.clone();
        clock.advance(500);
        assert_eq!(view.now_us().unwrap(), 1_500);
    }
}
