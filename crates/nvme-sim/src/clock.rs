use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use nvme_host::Clock;

/// Virtual time. Sleeping advances the clock instantly.
///
/// With a non-zero tick every [`Clock::now`] call also advances time, which
/// lets busy-wait loops that never sleep reach their deadline.
#[derive(Debug, Default)]
pub struct SimClock {
    nanos: AtomicU64,
    tick: AtomicU64,
    sleeps: AtomicU64,
}

impl SimClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        self.nanos.fetch_add(by.as_nanos() as u64, Ordering::AcqRel);
    }

    pub fn set_tick(&self, tick: Duration) {
        self.tick.store(tick.as_nanos() as u64, Ordering::Release);
    }

    /// Calls to [`Clock::sleep`] so far.
    pub fn sleeps(&self) -> u64 {
        self.sleeps.load(Ordering::Acquire)
    }
}

impl Clock for SimClock {
    fn now(&self) -> Duration {
        let tick = self.tick.load(Ordering::Acquire);
        Duration::from_nanos(self.nanos.fetch_add(tick, Ordering::AcqRel) + tick)
    }

    fn sleep(&self, duration: Duration) {
        self.sleeps.fetch_add(1, Ordering::AcqRel);
        self.advance(duration);
    }
}
