use std::time::Duration;

/// One jiffy: the minimum yield-sleep unit of the leveled waiter.
pub const JIFFY: Duration = Duration::from_millis(1);

const PROC_YIELD_CYCLES: u32 = 16;

#[inline(always)]
fn procyield() {
    for _ in 0..PROC_YIELD_CYCLES {
        std::hint::spin_loop();
    }
}

/// A lightweight synchronization type for very short waits.
///
/// The zero value is ready to use: the first few spins are hardware pauses,
/// after which every spin yields to the scheduler.
#[derive(Debug, Default)]
pub struct SpinWait {
    i: u32,
}

impl SpinWait {
    pub fn new() -> Self {
        Self::default()
    }

    /// Performs a single spin.
    pub fn once(&mut self) {
        self.i = self.i.wrapping_add(1);
        if self.will_yield() {
            std::thread::yield_now();
            return;
        }
        procyield();
    }

    /// Returns true if the next [`once`](SpinWait::once) will yield to the
    /// scheduler instead of emitting a hardware pause.
    pub fn will_yield(&self) -> bool {
        self.i >= 8
    }

    pub fn reset(&mut self) {
        self.i = 0;
    }
}

/// Caller role, ordered from most to least latency-sensitive. The level
/// dilates the interval between scheduler yields exponentially.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    /// End-client waits; yields (sleeps) every iteration.
    Client = 0,
    /// Long blocking-I/O polls; yields become jiffy sleeps.
    BlockingIo = 1,
    /// Consumer back-off against a producer counterpart.
    Consume = 2,
    /// Producer back-off against a consumer counterpart.
    Produce = 3,
    /// Atomic CAS retry loops; almost never yields.
    Atomic = 4,
}

/// Multi-level adaptive waiter used by every concurrent primitive and
/// busy-wait loop in the crate.
///
/// Each [`once`](SpinWaiter::once) either emits a short hardware pause, an
/// OS-scheduler yield, or a one-jiffy sleep, according to the level and an
/// internal iteration counter. The longer a waiter has been yielding, the
/// shorter its yield interval becomes.
#[derive(Debug)]
pub struct SpinWaiter {
    i: u32,
    level: Level,
    limit: u32,
    total: i32,
}

impl SpinWaiter {
    pub fn new() -> Self {
        Self {
            i: 0,
            level: Level::BlockingIo,
            limit: 0,
            total: 0,
        }
    }

    #[must_use]
    pub fn level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    /// Caps the number of iterations after which [`closed`](Self::closed)
    /// reports true. A limit of zero never closes.
    #[must_use]
    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = limit.min(u32::MAX - 1);
        self
    }

    pub fn once(&mut self) {
        self.once_at(self.level);
    }

    pub fn once_with_level(&mut self, level: Level) {
        self.once_at(level);
    }

    pub fn will_yield(&self) -> bool {
        self.will_yield_at(self.level)
    }

    pub fn reset(&mut self) {
        self.i = 0;
        self.total = 0;
    }

    pub fn closed(&self) -> bool {
        self.limit > 0 && self.i >= self.limit
    }

    fn will_yield_at(&self, level: Level) -> bool {
        let x = (level as i32) << 1;
        let shift = x - x.min(self.total >> 1);
        self.i & ((1u32 << shift) - 1) == 0
    }

    fn once_at(&mut self, level: Level) {
        self.i = self.i.wrapping_add(1);
        if !self.will_yield_at(level) {
            procyield();
            return;
        }
        self.total += 1;
        if level <= Level::BlockingIo {
            std::thread::sleep(JIFFY);
        } else {
            std::thread::yield_now();
        }
    }
}

impl Default for SpinWaiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_spin_wait_yield_threshold() {
        let mut sw = SpinWait::new();
        for _ in 0..8 {
            assert!(!sw.will_yield());
            sw.once();
        }
        assert!(sw.will_yield());
        sw.reset();
        assert!(!sw.will_yield());
    }

    #[rstest]
    #[case::one(1)]
    #[case::eight(8)]
    #[case::many(1000)]
    fn test_waiter_closes_after_limit(#[case] limit: u32) {
        let mut sw = SpinWaiter::new().level(Level::Atomic).limit(limit);
        for _ in 0..limit {
            assert!(!sw.closed());
            sw.once();
        }
        assert!(sw.closed());
    }

    #[test]
    fn test_waiter_without_limit_never_closes() {
        let mut sw = SpinWaiter::new().level(Level::Atomic);
        for _ in 0..100 {
            sw.once();
        }
        assert!(!sw.closed());
    }

    #[test]
    fn test_client_level_always_yields() {
        let sw = SpinWaiter::new().level(Level::Client);
        // x = 0, so the mask is empty and every iteration yields.
        for _ in 0..16 {
            assert!(sw.will_yield());
        }
    }

    #[test]
    fn test_higher_levels_dilate_yield_interval() {
        // At level Atomic (x = 8) with no accumulated yields, only every
        // 256th iteration yields.
        let mut sw = SpinWaiter::new().level(Level::Atomic);
        let mut yields = 0;
        for _ in 0..512 {
            if sw.will_yield() {
                yields += 1;
            }
            sw.i = sw.i.wrapping_add(1);
        }
        assert_eq!(yields, 2);
    }

    #[test]
    fn test_yield_interval_shortens_with_total() {
        let mut sw = SpinWaiter::new().level(Level::Atomic);
        // Simulate a long wait: the accumulated total halves the exponent.
        sw.total = 16;
        assert!(sw.will_yield_at(Level::Atomic));
        sw.i = 1;
        // shift = 8 - min(8, 8) = 0, mask empty: every iteration yields now.
        assert!(sw.will_yield_at(Level::Atomic));
    }

    #[test]
    fn test_reset_clears_counters() {
        let mut sw = SpinWaiter::new().level(Level::Produce).limit(4);
        for _ in 0..4 {
            sw.once();
        }
        assert!(sw.closed());
        sw.reset();
        assert!(!sw.closed());
    }
}
