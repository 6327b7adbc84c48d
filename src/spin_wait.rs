//! Bounded spinning for sub-microsecond waits.

/// Counter-based spinner used where the awaited condition is known to
/// resolve within a few instructions, e.g. the window between a task being
/// published for stealing and its registers being fully saved.
#[derive(Debug, Default)]
pub(crate) struct SpinWait {
    counter: u32,
}

impl SpinWait {
    #[inline]
    pub fn new() -> Self {
        Self { counter: 0 }
    }

    /// Spins a bounded number of rounds, doubling the busy-loop length each
    /// round. Returns `false` once the budget is exhausted and the caller
    /// should fall back to a heavier wait.
    #[inline]
    pub fn spin(&mut self) -> bool {
        if self.counter >= 10 {
            return false;
        }
        self.counter += 1;
        for _ in 0..(1 << self.counter) {
            std::hint::spin_loop();
        }
        true
    }

    /// Like [`spin`](Self::spin), but degrades to yielding the OS thread
    /// instead of giving up, so it may be called in an unbounded loop.
    #[inline]
    pub fn spin_yield_thread(&mut self) {
        if !self.spin() {
            std::thread::yield_now();
        }
    }
}
