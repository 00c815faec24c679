use std::hint;
use std::thread;

/// Adaptive waiter for the producer's insert-retry loop.
///
/// An evicted reader needs a moment to notice its membership bit is gone and
/// clear its slot pins; hard-spinning on the blocked slot until then only
/// steals cycles from the very thread being waited on. Waits escalate from
/// PAUSE-hinted spins to OS yields.
#[derive(Debug, Default)]
pub struct Backoff {
    step: u32,
}

impl Backoff {
    const SPIN_LIMIT: u32 = 6;

    /// Creates a fresh backoff.
    #[inline]
    pub fn new() -> Self {
        Self { step: 0 }
    }

    /// Waits once, escalating with every call.
    #[inline]
    pub fn snooze(&mut self) {
        if self.step <= Self::SPIN_LIMIT {
            for _ in 0..1 << self.step {
                hint::spin_loop();
            }
            self.step += 1;
        } else {
            thread::yield_now();
        }
    }

    /// Resets to the cheap end of the scale.
    #[inline]
    pub fn reset(&mut self) {
        self.step = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escalates_then_resets() {
        let mut b = Backoff::new();

        assert_eq!(b.step, 0);
        for _ in 0..16 {
            b.snooze();
        }
        assert_eq!(b.step, Backoff::SPIN_LIMIT + 1);

        b.reset();
        assert_eq!(b.step, 0);
    }
}
