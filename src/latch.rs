use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// A countdown latch: waiters block until the count reaches zero.
///
/// Counting down past zero has no effect, so a latch that has triggered
/// stays triggered.
pub struct CountDownLatch {
    count: Mutex<u64>,
    cond: Condvar,
}

impl CountDownLatch {
    pub fn new(count: u64) -> Self {
        Self {
            count: Mutex::new(count),
            cond: Condvar::new(),
        }
    }

    /// Decrements the count by `amount`, waking all waiters if it reaches
    /// zero.
    pub fn count_down_by(&self, amount: u64) {
        let mut count = self.count.lock().unwrap();
        if *count == 0 {
            return;
        }
        *count = count.saturating_sub(amount);
        if *count == 0 {
            self.cond.notify_all();
        }
    }

    /// Decrements the count by one.
    pub fn count_down(&self) {
        self.count_down_by(1);
    }

    /// Blocks until the count reaches zero.
    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count > 0 {
            count = self.cond.wait(count).unwrap();
        }
    }

    /// Blocks until the count reaches zero or `deadline` passes. Returns
    /// true if the count reached zero.
    pub fn wait_until(&self, deadline: Instant) -> bool {
        let mut count = self.count.lock().unwrap();
        while *count > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, timeout) = self.cond.wait_timeout(count, deadline - now).unwrap();
            count = guard;
            if timeout.timed_out() && *count > 0 {
                return false;
            }
        }
        true
    }

    /// Blocks for at most `timeout`. Returns true if the count reached zero.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        self.wait_until(Instant::now() + timeout)
    }

    /// Current count.
    pub fn count(&self) -> u64 {
        *self.count.lock().unwrap()
    }
}
