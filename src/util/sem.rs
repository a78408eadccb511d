use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Counting semaphore with an upper bound. Used for controller ACL buffer
/// credits and for the TX context free-list.
#[derive(Debug)]
pub(crate) struct Semaphore {
    count: Mutex<usize>,
    cv: Condvar,
    limit: usize,
}

impl Semaphore {
    /// Creates a semaphore with `initial` available units, never exceeding
    /// `limit`.
    #[must_use]
    pub fn new(initial: usize, limit: usize) -> Self {
        Self {
            count: Mutex::new(initial.min(limit)),
            cv: Condvar::new(),
            limit,
        }
    }

    /// Blocks until one unit is available and takes it.
    pub fn take(&self) {
        let mut n = self.count.lock();
        while *n == 0 {
            self.cv.wait(&mut n);
        }
        *n -= 1;
    }

    /// Takes one unit if one is available without blocking.
    #[must_use]
    pub fn try_take(&self) -> bool {
        let mut n = self.count.lock();
        if *n == 0 {
            return false;
        }
        *n -= 1;
        true
    }

    /// Takes one unit, waiting at most `timeout` for it to become available.
    #[must_use]
    pub fn take_timeout(&self, timeout: Duration) -> bool {
        let mut n = self.count.lock();
        while *n == 0 {
            if self.cv.wait_for(&mut n, timeout).timed_out() && *n == 0 {
                return false;
            }
        }
        *n -= 1;
        true
    }

    /// Returns one unit. Extra units beyond the limit are discarded.
    pub fn give(&self) {
        let mut n = self.count.lock();
        if *n < self.limit {
            *n += 1;
            self.cv.notify_one();
        }
    }

    /// Returns the number of available units.
    #[inline]
    #[must_use]
    pub fn count(&self) -> usize {
        *self.count.lock()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn limit() {
        let s = Semaphore::new(1, 2);
        s.give();
        s.give();
        assert_eq!(s.count(), 2);
        assert!(s.try_take());
        assert!(s.try_take());
        assert!(!s.try_take());
        assert!(!s.take_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn wake() {
        let s = Arc::new(Semaphore::new(0, 1));
        let t = {
            let s = Arc::clone(&s);
            thread::spawn(move || s.take())
        };
        s.give();
        t.join().unwrap();
        assert_eq!(s.count(), 0);
    }
}
