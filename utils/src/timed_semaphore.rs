// A counting semaphore with a timed wait
//
// The standard library does not ship a semaphore, and the places
// this gets used need a wait that gives up after a caller supplied
// timeout. A mutex paired with a condition variable is slower than
// a futex based semaphore but has a safe timedwait.
//
// Austin Shafer - 2025
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// A counting semaphore.
///
/// `wait` takes one token, blocking up to a timeout expressed in
/// nanoseconds. A timeout of 0 is a non-blocking probe and
/// `u64::MAX` waits until a token is available.
pub struct TimedSemaphore {
    ts_count: Mutex<u64>,
    ts_cond: Condvar,
}

impl TimedSemaphore {
    pub fn new(value: u64) -> Self {
        Self {
            ts_count: Mutex::new(value),
            ts_cond: Condvar::new(),
        }
    }

    /// Make one token available and wake one waiter.
    pub fn post(&self) {
        let mut count = self.ts_count.lock().unwrap();
        *count += 1;
        self.ts_cond.notify_one();
    }

    /// Take one token, waiting up to `timeout_ns`.
    ///
    /// Returns true if a token was consumed, false if the timeout
    /// expired first.
    pub fn wait(&self, timeout_ns: u64) -> bool {
        let mut count = self.ts_count.lock().unwrap();
        if *count > 0 {
            *count -= 1;
            return true;
        }

        if timeout_ns == 0 {
            return false;
        }

        if timeout_ns == u64::MAX {
            while *count == 0 {
                count = self.ts_cond.wait(count).unwrap();
            }
        } else {
            let deadline = Instant::now() + Duration::from_nanos(timeout_ns);
            while *count == 0 {
                let now = Instant::now();
                if now >= deadline {
                    return false;
                }
                let (guard, _) = self.ts_cond.wait_timeout(count, deadline - now).unwrap();
                count = guard;
            }
        }

        *count -= 1;
        true
    }

    /// The number of tokens currently available.
    pub fn count(&self) -> u64 {
        *self.ts_count.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn probe_and_post() {
        let sem = TimedSemaphore::new(1);
        assert!(sem.wait(0));
        assert!(!sem.wait(0));
        sem.post();
        assert_eq!(sem.count(), 1);
        assert!(sem.wait(0));
    }

    #[test]
    fn timed_wait_expires() {
        let sem = TimedSemaphore::new(0);
        let start = Instant::now();
        assert!(!sem.wait(20_000_000)); // 20 ms
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn cross_thread_post_wakes_waiter() {
        let sem = Arc::new(TimedSemaphore::new(0));
        let poster = sem.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            poster.post();
        });
        assert!(sem.wait(u64::MAX));
        handle.join().unwrap();
        assert_eq!(sem.count(), 0);
    }
}
