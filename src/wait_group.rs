//! WaitGroup: wait for a set of concurrent tasks to finish.

use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::condvar::ConditionVariable;

/// A counter that can be incremented, decremented, and waited on until it
/// reaches zero.
///
/// Cloning produces another handle to the same counter. The usual pattern
/// gives each scheduled task a clone that calls [`done`](WaitGroup::done)
/// when it finishes, while the submitter calls [`wait`](WaitGroup::wait).
#[derive(Clone)]
pub struct WaitGroup {
    data: Arc<Data>,
}

struct Data {
    count: AtomicUsize,
    mutex: Mutex<()>,
    cv: ConditionVariable,
}

impl WaitGroup {
    /// Creates a wait group with the given initial count.
    pub fn new(initial: usize) -> Self {
        WaitGroup {
            data: Arc::new(Data {
                count: AtomicUsize::new(initial),
                mutex: Mutex::new(()),
                cv: ConditionVariable::new(),
            }),
        }
    }

    /// Increments the counter by `count`.
    pub fn add(&self, count: usize) {
        self.data.count.fetch_add(count, SeqCst);
    }

    /// Decrements the counter by one, waking waiters when it reaches zero.
    /// Returns true if this call brought the counter to zero.
    pub fn done(&self) -> bool {
        let previous = self.data.count.fetch_sub(1, SeqCst);
        assert!(previous > 0, "WaitGroup::done() called more times than add()");
        if previous == 1 {
            let _lock = self.data.mutex.lock();
            self.data.cv.notify_all();
            return true;
        }
        false
    }

    /// Blocks until the counter reaches zero.
    pub fn wait(&self) {
        let data = &self.data;
        let mut lock = data.mutex.lock();
        data.cv.wait(&mut lock, |_| data.count.load(SeqCst) == 0);
    }
}

impl Default for WaitGroup {
    fn default() -> Self {
        WaitGroup::new(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_done_reports_zero_crossing() {
        let wg = WaitGroup::new(2);
        assert!(!wg.done());
        assert!(wg.done());
    }

    #[test]
    fn test_add_then_done() {
        let wg = WaitGroup::new(0);
        wg.add(3);
        assert!(!wg.done());
        assert!(!wg.done());
        assert!(wg.done());
    }

    #[test]
    fn test_wait_returns_immediately_at_zero() {
        let wg = WaitGroup::new(0);
        wg.wait();
    }

    #[test]
    #[should_panic(expected = "called more times than add()")]
    fn test_done_underflow_panics() {
        let wg = WaitGroup::new(0);
        wg.done();
    }
}
