//! A condition variable that blocks fibers as well as plain threads.
//!
//! When the waiter is running on a scheduler fiber, the fiber suspends and
//! its worker keeps executing other tasks; when the waiter is an ordinary
//! thread, it parks on an OS condition variable. Notification handles both
//! kinds of waiter.

use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};
use std::time::Instant;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::fiber::{Fiber, FiberHandle};

/// A fiber-aware condition variable.
///
/// All concurrent waiters must pass guards of the same mutex, mirroring the
/// usual condition-variable contract.
#[derive(Default)]
pub struct ConditionVariable {
    /// Fibers currently blocked in wait().
    waiting: Mutex<Vec<FiberHandle>>,
    /// Parking spot for waiters that are not on a fiber.
    condition: Condvar,
    num_waiting: AtomicUsize,
    num_waiting_on_condition: AtomicUsize,
}

impl ConditionVariable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wakes one waiter. Fibers are all notified and re-check their
    /// predicates; at most one will find it satisfied and proceed.
    pub fn notify_one(&self) {
        if self.num_waiting.load(SeqCst) == 0 {
            return;
        }
        {
            let waiting = self.waiting.lock();
            for fiber in waiting.iter() {
                fiber.notify();
            }
        }
        if self.num_waiting_on_condition.load(SeqCst) > 0 {
            self.condition.notify_one();
        }
    }

    /// Wakes every waiter.
    pub fn notify_all(&self) {
        if self.num_waiting.load(SeqCst) == 0 {
            return;
        }
        {
            let waiting = self.waiting.lock();
            for fiber in waiting.iter() {
                fiber.notify();
            }
        }
        if self.num_waiting_on_condition.load(SeqCst) > 0 {
            self.condition.notify_all();
        }
    }

    /// Blocks the current fiber or thread until `pred` returns true.
    /// `guard` locks the data `pred` reads; `pred` always runs with it
    /// held.
    pub fn wait<T: ?Sized>(&self, guard: &mut MutexGuard<'_, T>, mut pred: impl FnMut(&mut T) -> bool) {
        if pred(&mut **guard) {
            return;
        }
        self.num_waiting.fetch_add(1, SeqCst);
        if let Some(fiber) = Fiber::current() {
            // On a scheduler fiber: suspend it so the worker can run other
            // tasks that may satisfy the predicate.
            self.waiting.lock().push(fiber);
            fiber.wait(guard, pred);
            self.deregister(fiber);
        } else {
            self.num_waiting_on_condition.fetch_add(1, SeqCst);
            while !pred(&mut **guard) {
                self.condition.wait(guard);
            }
            self.num_waiting_on_condition.fetch_sub(1, SeqCst);
        }
        self.num_waiting.fetch_sub(1, SeqCst);
    }

    /// As [`wait`](ConditionVariable::wait), but gives up at `deadline`.
    /// Returns the final value of `pred`.
    pub fn wait_until<T: ?Sized>(
        &self,
        guard: &mut MutexGuard<'_, T>,
        deadline: Instant,
        mut pred: impl FnMut(&mut T) -> bool,
    ) -> bool {
        if pred(&mut **guard) {
            return true;
        }
        self.num_waiting.fetch_add(1, SeqCst);
        let satisfied = if let Some(fiber) = Fiber::current() {
            self.waiting.lock().push(fiber);
            let satisfied = fiber.wait_until(guard, deadline, pred);
            self.deregister(fiber);
            satisfied
        } else {
            self.num_waiting_on_condition.fetch_add(1, SeqCst);
            let satisfied = loop {
                if pred(&mut **guard) {
                    break true;
                }
                if self.condition.wait_until(guard, deadline).timed_out() {
                    break pred(&mut **guard);
                }
            };
            self.num_waiting_on_condition.fetch_sub(1, SeqCst);
            satisfied
        };
        self.num_waiting.fetch_sub(1, SeqCst);
        satisfied
    }

    fn deregister(&self, fiber: FiberHandle) {
        let mut waiting = self.waiting.lock();
        if let Some(index) = waiting.iter().position(|f| *f == fiber) {
            waiting.swap_remove(index);
        }
    }
}
