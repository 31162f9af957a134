//! Bookkeeping for fibers suspended with a deadline.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::time::Instant;

use crate::fiber::FiberHandle;

#[derive(Clone, Copy, PartialEq, Eq)]
struct Timeout {
    deadline: Instant,
    fiber: FiberHandle,
}

impl Ord for Timeout {
    fn cmp(&self, other: &Self) -> Ordering {
        // The fiber pointer is only a tie-breaker for equal deadlines.
        self.deadline
            .cmp(&other.deadline)
            .then_with(|| (self.fiber.0 as usize).cmp(&(other.fiber.0 as usize)))
    }
}

impl PartialOrd for Timeout {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The set of fibers blocked on a timed wait, ordered by deadline.
///
/// Entries are kept both in a deadline-ordered set (for earliest-deadline
/// queries and expiry draining) and in a per-fiber map (for targeted
/// removal when a fiber is notified before its deadline).
#[derive(Default)]
pub(crate) struct WaitingFibers {
    timeouts: BTreeSet<Timeout>,
    fibers: HashMap<FiberHandle, Instant>,
}

impl WaitingFibers {
    pub fn is_empty(&self) -> bool {
        self.timeouts.is_empty()
    }

    /// Registers `fiber` to be woken at `deadline`.
    /// The fiber must not already be waiting.
    pub fn add(&mut self, deadline: Instant, fiber: FiberHandle) {
        debug_assert!(!self.fibers.contains_key(&fiber), "fiber is already waiting");
        self.timeouts.insert(Timeout { deadline, fiber });
        self.fibers.insert(fiber, deadline);
    }

    /// Removes and returns a fiber whose deadline has passed, if any.
    /// Repeated calls drain all expired entries.
    pub fn take(&mut self, now: Instant) -> Option<FiberHandle> {
        let first = *self.timeouts.iter().next()?;
        if first.deadline > now {
            return None;
        }
        self.timeouts.remove(&first);
        self.fibers.remove(&first.fiber);
        Some(first.fiber)
    }

    /// The earliest deadline among all waiting fibers.
    pub fn next(&self) -> Option<Instant> {
        self.timeouts.iter().next().map(|t| t.deadline)
    }

    /// Removes `fiber` if it is waiting. Idempotent.
    pub fn erase(&mut self, fiber: FiberHandle) {
        if let Some(deadline) = self.fibers.remove(&fiber) {
            self.timeouts.remove(&Timeout { deadline, fiber });
        }
    }

    pub fn contains(&self, fiber: FiberHandle) -> bool {
        self.fibers.contains_key(&fiber)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn handle(addr: usize) -> FiberHandle {
        // Never dereferenced; WaitingFibers only compares pointers.
        FiberHandle(addr as *const crate::fiber::Fiber)
    }

    #[test]
    fn test_take_in_deadline_order() {
        let mut waiting = WaitingFibers::default();
        let base = Instant::now();
        let (a, b, c) = (handle(8), handle(16), handle(24));

        waiting.add(base + Duration::from_millis(30), c);
        waiting.add(base + Duration::from_millis(10), a);
        waiting.add(base + Duration::from_millis(20), b);

        assert_eq!(waiting.next(), Some(base + Duration::from_millis(10)));
        let late = base + Duration::from_millis(25);
        assert_eq!(waiting.take(late), Some(a));
        assert_eq!(waiting.take(late), Some(b));
        assert_eq!(waiting.take(late), None);
        assert!(!waiting.is_empty());
    }

    #[test]
    fn test_take_respects_now() {
        let mut waiting = WaitingFibers::default();
        let base = Instant::now();
        waiting.add(base + Duration::from_secs(60), handle(8));
        assert_eq!(waiting.take(base), None);
    }

    #[test]
    fn test_erase_is_idempotent() {
        let mut waiting = WaitingFibers::default();
        let base = Instant::now();
        let a = handle(8);

        waiting.add(base, a);
        assert!(waiting.contains(a));
        waiting.erase(a);
        assert!(!waiting.contains(a));
        assert!(waiting.is_empty());
        waiting.erase(a);
    }

    #[test]
    fn test_equal_deadlines_keep_both_entries() {
        let mut waiting = WaitingFibers::default();
        let deadline = Instant::now();
        waiting.add(deadline, handle(8));
        waiting.add(deadline, handle(16));
        assert!(waiting.take(deadline).is_some());
        assert!(waiting.take(deadline).is_some());
        assert!(waiting.is_empty());
    }
}
