//! Task definitions.
//!
//! A task is a move-only unit of deferred work: a nullary closure that the
//! scheduler runs exactly once on a fiber. Tasks are owned by the scheduler
//! from `enqueue` until a worker consumes them into a running fiber.

/// A unit of work queued for asynchronous execution.
pub struct Task {
    f: Box<dyn FnOnce() + Send>,
}

impl Task {
    /// Wraps a closure as a schedulable task.
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Task { f: Box::new(f) }
    }

    /// Consumes the task, invoking its closure.
    pub(crate) fn run(self) {
        (self.f)()
    }
}

impl<F> From<F> for Task
where
    F: FnOnce() + Send + 'static,
{
    fn from(f: F) -> Self {
        Task::new(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_task_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let task = Task::new(move || {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });
        task.run();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_task_from_closure() {
        let task: Task = (|| {}).into();
        task.run();
    }
}
