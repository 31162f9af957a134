//! # weft: a hybrid task-and-fiber scheduler
//!
//! Tasks submitted to the scheduler run on stackful fibers multiplexed
//! over a fixed pool of worker threads (an M:N model). Because every task
//! executes on its own fiber, it can block on synchronization primitives
//! like [`Event`] and [`WaitGroup`] without blocking the underlying OS
//! thread: the worker simply switches to another ready fiber or task.
//!
//! Key mechanics:
//!
//! - **Per-worker queues with stealing**: each worker owns a task queue
//!   and a ready-fiber queue; idle workers steal tasks (never fibers) from
//!   the front of random victims' queues.
//! - **Adaptive spinning**: a worker about to park advertises itself so
//!   producers route new tasks to it, cutting park/wake churn.
//! - **Timed wakeups**: fibers waiting with a deadline are resumed by
//!   their worker once it passes.
//! - **Fiber recycling**: completed fibers return to a per-worker idle
//!   pool and are reused for later tasks.
//!
//! Scheduling is strictly cooperative within a worker: a fiber runs until
//! it returns or blocks in a wait, and it stays on the worker that created
//! it for its whole life.
//!
//! ## Example
//!
//! ```no_run
//! use weft::{schedule, Scheduler, WaitGroup};
//!
//! let mut scheduler = Scheduler::new();
//! scheduler.set_worker_thread_count(4);
//! scheduler.bind();
//!
//! let wg = WaitGroup::new(2);
//! for i in 0..2 {
//!     let wg = wg.clone();
//!     schedule(move || {
//!         println!("hello from task {i}");
//!         wg.done();
//!     });
//! }
//! wg.wait();
//!
//! Scheduler::unbind();
//! ```

pub mod condvar;
pub mod event;
pub mod fiber;
pub mod scheduler;
pub mod task;
pub mod wait_group;

mod waiting;
mod worker;

pub use condvar::ConditionVariable;
pub use event::Event;
pub use fiber::{Fiber, FiberHandle};
pub use scheduler::{schedule, Scheduler, SchedulerRef, FIBER_STACK_SIZE, MAX_WORKER_THREADS};
pub use task::Task;
pub use wait_group::WaitGroup;
