//! The scheduler: routes tasks to workers and manages their lifecycles.
//!
//! A scheduler starts in single-threaded mode; call
//! [`set_worker_thread_count`](Scheduler::set_worker_thread_count) to spawn
//! dedicated worker threads. Threads that want to submit or wait on work
//! bind the scheduler with [`bind`](Scheduler::bind), after which the free
//! function [`schedule`] routes closures through it.

use std::cell::Cell;
use std::collections::HashMap;
use std::ptr;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering::Relaxed};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;

use crate::task::Task;
use crate::worker::{Mode, SendPtr, Worker};

/// Stack size in bytes of a new fiber.
pub const FIBER_STACK_SIZE: usize = 1024 * 1024;

/// Maximum number of multi-threaded workers.
pub const MAX_WORKER_THREADS: usize = 256;

/// Slots in the spinning-worker ring.
const SPINNING_WORKERS: usize = 8;

/// Sentinel for an empty spinning-worker slot.
const NO_WORKER: i32 = -1;

type ThreadInitFn = Arc<dyn Fn() + Send + Sync>;

thread_local! {
    static BOUND: Cell<*const SchedulerState> = const { Cell::new(ptr::null()) };
}

pub(crate) fn set_bound(state: *const SchedulerState) {
    BOUND.set(state);
}

/// Asynchronously processes [`Task`]s on a pool of worker threads.
///
/// Dropping the scheduler stops and joins every worker; all tasks enqueued
/// beforehand complete first. Every thread that bound the scheduler must
/// unbind before the drop.
pub struct Scheduler {
    // Boxed so worker back-pointers survive moves of the Scheduler value.
    state: Box<SchedulerState>,
}

pub(crate) struct SchedulerState {
    /// Multi-threaded workers. Only mutated with every worker stopped.
    worker_threads: Vec<Box<Worker>>,
    /// Round-robin cursor for enqueue. Biased start so early task ids
    /// spread well.
    next_enqueue_index: AtomicU32,
    /// Worker ids recently published by spinners, claimed by producers.
    spinning_workers: [AtomicI32; SPINNING_WORKERS],
    next_spinning_worker_idx: AtomicU32,
    single_threaded_workers: Mutex<HashMap<ThreadId, Box<Worker>>>,
    thread_init_fn: Mutex<Option<ThreadInitFn>>,
}

impl Scheduler {
    /// Creates a scheduler in single-threaded mode.
    pub fn new() -> Self {
        Scheduler {
            state: Box::new(SchedulerState {
                worker_threads: Vec::new(),
                next_enqueue_index: AtomicU32::new(0x8000000),
                spinning_workers: [NO_WORKER; SPINNING_WORKERS].map(AtomicI32::new),
                next_spinning_worker_idx: AtomicU32::new(0),
                single_threaded_workers: Mutex::new(HashMap::new()),
                thread_init_fn: Mutex::new(None),
            }),
        }
    }

    /// Adjusts the number of dedicated worker threads. A count of 0 puts
    /// the scheduler into single-threaded mode.
    ///
    /// Existing workers are stopped and joined before the new fleet
    /// starts. Calling this after tasks have been enqueued is not
    /// supported.
    pub fn set_worker_thread_count(&mut self, count: usize) {
        let count = if count > MAX_WORKER_THREADS {
            tracing::warn!(
                requested = count,
                max = MAX_WORKER_THREADS,
                "worker thread count clamped"
            );
            MAX_WORKER_THREADS
        } else {
            count
        };
        for worker in &self.state.worker_threads {
            worker.stop();
        }
        self.state.worker_threads.clear();
        let scheduler = SendPtr::new(&*self.state as *const SchedulerState);
        for id in 0..count {
            self.state
                .worker_threads
                .push(Worker::new(scheduler, Mode::MultiThreaded, id as u32));
        }
        for worker in &self.state.worker_threads {
            worker.start();
        }
    }

    /// The number of dedicated worker threads.
    pub fn worker_thread_count(&self) -> usize {
        self.state.worker_threads.len()
    }

    /// One worker per logical CPU; a reasonable argument to
    /// [`set_worker_thread_count`](Scheduler::set_worker_thread_count).
    pub fn default_worker_thread_count() -> usize {
        num_cpus::get()
    }

    /// Sets a callback run at the start of each newly spawned worker
    /// thread, before it processes any work. Call before
    /// [`set_worker_thread_count`](Scheduler::set_worker_thread_count).
    pub fn set_thread_initializer<F>(&self, init: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.state.thread_init_fn.lock() = Some(Arc::new(init));
    }

    /// Queues the task for asynchronous execution.
    pub fn enqueue(&self, task: Task) {
        self.state.enqueue(task);
    }

    /// Binds this scheduler to the calling thread, enabling [`schedule`]
    /// and fiber-aware waiting from it. The thread must not already have a
    /// bound scheduler.
    pub fn bind(&self) {
        assert!(
            BOUND.get().is_null(),
            "a scheduler is already bound to this thread"
        );
        BOUND.set(&*self.state as *const SchedulerState);
        let worker = Worker::new(
            SendPtr::new(&*self.state as *const SchedulerState),
            Mode::SingleThreaded,
            0,
        );
        worker.start();
        self.state
            .single_threaded_workers
            .lock()
            .insert(thread::current().id(), worker);
    }

    /// Unbinds the scheduler bound to the calling thread, draining any
    /// tasks still queued on the thread's single-threaded worker.
    pub fn unbind() {
        let state = BOUND.get();
        assert!(!state.is_null(), "no scheduler bound to this thread");
        // SAFETY: bind() stored a pointer to a live scheduler, and the
        // caller keeps the scheduler alive until after unbind().
        let state = unsafe { &*state };
        let worker = state
            .single_threaded_workers
            .lock()
            .remove(&thread::current().id())
            .expect("single-threaded worker not found for this thread");
        worker.flush();
        worker.stop();
        BOUND.set(ptr::null());
    }

    /// The scheduler bound to the calling thread, if any.
    pub fn get() -> Option<SchedulerRef> {
        let state = BOUND.get();
        (!state.is_null()).then_some(SchedulerRef { state })
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Scheduler::new()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        {
            let single_threaded = self.state.single_threaded_workers.lock();
            assert!(
                single_threaded.is_empty(),
                "scheduler dropped while still bound to {} thread(s)",
                single_threaded.len()
            );
        }
        self.set_worker_thread_count(0);
    }
}

impl SchedulerState {
    pub(crate) fn enqueue(&self, mut task: Task) {
        let worker_count = self.worker_threads.len();
        if worker_count > 0 {
            loop {
                // Prefer a worker that recently started spinning; it is
                // awake and hungry. Otherwise round-robin.
                let slot = (self.next_spinning_worker_idx.fetch_sub(1, Relaxed) as usize)
                    .wrapping_sub(1)
                    % SPINNING_WORKERS;
                let spinning = self.spinning_workers[slot].swap(NO_WORKER, Relaxed);
                let index = if spinning >= 0 {
                    spinning as usize % worker_count
                } else {
                    self.next_enqueue_index.fetch_add(1, Relaxed) as usize % worker_count
                };
                match self.worker_threads[index].try_enqueue_task(task) {
                    Ok(()) => return,
                    Err(contended) => task = contended,
                }
            }
        } else {
            let workers = self.single_threaded_workers.lock();
            let worker = workers
                .get(&thread::current().id())
                .expect("enqueue requires worker threads or a scheduler bound to this thread");
            worker.enqueue_task(task);
        }
    }

    /// Attempts to steal a task from the worker picked by `from` for the
    /// worker `thief`.
    pub(crate) fn steal_work(&self, thief: u32, from: u64) -> Option<Task> {
        let worker_count = self.worker_threads.len();
        if worker_count == 0 {
            return None;
        }
        let victim = &self.worker_threads[(from % worker_count as u64) as usize];
        if victim.id() == thief {
            return None;
        }
        victim.steal()
    }

    /// Publishes `worker_id` as spinning so producers route new tasks to
    /// it before it parks.
    pub(crate) fn on_begin_spinning(&self, worker_id: u32) {
        let slot = self.next_spinning_worker_idx.fetch_add(1, Relaxed) as usize % SPINNING_WORKERS;
        self.spinning_workers[slot].store(worker_id as i32, Relaxed);
    }

    pub(crate) fn thread_initializer(&self) -> Option<ThreadInitFn> {
        self.thread_init_fn.lock().clone()
    }
}

/// Borrowed access to the scheduler bound to the calling thread.
///
/// Returned by [`Scheduler::get`]; valid until the thread unbinds.
#[derive(Clone, Copy)]
pub struct SchedulerRef {
    state: *const SchedulerState,
}

impl SchedulerRef {
    /// Queues the task for asynchronous execution.
    pub fn enqueue(&self, task: Task) {
        // SAFETY: the handle came from the thread-local binding, which the
        // binding contract keeps pointing at a live scheduler.
        unsafe { &*self.state }.enqueue(task);
    }

    /// The number of dedicated worker threads.
    pub fn worker_thread_count(&self) -> usize {
        // SAFETY: as in enqueue().
        unsafe { &*self.state }.worker_threads.len()
    }
}

/// Schedules `f` to be asynchronously run by the scheduler bound to the
/// calling thread. Panics if no scheduler is bound.
pub fn schedule<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    let scheduler = Scheduler::get().expect("schedule() requires a bound scheduler");
    scheduler.enqueue(Task::new(f));
}
