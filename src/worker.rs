//! Workers: the per-thread execution engines of the scheduler.
//!
//! A worker owns a queue of pending tasks, a queue of ready fibers, and a
//! set of fibers waiting on deadlines. In multi-threaded mode it runs a
//! dedicated OS thread; in single-threaded mode it piggybacks on the thread
//! that bound the scheduler and drains work lazily inside wait calls.
//!
//! Locking discipline: `Work::state` is a per-worker leaf mutex. It is held
//! across every fiber switch and released only while user code runs or the
//! worker parks. Because switches never leave the worker's OS thread, the
//! thread that forgets the guard on one side of a switch is the same thread
//! that re-takes it on the other side. User locks are always acquired
//! before the work mutex, never after.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering::SeqCst};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crossbeam::utils::Backoff;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::fiber::{Fiber, FiberHandle, FiberInput, FiberYield, State};
use crate::scheduler::SchedulerState;
use crate::task::Task;
use crate::waiting::WaitingFibers;

/// Iterations of the no-op burst between steal attempts while spinning.
const SPIN_BURSTS: usize = 256;
/// How long a worker spins for work before parking on its condvar.
const SPIN_DURATION: Duration = Duration::from_millis(1);

/// Execution mode of a worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Mode {
    /// The worker spawns a dedicated OS thread to process work.
    MultiThreaded,
    /// The worker executes work on the binding thread, inside waits.
    SingleThreaded,
}

/// Xorshift generator used to pick steal victims.
/// <https://en.wikipedia.org/wiki/Xorshift>
pub(crate) struct FastRand {
    x: u64,
}

impl FastRand {
    fn from_clock() -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(1, |d| d.as_nanos() as u64);
        FastRand { x: seed.max(1) }
    }

    pub(crate) fn next(&mut self) -> u64 {
        self.x ^= self.x << 13;
        self.x ^= self.x >> 7;
        self.x ^= self.x << 17;
        self.x
    }
}

/// Raw-pointer wrapper that may be moved into a worker thread.
pub(crate) struct SendPtr<T>(*const T);

impl<T> Clone for SendPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for SendPtr<T> {}

// SAFETY: the wrapper only transfers the pointer value; every dereference
// site is responsible for its own synchronization and lifetime reasoning.
unsafe impl<T> Send for SendPtr<T> {}

impl<T> SendPtr<T> {
    pub(crate) fn new(ptr: *const T) -> Self {
        SendPtr(ptr)
    }

    pub(crate) fn get(self) -> *const T {
        self.0
    }
}

/// Tasks and fibers enqueued on a worker.
pub(crate) struct Work {
    /// `tasks.len() + fibers.len()`, readable without the mutex so that
    /// stealers and spinners can check for emptiness lock-free.
    num: AtomicU64,
    state: Mutex<WorkState>,
    /// Signalled when work is added or shutdown begins.
    added: Condvar,
}

struct WorkState {
    tasks: VecDeque<Task>,
    fibers: VecDeque<FiberHandle>,
    waiting: WaitingFibers,
    /// Fibers currently suspended (yielded + waiting).
    num_blocked_fibers: u64,
    /// True while producers must signal `added` on enqueue. Cleared only
    /// during the spin window, where the worker polls `num` itself.
    notify_added: bool,
    shutdown: bool,
}

impl Default for WorkState {
    fn default() -> Self {
        WorkState {
            tasks: VecDeque::new(),
            fibers: VecDeque::new(),
            waiting: WaitingFibers::default(),
            num_blocked_fibers: 0,
            notify_added: true,
            shutdown: false,
        }
    }
}

impl Default for Work {
    fn default() -> Self {
        Work {
            num: AtomicU64::new(0),
            state: Mutex::new(WorkState::default()),
            added: Condvar::new(),
        }
    }
}

/// State only ever touched from the thread the worker runs on.
struct WorkerLocal {
    main_fiber: Option<Box<Fiber>>,
    current_fiber: Option<FiberHandle>,
    /// Completed fibers available for reuse.
    idle_fibers: Vec<FiberHandle>,
    /// Owning storage for every fiber this worker ever created.
    all_fibers: Vec<Box<Fiber>>,
    next_fiber_id: u32,
    rng: FastRand,
}

thread_local! {
    static CURRENT_WORKER: std::cell::Cell<*const Worker> =
        const { std::cell::Cell::new(ptr::null()) };
}

/// A single execution engine. See the module docs for the threading model.
pub(crate) struct Worker {
    id: u32,
    mode: Mode,
    scheduler: SendPtr<SchedulerState>,
    work: Work,
    local: UnsafeCell<WorkerLocal>,
    join: Mutex<Option<JoinHandle<()>>>,
}

// SAFETY: cross-thread access goes through `work` (mutex + atomics) and
// `join` (mutex); `local` is only touched by the thread the worker runs on.
unsafe impl Send for Worker {}
unsafe impl Sync for Worker {}

impl Worker {
    pub(crate) fn new(scheduler: SendPtr<SchedulerState>, mode: Mode, id: u32) -> Box<Worker> {
        Box::new(Worker {
            id,
            mode,
            scheduler,
            work: Work::default(),
            local: UnsafeCell::new(WorkerLocal {
                main_fiber: None,
                current_fiber: None,
                idle_fibers: Vec::new(),
                all_fibers: Vec::new(),
                next_fiber_id: 0,
                rng: FastRand { x: 1 },
            }),
            join: Mutex::new(None),
        })
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    /// The worker bound to the calling thread, if any.
    pub(crate) fn current_on_thread() -> Option<*const Worker> {
        let ptr = CURRENT_WORKER.get();
        (!ptr.is_null()).then_some(ptr)
    }

    /// The fiber currently executing on this worker.
    /// Must be called from the worker's own thread.
    pub(crate) fn current_fiber(&self) -> Option<FiberHandle> {
        // SAFETY: read from the owning thread only (see callers).
        unsafe { (*self.local.get()).current_fiber }
    }

    /// Begins execution. Multi-threaded workers spawn their OS thread;
    /// single-threaded workers attach to the calling thread and return.
    pub(crate) fn start(&self) {
        match self.mode {
            Mode::MultiThreaded => {
                let this = SendPtr::new(self as *const Worker);
                let handle = thread::Builder::new()
                    .name(format!("weft-worker-{:02}", self.id))
                    .spawn(move || {
                        // SAFETY: the scheduler joins this thread in stop()
                        // before the worker is dropped.
                        let worker = unsafe { &*this.get() };
                        worker.thread_main();
                    })
                    .expect("failed to spawn worker thread");
                *self.join.lock() = Some(handle);
            }
            Mode::SingleThreaded => {
                self.attach_to_current_thread();
            }
        }
    }

    /// Ceases execution. Blocks until all pending and blocked work has
    /// fully finished.
    pub(crate) fn stop(&self) {
        match self.mode {
            Mode::MultiThreaded => {
                self.work.state.lock().shutdown = true;
                self.work.added.notify_all();
                if let Some(handle) = self.join.lock().take() {
                    if handle.join().is_err() {
                        tracing::error!(worker = self.id, "worker thread panicked");
                    }
                }
            }
            Mode::SingleThreaded => {
                {
                    let state = self.work.state.lock();
                    assert!(
                        self.work.num.load(SeqCst) == 0 && state.num_blocked_fibers == 0,
                        "worker stopped with pending work or blocked fibers"
                    );
                }
                CURRENT_WORKER.set(ptr::null());
            }
        }
    }

    fn attach_to_current_thread(&self) {
        CURRENT_WORKER.set(self as *const Worker);
        let local = self.local_mut();
        local.rng = FastRand::from_clock();
        let main = Fiber::create_from_current_thread(0, self as *const Worker);
        local.current_fiber = Some(FiberHandle(&*main as *const Fiber));
        local.main_fiber = Some(main);
    }

    /// Entry point of a multi-threaded worker's OS thread.
    fn thread_main(&self) {
        if let Some(init) = self.scheduler().thread_initializer() {
            init();
        }
        crate::scheduler::set_bound(self.scheduler.get());
        self.attach_to_current_thread();
        tracing::trace!(worker = self.id, "worker started");
        self.run();
        tracing::trace!(worker = self.id, "worker stopped");
        CURRENT_WORKER.set(ptr::null());
        crate::scheduler::set_bound(ptr::null());
    }

    /// The multi-threaded scheduling loop, running on the main fiber.
    fn run(&self) {
        debug_assert_eq!(self.mode, Mode::MultiThreaded);
        let mut guard = self.work.state.lock();
        // Park until the first work item arrives or shutdown begins.
        while self.work.num.load(SeqCst) == 0 && !guard.shutdown {
            self.work.added.wait(&mut guard);
        }
        while !guard.shutdown
            || self.work.num.load(SeqCst) > 0
            || guard.num_blocked_fibers > 0
        {
            self.wait_for_work(&mut guard);
            guard = self.run_until_idle(guard);
        }
    }

    /// Runs all pending tasks on the calling thread until the queues are
    /// empty. Used by single-threaded workers at unbind.
    pub(crate) fn flush(&self) {
        debug_assert_eq!(self.mode, Mode::SingleThreaded);
        let guard = self.work.state.lock();
        drop(self.run_until_idle(guard));
    }

    // ---- producers -------------------------------------------------------

    /// Queues a new task, blocking on the work mutex if contended.
    pub(crate) fn enqueue_task(&self, task: Task) {
        let guard = self.work.state.lock();
        self.enqueue_task_and_unlock(guard, task);
    }

    /// Queues a new task only if the work mutex is immediately available.
    /// Returns the task on contention so the caller can pick another
    /// worker.
    pub(crate) fn try_enqueue_task(&self, task: Task) -> Result<(), Task> {
        match self.work.state.try_lock() {
            Some(guard) => {
                self.enqueue_task_and_unlock(guard, task);
                Ok(())
            }
            None => Err(task),
        }
    }

    fn enqueue_task_and_unlock(&self, mut guard: MutexGuard<'_, WorkState>, task: Task) {
        let notify = guard.notify_added;
        guard.tasks.push_back(task);
        self.work.num.fetch_add(1, SeqCst);
        drop(guard);
        if notify {
            self.work.added.notify_one();
        }
    }

    /// Reschedules a suspended fiber. This is the notify path and is legal
    /// from any thread.
    pub(crate) fn enqueue_fiber(&self, fiber: FiberHandle) {
        let notify;
        {
            let mut guard = self.work.state.lock();
            match fiber.state() {
                // Already scheduled; nothing to do.
                State::Queued | State::Running => return,
                State::Idle => panic!("notify() called on an idle fiber"),
                State::Waiting => guard.waiting.erase(fiber),
                State::Yielded => {}
            }
            notify = guard.notify_added;
            fiber.set_state(State::Queued);
            guard.fibers.push_back(fiber);
            guard.num_blocked_fibers -= 1;
            self.work.num.fetch_add(1, SeqCst);
            debug_assert!(!guard.waiting.contains(fiber));
        }
        if notify {
            self.work.added.notify_one();
        }
    }

    /// Takes the oldest pending task for another worker. Fails rather than
    /// contend on the mutex; ready fibers are never stolen.
    pub(crate) fn steal(&self) -> Option<Task> {
        if self.work.num.load(SeqCst) == 0 {
            return None;
        }
        let mut guard = self.work.state.try_lock()?;
        let task = guard.tasks.pop_front()?;
        self.work.num.fetch_sub(1, SeqCst);
        Some(task)
    }

    // ---- blocking --------------------------------------------------------

    /// Suspends `fiber` until `pred` is satisfied or `deadline` passes.
    /// `guard` is the caller's lock over the predicate's data; it is
    /// released while suspended and held whenever `pred` runs.
    pub(crate) fn wait<T: ?Sized, F>(
        &self,
        fiber: FiberHandle,
        guard: &mut MutexGuard<'_, T>,
        deadline: Option<Instant>,
        mut pred: F,
    ) -> bool
    where
        F: FnMut(&mut T) -> bool,
    {
        while !pred(&mut **guard) {
            let mut work = self.work.state.lock();
            self.begin_suspend(&mut work, fiber, deadline);
            MutexGuard::unlocked(guard, || self.park_current(work, fiber, deadline));
            if let Some(d) = deadline {
                if Instant::now() >= d {
                    return pred(&mut **guard);
                }
            }
            // Spurious wakeup; suspend again.
        }
        true
    }

    /// Suspends `fiber` with no lock or predicate. Returns false if the
    /// wakeup came from the deadline rather than a notify.
    pub(crate) fn wait_detached(&self, fiber: FiberHandle, deadline: Option<Instant>) -> bool {
        let mut work = self.work.state.lock();
        self.begin_suspend(&mut work, fiber, deadline);
        self.park_current(work, fiber, deadline);
        match deadline {
            Some(d) => Instant::now() < d,
            None => true,
        }
    }

    /// Marks the current fiber blocked. Requires the work mutex.
    fn begin_suspend(
        &self,
        state: &mut WorkState,
        fiber: FiberHandle,
        deadline: Option<Instant>,
    ) {
        debug_assert_eq!(fiber.state(), State::Running);
        match deadline {
            Some(d) => {
                fiber.set_state(State::Waiting);
                state.waiting.add(d, fiber);
            }
            None => fiber.set_state(State::Yielded),
        }
        state.num_blocked_fibers += 1;
    }

    /// Gives up the thread until the blocked fiber is runnable again.
    /// Entered with the work mutex held (via `work`); returns with it
    /// released and the fiber back in the Running state.
    fn park_current<'a>(
        &'a self,
        work: MutexGuard<'a, WorkState>,
        fiber: FiberHandle,
        deadline: Option<Instant>,
    ) {
        if fiber.is_main() {
            // The host thread's own stack cannot context-switch away;
            // drain work in place instead.
            self.drain_until_notified(work, fiber, deadline);
        } else {
            mem::forget(work);
            let _resume = fiber.suspend_current();
            // SAFETY: the scheduling loop re-locked the work mutex before
            // resuming this fiber; this thread owns it.
            unsafe { self.work.state.force_unlock() };
        }
    }

    /// Runs queued work on the host stack until this (main) fiber is
    /// notified or `deadline` passes. The single-threaded counterpart of a
    /// fiber switch: same queues, same states, no stack change.
    fn drain_until_notified<'a>(
        &'a self,
        mut guard: MutexGuard<'a, WorkState>,
        fiber: FiberHandle,
        deadline: Option<Instant>,
    ) {
        loop {
            self.enqueue_fiber_timeouts(&mut guard);
            // A notify (or an expired deadline) queued us for resumption.
            if fiber.state() == State::Queued {
                let index = guard
                    .fibers
                    .iter()
                    .position(|f| *f == fiber)
                    .expect("queued fiber missing from ready queue");
                guard.fibers.remove(index);
                self.work.num.fetch_sub(1, SeqCst);
                fiber.set_state(State::Running);
                break;
            }
            if let Some(d) = deadline {
                if Instant::now() >= d {
                    // Timed out while still blocked.
                    if fiber.state() == State::Waiting {
                        guard.waiting.erase(fiber);
                    }
                    fiber.set_state(State::Running);
                    guard.num_blocked_fibers -= 1;
                    break;
                }
            }
            // Run other ready work while blocked.
            if let Some(next) = guard.fibers.pop_front() {
                self.work.num.fetch_sub(1, SeqCst);
                debug_assert_eq!(next.state(), State::Queued);
                next.set_state(State::Running);
                guard = self.switch_to_fiber(guard, next, FiberInput::Resume);
                continue;
            }
            if let Some(task) = guard.tasks.pop_front() {
                self.work.num.fetch_sub(1, SeqCst);
                let next = self.acquire_fiber();
                next.set_state(State::Running);
                guard = self.switch_to_fiber(guard, next, FiberInput::Run(task));
                continue;
            }
            // Nothing runnable; park until a producer signals.
            let bound = match (deadline, guard.waiting.next()) {
                (Some(d), Some(w)) => Some(d.min(w)),
                (Some(d), None) => Some(d),
                (None, Some(w)) => Some(w),
                (None, None) => None,
            };
            match bound {
                Some(instant) => {
                    self.work.added.wait_until(&mut guard, instant);
                }
                None => self.work.added.wait(&mut guard),
            }
        }
    }

    // ---- scheduling loop -------------------------------------------------

    /// Executes everything in the ready queues, switching into fibers as
    /// needed, and returns once both queues are empty.
    fn run_until_idle<'a>(
        &'a self,
        mut guard: MutexGuard<'a, WorkState>,
    ) -> MutexGuard<'a, WorkState> {
        self.assert_work_counts(&guard);
        while !guard.fibers.is_empty() || !guard.tasks.is_empty() {
            // Unblocked fibers take priority over new tasks.
            while let Some(fiber) = guard.fibers.pop_front() {
                self.work.num.fetch_sub(1, SeqCst);
                debug_assert_eq!(fiber.state(), State::Queued);
                fiber.set_state(State::Running);
                guard = self.switch_to_fiber(guard, fiber, FiberInput::Resume);
            }
            if let Some(task) = guard.tasks.pop_front() {
                self.work.num.fetch_sub(1, SeqCst);
                let fiber = self.acquire_fiber();
                fiber.set_state(State::Running);
                guard = self.switch_to_fiber(guard, fiber, FiberInput::Run(task));
            }
        }
        guard
    }

    /// Resumes `fiber` on this thread. The work mutex is held across both
    /// directions of the switch; user code inside the fiber runs with it
    /// released.
    fn switch_to_fiber<'a>(
        &'a self,
        guard: MutexGuard<'a, WorkState>,
        fiber: FiberHandle,
        input: FiberInput,
    ) -> MutexGuard<'a, WorkState> {
        let previous = {
            let local = self.local_mut();
            let previous = local.current_fiber;
            local.current_fiber = Some(fiber);
            previous
        };
        mem::forget(guard);
        // SAFETY: fibers are resumed only by their owning thread, and the
        // handle points into this worker's fiber storage.
        let result = unsafe { fiber.resume(input) };
        // SAFETY: the fiber side of the switch left the mutex locked for
        // us; this thread owns it.
        let guard = unsafe { self.work.state.make_guard_unchecked() };
        let local = self.local_mut();
        local.current_fiber = previous;
        if result == FiberYield::Finished {
            fiber.set_state(State::Idle);
            local.idle_fibers.push(fiber);
        }
        guard
    }

    /// Blocks until there is something to do: spins and steals first, then
    /// parks on the condvar, bounded by the earliest waiting-fiber
    /// deadline.
    fn wait_for_work(&self, guard: &mut MutexGuard<'_, WorkState>) {
        self.assert_work_counts(guard);
        if self.work.num.load(SeqCst) == 0 && self.mode == Mode::MultiThreaded {
            guard.notify_added = false;
            self.scheduler().on_begin_spinning(self.id);
            MutexGuard::unlocked(guard, || self.spin_for_work());
            guard.notify_added = true;
        }
        loop {
            self.enqueue_fiber_timeouts(guard);
            if self.work.num.load(SeqCst) > 0
                || (guard.shutdown && guard.num_blocked_fibers == 0)
            {
                break;
            }
            match guard.waiting.next() {
                Some(deadline) => {
                    self.work.added.wait_until(guard, deadline);
                }
                None => self.work.added.wait(guard),
            }
        }
    }

    /// Moves every fiber whose deadline has passed onto the ready queue.
    fn enqueue_fiber_timeouts(&self, state: &mut WorkState) {
        let now = Instant::now();
        while let Some(fiber) = state.waiting.take(now) {
            debug_assert_eq!(fiber.state(), State::Waiting);
            tracing::trace!(worker = self.id, fiber = fiber.id(), "fiber wait timed out");
            fiber.set_state(State::Queued);
            state.fibers.push_back(fiber);
            state.num_blocked_fibers -= 1;
            self.work.num.fetch_add(1, SeqCst);
        }
    }

    /// Keeps the thread awake for a short window, attempting to steal from
    /// random victims. Cuts park/wake churn under bursty load.
    fn spin_for_work(&self) {
        let backoff = Backoff::new();
        let start = Instant::now();
        while start.elapsed() < SPIN_DURATION {
            for _ in 0..SPIN_BURSTS {
                for _ in 0..32 {
                    std::hint::spin_loop();
                }
                if self.work.num.load(SeqCst) > 0 {
                    return;
                }
            }
            let victim = self.local_mut().rng.next();
            if let Some(task) = self.scheduler().steal_work(self.id, victim) {
                let mut guard = self.work.state.lock();
                guard.tasks.push_back(task);
                self.work.num.fetch_add(1, SeqCst);
                return;
            }
            backoff.snooze();
        }
    }

    /// Pops a recycled fiber or creates a fresh one.
    fn acquire_fiber(&self) -> FiberHandle {
        let local = self.local_mut();
        if let Some(fiber) = local.idle_fibers.pop() {
            debug_assert_eq!(fiber.state(), State::Idle);
            return fiber;
        }
        local.next_fiber_id += 1;
        let fiber = Fiber::create(local.next_fiber_id, self as *const Worker);
        let handle = FiberHandle(&*fiber as *const Fiber);
        local.all_fibers.push(fiber);
        handle
    }

    // ---- plumbing --------------------------------------------------------

    /// Unlocks the work mutex from a fiber that was resumed with it held.
    ///
    /// # Safety
    /// The calling thread must own the (forgotten) lock.
    pub(crate) unsafe fn unlock_work(&self) {
        self.work.state.force_unlock();
    }

    /// Locks the work mutex and leaves it held for the other side of an
    /// imminent fiber switch.
    pub(crate) fn lock_work_for_switch(&self) {
        mem::forget(self.work.state.lock());
    }

    fn scheduler(&self) -> &SchedulerState {
        // SAFETY: the scheduler outlives its workers.
        unsafe { &*self.scheduler.get() }
    }

    #[allow(clippy::mut_from_ref)]
    fn local_mut(&self) -> &mut WorkerLocal {
        // SAFETY: WorkerLocal is only touched from the thread the worker
        // runs on, and no borrow is held across a fiber switch.
        unsafe { &mut *self.local.get() }
    }

    fn assert_work_counts(&self, state: &WorkState) {
        debug_assert_eq!(
            self.work.num.load(SeqCst),
            (state.tasks.len() + state.fibers.len()) as u64,
            "work.num out of sync"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fast_rand_progresses() {
        let mut rng = FastRand { x: 1 };
        let a = rng.next();
        let b = rng.next();
        let c = rng.next();
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(a, 0);
    }

    #[test]
    fn test_fast_rand_known_sequence() {
        // x=1: x ^= x<<13; x ^= x>>7; x ^= x<<17.
        let mut rng = FastRand { x: 1 };
        let mut x: u64 = 1;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        assert_eq!(rng.next(), x);
    }

    #[test]
    fn test_clock_seed_is_nonzero() {
        assert_ne!(FastRand::from_clock().x, 0);
    }
}
