//! Fibers: stackful cooperative execution contexts pinned to one worker.
//!
//! Every task runs on a fiber, a coroutine with its own stack built on
//! `corosensei`. A fiber may suspend mid-task through [`FiberHandle::wait`]
//! without blocking the worker's OS thread; the worker runs other tasks and
//! fibers until the suspended fiber is notified or its deadline expires.
//! Fibers never migrate: the worker that created a fiber is the only one
//! that ever resumes it.

use std::cell::{Cell, UnsafeCell};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::time::Instant;

use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};
use parking_lot::MutexGuard;

use crate::scheduler::FIBER_STACK_SIZE;
use crate::task::Task;
use crate::worker::{SendPtr, Worker};

/// Input passed into a fiber coroutine when its worker resumes it.
pub(crate) enum FiberInput {
    /// Begin executing a task on this fiber.
    Run(Task),
    /// Continue a fiber suspended inside a wait.
    Resume,
}

/// Why control returned from a fiber coroutine to the worker's loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum FiberYield {
    /// The fiber blocked inside a wait.
    Suspended,
    /// The task completed; the fiber can be recycled.
    Finished,
}

/// Scheduling state of a fiber. Guarded by the owning worker's work mutex.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum State {
    /// Unused, parked in the worker's idle pool awaiting a task.
    Idle,
    /// Blocked in a wait with no deadline.
    Yielded,
    /// Blocked in a wait with a deadline; a member of the waiting set.
    Waiting,
    /// Ready to run; a member of the worker's ready-fiber queue.
    Queued,
    /// Currently executing on its worker.
    Running,
}

type FiberCoroutine = Coroutine<FiberInput, FiberYield, ()>;

/// A stackful cooperative coroutine owned by a single worker.
///
/// User code interacts with fibers through [`FiberHandle`], obtained from
/// [`Fiber::current`].
pub struct Fiber {
    id: u32,
    /// The worker that created this fiber. Valid for the fiber's lifetime,
    /// which ends with the worker's.
    owner: *const Worker,
    /// Guarded by the owner's work mutex.
    state: Cell<State>,
    /// None for a worker's main fiber, which runs on the host thread's own
    /// stack.
    coroutine: Option<UnsafeCell<FiberCoroutine>>,
    /// Set by the coroutine on first entry; used to suspend from
    /// arbitrarily deep in user code.
    yielder: Cell<*const Yielder<FiberInput, FiberYield>>,
}

impl Fiber {
    /// Creates a fiber with a freshly allocated stack of
    /// [`FIBER_STACK_SIZE`] bytes.
    pub(crate) fn create(id: u32, owner: *const Worker) -> Box<Fiber> {
        let mut fiber = Box::new(Fiber {
            id,
            owner,
            state: Cell::new(State::Idle),
            coroutine: None,
            yielder: Cell::new(ptr::null()),
        });
        let handle = FiberHandle(&*fiber as *const Fiber);
        let worker = SendPtr::new(owner);
        let stack = DefaultStack::new(FIBER_STACK_SIZE).expect("failed to allocate fiber stack");
        let coroutine = Coroutine::with_stack(stack, move |yielder, input: FiberInput| {
            fiber_entry(yielder, input, handle, worker)
        });
        fiber.coroutine = Some(UnsafeCell::new(coroutine));
        fiber
    }

    /// Wraps the calling thread's own stack as a worker's main fiber.
    pub(crate) fn create_from_current_thread(id: u32, owner: *const Worker) -> Box<Fiber> {
        Box::new(Fiber {
            id,
            owner,
            state: Cell::new(State::Running),
            coroutine: None,
            yielder: Cell::new(ptr::null()),
        })
    }

    /// The fiber executing on the calling thread, or None when the thread
    /// has no bound worker.
    pub fn current() -> Option<FiberHandle> {
        let worker = Worker::current_on_thread()?;
        // SAFETY: the pointer comes from this thread's worker binding,
        // which is cleared before the worker is destroyed.
        unsafe { (*worker).current_fiber() }
    }
}

/// Runs every task assigned to this fiber until the worker drops it.
fn fiber_entry(
    yielder: &Yielder<FiberInput, FiberYield>,
    mut input: FiberInput,
    fiber: FiberHandle,
    worker: SendPtr<Worker>,
) {
    // SAFETY: the fiber and its worker both outlive this coroutine; the
    // worker joins its thread before either is dropped.
    let worker = unsafe { &*worker.get() };
    unsafe { (*fiber.0).yielder.set(yielder as *const _) };
    loop {
        let task = match input {
            FiberInput::Run(task) => task,
            FiberInput::Resume => panic!("idle fiber resumed without a task"),
        };
        // The worker holds the work mutex across the switch; release it
        // before entering user code.
        unsafe { worker.unlock_work() };
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| task.run())) {
            tracing::error!(
                fiber = fiber.id(),
                "task panicked: {}",
                panic_message(&payload)
            );
        }
        // Hand control back to the scheduling loop, with the mutex again
        // held across the switch.
        worker.lock_work_for_switch();
        input = yielder.suspend(FiberYield::Finished);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic payload"
    }
}

/// A copyable reference to a fiber.
///
/// Handles stay valid for as long as the scheduler that created the fiber
/// is alive, so synchronization primitives may store them and call
/// [`notify`](FiberHandle::notify) from any thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FiberHandle(pub(crate) *const Fiber);

// SAFETY: all mutation behind the pointer is either guarded by the owning
// worker's work mutex (state, waiting-set membership) or confined to the
// owning thread (the coroutine itself).
unsafe impl Send for FiberHandle {}
unsafe impl Sync for FiberHandle {}

impl FiberHandle {
    fn fiber(&self) -> &Fiber {
        // SAFETY: handles are only reachable while the owning worker, and
        // therefore the fiber, is alive.
        unsafe { &*self.0 }
    }

    fn owner(&self) -> &Worker {
        // SAFETY: as above; the owner outlives its fibers.
        unsafe { &*self.fiber().owner }
    }

    /// The worker-unique identifier of this fiber. The main fiber of each
    /// worker is 0; task fibers count up from 1.
    pub fn id(&self) -> u32 {
        self.fiber().id
    }

    /// Suspends the current fiber until `pred` returns true.
    ///
    /// `guard` must lock the data `pred` reads; it is released just before
    /// the fiber suspends and re-acquired before this returns, and `pred`
    /// is only ever evaluated while it is held. Wakeups are driven by
    /// [`notify`](FiberHandle::notify): each one re-checks `pred` and
    /// re-suspends the fiber if it is still false.
    ///
    /// Panics if `self` is not the currently executing fiber.
    pub fn wait<T: ?Sized>(&self, guard: &mut MutexGuard<'_, T>, pred: impl FnMut(&mut T) -> bool) {
        assert_eq!(
            Fiber::current(),
            Some(*self),
            "wait() must be called from the currently executing fiber"
        );
        self.owner().wait(*self, guard, None, pred);
    }

    /// As [`wait`](FiberHandle::wait), but gives up at `deadline`.
    ///
    /// Returns the final value of `pred`: false means the deadline passed
    /// with the predicate still unsatisfied.
    pub fn wait_until<T: ?Sized>(
        &self,
        guard: &mut MutexGuard<'_, T>,
        deadline: Instant,
        pred: impl FnMut(&mut T) -> bool,
    ) -> bool {
        assert_eq!(
            Fiber::current(),
            Some(*self),
            "wait_until() must be called from the currently executing fiber"
        );
        self.owner().wait(*self, guard, Some(deadline), pred)
    }

    /// Suspends the current fiber until [`notify`](FiberHandle::notify) is
    /// called, with no lock or predicate.
    ///
    /// Without a predicate there is no protection against a notify that
    /// lands before the fiber suspends, so this is only reliable when wait
    /// and notify happen on the same thread.
    pub fn wait_unguarded(&self) {
        assert_eq!(
            Fiber::current(),
            Some(*self),
            "wait_unguarded() must be called from the currently executing fiber"
        );
        self.owner().wait_detached(*self, None);
    }

    /// As [`wait_unguarded`](FiberHandle::wait_unguarded), but wakes at
    /// `deadline` if not notified first. Returns false on timeout.
    ///
    /// Carries the same same-thread restriction as `wait_unguarded`.
    pub fn wait_unguarded_until(&self, deadline: Instant) -> bool {
        assert_eq!(
            Fiber::current(),
            Some(*self),
            "wait_unguarded_until() must be called from the currently executing fiber"
        );
        self.owner().wait_detached(*self, Some(deadline))
    }

    /// Makes the fiber eligible to run again.
    ///
    /// A yielded or waiting fiber moves to its worker's ready queue; a
    /// queued or running fiber is left alone. Legal from any thread.
    pub fn notify(&self) {
        self.owner().enqueue_fiber(*self);
    }

    pub(crate) fn state(&self) -> State {
        self.fiber().state.get()
    }

    pub(crate) fn set_state(&self, state: State) {
        self.fiber().state.set(state);
    }

    pub(crate) fn is_main(&self) -> bool {
        self.fiber().coroutine.is_none()
    }

    /// Resumes the fiber's coroutine and reports why control came back.
    ///
    /// # Safety
    /// Must only be called by the owning worker's thread, with no other
    /// resume of the same fiber in progress.
    pub(crate) unsafe fn resume(&self, input: FiberInput) -> FiberYield {
        let fiber = self.fiber();
        let coroutine = fiber
            .coroutine
            .as_ref()
            .expect("cannot resume a worker's main fiber");
        match (*coroutine.get()).resume(input) {
            CoroutineResult::Yield(reason) => reason,
            CoroutineResult::Return(()) => unreachable!("fiber coroutines never return"),
        }
    }

    /// Yields from inside the fiber back to the worker's scheduling loop.
    /// Returns once the worker resumes the fiber.
    pub(crate) fn suspend_current(&self) -> FiberInput {
        let yielder = self.fiber().yielder.get();
        assert!(!yielder.is_null(), "fiber suspended before its first task");
        // SAFETY: the yielder is valid while the coroutine is live, and
        // suspend_current is only reached from code running on it.
        unsafe { (*yielder).suspend(FiberYield::Suspended) }
    }
}
