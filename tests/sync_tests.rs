//! Tests for the synchronization primitives layered on fiber wait/notify:
//! events, wait groups, the fiber-aware condition variable, and the raw
//! fiber API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use weft::event::Mode;
use weft::{schedule, ConditionVariable, Event, Fiber, FiberHandle, Scheduler, WaitGroup};

fn with_scheduler(workers: usize, f: impl FnOnce()) {
    let mut scheduler = Scheduler::new();
    scheduler.set_worker_thread_count(workers);
    scheduler.bind();
    f();
    Scheduler::unbind();
}

#[test]
fn test_auto_event_releases_one_waiter_per_signal() {
    with_scheduler(2, || {
        let event = Event::new(Mode::Auto);
        let released = Arc::new(AtomicUsize::new(0));
        let wg = WaitGroup::new(3);

        for _ in 0..3 {
            let event = event.clone();
            let released = released.clone();
            let wg = wg.clone();
            schedule(move || {
                event.wait();
                released.fetch_add(1, Ordering::SeqCst);
                wg.done();
            });
        }

        event.signal();
        thread::sleep(Duration::from_millis(150));
        assert_eq!(released.load(Ordering::SeqCst), 1);

        event.signal();
        event.signal();
        wg.wait();
        assert_eq!(released.load(Ordering::SeqCst), 3);
    });
}

#[test]
fn test_manual_event_passes_waiters_through_once_signalled() {
    with_scheduler(2, || {
        let event = Event::with_state(Mode::Manual, true);
        let wg = WaitGroup::new(4);
        for _ in 0..4 {
            let event = event.clone();
            let wg = wg.clone();
            schedule(move || {
                event.wait();
                wg.done();
            });
        }
        wg.wait();
        assert!(event.is_signalled());
    });
}

#[test]
fn test_event_any_wakes_on_either_source() {
    with_scheduler(2, || {
        let a = Event::new(Mode::Manual);
        let b = Event::new(Mode::Manual);
        let either = Event::any(Mode::Manual, [&a, &b]);
        let wg = WaitGroup::new(1);

        {
            let either = either.clone();
            let wg = wg.clone();
            schedule(move || {
                either.wait();
                wg.done();
            });
        }

        b.signal();
        wg.wait();
        assert!(!a.is_signalled());
    });
}

#[test]
fn test_wait_group_over_many_tasks() {
    with_scheduler(4, || {
        let counter = Arc::new(AtomicUsize::new(0));
        let wg = WaitGroup::new(200);
        for _ in 0..200 {
            let counter = counter.clone();
            let wg = wg.clone();
            schedule(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                wg.done();
            });
        }
        wg.wait();
        assert_eq!(counter.load(Ordering::SeqCst), 200);
    });
}

#[test]
fn test_condvar_with_plain_threads() {
    // Without a bound scheduler the condvar falls back to OS blocking.
    let ready = Arc::new(Mutex::new(false));
    let cv = Arc::new(ConditionVariable::new());

    let waiters: Vec<_> = (0..2)
        .map(|_| {
            let ready = ready.clone();
            let cv = cv.clone();
            thread::spawn(move || {
                let mut guard = ready.lock();
                cv.wait(&mut guard, |ready| *ready);
            })
        })
        .collect();

    thread::sleep(Duration::from_millis(50));
    *ready.lock() = true;
    cv.notify_all();
    for waiter in waiters {
        waiter.join().unwrap();
    }
}

#[test]
fn test_condvar_wait_until_times_out_on_plain_thread() {
    let ready = Mutex::new(false);
    let cv = ConditionVariable::new();
    let mut guard = ready.lock();
    let start = Instant::now();
    let satisfied = cv.wait_until(&mut guard, start + Duration::from_millis(50), |ready| *ready);
    assert!(!satisfied);
    assert!(start.elapsed() >= Duration::from_millis(50));
}

#[test]
fn test_condvar_between_fibers() {
    with_scheduler(2, || {
        let state = Arc::new(Mutex::new(0usize));
        let cv = Arc::new(ConditionVariable::new());
        let wg = WaitGroup::new(2);

        {
            let (state, cv, wg) = (state.clone(), cv.clone(), wg.clone());
            schedule(move || {
                let mut guard = state.lock();
                cv.wait(&mut guard, |value| *value == 1);
                *guard = 2;
                cv.notify_all();
                drop(guard);
                wg.done();
            });
        }
        {
            let (state, cv, wg) = (state.clone(), cv.clone(), wg.clone());
            schedule(move || {
                {
                    let mut guard = state.lock();
                    *guard = 1;
                    cv.notify_all();
                    cv.wait(&mut guard, |value| *value == 2);
                }
                wg.done();
            });
        }

        wg.wait();
        assert_eq!(*state.lock(), 2);
    });
}

#[test]
fn test_fiber_wait_and_notify_directly() {
    // Exercises the core blocking primitive without the Event layer.
    with_scheduler(2, || {
        let flag = Arc::new(Mutex::new(false));
        let handle_slot: Arc<Mutex<Option<FiberHandle>>> = Arc::new(Mutex::new(None));
        let wg = WaitGroup::new(1);

        {
            let (flag, handle_slot, wg) = (flag.clone(), handle_slot.clone(), wg.clone());
            schedule(move || {
                let fiber = Fiber::current().expect("task must run on a fiber");
                *handle_slot.lock() = Some(fiber);
                let mut guard = flag.lock();
                fiber.wait(&mut guard, |flag| *flag);
                drop(guard);
                wg.done();
            });
        }

        // Wait for the task to publish its fiber handle.
        let fiber = loop {
            if let Some(fiber) = *handle_slot.lock() {
                break fiber;
            }
            thread::yield_now();
        };
        {
            let mut guard = flag.lock();
            *guard = true;
        }
        fiber.notify();
        wg.wait();
        assert!(fiber.id() > 0);
    });
}

#[test]
fn test_fiber_wait_until_reports_timeout() {
    with_scheduler(2, || {
        let wg = WaitGroup::new(1);
        let wg_clone = wg.clone();
        schedule(move || {
            let fiber = Fiber::current().unwrap();
            let lock = Mutex::new(());
            let mut guard = lock.lock();
            let satisfied =
                fiber.wait_until(&mut guard, Instant::now() + Duration::from_millis(30), |_| false);
            assert!(!satisfied);
            drop(guard);
            wg_clone.done();
        });
        wg.wait();
    });
}

#[test]
fn test_unguarded_wait_same_thread() {
    // Single-threaded mode makes same-thread notify deterministic: the
    // second task only runs once the first has suspended.
    with_scheduler(0, || {
        let handle_slot: Arc<Mutex<Option<FiberHandle>>> = Arc::new(Mutex::new(None));
        let resumed = Arc::new(AtomicUsize::new(0));
        let wg = WaitGroup::new(2);

        {
            let (handle_slot, resumed, wg) = (handle_slot.clone(), resumed.clone(), wg.clone());
            schedule(move || {
                let fiber = Fiber::current().unwrap();
                *handle_slot.lock() = Some(fiber);
                fiber.wait_unguarded();
                resumed.fetch_add(1, Ordering::SeqCst);
                wg.done();
            });
        }
        {
            let (handle_slot, wg) = (handle_slot.clone(), wg.clone());
            schedule(move || {
                let fiber = (*handle_slot.lock()).expect("first task ran before us");
                fiber.notify();
                wg.done();
            });
        }

        wg.wait();
        assert_eq!(resumed.load(Ordering::SeqCst), 1);
    });
}

#[test]
fn test_unguarded_wait_until_expires() {
    with_scheduler(0, || {
        let wg = WaitGroup::new(1);
        let wg_clone = wg.clone();
        schedule(move || {
            let fiber = Fiber::current().unwrap();
            let notified = fiber.wait_unguarded_until(Instant::now() + Duration::from_millis(20));
            assert!(!notified);
            wg_clone.done();
        });
        wg.wait();
    });
}

#[test]
fn test_fiber_current_is_none_off_scheduler() {
    assert!(Fiber::current().is_none());
}
