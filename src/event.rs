//! Event: block until a signal is raised.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::condvar::ConditionVariable;

/// Reset behaviour of an [`Event`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// The signal resets when a wait() returns: one signal() unblocks a
    /// single (possibly future) wait().
    Auto,
    /// The signal persists until [`clear`](Event::clear); while signalled,
    /// every wait() passes straight through.
    Manual,
}

struct EventState {
    signalled: bool,
    /// Downstream events created by [`Event::any`], signalled alongside
    /// this one.
    deps: Vec<Arc<Shared>>,
}

struct Shared {
    mutex: Mutex<EventState>,
    cv: ConditionVariable,
    mode: Mode,
}

impl Shared {
    fn signal(&self) {
        let deps;
        {
            let mut state = self.mutex.lock();
            if state.signalled {
                return;
            }
            state.signalled = true;
            match self.mode {
                Mode::Auto => self.cv.notify_one(),
                Mode::Manual => self.cv.notify_all(),
            }
            deps = state.deps.clone();
        }
        for dep in deps {
            dep.signal();
        }
    }
}

/// A synchronization primitive that blocks fibers until signalled.
///
/// Cloning produces another handle to the same event.
#[derive(Clone)]
pub struct Event {
    shared: Arc<Shared>,
}

impl Event {
    /// Creates an unsignalled event with the given reset mode.
    pub fn new(mode: Mode) -> Self {
        Event::with_state(mode, false)
    }

    /// Creates an event with an explicit initial signal state.
    pub fn with_state(mode: Mode, signalled: bool) -> Self {
        Event {
            shared: Arc::new(Shared {
                mutex: Mutex::new(EventState {
                    signalled,
                    deps: Vec::new(),
                }),
                cv: ConditionVariable::new(),
                mode,
            }),
        }
    }

    /// Signals the event, unblocking waiters per the event's [`Mode`].
    pub fn signal(&self) {
        self.shared.signal();
    }

    /// Clears the signalled state.
    pub fn clear(&self) {
        self.shared.mutex.lock().signalled = false;
    }

    /// Blocks until the event is signalled. With [`Mode::Auto`], clears
    /// the signal on return.
    pub fn wait(&self) {
        let mut lock = self.shared.mutex.lock();
        self.shared.cv.wait(&mut lock, |state| state.signalled);
        if self.shared.mode == Mode::Auto {
            lock.signalled = false;
        }
    }

    /// Blocks until the event is signalled or `deadline` passes. Returns
    /// false on timeout. With [`Mode::Auto`], a successful wait clears the
    /// signal.
    pub fn wait_until(&self, deadline: Instant) -> bool {
        let mut lock = self.shared.mutex.lock();
        if !self
            .shared
            .cv
            .wait_until(&mut lock, deadline, |state| state.signalled)
        {
            return false;
        }
        if self.shared.mode == Mode::Auto {
            lock.signalled = false;
        }
        true
    }

    /// Returns the signalled state, consuming it with [`Mode::Auto`].
    pub fn test(&self) -> bool {
        let mut lock = self.shared.mutex.lock();
        if !lock.signalled {
            return false;
        }
        if self.shared.mode == Mode::Auto {
            lock.signalled = false;
        }
        true
    }

    /// Returns the signalled state without consuming it. The state may
    /// change the moment this returns.
    pub fn is_signalled(&self) -> bool {
        self.shared.mutex.lock().signalled
    }

    /// Returns an event that is signalled whenever any of `events` is.
    pub fn any<'a>(mode: Mode, events: impl IntoIterator<Item = &'a Event>) -> Event {
        let any = Event::new(mode);
        for event in events {
            let mut state = event.shared.mutex.lock();
            if state.signalled {
                any.shared.signal();
            }
            state.deps.push(any.shared.clone());
        }
        any
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_event_stays_signalled() {
        let event = Event::new(Mode::Manual);
        assert!(!event.is_signalled());
        event.signal();
        assert!(event.test());
        assert!(event.test());
        event.clear();
        assert!(!event.test());
    }

    #[test]
    fn test_auto_event_consumes_signal() {
        let event = Event::new(Mode::Auto);
        event.signal();
        assert!(event.test());
        assert!(!event.test());
    }

    #[test]
    fn test_initial_state() {
        let event = Event::with_state(Mode::Manual, true);
        assert!(event.is_signalled());
    }

    #[test]
    fn test_any_observes_pre_signalled_source() {
        let a = Event::new(Mode::Manual);
        let b = Event::new(Mode::Manual);
        a.signal();
        let any = Event::any(Mode::Manual, [&a, &b]);
        assert!(any.is_signalled());
    }

    #[test]
    fn test_any_follows_later_signal() {
        let a = Event::new(Mode::Manual);
        let b = Event::new(Mode::Manual);
        let any = Event::any(Mode::Manual, [&a, &b]);
        assert!(!any.is_signalled());
        b.signal();
        assert!(any.is_signalled());
    }
}
