//! Completion handles: portable manual-reset events and a multi-object wait over them.
//!
//! A `CompletionEvent` behaves like an event-signaled overlapped completion object. It stays
//! signaled after `set` until somebody calls `reset`, and any number of threads may wait on it.
//! `wait_any` blocks on several events at once and reports the lowest signaled index, which is
//! the multiplexing primitive the readiness waiter is built on.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Parked `wait_any` caller. Registered on every event it waits for.
#[derive(Debug, Default)]
struct Waiter {
    fired: Mutex<bool>,
    cond: Condvar,
}

impl Waiter {
    fn wake(&self) {
        let mut fired = self.fired.lock();
        *fired = true;
        self.cond.notify_one();
    }

    /// Returns false when the deadline passed before a wake.
    fn park(&self, deadline: Option<Instant>) -> bool {
        let mut fired = self.fired.lock();
        while !*fired {
            match deadline {
                None => self.cond.wait(&mut fired),
                Some(deadline) => {
                    if self.cond.wait_until(&mut fired, deadline).timed_out() {
                        break;
                    }
                }
            }
        }
        std::mem::replace(&mut *fired, false)
    }
}

struct EventState {
    signaled: bool,
    waiters: Vec<Arc<Waiter>>,
}

struct Inner {
    state: Mutex<EventState>,
    cond: Condvar,
}

/// Manual-reset completion event. Clones share the same underlying object.
#[derive(Clone)]
pub struct CompletionEvent {
    inner: Arc<Inner>,
}

impl CompletionEvent {
    pub fn new() -> Self {
        Self::with_state(false)
    }

    pub fn with_state(signaled: bool) -> Self {
        CompletionEvent {
            inner: Arc::new(Inner {
                state: Mutex::new(EventState { signaled, waiters: Vec::new() }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Signal the event and wake every thread blocked on it.
    pub fn set(&self) {
        let mut state = self.inner.state.lock();
        state.signaled = true;
        self.inner.cond.notify_all();
        for waiter in &state.waiters {
            waiter.wake();
        }
    }

    pub fn reset(&self) {
        self.inner.state.lock().signaled = false;
    }

    /// Non-blocking check.
    pub fn is_set(&self) -> bool {
        self.inner.state.lock().signaled
    }

    /// Block until the event is signaled. `None` waits forever. Returns the signaled state.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = deadline_after(timeout);
        let mut state = self.inner.state.lock();
        while !state.signaled {
            match deadline {
                None => self.inner.cond.wait(&mut state),
                Some(deadline) => {
                    if self.inner.cond.wait_until(&mut state, deadline).timed_out() {
                        return state.signaled;
                    }
                }
            }
        }
        true
    }

    pub fn ptr_eq(&self, other: &CompletionEvent) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn register(&self, waiter: &Arc<Waiter>) -> bool {
        let mut state = self.inner.state.lock();
        if state.signaled {
            return true;
        }
        state.waiters.push(Arc::clone(waiter));
        false
    }

    fn unregister(&self, waiter: &Arc<Waiter>) {
        self.inner.state.lock().waiters.retain(|w| !Arc::ptr_eq(w, waiter));
    }
}

impl Default for CompletionEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CompletionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionEvent").field("signaled", &self.is_set()).finish()
    }
}

/// Block until one of `events` is signaled or `timeout` elapses.
///
/// Returns the lowest index among the signaled events, or `None` on timeout. `None` as the timeout
/// waits forever. Events are not reset by the wait.
pub fn wait_any(events: &[&CompletionEvent], timeout: Option<Duration>) -> Option<usize> {
    let deadline = deadline_after(timeout);
    let waiter = Arc::new(Waiter::default());

    loop {
        let mut registered = 0;
        let mut hit = None;
        for (i, event) in events.iter().enumerate() {
            if event.register(&waiter) {
                hit = Some(i);
                break;
            }
            registered = i + 1;
        }

        if hit.is_none() {
            waiter.park(deadline);
        }
        for event in &events[..registered] {
            event.unregister(&waiter);
        }
        if hit.is_some() {
            return hit;
        }

        if let Some(i) = events.iter().position(|e| e.is_set()) {
            return Some(i);
        }
        // Woken by an event that was reset again before we looked.
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return None;
            }
        }
    }
}

/// Convert a millisecond timeout where negative means "forever".
pub fn timeout_from_ms(timeout_ms: isize) -> Option<Duration> {
    if timeout_ms < 0 {
        None
    } else {
        Some(Duration::from_millis(timeout_ms as u64))
    }
}

fn deadline_after(timeout: Option<Duration>) -> Option<Instant> {
    timeout.and_then(|d| Instant::now().checked_add(d))
}
