//! Callback re-entrancy guard. A `DebuggerCallbacks` implementation may be
//! invoked concurrently from the debug-event loop thread while the facade is
//! tearing the session down; this guards against calling into a callback
//! object that teardown has already started releasing. Grounded on
//! `debuggerworker.cc`'s callback dispatch.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

struct State {
    valid: AtomicBool,
    in_flight: AtomicU32,
    drained: Mutex<()>,
    condvar: Condvar,
}

/// Shared validity/in-flight-count tracker for one debug session's callback
/// object. Cloned cheaply (it's an `Arc`) wherever the event loop needs to
/// invoke a callback.
#[derive(Clone)]
pub struct CallbackContext {
    state: Arc<State>,
}

impl CallbackContext {
    pub fn new() -> Self {
        Self {
            state: Arc::new(State {
                valid: AtomicBool::new(true),
                in_flight: AtomicU32::new(0),
                drained: Mutex::new(()),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Acquires a guard for one callback invocation, or `None` if the
    /// context has already been invalidated.
    pub fn enter(&self) -> Option<CallbackGuard<'_>> {
        if !self.state.valid.load(Ordering::Acquire) {
            return None;
        }
        self.state.in_flight.fetch_add(1, Ordering::AcqRel);
        // Re-check: invalidate() may have flipped `valid` between the load
        // above and the increment.
        if !self.state.valid.load(Ordering::Acquire) {
            self.release();
            return None;
        }
        Some(CallbackGuard { context: self })
    }

    fn release(&self) {
        if self.state.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _lock = self.state.drained.lock().unwrap();
            self.state.condvar.notify_all();
        }
    }

    /// Marks the context invalid so no new callback invocations begin, then
    /// blocks until all in-flight invocations finish or `DRAIN_TIMEOUT`
    /// elapses. Returns `false` on timeout; teardown proceeds regardless,
    /// since it must never block indefinitely on a wedged callback.
    pub fn invalidate_and_drain(&self) -> bool {
        self.state.valid.store(false, Ordering::Release);

        let deadline = Instant::now() + DRAIN_TIMEOUT;
        let mut lock = self.state.drained.lock().unwrap();
        while self.state.in_flight.load(Ordering::Acquire) > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, timeout_result) = self
                .state
                .condvar
                .wait_timeout(lock, deadline - now)
                .unwrap();
            lock = guard;
            if timeout_result.timed_out() && self.state.in_flight.load(Ordering::Acquire) > 0 {
                return false;
            }
        }
        true
    }

    pub fn is_valid(&self) -> bool {
        self.state.valid.load(Ordering::Acquire)
    }

    pub fn in_flight_count(&self) -> u32 {
        self.state.in_flight.load(Ordering::Acquire)
    }
}

impl Default for CallbackContext {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard held for the duration of one callback invocation. Dropping it
/// releases the in-flight count and wakes any pending drain.
pub struct CallbackGuard<'a> {
    context: &'a CallbackContext,
}

impl Drop for CallbackGuard<'_> {
    fn drop(&mut self) {
        self.context.release();
    }
}

/// Registry of active `CallbackContext`s, keyed by debug session id, so a
/// global shutdown path can invalidate every session's callbacks without
/// threading a reference through every call site.
#[derive(Default)]
pub struct CallbackContextRegistry {
    contexts: Mutex<std::collections::HashMap<u32, CallbackContext>>,
}

impl CallbackContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session_id: u32) -> CallbackContext {
        let context = CallbackContext::new();
        self.contexts.lock().unwrap().insert(session_id, context.clone());
        context
    }

    pub fn unregister(&self, session_id: u32) -> Option<CallbackContext> {
        self.contexts.lock().unwrap().remove(&session_id)
    }

    pub fn get(&self, session_id: u32) -> Option<CallbackContext> {
        self.contexts.lock().unwrap().get(&session_id).cloned()
    }
}
