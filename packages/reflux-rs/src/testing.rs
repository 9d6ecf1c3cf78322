//! Testing utilities for stores and sagas.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! reflux = { version = "0.1", features = ["testing"] }
//! ```
//!
//! # Philosophy
//!
//! Tests should wait for meaning, not time. Dispatch hands off
//! asynchronously, so assert on *what was observed* and use
//! [`wait_until`] as the synchronization point instead of a fixed sleep.
//!
//! ```ignore
//! use reflux::testing::{wait_until, CallRecorder};
//!
//! let recorder = CallRecorder::new();
//! store.register("view", "count", recorder.callback());
//!
//! store.dispatch(Counter::Add);
//!
//! assert!(wait_until(Duration::from_secs(1), || recorder.len() == 2));
//! assert_eq!(recorder.last(), Some(Ok(1)));
//! ```

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

/// How often [`wait_until`] re-checks its predicate.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Thread-safe recorder for callback invocations.
///
/// Clones share the same recording.
#[derive(Debug)]
pub struct CallRecorder<T> {
    calls: Arc<Mutex<Vec<T>>>,
}

impl<T> CallRecorder<T> {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<T>> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record one value.
    pub fn record(&self, value: T) {
        self.lock().push(value);
    }

    /// A callback that records every value it receives.
    pub fn callback(&self) -> impl Fn(T) + Send + Sync + 'static
    where
        T: Send + 'static,
    {
        let calls = self.calls.clone();
        move |value| calls.lock().unwrap_or_else(|e| e.into_inner()).push(value)
    }

    /// Number of recorded calls.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns true if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl<T: Clone> CallRecorder<T> {
    /// Copy of every recorded value, in call order.
    pub fn values(&self) -> Vec<T> {
        self.lock().clone()
    }

    /// The most recent value.
    pub fn last(&self) -> Option<T> {
        self.lock().last().cloned()
    }
}

impl<T> Clone for CallRecorder<T> {
    fn clone(&self) -> Self {
        Self {
            calls: self.calls.clone(),
        }
    }
}

impl<T> Default for CallRecorder<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Poll `predicate` until it holds or `timeout` elapses.
///
/// Blocks the calling thread. Returns whether the predicate held.
pub fn wait_until<F>(timeout: Duration, mut predicate: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(POLL_INTERVAL);
    }
}
