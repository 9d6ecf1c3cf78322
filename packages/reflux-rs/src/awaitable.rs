//! One-shot jobs whose result can be retrieved with a blocking wait.
//!
//! An [`AwaitableJob`] bridges callback-driven or async work into a plain
//! blocking call. There are three kinds:
//!
//! - **Empty**: always fails with [`RefluxError::Unavailable`]
//! - **Just**: always succeeds immediately with a known value
//! - **Async**: *hot*, the work starts at construction time (not on the
//!   first wait) and its result is cached once it resolves
//!
//! # Timeouts Do Not Cancel
//!
//! [`AwaitableJob::wait_timeout`] gives up waiting, nothing more. The work
//! keeps running and its eventual result is still cached for later waiters.
//!
//! # Example
//!
//! ```ignore
//! use reflux::AwaitableJob;
//!
//! let job = AwaitableJob::spawn(runtime.handle(), async {
//!     Ok(fetch_profile().await?)
//! });
//!
//! match job.wait_timeout(Duration::from_secs(2)) {
//!     Ok(profile) => render(profile),
//!     Err(e) if e.is_timed_out() => show_spinner(),
//!     Err(e) => show_error(e),
//! }
//! ```

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::{trace, warn};

use crate::error::{RefluxError, Result};

/// Shared cell holding the cached result and its completion signal.
struct Latch<T> {
    result: Mutex<Option<Result<T>>>,
    resolved: Condvar,
}

impl<T> Latch<T> {
    fn new() -> Self {
        Self {
            result: Mutex::new(None),
            resolved: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Result<T>>> {
        match self.result.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("awaitable latch was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Store the result if none is cached yet. Later results are ignored.
    fn resolve(&self, result: Result<T>) {
        let mut slot = self.lock();
        if slot.is_none() {
            *slot = Some(result);
            self.resolved.notify_all();
        }
    }
}

/// The one-shot completer handed to an async block.
///
/// Completing consumes the handle, so a job resolves at most once.
/// Dropping it without completing resolves the job with
/// [`RefluxError::Unavailable`], so waiters never hang on abandoned work.
pub struct Completion<T> {
    latch: Option<Arc<Latch<T>>>,
}

impl<T> Completion<T> {
    /// Resolve the job with a result.
    pub fn complete(mut self, result: Result<T>) {
        if let Some(latch) = self.latch.take() {
            latch.resolve(result);
        }
    }

    /// Resolve the job successfully.
    pub fn succeed(self, value: T) {
        self.complete(Ok(value));
    }

    /// Resolve the job with a failure.
    pub fn fail(self, err: RefluxError) {
        self.complete(Err(err));
    }
}

impl<T> Drop for Completion<T> {
    fn drop(&mut self) {
        if let Some(latch) = self.latch.take() {
            trace!("completion dropped before resolving");
            latch.resolve(Err(RefluxError::Unavailable));
        }
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("pending", &self.latch.is_some())
            .finish()
    }
}

enum JobKind<T> {
    Empty,
    Just(T),
    Async(Arc<Latch<T>>),
}

/// A job whose result can be retrieved by blocking the calling thread.
///
/// Once resolved, the result never changes: every waiter, concurrent or
/// later, receives a clone of the same cached value.
pub struct AwaitableJob<T> {
    kind: JobKind<T>,
}

impl<T> AwaitableJob<T> {
    /// A job that has no result. Every wait fails with `Unavailable`.
    pub fn empty() -> Self {
        Self {
            kind: JobKind::Empty,
        }
    }

    /// A job that is already resolved with `value`.
    pub fn just(value: T) -> Self {
        Self {
            kind: JobKind::Just(value),
        }
    }

    /// Start a callback-driven job.
    ///
    /// `block` runs immediately on the calling thread and receives the
    /// [`Completion`] it must eventually resolve, from any thread.
    pub fn from_callback<F>(block: F) -> Self
    where
        F: FnOnce(Completion<T>),
    {
        let latch = Arc::new(Latch::new());
        block(Completion {
            latch: Some(latch.clone()),
        });
        Self {
            kind: JobKind::Async(latch),
        }
    }

    /// Start a future on the given execution context.
    ///
    /// The future is spawned before this returns. If the runtime shuts down
    /// before the future finishes, the job resolves with `Unavailable`.
    pub fn spawn<F>(handle: &Handle, future: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        Self::from_callback(|completion| {
            handle.spawn(async move {
                completion.complete(future.await);
            });
        })
    }

    /// Returns true once a result is available without waiting.
    pub fn is_resolved(&self) -> bool {
        match &self.kind {
            JobKind::Empty | JobKind::Just(_) => true,
            JobKind::Async(latch) => latch.lock().is_some(),
        }
    }
}

impl<T: Clone> AwaitableJob<T> {
    /// Block until the job resolves and return its cached result.
    pub fn wait(&self) -> Result<T> {
        match &self.kind {
            JobKind::Empty => Err(RefluxError::Unavailable),
            JobKind::Just(value) => Ok(value.clone()),
            JobKind::Async(latch) => {
                let mut slot = latch.lock();
                loop {
                    if let Some(result) = slot.as_ref() {
                        return result.clone();
                    }
                    slot = match latch.resolved.wait(slot) {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                }
            }
        }
    }

    /// Block for at most `timeout`.
    ///
    /// Fails with [`RefluxError::TimedOut`] if the job is still pending when
    /// the timeout elapses. The work itself keeps running.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<T> {
        let JobKind::Async(latch) = &self.kind else {
            return self.wait();
        };

        let slot = latch.lock();
        let (slot, _) = match latch
            .resolved
            .wait_timeout_while(slot, timeout, |slot| slot.is_none())
        {
            Ok(pair) => pair,
            Err(poisoned) => poisoned.into_inner(),
        };

        match slot.as_ref() {
            Some(result) => result.clone(),
            None => {
                trace!(?timeout, "awaitable wait timed out");
                Err(RefluxError::timed_out(timeout))
            }
        }
    }

    /// Return the cached result if the job has resolved, without blocking.
    pub fn try_result(&self) -> Option<Result<T>> {
        match &self.kind {
            JobKind::Empty => Some(Err(RefluxError::Unavailable)),
            JobKind::Just(value) => Some(Ok(value.clone())),
            JobKind::Async(latch) => latch.lock().clone(),
        }
    }
}

impl<T: Clone> Clone for AwaitableJob<T> {
    fn clone(&self) -> Self {
        let kind = match &self.kind {
            JobKind::Empty => JobKind::Empty,
            JobKind::Just(value) => JobKind::Just(value.clone()),
            JobKind::Async(latch) => JobKind::Async(latch.clone()),
        };
        Self { kind }
    }
}

impl<T> fmt::Debug for AwaitableJob<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            JobKind::Empty => "empty",
            JobKind::Just(_) => "just",
            JobKind::Async(_) => "async",
        };
        f.debug_struct("AwaitableJob")
            .field("kind", &kind)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}
