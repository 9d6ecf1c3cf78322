//! Saga monitor: broadcast dispatch across running effects.
//!
//! Every running saga effect that wants to observe actions registers its own
//! dispatcher here. [`SagaMonitor::dispatch`] then fans an action out to all
//! of them.
//!
//! # Guarantees
//!
//! One exclusive lock covers `add_dispatcher`, `remove_dispatcher`, and the
//! read-then-call sequence of `dispatch`:
//!
//! - A dispatcher is never invoked after its removal call has returned
//! - A dispatcher whose registration returned before a broadcast began is
//!   invoked by that broadcast
//!
//! Dispatchers are called in insertion order, but callers must not rely on it.
//!
//! Dispatchers run under the lock, so they must be quick hand-offs (for
//! example, pushing into a channel) and must not call back into the monitor.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use indexmap::IndexMap;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::awaitable::AwaitableJob;

/// A function submitting an action into the system.
pub type Dispatcher<A> = Arc<dyn Fn(A) -> AwaitableJob<()> + Send + Sync>;

/// Lock-guarded registry of saga dispatchers.
pub struct SagaMonitor<A> {
    dispatchers: Mutex<IndexMap<Uuid, Dispatcher<A>>>,
}

impl<A: Clone> SagaMonitor<A> {
    /// Create an empty monitor.
    pub fn new() -> Self {
        Self {
            dispatchers: Mutex::new(IndexMap::new()),
        }
    }

    /// A fresh id suitable for [`SagaMonitor::add_dispatcher`].
    pub fn next_id(&self) -> Uuid {
        Uuid::new_v4()
    }

    fn lock(&self) -> MutexGuard<'_, IndexMap<Uuid, Dispatcher<A>>> {
        match self.dispatchers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("saga monitor lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Register `dispatcher` under `id`, replacing any previous one.
    pub fn add_dispatcher(&self, id: Uuid, dispatcher: Dispatcher<A>) {
        self.lock().insert(id, dispatcher);
        debug!(%id, "saga dispatcher added");
    }

    /// Remove the dispatcher under `id`. No-op if absent.
    pub fn remove_dispatcher(&self, id: Uuid) {
        if self.lock().shift_remove(&id).is_some() {
            debug!(%id, "saga dispatcher removed");
        }
    }

    /// Invoke every registered dispatcher once with `action`.
    ///
    /// Returns an already-resolved empty job: the broadcast is fire-and-forget.
    pub fn dispatch(&self, action: A) -> AwaitableJob<()> {
        let dispatchers = self.lock();
        for dispatcher in dispatchers.values() {
            // Each dispatcher's own job is ignored
            let _ = dispatcher(action.clone());
        }
        trace!(count = dispatchers.len(), "saga broadcast delivered");
        AwaitableJob::empty()
    }

    /// Number of registered dispatchers.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns true if no dispatchers are registered.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl<A: Clone> Default for SagaMonitor<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> fmt::Debug for SagaMonitor<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self
            .dispatchers
            .lock()
            .map(|d| d.len())
            .unwrap_or_default();
        f.debug_struct("SagaMonitor")
            .field("dispatcher_count", &count)
            .finish()
    }
}
