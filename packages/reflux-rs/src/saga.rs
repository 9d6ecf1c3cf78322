//! Sagas: long-running side effects driven by dispatched actions.
//!
//! A saga effect is a function from [`SagaInput`] to a pipeline of actions.
//! The [`SagaMiddleware`] builds the input, runs every effect on the saga
//! scheduler, and dispatches whatever the effects emit.
//!
//! ```text
//! middleware.dispatch(action)
//!     ├─► store.dispatch(action)          (reducer + router)
//!     └─► monitor.dispatch(action)        (every input.actions() stream)
//!                                              │
//!                          effect pipeline ◄───┘
//!                                 │
//!                                 └─► emitted action ─► middleware.dispatch
//! ```
//!
//! # Example
//!
//! ```ignore
//! use reflux::{SagaInput, SagaMiddleware, SagaOutput};
//!
//! fn search(input: SagaInput<AppState, AppAction>) -> SagaOutput<AppAction, AppAction> {
//!     let worker = input.clone();
//!     input.take_latest(
//!         |action| match action {
//!             AppAction::Query(text) => Some(text),
//!             _ => None,
//!         },
//!         move |text| worker.call(async move {
//!             Ok(AppAction::Results(run_query(&text).await?))
//!         }),
//!     )
//! }
//!
//! let sagas = SagaMiddleware::builder(store.clone()).build()?;
//! sagas.run(search);
//! sagas.dispatch(AppAction::Query("rust".into()));
//! ```

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use async_stream::stream;
use futures::stream::{self as fstream, Stream};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::awaitable::AwaitableJob;
use crate::error::{RefluxError, Result};
use crate::monitor::{Dispatcher, SagaMonitor};
use crate::pipeline::{SagaOutput, SagaSubscription};
use crate::scheduler::{SerialScheduler, DEFAULT_SCHEDULER_NAME};
use crate::state::StateTree;
use crate::store::{Action, Store};

// =============================================================================
// Input
// =============================================================================

/// Everything a saga effect may use.
pub struct SagaInput<S, A> {
    dispatch: Dispatcher<A>,
    last_state: Arc<dyn Fn() -> S + Send + Sync>,
    monitor: Arc<SagaMonitor<A>>,
    scheduler: Handle,
}

impl<S, A> SagaInput<S, A>
where
    S: Send + 'static,
    A: Clone + Send + 'static,
{
    /// Assemble an input from its parts.
    pub fn new(
        dispatch: Dispatcher<A>,
        last_state: Arc<dyn Fn() -> S + Send + Sync>,
        monitor: Arc<SagaMonitor<A>>,
        scheduler: Handle,
    ) -> Self {
        Self {
            dispatch,
            last_state,
            monitor,
            scheduler,
        }
    }

    /// Submit an action into the system.
    pub fn dispatch(&self, action: A) -> AwaitableJob<()> {
        (self.dispatch)(action)
    }

    /// The dispatcher itself, for handing to other components.
    pub fn dispatcher(&self) -> Dispatcher<A> {
        self.dispatch.clone()
    }

    /// Snapshot of the store's latest state.
    pub fn last_state(&self) -> S {
        (self.last_state)()
    }

    /// The monitor shared by every effect of this middleware.
    pub fn monitor(&self) -> &Arc<SagaMonitor<A>> {
        &self.monitor
    }

    /// The saga execution context.
    pub fn scheduler(&self) -> &Handle {
        &self.scheduler
    }

    // =========================================================================
    // Sources
    // =========================================================================

    /// Wrap an arbitrary stream as a pipeline on this input.
    pub fn output<T, St>(&self, source: St) -> SagaOutput<T, A>
    where
        T: Send + 'static,
        St: Stream<Item = Result<T>> + Send + 'static,
    {
        SagaOutput::new(source, self.dispatch.clone(), self.scheduler.clone())
    }

    /// A pipeline yielding one value.
    pub fn just<T: Send + 'static>(&self, value: T) -> SagaOutput<T, A> {
        SagaOutput::just(value, self.dispatch.clone(), self.scheduler.clone())
    }

    /// A pipeline yielding each value in order.
    pub fn from_values<T, I>(&self, values: I) -> SagaOutput<T, A>
    where
        T: Send + 'static,
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        SagaOutput::from_values(values, self.dispatch.clone(), self.scheduler.clone())
    }

    /// A pipeline that completes without yielding.
    pub fn empty<T: Send + 'static>(&self) -> SagaOutput<T, A> {
        SagaOutput::empty(self.dispatch.clone(), self.scheduler.clone())
    }

    /// Every action dispatched through the monitor from now on.
    ///
    /// The stream registers its own dispatcher with the monitor immediately,
    /// so no action is missed between this call and consumption. The
    /// dispatcher is removed when the pipeline is dropped or disposed.
    pub fn actions(&self) -> SagaOutput<A, A> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = self.monitor.next_id();
        let forward: Dispatcher<A> = Arc::new(move |action: A| -> AwaitableJob<()> {
            // The receiver is gone only while the registration is being dropped
            let _ = tx.send(action);
            AwaitableJob::empty()
        });
        self.monitor.add_dispatcher(id, forward);

        let registration = Registration {
            monitor: self.monitor.clone(),
            id,
        };
        let source = stream! {
            let _registration = registration;
            while let Some(action) = rx.recv().await {
                yield Ok(action);
            }
        };
        self.output(source)
    }

    // =========================================================================
    // Effect helpers
    // =========================================================================

    /// Run `worker` for every matching action, one worker at a time.
    ///
    /// `pattern` selects the actions to handle and extracts their payload.
    /// Workers are concatenated: a new match waits for the current worker to
    /// finish.
    pub fn take_every<T, U, P, W>(&self, pattern: P, worker: W) -> SagaOutput<U, A>
    where
        T: Send + 'static,
        U: Send + 'static,
        P: FnMut(A) -> Option<T> + Send + 'static,
        W: FnMut(T) -> SagaOutput<U, A> + Send + 'static,
    {
        self.actions().filter_map(pattern).flat_map(worker)
    }

    /// Run `worker` for the latest matching action, cancelling the previous one.
    pub fn take_latest<T, U, P, W>(&self, pattern: P, worker: W) -> SagaOutput<U, A>
    where
        T: Send + 'static,
        U: Send + 'static,
        P: FnMut(A) -> Option<T> + Send + 'static,
        W: FnMut(T) -> SagaOutput<U, A> + Send + 'static,
    {
        self.actions().filter_map(pattern).switch_map(worker)
    }

    /// Read from the latest state when the pipeline is consumed.
    pub fn select<V, F>(&self, selector: F) -> SagaOutput<V, A>
    where
        V: Send + 'static,
        F: FnOnce(&S) -> V + Send + 'static,
    {
        let last_state = self.last_state.clone();
        self.output(fstream::once(async move { Ok(selector(&last_state())) }))
    }

    /// Emit `action`. Effect emissions are dispatched by the middleware.
    pub fn put(&self, action: A) -> SagaOutput<A, A> {
        self.just(action)
    }

    /// Run `future` when the pipeline is consumed, yielding its result.
    ///
    /// Failures surface through `anyhow` and become
    /// [`RefluxError::Upstream`].
    pub fn call<T, F>(&self, future: F) -> SagaOutput<T, A>
    where
        T: Send + 'static,
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.output(fstream::once(async move {
            future.await.map_err(RefluxError::upstream)
        }))
    }
}

impl<S, A> Clone for SagaInput<S, A> {
    fn clone(&self) -> Self {
        Self {
            dispatch: self.dispatch.clone(),
            last_state: self.last_state.clone(),
            monitor: self.monitor.clone(),
            scheduler: self.scheduler.clone(),
        }
    }
}

impl<S, A> fmt::Debug for SagaInput<S, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SagaInput").finish_non_exhaustive()
    }
}

/// Removes an `actions()` dispatcher from its monitor when dropped.
struct Registration<A: Clone> {
    monitor: Arc<SagaMonitor<A>>,
    id: Uuid,
}

impl<A: Clone> Drop for Registration<A> {
    fn drop(&mut self) {
        self.monitor.remove_dispatcher(self.id);
    }
}

// =============================================================================
// Effects
// =============================================================================

/// A saga effect: turns its input into a pipeline of actions to dispatch.
pub trait SagaEffect<S, A>: Send + Sync + 'static {
    /// Build the effect's pipeline.
    fn run(&self, input: SagaInput<S, A>) -> SagaOutput<A, A>;
}

impl<S, A, F> SagaEffect<S, A> for F
where
    F: Fn(SagaInput<S, A>) -> SagaOutput<A, A> + Send + Sync + 'static,
{
    fn run(&self, input: SagaInput<S, A>) -> SagaOutput<A, A> {
        self(input)
    }
}

// =============================================================================
// Middleware
// =============================================================================

/// Connects a store to a set of running saga effects.
///
/// Dropping the middleware disposes every effect it started.
pub struct SagaMiddleware<S: StateTree, A: Clone> {
    store: Store<S, A>,
    monitor: Arc<SagaMonitor<A>>,
    scheduler: Handle,
    running: Mutex<Vec<SagaSubscription>>,
    // Keeps the default scheduler's thread alive.
    _serial: Option<SerialScheduler>,
}

impl<S, A> SagaMiddleware<S, A>
where
    S: StateTree,
    A: Action + Clone,
{
    /// Start building a middleware for `store`.
    pub fn builder(store: Store<S, A>) -> SagaMiddlewareBuilder<S, A> {
        SagaMiddlewareBuilder::new(store)
    }

    /// Dispatch to the store, then broadcast to the monitor.
    pub fn dispatch(&self, action: A) -> AwaitableJob<()> {
        self.store.dispatch(action.clone());
        self.monitor.dispatch(action)
    }

    /// A fresh input bound to this middleware.
    pub fn input(&self) -> SagaInput<S, A> {
        let store = self.store.clone();
        let monitor = self.monitor.clone();
        let dispatch: Dispatcher<A> = Arc::new(move |action: A| -> AwaitableJob<()> {
            store.dispatch(action.clone());
            monitor.dispatch(action)
        });

        let reader = self.store.clone();
        SagaInput::new(
            dispatch,
            Arc::new(move || reader.last_state()),
            self.monitor.clone(),
            self.scheduler.clone(),
        )
    }

    /// Start an effect. Its emitted actions are dispatched.
    pub fn run<E>(&self, effect: E) -> SagaSubscription
    where
        E: SagaEffect<S, A>,
    {
        let subscription = effect.run(self.input()).subscribe_dispatch();
        let mut running = self.running();
        running.retain(|s| !s.is_disposed());
        running.push(subscription.clone());
        debug!(store = %self.store.name(), effects = running.len(), "saga effect started");
        subscription
    }

    /// Stop every running effect.
    pub fn dispose(&self) {
        let running = std::mem::take(&mut *self.running());
        for subscription in &running {
            subscription.dispose();
        }
        if !running.is_empty() {
            info!(store = %self.store.name(), effects = running.len(), "saga effects disposed");
        }
    }

    /// Number of effects that are still running.
    pub fn running_count(&self) -> usize {
        self.running().iter().filter(|s| !s.is_disposed()).count()
    }

    /// The store this middleware feeds.
    pub fn store(&self) -> &Store<S, A> {
        &self.store
    }

    /// The shared monitor.
    pub fn monitor(&self) -> &Arc<SagaMonitor<A>> {
        &self.monitor
    }

    fn running(&self) -> MutexGuard<'_, Vec<SagaSubscription>> {
        match self.running.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("saga middleware lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

impl<S: StateTree, A: Clone> Drop for SagaMiddleware<S, A> {
    fn drop(&mut self) {
        let running = match self.running.get_mut() {
            Ok(running) => std::mem::take(running),
            Err(poisoned) => std::mem::take(poisoned.into_inner()),
        };
        for subscription in running {
            subscription.dispose();
        }
    }
}

impl<S: StateTree, A: Clone> fmt::Debug for SagaMiddleware<S, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SagaMiddleware")
            .field("store", &self.store)
            .field("monitor", &self.monitor)
            .finish_non_exhaustive()
    }
}

/// Builder for a [`SagaMiddleware`].
pub struct SagaMiddlewareBuilder<S: StateTree, A> {
    store: Store<S, A>,
    scheduler: Option<Handle>,
    scheduler_name: String,
}

impl<S, A> SagaMiddlewareBuilder<S, A>
where
    S: StateTree,
    A: Action + Clone,
{
    fn new(store: Store<S, A>) -> Self {
        Self {
            store,
            scheduler: None,
            scheduler_name: DEFAULT_SCHEDULER_NAME.to_string(),
        }
    }

    /// Run effects on `handle` instead of a dedicated serial scheduler.
    pub fn scheduler(mut self, handle: Handle) -> Self {
        self.scheduler = Some(handle);
        self
    }

    /// Thread name of the default serial scheduler.
    pub fn scheduler_name(mut self, name: impl Into<String>) -> Self {
        self.scheduler_name = name.into();
        self
    }

    /// Build the middleware.
    ///
    /// Without an explicit scheduler, a [`SerialScheduler`] is started; if
    /// its thread cannot be spawned the error surfaces as `Upstream`.
    pub fn build(self) -> Result<SagaMiddleware<S, A>> {
        let (scheduler, serial) = match self.scheduler {
            Some(handle) => (handle, None),
            None => {
                let serial =
                    SerialScheduler::new(self.scheduler_name).map_err(RefluxError::upstream)?;
                (serial.handle().clone(), Some(serial))
            }
        };

        info!(store = %self.store.name(), "saga middleware ready");
        Ok(SagaMiddleware {
            store: self.store,
            monitor: Arc::new(SagaMonitor::new()),
            scheduler,
            running: Mutex::new(Vec::new()),
            _serial: serial,
        })
    }
}
