//! The state container and its dispatch router.
//!
//! A [`Store`] owns the application state and a reducer. Every dispatch is
//! handed off to one serialized task on the store's execution context:
//!
//! ```text
//! dispatch(action) ──► queue ──► serialized task
//!                                    │
//!                                    ├─► reducer(state, action) ─► new state
//!                                    │
//!                                    └─► router: notify every path whose value changed
//! ```
//!
//! # Guarantees
//!
//! - **One reduction in flight**: reduce-and-notify runs on one serialized task
//! - **Total order**: subscribers observe transitions in true dispatch order
//! - **Replay on register**: a new subscription is called once with the
//!   path's current value before `register` returns, and before any change
//!   notification reaches it
//! - **Change-only notification**: a subscription only fires when its
//!   path's value differs from the last value it was given
//!
//! # Reentrancy
//!
//! Callbacks run without the router lock held. A callback may call
//! [`Store::dispatch`], read state, and `register`/`unregister` any pair,
//! its own included. An unregistered callback is not called again.
//! Blocking on [`Store::dispatch_awaitable`] from inside a callback waits on
//! the task that is running the callback and never resolves.
//!
//! # Example
//!
//! ```ignore
//! use reflux::{create_store, TreeState};
//!
//! let store = create_store(
//!     TreeState::empty().with_value("count", 0),
//!     |state: &TreeState<i32>, action: &Counter| match action {
//!         Counter::Add => state.map_value("count", |v| v.map(|n| n + 1)),
//!     },
//!     runtime.handle(),
//! );
//!
//! let sub = store.register("badge", "count", |value| println!("count = {value:?}"));
//! store.dispatch(Counter::Add);
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, Weak};

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::awaitable::{AwaitableJob, Completion};
use crate::error::{RefluxError, Result};
use crate::state::StateTree;

/// Default name used in tracing fields.
const DEFAULT_STORE_NAME: &str = "store";

// =============================================================================
// Actions and Reducers
// =============================================================================

/// A message describing an intended state change.
///
/// Model each domain's actions as a closed enum and match it exhaustively in
/// the reducer.
pub trait Action: Send + 'static {
    /// The path this action only *pings*.
    ///
    /// A ping sets a value so subscribers see it once; after notification the
    /// router removes the path again. Most actions return `None`.
    fn ping_path(&self) -> Option<&str> {
        None
    }
}

/// A pure, total function from `(state, action)` to the next state.
pub trait Reducer<S, A>: Send + Sync + 'static {
    /// Compute the next state.
    fn reduce(&self, state: &S, action: &A) -> S;
}

impl<S, A, F> Reducer<S, A> for F
where
    F: Fn(&S, &A) -> S + Send + Sync + 'static,
{
    fn reduce(&self, state: &S, action: &A) -> S {
        self(state, action)
    }
}

/// Callback invoked with a path's value, or `Unavailable` if absent.
pub type PathCallback<V> = Arc<dyn Fn(Result<V>) + Send + Sync>;

// =============================================================================
// Router
// =============================================================================

/// One registered callback.
///
/// Deliveries take the route's turn, so two notifications for the same route
/// never overlap and a replay always lands before later changes.
struct Route<V> {
    callback: PathCallback<V>,
    turn: Mutex<()>,
    live: AtomicBool,
}

impl<V> Route<V> {
    fn new(callback: PathCallback<V>) -> Self {
        Self {
            callback,
            turn: Mutex::new(()),
            live: AtomicBool::new(true),
        }
    }

    fn take_turn(&self) -> MutexGuard<'_, ()> {
        match self.turn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Invoke the callback unless the route was removed in the meantime.
    fn deliver(&self, value: Result<V>) {
        let _turn = self.take_turn();
        if self.live.load(Ordering::Acquire) {
            (self.callback)(value);
        }
    }

    fn retire(&self) {
        self.live.store(false, Ordering::Release);
    }
}

struct RouteEntry<V> {
    route: Arc<Route<V>>,
    /// Last value handed to the route (`None` = handed `Unavailable`).
    last: Option<V>,
}

/// A notification computed under the router lock, delivered after it is released.
type Pending<V> = (Arc<Route<V>>, Result<V>);

/// Subscription table keyed by registrant, then by observed path.
struct Router<V> {
    routes: HashMap<String, HashMap<String, RouteEntry<V>>>,
}

impl<V: Clone + PartialEq> Router<V> {
    fn new() -> Self {
        Self {
            routes: HashMap::new(),
        }
    }

    fn insert(&mut self, id: &str, path: &str, route: Arc<Route<V>>, current: Option<V>) {
        let entry = RouteEntry {
            route,
            last: current,
        };
        let replaced = self
            .routes
            .entry(id.to_string())
            .or_default()
            .insert(path.to_string(), entry);
        if let Some(old) = replaced {
            old.route.retire();
        }
    }

    fn remove(&mut self, id: &str, path: &str) -> bool {
        let Some(paths) = self.routes.get_mut(id) else {
            return false;
        };
        let removed = paths.remove(path);
        if paths.is_empty() {
            self.routes.remove(id);
        }
        match removed {
            Some(entry) => {
                entry.route.retire();
                true
            }
            None => false,
        }
    }

    fn remove_all(&mut self, id: &str) -> usize {
        let Some(paths) = self.routes.remove(id) else {
            return 0;
        };
        for entry in paths.values() {
            entry.route.retire();
        }
        paths.len()
    }

    /// Collect every subscription whose path value changed, recording the new value.
    fn notify<S: StateTree<Value = V>>(&mut self, state: &S) -> Vec<Pending<V>> {
        let mut pending = Vec::new();
        for paths in self.routes.values_mut() {
            for (path, entry) in paths.iter_mut() {
                let next = state.value_at(path);
                if next != entry.last {
                    entry.last = next.clone();
                    pending.push((entry.route.clone(), next.ok_or(RefluxError::Unavailable)));
                }
            }
        }
        pending
    }

    /// Record that `path` was cleared without telling its subscribers.
    fn forget(&mut self, path: &str) {
        for paths in self.routes.values_mut() {
            if let Some(entry) = paths.get_mut(path) {
                entry.last = None;
            }
        }
    }

    fn len(&self) -> usize {
        self.routes.values().map(HashMap::len).sum()
    }
}

// =============================================================================
// Store
// =============================================================================

/// An action queued for the serialized task, with an optional completion.
struct Envelope<S, A> {
    action: A,
    done: Option<Completion<S>>,
}

struct StoreInner<S: StateTree, A> {
    name: String,
    state: RwLock<S>,
    router: Mutex<Router<S::Value>>,
    reducer: Box<dyn Reducer<S, A>>,
    sender: mpsc::UnboundedSender<Envelope<S, A>>,
}

impl<S: StateTree, A: Action> StoreInner<S, A> {
    fn router(&self) -> MutexGuard<'_, Router<S::Value>> {
        match self.router.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!(store = %self.name, "router lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn read_state(&self) -> RwLockReadGuard<'_, S> {
        match self.state.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn replace_state(&self, next: S) {
        match self.state.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }

    /// Reduce one action and notify. Runs only on the serialized task.
    ///
    /// State is swapped under the router lock; callbacks run after it is
    /// released so they can register and unregister freely.
    fn apply(&self, envelope: Envelope<S, A>) {
        let Envelope { action, done } = envelope;

        let next = {
            let current = self.read_state();
            self.reducer.reduce(&current, &action)
        };
        let pending = {
            let mut router = self.router();
            self.replace_state(next.clone());
            router.notify(&next)
        };
        let notified = pending.len();
        for (route, value) in pending {
            route.deliver(value);
        }

        let state = match action.ping_path() {
            Some(path) => {
                let mut cleared = next;
                cleared.remove_value(path);
                let mut router = self.router();
                self.replace_state(cleared.clone());
                router.forget(path);
                cleared
            }
            None => next,
        };

        trace!(store = %self.name, notified, "action applied");

        if let Some(done) = done {
            done.succeed(state);
        }
    }
}

/// A thread-safe, serialized state container.
///
/// Cheap to clone; all clones share the same state, router and queue.
pub struct Store<S: StateTree, A> {
    inner: Arc<StoreInner<S, A>>,
}

impl<S: StateTree, A: Action> Store<S, A> {
    /// Hand `action` off to the serialized task.
    ///
    /// Returns immediately; use [`Store::dispatch_awaitable`] to learn when
    /// the reduction and its notifications have run.
    pub fn dispatch(&self, action: A) {
        self.enqueue(Envelope { action, done: None });
    }

    /// Dispatch and return a job that resolves with the post-reduction state.
    pub fn dispatch_awaitable(&self, action: A) -> AwaitableJob<S> {
        AwaitableJob::from_callback(|done| {
            self.enqueue(Envelope {
                action,
                done: Some(done),
            });
        })
    }

    fn enqueue(&self, envelope: Envelope<S, A>) {
        if self.inner.sender.send(envelope).is_err() {
            // The serialized task is gone (runtime shut down or a reducer panicked).
            // The returned envelope drops here, resolving any completion as Unavailable.
            warn!(store = %self.inner.name, "store task stopped, action dropped");
        }
    }

    /// Register `callback` for `path` under `id`.
    ///
    /// Replaces any existing registration for the same `(id, path)` pair.
    /// The callback is invoked once, before this returns, with the current
    /// value at `path`; afterwards it fires whenever that value changes.
    pub fn register<F>(&self, id: &str, path: &str, callback: F) -> Subscription
    where
        F: Fn(Result<S::Value>) + Send + Sync + 'static,
    {
        let route = Arc::new(Route::new(Arc::new(callback) as PathCallback<S::Value>));
        // Holding the turn keeps any notification for this route behind the replay
        let turn = route.take_turn();

        let current = {
            let mut router = self.inner.router();
            let current = self.inner.read_state().value_at(path);
            router.insert(id, path, route.clone(), current.clone());
            current
        };
        (route.callback)(current.ok_or(RefluxError::Unavailable));
        drop(turn);

        debug!(store = %self.inner.name, id, path, "subscription registered");

        let weak: Weak<StoreInner<S, A>> = Arc::downgrade(&self.inner);
        let (owner, observed) = (id.to_string(), path.to_string());
        Subscription {
            id: id.to_string(),
            path: path.to_string(),
            unsubscribe: Box::new(move || match weak.upgrade() {
                Some(inner) => Store { inner }.unregister(&owner, &observed),
                None => false,
            }),
        }
    }

    /// Remove the `(id, path)` registration. Returns whether one existed.
    pub fn unregister(&self, id: &str, path: &str) -> bool {
        let removed = self.inner.router().remove(id, path);
        if removed {
            debug!(store = %self.inner.name, id, path, "subscription removed");
        }
        removed
    }

    /// Remove every registration for `id`. Returns how many were removed.
    pub fn unregister_all(&self, id: &str) -> usize {
        let removed = self.inner.router().remove_all(id);
        debug!(store = %self.inner.name, id, removed, "registrant removed");
        removed
    }

    /// Remove every registration for each id in `ids`.
    pub fn unregister_many<I>(&self, ids: I) -> usize
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let mut router = self.inner.router();
        let removed = ids
            .into_iter()
            .map(|id| router.remove_all(id.as_ref()))
            .sum();
        drop(router);
        debug!(store = %self.inner.name, removed, "registrants removed");
        removed
    }

    /// Snapshot of the latest state.
    pub fn last_state(&self) -> S {
        self.inner.read_state().clone()
    }

    /// The latest value at `path`, or `Unavailable` if absent.
    pub fn last_value(&self, path: &str) -> Result<S::Value> {
        self.inner
            .read_state()
            .value_at(path)
            .ok_or(RefluxError::Unavailable)
    }

    /// Number of live registrations.
    pub fn subscription_count(&self) -> usize {
        self.inner.router().len()
    }

    /// The name used in this store's log fields.
    pub fn name(&self) -> &str {
        &self.inner.name
    }
}

impl<S: StateTree, A> Clone for Store<S, A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: StateTree, A> fmt::Debug for Store<S, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("name", &self.inner.name)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Subscription
// =============================================================================

/// Handle to one `(id, path)` registration.
///
/// Dropping a `Subscription` does not unregister it.
pub struct Subscription {
    id: String,
    path: String,
    unsubscribe: Box<dyn Fn() -> bool + Send + Sync>,
}

impl Subscription {
    /// Remove the registration. Returns whether it was still registered.
    pub fn unsubscribe(&self) -> bool {
        (self.unsubscribe)()
    }

    /// The registrant id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The observed path.
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("path", &self.path)
            .finish()
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for a [`Store`].
///
/// # Example
///
/// ```ignore
/// let store = StoreBuilder::new(initial, reducer)
///     .name("checkout")
///     .runtime(runtime.handle().clone())
///     .build()?;
/// ```
pub struct StoreBuilder<S, A> {
    initial: S,
    reducer: Box<dyn Reducer<S, A>>,
    name: String,
    runtime: Option<Handle>,
}

impl<S: StateTree, A: Action> StoreBuilder<S, A> {
    /// Start building a store from its initial state and reducer.
    pub fn new<R: Reducer<S, A>>(initial: S, reducer: R) -> Self {
        Self {
            initial,
            reducer: Box::new(reducer),
            name: DEFAULT_STORE_NAME.to_string(),
            runtime: None,
        }
    }

    /// Name used in log fields.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Execution context hosting the serialized task.
    ///
    /// Defaults to the ambient tokio runtime.
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    /// Build the store and start its serialized task.
    pub fn build(mut self) -> Result<Store<S, A>> {
        let handle = match self.runtime.take() {
            Some(handle) => handle,
            None => Handle::try_current().map_err(|_| RefluxError::NoRuntime)?,
        };
        Ok(self.start(&handle))
    }

    fn start(self, handle: &Handle) -> Store<S, A> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Envelope<S, A>>();
        let inner = Arc::new(StoreInner {
            name: self.name,
            state: RwLock::new(self.initial),
            router: Mutex::new(Router::new()),
            reducer: self.reducer,
            sender,
        });

        // The task holds a weak reference so dropping every Store closes the queue.
        let weak = Arc::downgrade(&inner);
        let name = inner.name.clone();
        handle.spawn(async move {
            info!(store = %name, "store task starting");
            while let Some(envelope) = receiver.recv().await {
                match weak.upgrade() {
                    Some(inner) => inner.apply(envelope),
                    None => break,
                }
            }
            info!(store = %name, "store task stopped");
        });

        Store { inner }
    }
}

/// Create a store hosted on `handle`.
pub fn create_store<S, A, R>(initial: S, reducer: R, handle: &Handle) -> Store<S, A>
where
    S: StateTree,
    A: Action,
    R: Reducer<S, A>,
{
    StoreBuilder::new(initial, reducer).start(handle)
}
