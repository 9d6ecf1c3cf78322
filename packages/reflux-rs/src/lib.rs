//! # Reflux
//!
//! A thread-safe state container where reducers own state, routers serialize
//! notifications, and sagas run cancellable side effects.
//!
//! ## Core Concepts
//!
//! - [`Store`] holds the application state and applies [`Action`]s through a
//!   pure [`Reducer`], one at a time
//! - Subscriptions observe *paths* of the state ([`StateTree`]) and are told
//!   only when the value at their path changes
//! - [`AwaitableJob`] turns callback or async work into a blocking wait
//! - Sagas ([`SagaEffect`]) react to dispatched actions through lazy,
//!   cancellable pipelines ([`SagaOutput`]) and dispatch new actions back
//!
//! ## Architecture
//!
//! ```text
//! caller ─► SagaMiddleware.dispatch(action)
//!               │
//!               ├─► Store.dispatch ─► queue ─► serialized task
//!               │                                  │
//!               │                                  ├─► reducer(state, action)
//!               │                                  └─► router ─► path callbacks
//!               │
//!               └─► SagaMonitor.dispatch ─► input.actions() streams
//!                                                │
//!                                 saga pipelines (map, switch_map, debounce, ...)
//!                                                │
//!                                                └─► emitted actions ─► dispatch
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Reducers are pure** - `(state, action) -> state`, no IO
//! 2. **One reduction in flight** - reduce-and-notify is serialized per store
//! 3. **Replay on register** - a new subscription sees the current value first
//! 4. **Change-only notification** - unchanged paths stay silent
//! 5. **Jobs resolve once** - an awaitable's result is cached and shared
//! 6. **Errors end pipelines** - unless `catch_error` substitutes a fallback
//!
//! ## Example
//!
//! ```ignore
//! use reflux::{create_store, Action, TreeState};
//!
//! #[derive(Debug, Clone)]
//! enum Counter {
//!     Add,
//!     Minus,
//! }
//! impl Action for Counter {}
//!
//! let runtime = tokio::runtime::Runtime::new()?;
//! let store = create_store(
//!     TreeState::empty().with_value("count", 0),
//!     |state: &TreeState<i32>, action: &Counter| match action {
//!         Counter::Add => state.map_value("count", |v| v.map(|n| n + 1)),
//!         Counter::Minus => state.map_value("count", |v| v.map(|n| n - 1)),
//!     },
//!     runtime.handle(),
//! );
//!
//! store.register("badge", "count", |value| println!("count = {value:?}"));
//!
//! let state = store.dispatch_awaitable(Counter::Add).wait()?;
//! assert_eq!(state.value("count"), Some(&1));
//! ```
//!
//! ## What This Is Not
//!
//! Reflux is **not**:
//! - A persistence layer
//! - A time-travel debugger
//! - A cross-process event bus

// Core modules
mod awaitable;
mod error;
mod monitor;
mod pipeline;
mod saga;
mod scheduler;
mod state;
mod store;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;


// Stress tests (test-only)
#[cfg(test)]
mod stress_tests;

// Re-export state and store
pub use state::{StateTree, TreeState, PATH_SEPARATOR};
pub use store::{
    create_store, Action, PathCallback, Reducer, Store, StoreBuilder, Subscription,
};

// Re-export awaitables
pub use awaitable::{AwaitableJob, Completion};

// Re-export saga types
pub use monitor::{Dispatcher, SagaMonitor};
pub use pipeline::{SagaOutput, SagaSubscription};
pub use saga::{SagaEffect, SagaInput, SagaMiddleware, SagaMiddlewareBuilder};
pub use scheduler::{SerialScheduler, DEFAULT_SCHEDULER_NAME};

// Re-export error types
pub use error::{RefluxError, Result};
