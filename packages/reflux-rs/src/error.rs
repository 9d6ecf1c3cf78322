//! Structured error type for reflux.
//!
//! `RefluxError` provides pattern-matchable errors instead of generic `anyhow::Error`.
//!
//! # The Error Boundary Rule
//!
//! > **No bare `anyhow::Error` is ever handed back to a caller.**
//!
//! - `anyhow` is internal transport (ergonomic inside saga effects)
//! - `RefluxError::Upstream` is how such failures surface in a pipeline
//!
//! Every variant is `Clone`: awaitable jobs cache their result and hand the
//! same value to every waiter, and pipeline errors may be observed by more
//! than one tap.
//!
//! # Example
//!
//! ```ignore
//! use reflux::RefluxError;
//!
//! match job.wait_timeout(Duration::from_millis(50)) {
//!     Ok(value) => println!("resolved: {value}"),
//!     Err(RefluxError::TimedOut { duration }) => println!("gave up after {duration:?}"),
//!     Err(RefluxError::Unavailable) => println!("nothing to wait for"),
//!     Err(e) => println!("job failed: {e}"),
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T, E = RefluxError> = std::result::Result<T, E>;

/// Structured error type for reflux operations.
#[derive(Debug, Clone, Error)]
pub enum RefluxError {
    /// No result is ready: an empty job, an absent state path, a dropped
    /// completion, or a pipeline that finished without emitting.
    #[error("no result available")]
    Unavailable,

    /// A bounded wait expired before the result resolved.
    ///
    /// The underlying work is not cancelled.
    #[error("operation timed out after {duration:?}")]
    TimedOut {
        /// How long we waited.
        duration: Duration,
    },

    /// An opaque failure raised inside a saga pipeline.
    #[error("{0}")]
    Upstream(Arc<anyhow::Error>),

    /// A store was built without an execution context and none was ambient.
    #[error("no tokio runtime available to host the store")]
    NoRuntime,
}

impl RefluxError {
    /// Wrap an arbitrary error as a pipeline failure.
    pub fn upstream(err: impl Into<anyhow::Error>) -> Self {
        RefluxError::Upstream(Arc::new(err.into()))
    }

    /// Build a timeout error for the given wait.
    pub fn timed_out(duration: Duration) -> Self {
        RefluxError::TimedOut { duration }
    }

    /// Returns true for [`RefluxError::Unavailable`].
    pub fn is_unavailable(&self) -> bool {
        matches!(self, RefluxError::Unavailable)
    }

    /// Returns true for [`RefluxError::TimedOut`].
    pub fn is_timed_out(&self) -> bool {
        matches!(self, RefluxError::TimedOut { .. })
    }
}

impl PartialEq for RefluxError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (RefluxError::Unavailable, RefluxError::Unavailable) => true,
            (RefluxError::NoRuntime, RefluxError::NoRuntime) => true,
            (RefluxError::TimedOut { duration: a }, RefluxError::TimedOut { duration: b }) => {
                a == b
            }
            // Upstream errors are opaque; identity is the only sound equality.
            (RefluxError::Upstream(a), RefluxError::Upstream(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        assert_eq!(RefluxError::Unavailable.to_string(), "no result available");
        assert_eq!(
            RefluxError::timed_out(Duration::from_millis(250)).to_string(),
            "operation timed out after 250ms"
        );
        assert_eq!(
            RefluxError::upstream(anyhow::anyhow!("boom")).to_string(),
            "boom"
        );
    }

    #[test]
    fn test_predicates() {
        assert!(RefluxError::Unavailable.is_unavailable());
        assert!(!RefluxError::Unavailable.is_timed_out());
        assert!(RefluxError::timed_out(Duration::ZERO).is_timed_out());
    }

    #[test]
    fn test_upstream_equality_is_identity() {
        let a = RefluxError::upstream(anyhow::anyhow!("same text"));
        let b = RefluxError::upstream(anyhow::anyhow!("same text"));
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }

    #[test]
    fn test_upstream_from_std_error() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err = RefluxError::upstream(io);
        match err {
            RefluxError::Upstream(inner) => {
                assert!(inner.downcast_ref::<std::io::Error>().is_some())
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
