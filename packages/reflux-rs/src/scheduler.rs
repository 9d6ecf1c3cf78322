//! A dedicated serial execution context.
//!
//! [`SerialScheduler`] runs a single-threaded tokio runtime on its own OS
//! thread. Work spawned on its [`Handle`] executes one task at a time on
//! that thread. Sagas use it by default so effect cadence is decoupled from
//! the store's own context.

use std::fmt;
use std::io;
use std::thread;

use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;
use tracing::{debug, info};

/// Thread name used when none is given.
pub const DEFAULT_SCHEDULER_NAME: &str = "reflux-saga";

/// A single-threaded runtime on a dedicated thread.
///
/// Dropping the scheduler stops its runtime; tasks still pending are dropped.
pub struct SerialScheduler {
    name: String,
    handle: Handle,
    shutdown: Option<oneshot::Sender<()>>,
}

impl SerialScheduler {
    /// Start a scheduler whose thread carries `name`.
    pub fn new(name: impl Into<String>) -> io::Result<Self> {
        let name = name.into();
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let handle = runtime.handle().clone();
        let (shutdown, stopped) = oneshot::channel::<()>();

        let thread_name = name.clone();
        thread::Builder::new().name(name.clone()).spawn(move || {
            info!(scheduler = %thread_name, "serial scheduler started");
            // Returns once the sender fires or is dropped.
            let _ = runtime.block_on(stopped);
            info!(scheduler = %thread_name, "serial scheduler stopped");
        })?;

        Ok(Self {
            name,
            handle,
            shutdown: Some(shutdown),
        })
    }

    /// Handle for spawning onto this scheduler.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// The scheduler's thread name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for SerialScheduler {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            debug!(scheduler = %self.name, "stopping serial scheduler");
            let _ = shutdown.send(());
        }
    }
}

impl fmt::Debug for SerialScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialScheduler")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::awaitable::AwaitableJob;
    use std::time::Duration;

    #[test]
    fn test_work_runs_on_named_thread() {
        let scheduler = SerialScheduler::new("reflux-test-serial").unwrap();
        let job = AwaitableJob::spawn(scheduler.handle(), async {
            Ok(thread::current().name().map(str::to_string))
        });

        let name = job.wait_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(name.as_deref(), Some("reflux-test-serial"));
    }

    #[test]
    fn test_timers_are_enabled() {
        let scheduler = SerialScheduler::new(DEFAULT_SCHEDULER_NAME).unwrap();
        let job = AwaitableJob::spawn(scheduler.handle(), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(1)
        });
        assert_eq!(job.wait_timeout(Duration::from_secs(2)).unwrap(), 1);
    }

    #[test]
    fn test_drop_abandons_pending_work() {
        let scheduler = SerialScheduler::new("reflux-test-drop").unwrap();
        let job = AwaitableJob::<i32>::spawn(scheduler.handle(), async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(1)
        });

        drop(scheduler);

        // The task is dropped with the runtime, which drops its completion
        assert!(job
            .wait_timeout(Duration::from_secs(2))
            .unwrap_err()
            .is_unavailable());
    }
}
