//! Effect pipelines.
//!
//! A [`SagaOutput`] is a lazy, asynchronous sequence of values produced by a
//! saga effect. It carries the dispatcher that lets the effect feed actions
//! back into the system, and the execution context its consumers run on.
//!
//! Nothing runs until a terminal consumes the pipeline:
//!
//! - [`SagaOutput::subscribe`] runs it on the scheduler, returning a
//!   disposable [`SagaSubscription`]
//! - [`SagaOutput::subscribe_dispatch`] does the same, dispatching every value
//! - [`SagaOutput::next_value`] blocks for the first value with a timeout
//!
//! # Errors
//!
//! An error is terminal. Once a pipeline yields an error it yields nothing
//! further, unless [`SagaOutput::catch_error`] substitutes a fallback.
//!
//! # Combinators
//!
//! ```text
//! source ─► map ─► filter ─► switch_map(|v| inner(v)) ─► debounce ─► subscribe
//!                                │
//!                                └─ a new value cancels the previous inner pipeline
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::future::{self, Future};
use std::time::Duration;

use async_stream::stream;
use futures::stream::{self as fstream, BoxStream, Stream, StreamExt};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::awaitable::AwaitableJob;
use crate::error::{RefluxError, Result};
use crate::monitor::Dispatcher;

/// A lazy effect pipeline of `T` values that can dispatch `A` actions.
pub struct SagaOutput<T, A> {
    source: BoxStream<'static, Result<T>>,
    dispatch: Dispatcher<A>,
    scheduler: Handle,
}

impl<T, A> SagaOutput<T, A>
where
    T: Send + 'static,
    A: 'static,
{
    /// Wrap a stream of results.
    ///
    /// The stream is cut off after its first error.
    pub fn new<S>(source: S, dispatch: Dispatcher<A>, scheduler: Handle) -> Self
    where
        S: Stream<Item = Result<T>> + Send + 'static,
    {
        Self {
            source: stop_after_error(source),
            dispatch,
            scheduler,
        }
    }

    /// A pipeline that yields each value of `values` in order.
    pub fn from_values<I>(values: I, dispatch: Dispatcher<A>, scheduler: Handle) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        Self::new(fstream::iter(values.into_iter().map(Ok)), dispatch, scheduler)
    }

    /// A pipeline that yields one value.
    pub fn just(value: T, dispatch: Dispatcher<A>, scheduler: Handle) -> Self {
        Self::new(fstream::once(future::ready(Ok(value))), dispatch, scheduler)
    }

    /// A pipeline that completes without yielding.
    pub fn empty(dispatch: Dispatcher<A>, scheduler: Handle) -> Self {
        Self::new(fstream::empty(), dispatch, scheduler)
    }

    /// A pipeline that fails immediately.
    pub fn failed(err: RefluxError, dispatch: Dispatcher<A>, scheduler: Handle) -> Self {
        Self::new(fstream::once(future::ready(Err(err))), dispatch, scheduler)
    }

    /// A pipeline yielding the output of one future.
    pub fn from_future<F>(future: F, dispatch: Dispatcher<A>, scheduler: Handle) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        Self::new(fstream::once(future), dispatch, scheduler)
    }

    /// The dispatcher carried by this pipeline.
    pub fn dispatcher(&self) -> &Dispatcher<A> {
        &self.dispatch
    }

    /// The execution context consumers run on.
    pub fn scheduler(&self) -> &Handle {
        &self.scheduler
    }

    /// Give up the pipeline wrapper and return the raw stream.
    pub fn into_stream(self) -> BoxStream<'static, Result<T>> {
        self.source
    }

    /// Rebuild the stream, keeping dispatcher and scheduler.
    fn pipe<U, S, F>(self, build: F) -> SagaOutput<U, A>
    where
        U: Send + 'static,
        S: Stream<Item = Result<U>> + Send + 'static,
        F: FnOnce(BoxStream<'static, Result<T>>) -> S,
    {
        SagaOutput::new(build(self.source), self.dispatch, self.scheduler)
    }

    // =========================================================================
    // Element-wise
    // =========================================================================

    /// Transform every value.
    pub fn map<U, F>(self, mut f: F) -> SagaOutput<U, A>
    where
        U: Send + 'static,
        F: FnMut(T) -> U + Send + 'static,
    {
        self.pipe(move |source| source.map(move |item| item.map(&mut f)))
    }

    /// Keep only values satisfying `predicate`. Errors pass through.
    pub fn filter<F>(self, mut predicate: F) -> SagaOutput<T, A>
    where
        F: FnMut(&T) -> bool + Send + 'static,
    {
        self.pipe(move |source| {
            source.filter(move |item| {
                future::ready(match item {
                    Ok(value) => predicate(value),
                    Err(_) => true,
                })
            })
        })
    }

    /// Transform and filter in one step.
    pub fn filter_map<U, F>(self, mut f: F) -> SagaOutput<U, A>
    where
        U: Send + 'static,
        F: FnMut(T) -> Option<U> + Send + 'static,
    {
        self.pipe(move |source| {
            source.filter_map(move |item| {
                future::ready(match item {
                    Ok(value) => f(value).map(Ok),
                    Err(e) => Some(Err(e)),
                })
            })
        })
    }

    /// Run `f` on every value without changing it.
    pub fn do_on_value<F>(self, mut f: F) -> SagaOutput<T, A>
    where
        F: FnMut(&T) + Send + 'static,
    {
        self.pipe(move |source| {
            source.inspect(move |item| {
                if let Ok(value) = item {
                    f(value);
                }
            })
        })
    }

    /// Run `f` on the terminal error, if one occurs.
    pub fn do_on_error<F>(self, mut f: F) -> SagaOutput<T, A>
    where
        F: FnMut(&RefluxError) + Send + 'static,
    {
        self.pipe(move |source| {
            source.inspect(move |item| {
                if let Err(e) = item {
                    f(e);
                }
            })
        })
    }

    // =========================================================================
    // Higher-order
    // =========================================================================

    /// Map each value to a pipeline and concatenate them.
    ///
    /// Inner pipelines run one at a time, in upstream order. An inner error
    /// terminates the whole pipeline.
    pub fn flat_map<U, F>(self, mut f: F) -> SagaOutput<U, A>
    where
        U: Send + 'static,
        F: FnMut(T) -> SagaOutput<U, A> + Send + 'static,
    {
        self.pipe(move |mut source| {
            stream! {
                while let Some(item) = source.next().await {
                    let value = match item {
                        Ok(value) => value,
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    };
                    let mut inner = f(value).source;
                    while let Some(emission) = inner.next().await {
                        let failed = emission.is_err();
                        yield emission;
                        if failed {
                            return;
                        }
                    }
                }
            }
        })
    }

    /// Map each value to a pipeline, keeping only the latest one alive.
    ///
    /// A new upstream value drops (and so cancels) the previous inner
    /// pipeline; nothing it would have emitted afterwards is delivered.
    /// When upstream completes, the last inner pipeline runs to completion.
    pub fn switch_map<U, F>(self, mut f: F) -> SagaOutput<U, A>
    where
        U: Send + 'static,
        F: FnMut(T) -> SagaOutput<U, A> + Send + 'static,
    {
        self.pipe(move |mut source| {
            stream! {
                let mut generation: u64 = 0;
                let mut active: Option<BoxStream<'static, (u64, Result<U>)>> = None;
                let mut upstream_done = false;

                loop {
                    let step = tokio::select! {
                        biased;
                        next = source.next(), if !upstream_done => SwitchStep::Outer(next),
                        next = next_from(&mut active), if active.is_some() => SwitchStep::Inner(next),
                        else => SwitchStep::Exhausted,
                    };

                    match step {
                        SwitchStep::Outer(Some(Ok(value))) => {
                            generation += 1;
                            let tag = generation;
                            if active.take().is_some() {
                                trace!(generation = tag, "switch_map cancelled previous inner pipeline");
                            }
                            active = Some(f(value).source.map(move |emission| (tag, emission)).boxed());
                        }
                        SwitchStep::Outer(Some(Err(e))) => {
                            yield Err(e);
                            return;
                        }
                        SwitchStep::Outer(None) => {
                            upstream_done = true;
                        }
                        SwitchStep::Inner(Some((tag, emission))) => {
                            // Stale emissions from a superseded generation are dropped
                            if tag != generation {
                                continue;
                            }
                            let failed = emission.is_err();
                            yield emission;
                            if failed {
                                return;
                            }
                        }
                        SwitchStep::Inner(None) => {
                            active = None;
                        }
                        SwitchStep::Exhausted => return,
                    }
                }
            }
        })
    }

    /// Replace the terminal error with a fallback pipeline.
    ///
    /// The substitution is permanent: after the fallback completes, the
    /// combined pipeline completes.
    pub fn catch_error<F>(self, handler: F) -> SagaOutput<T, A>
    where
        F: FnOnce(RefluxError) -> SagaOutput<T, A> + Send + 'static,
    {
        self.pipe(move |mut source| {
            stream! {
                let mut handler = Some(handler);
                while let Some(item) = source.next().await {
                    match item {
                        Ok(value) => {
                            yield Ok(value);
                        }
                        Err(e) => {
                            let Some(handler) = handler.take() else {
                                return;
                            };
                            debug!(error = %e, "pipeline error caught, switching to fallback");
                            let mut fallback = handler(e).source;
                            while let Some(emission) = fallback.next().await {
                                yield emission;
                            }
                            return;
                        }
                    }
                }
            }
        })
    }

    // =========================================================================
    // Time
    // =========================================================================

    /// Shift every value later by `delay`. Errors are not delayed.
    pub fn delay(self, delay: Duration) -> SagaOutput<T, A> {
        self.pipe(move |mut source| {
            stream! {
                let mut queue: VecDeque<(Instant, T)> = VecDeque::new();
                let mut upstream_done = false;

                loop {
                    let due = queue.front().map(|(at, _)| *at);
                    let due_at = due.unwrap_or_else(Instant::now);
                    let step = tokio::select! {
                        biased;
                        _ = sleep_until(due_at), if due.is_some() => TimedStep::Due,
                        next = source.next(), if !upstream_done => TimedStep::Next(next),
                        else => TimedStep::Exhausted,
                    };

                    match step {
                        TimedStep::Due => {
                            if let Some((_, value)) = queue.pop_front() {
                                yield Ok(value);
                            }
                        }
                        TimedStep::Next(Some(Ok(value))) => {
                            queue.push_back((deadline_after(delay), value));
                        }
                        TimedStep::Next(Some(Err(e))) => {
                            yield Err(e);
                            return;
                        }
                        TimedStep::Next(None) => upstream_done = true,
                        TimedStep::Exhausted => return,
                    }
                }
            }
        })
    }

    /// Emit a value only once `quiet` has passed without a newer one.
    ///
    /// A pending value is flushed when upstream completes. A zero duration
    /// leaves the pipeline unchanged.
    pub fn debounce(self, quiet: Duration) -> SagaOutput<T, A> {
        if quiet.is_zero() {
            return self;
        }
        self.pipe(move |mut source| {
            stream! {
                let mut pending: Option<T> = None;
                let mut deadline = Instant::now();

                loop {
                    let step = tokio::select! {
                        biased;
                        next = source.next() => DebounceStep::Next(next),
                        _ = sleep_until(deadline), if pending.is_some() => DebounceStep::Quiet,
                    };

                    match step {
                        DebounceStep::Next(Some(Ok(value))) => {
                            pending = Some(value);
                            deadline = deadline_after(quiet);
                        }
                        DebounceStep::Next(Some(Err(e))) => {
                            yield Err(e);
                            return;
                        }
                        DebounceStep::Next(None) => {
                            if let Some(value) = pending.take() {
                                yield Ok(value);
                            }
                            return;
                        }
                        DebounceStep::Quiet => {
                            if let Some(value) = pending.take() {
                                yield Ok(value);
                            }
                        }
                    }
                }
            }
        })
    }

    // =========================================================================
    // Scheduling
    // =========================================================================

    /// Move downstream consumption onto `scheduler`.
    ///
    /// Upstream keeps running on the current scheduler and hands each item
    /// across. Nothing starts until the returned pipeline is consumed.
    pub fn observe_on(self, scheduler: Handle) -> SagaOutput<T, A> {
        let SagaOutput {
            mut source,
            dispatch,
            scheduler: upstream,
        } = self;

        let relay = stream! {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let forwarder = upstream.spawn(async move {
                while let Some(item) = source.next().await {
                    if tx.send(item).is_err() {
                        break;
                    }
                }
            });
            let _forwarder = AbortOnDrop(forwarder);

            while let Some(item) = rx.recv().await {
                yield item;
            }
        };

        SagaOutput::new(relay, dispatch, scheduler)
    }

    // =========================================================================
    // Terminals
    // =========================================================================

    /// Run the pipeline on its scheduler, calling `on_value` for each value.
    ///
    /// The subscription ends on [`SagaSubscription::dispose`], on completion,
    /// or on a terminal error (which is logged).
    pub fn subscribe<F>(self, mut on_value: F) -> SagaSubscription
    where
        F: FnMut(T) + Send + 'static,
    {
        let token = CancellationToken::new();
        let finished = token.clone();
        let mut source = self.source;

        self.scheduler.spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = finished.cancelled() => {
                        trace!("saga subscription disposed");
                        break;
                    }
                    next = source.next() => match next {
                        Some(Ok(value)) => on_value(value),
                        Some(Err(e)) => {
                            warn!(error = %e, "saga pipeline terminated with error");
                            break;
                        }
                        None => {
                            trace!("saga pipeline completed");
                            break;
                        }
                    },
                }
            }
            finished.cancel();
        });

        SagaSubscription { token }
    }

    /// Block for the first value, waiting at most `timeout`.
    ///
    /// Fails with `Unavailable` if the pipeline completes without a value and
    /// with `TimedOut` if nothing arrives in time. The pipeline is torn down
    /// in every case.
    pub fn next_value(self, timeout: Duration) -> Result<T>
    where
        T: Clone,
    {
        let stop = CancellationToken::new();
        let stopped = stop.clone();
        let mut source = self.source;

        let job = AwaitableJob::spawn(&self.scheduler, async move {
            tokio::select! {
                biased;
                _ = stopped.cancelled() => Err(RefluxError::Unavailable),
                next = source.next() => next.unwrap_or(Err(RefluxError::Unavailable)),
            }
        });

        let result = job.wait_timeout(timeout);
        stop.cancel();
        result
    }
}

impl<A: Send + 'static> SagaOutput<A, A> {
    /// Run the pipeline, dispatching every value through the carried dispatcher.
    pub fn subscribe_dispatch(self) -> SagaSubscription {
        let dispatch = self.dispatch.clone();
        self.subscribe(move |action| {
            let _ = dispatch(action);
        })
    }
}

impl<T, A> fmt::Debug for SagaOutput<T, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SagaOutput").finish_non_exhaustive()
    }
}

/// Handle to a running pipeline.
///
/// Clones share the same cancellation. Dropping the handle does not dispose.
#[derive(Debug, Clone)]
pub struct SagaSubscription {
    token: CancellationToken,
}

impl SagaSubscription {
    /// Stop the pipeline. Idempotent.
    pub fn dispose(&self) {
        self.token.cancel();
    }

    /// Returns true once disposed, completed, or failed.
    pub fn is_disposed(&self) -> bool {
        self.token.is_cancelled()
    }
}

// =============================================================================
// Internals
// =============================================================================

enum SwitchStep<T, U> {
    Outer(Option<Result<T>>),
    Inner(Option<(u64, Result<U>)>),
    Exhausted,
}

enum TimedStep<T> {
    Next(Option<Result<T>>),
    Due,
    Exhausted,
}

/// Debounce always polls upstream, so its select never runs dry.
enum DebounceStep<T> {
    Next(Option<Result<T>>),
    Quiet,
}

/// Stand-in deadline for durations too large to add to the clock.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// `now + after`, saturating to a far-future deadline instead of overflowing.
fn deadline_after(after: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(after).unwrap_or_else(|| now + FAR_FUTURE)
}

/// Aborts a spawned task when dropped.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn next_from<U>(active: &mut Option<BoxStream<'static, U>>) -> Option<U> {
    match active {
        Some(stream) => stream.next().await,
        None => future::pending().await,
    }
}

fn stop_after_error<T, S>(source: S) -> BoxStream<'static, Result<T>>
where
    T: Send + 'static,
    S: Stream<Item = Result<T>> + Send + 'static,
{
    let mut source = Box::pin(source);
    stream! {
        while let Some(item) = source.next().await {
            let failed = item.is_err();
            yield item;
            if failed {
                break;
            }
        }
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::SerialScheduler;
    use crate::testing::{wait_until, CallRecorder};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::runtime::{Builder, Runtime};

    fn runtime() -> Runtime {
        Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap()
    }

    fn noop() -> Dispatcher<i32> {
        Arc::new(|_: i32| AwaitableJob::<()>::empty())
    }

    fn values(rt: &Runtime, items: Vec<i32>) -> SagaOutput<i32, i32> {
        SagaOutput::from_values(items, noop(), rt.handle().clone())
    }

    /// Emits each value after waiting its paired number of milliseconds.
    fn timed(rt: &Runtime, items: Vec<(u64, i32)>) -> SagaOutput<i32, i32> {
        let source = stream! {
            for (wait_ms, value) in items {
                tokio::time::sleep(Duration::from_millis(wait_ms)).await;
                yield Ok(value);
            }
        };
        SagaOutput::new(source, noop(), rt.handle().clone())
    }

    fn collect<T: Send + 'static>(rt: &Runtime, output: SagaOutput<T, i32>) -> Vec<Result<T>> {
        rt.block_on(output.into_stream().collect::<Vec<_>>())
    }

    fn collect_ok<T: Send + 'static>(rt: &Runtime, output: SagaOutput<T, i32>) -> Vec<T> {
        collect(rt, output)
            .into_iter()
            .map(|item| item.unwrap())
            .collect()
    }

    #[test]
    fn test_map_and_filter_preserve_order() {
        let rt = runtime();
        let output = values(&rt, (1..=5).collect())
            .map(|v| v * 2)
            .filter(|v| *v > 4);
        assert_eq!(collect_ok(&rt, output), vec![6, 8, 10]);
    }

    #[test]
    fn test_filter_map() {
        let rt = runtime();
        let output = values(&rt, vec![1, 2, 3, 4]).filter_map(|v| (v % 2 == 0).then(|| v * 100));
        assert_eq!(collect_ok(&rt, output), vec![200, 400]);
    }

    #[test]
    fn test_flat_map_concatenates_in_order() {
        let rt = runtime();
        let handle = rt.handle().clone();
        // The first inner pipeline is the slowest; order must still hold
        let output = values(&rt, vec![1, 2, 3]).flat_map(move |v| {
            let wait = if v == 1 { 30 } else { 0 };
            let source = stream! {
                tokio::time::sleep(Duration::from_millis(wait)).await;
                yield Ok(v);
                yield Ok(v * 10);
            };
            SagaOutput::new(source, noop(), handle.clone())
        });
        assert_eq!(collect_ok(&rt, output), vec![1, 10, 2, 20, 3, 30]);
    }

    #[test]
    fn test_flat_map_inner_error_is_terminal() {
        let rt = runtime();
        let handle = rt.handle().clone();
        let inner_started = Arc::new(AtomicUsize::new(0));
        let started = inner_started.clone();

        let output = values(&rt, vec![1, 2, 3]).flat_map(move |v| {
            started.fetch_add(1, Ordering::SeqCst);
            let source = stream! {
                yield Ok(v * 10);
                if v == 1 {
                    yield Err(RefluxError::Unavailable);
                }
                yield Ok(v * 10 + 1);
            };
            SagaOutput::new(source, noop(), handle.clone())
        });

        let results = collect(&rt, output);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0], Ok(10));
        assert!(results[1].as_ref().unwrap_err().is_unavailable());
        // Later upstream values never reach the mapper
        assert_eq!(inner_started.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_switch_map_drops_superseded_inner() {
        let rt = runtime();
        let handle = rt.handle().clone();
        let inner_started = Arc::new(AtomicUsize::new(0));
        let started = inner_started.clone();

        let output = timed(&rt, vec![(0, 1), (20, 2)]).switch_map(move |v| {
            started.fetch_add(1, Ordering::SeqCst);
            let source = stream! {
                tokio::time::sleep(Duration::from_millis(80)).await;
                yield Ok(v * 10);
                tokio::time::sleep(Duration::from_millis(10)).await;
                yield Ok(v * 10 + 1);
            };
            SagaOutput::new(source, noop(), handle.clone())
        });

        // Upstream completes at ~20ms; the latest inner still finishes
        assert_eq!(collect_ok(&rt, output), vec![20, 21]);
        assert_eq!(inner_started.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_switch_map_inner_error_is_terminal() {
        let rt = runtime();
        let handle = rt.handle().clone();
        let output = values(&rt, vec![1]).switch_map(move |_| {
            SagaOutput::<i32, i32>::failed(RefluxError::Unavailable, noop(), handle.clone())
        });
        let results = collect(&rt, output);
        assert_eq!(results.len(), 1);
        assert!(results[0].as_ref().unwrap_err().is_unavailable());
    }

    #[test]
    fn test_debounce_zero_is_identity() {
        let rt = runtime();
        let output = values(&rt, vec![1, 2, 3]).debounce(Duration::ZERO);
        assert_eq!(collect_ok(&rt, output), vec![1, 2, 3]);
    }

    #[test]
    fn test_debounce_emits_last_of_each_burst() {
        let rt = runtime();
        let output = timed(&rt, vec![(0, 1), (5, 2), (5, 3), (150, 4), (5, 5)])
            .debounce(Duration::from_millis(60));
        // 3 settles during the long gap; 5 is flushed on completion
        assert_eq!(collect_ok(&rt, output), vec![3, 5]);
    }

    #[test]
    fn test_debounce_huge_duration_flushes_on_completion() {
        let rt = runtime();
        let first = values(&rt, vec![1, 2])
            .debounce(Duration::MAX)
            .next_value(Duration::from_secs(2));
        assert_eq!(first, Ok(2));
    }

    #[test]
    fn test_delay_huge_duration_keeps_waiting() {
        let rt = runtime();
        let first = values(&rt, vec![1, 2])
            .delay(Duration::MAX)
            .next_value(Duration::from_millis(50));
        assert!(first.unwrap_err().is_timed_out());
    }

    #[test]
    fn test_delay_shifts_values() {
        let rt = runtime();
        let started = std::time::Instant::now();
        let output = values(&rt, vec![1, 2]).delay(Duration::from_millis(40));
        assert_eq!(collect_ok(&rt, output), vec![1, 2]);
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_error_is_terminal() {
        let rt = runtime();
        let source = fstream::iter(vec![Ok(1), Err(RefluxError::Unavailable), Ok(2)]);
        let output = SagaOutput::new(source, noop(), rt.handle().clone());

        let results = collect(&rt, output);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0], Ok(1));
        assert!(results[1].is_err());
    }

    #[test]
    fn test_catch_error_substitutes_permanently() {
        let rt = runtime();
        let handle = rt.handle().clone();
        let source = fstream::iter(vec![Ok(1), Err(RefluxError::Unavailable), Ok(2)]);
        let output = SagaOutput::new(source, noop(), rt.handle().clone())
            .catch_error(move |_| SagaOutput::just(9, noop(), handle));

        assert_eq!(collect_ok(&rt, output), vec![1, 9]);
    }

    #[test]
    fn test_taps_observe_without_changing() {
        let rt = runtime();
        let seen = CallRecorder::new();
        let errors = CallRecorder::new();
        let (seen_tap, errors_tap) = (seen.clone(), errors.clone());

        let source = fstream::iter(vec![Ok(1), Ok(2), Err(RefluxError::timed_out(Duration::from_millis(5)))]);
        let output = SagaOutput::new(source, noop(), rt.handle().clone())
            .do_on_value(move |v| seen_tap.record(*v))
            .do_on_error(move |e| errors_tap.record(e.is_timed_out()));

        assert_eq!(collect(&rt, output).len(), 3);
        assert_eq!(seen.values(), vec![1, 2]);
        assert_eq!(errors.values(), vec![true]);
    }

    #[test]
    fn test_observe_on_moves_consumption() {
        let rt = runtime();
        let observer = SerialScheduler::new("reflux-observe-test").unwrap();
        let threads = CallRecorder::new();
        let record = threads.clone();

        let subscription = values(&rt, vec![1, 2, 3])
            .observe_on(observer.handle().clone())
            .subscribe(move |_| {
                record.record(std::thread::current().name().map(str::to_string));
            });

        assert!(wait_until(Duration::from_secs(2), || subscription.is_disposed()));
        assert_eq!(threads.len(), 3);
        assert!(threads
            .values()
            .iter()
            .all(|name| name.as_deref() == Some("reflux-observe-test")));
    }

    #[test]
    fn test_subscribe_completes_and_disposes() {
        let rt = runtime();
        let recorder = CallRecorder::new();
        let subscription = values(&rt, vec![1, 2, 3]).subscribe(recorder.callback());

        assert!(wait_until(Duration::from_secs(2), || subscription.is_disposed()));
        assert_eq!(recorder.values(), vec![1, 2, 3]);
    }

    #[test]
    fn test_dispose_stops_delivery() {
        let rt = runtime();
        let source = stream! {
            let mut n = 0;
            loop {
                tokio::time::sleep(Duration::from_millis(2)).await;
                n += 1;
                yield Ok(n);
            }
        };
        let recorder = CallRecorder::new();
        let subscription =
            SagaOutput::new(source, noop(), rt.handle().clone()).subscribe(recorder.callback());

        assert!(wait_until(Duration::from_secs(2), || recorder.len() >= 3));
        subscription.dispose();
        subscription.dispose();
        assert!(subscription.is_disposed());

        // Allow an in-flight value to land, then expect silence
        std::thread::sleep(Duration::from_millis(20));
        let settled = recorder.len();
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(recorder.len(), settled);
    }

    #[test]
    fn test_subscribe_dispatch_uses_carried_dispatcher() {
        let rt = runtime();
        let recorder = CallRecorder::new();
        let record = recorder.clone();
        let dispatch: Dispatcher<i32> = Arc::new(move |action: i32| -> AwaitableJob<()> {
            record.record(action);
            AwaitableJob::empty()
        });

        let subscription = SagaOutput::from_values(vec![4, 5], dispatch, rt.handle().clone())
            .subscribe_dispatch();

        assert!(wait_until(Duration::from_secs(2), || subscription.is_disposed()));
        assert_eq!(recorder.values(), vec![4, 5]);
    }

    #[test]
    fn test_next_value_returns_first() {
        let rt = runtime();
        let first = values(&rt, vec![7, 8]).next_value(Duration::from_secs(1));
        assert_eq!(first, Ok(7));
    }

    #[test]
    fn test_next_value_on_empty_is_unavailable() {
        let rt = runtime();
        let output = SagaOutput::<i32, i32>::empty(noop(), rt.handle().clone());
        assert!(output
            .next_value(Duration::from_secs(1))
            .unwrap_err()
            .is_unavailable());
    }

    #[test]
    fn test_next_value_timeout_tears_down() {
        struct SetOnDrop(Arc<AtomicBool>);
        impl Drop for SetOnDrop {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let rt = runtime();
        let dropped = Arc::new(AtomicBool::new(false));
        let guard = SetOnDrop(dropped.clone());
        let source = stream! {
            let _guard = guard;
            loop {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                yield Ok(1);
            }
        };

        let result = SagaOutput::new(source, noop(), rt.handle().clone())
            .next_value(Duration::from_millis(30));

        assert!(result.unwrap_err().is_timed_out());
        assert!(wait_until(Duration::from_secs(2), || dropped.load(Ordering::SeqCst)));
    }
}
