//! Stress tests designed to break the reflux library.
//!
//! These tests exercise concurrent dispatch, subscription churn, and
//! racing waiters.

#[cfg(test)]
mod stress_tests {
    use crate::awaitable::AwaitableJob;
    use crate::monitor::{Dispatcher, SagaMonitor};
    use crate::saga::{SagaInput, SagaMiddleware};
    use crate::state::{StateTree, TreeState};
    use crate::store::{create_store, Action};
    use crate::testing::{wait_until, CallRecorder};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::{Duration, Instant};
    use tokio::runtime::{Builder, Runtime};

    const CALC: &str = "layer1.layer2.layer3.calculation";
    const SETTLE: Duration = Duration::from_secs(5);

    // ==========================================================================
    // Test Types
    // ==========================================================================

    #[derive(Debug, Clone, PartialEq)]
    enum Calc {
        Add,
    }
    impl Action for Calc {}

    /// A non-commutative operation tagged with its origin.
    #[derive(Debug, Clone, PartialEq)]
    struct Op {
        thread: usize,
        seq: usize,
        double: bool,
    }
    impl Action for Op {}

    fn apply(value: i64, op: &Op) -> i64 {
        if op.double {
            value.wrapping_mul(2).wrapping_add(1)
        } else {
            value.wrapping_sub(3)
        }
    }

    /// State that keeps every applied op, in application order.
    #[derive(Debug, Clone, PartialEq, Default)]
    struct Ledger {
        value: i64,
        applied: Vec<Op>,
    }

    impl StateTree for Ledger {
        type Value = i64;

        fn value_at(&self, path: &str) -> Option<i64> {
            (path == "value").then_some(self.value)
        }

        fn remove_value(&mut self, _path: &str) {}
    }

    fn runtime() -> Runtime {
        Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .unwrap()
    }

    fn micro_pause() {
        thread::sleep(Duration::from_micros(fastrand::u64(0..200)));
    }

    // ==========================================================================
    // Store
    // ==========================================================================

    #[test]
    fn test_concurrent_adds_reach_exact_total() {
        let rt = runtime();
        let store = create_store(
            TreeState::empty().with_value(CALC, 0),
            |state: &TreeState<i32>, action: &Calc| match action {
                Calc::Add => state.map_value(CALC, |v| v.map(|n| n + 1)),
            },
            rt.handle(),
        );

        let observed = CallRecorder::new();
        store.register("stress", CALC, observed.callback());

        let threads = 10;
        let per_thread = 50;
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let store = store.clone();
                thread::spawn(move || {
                    for _ in 0..per_thread {
                        micro_pause();
                        store.dispatch(Calc::Add);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(wait_until(SETTLE, || store.last_value(CALC) == Ok(500)));

        let values: Vec<i32> = observed
            .values()
            .into_iter()
            .map(|v| v.unwrap())
            .collect();
        assert!(
            values.windows(2).all(|pair| pair[0] <= pair[1]),
            "subscriber saw values out of order"
        );
        assert_eq!(values.first(), Some(&0));
        assert_eq!(values.last(), Some(&500));
        // Every transition is a distinct change, so nothing is skipped
        assert_eq!(values.len(), 501);
    }

    #[test]
    fn test_final_state_is_fold_in_dispatch_order() {
        let rt = runtime();
        let store = create_store(
            Ledger::default(),
            |state: &Ledger, op: &Op| {
                let mut next = state.clone();
                next.value = apply(state.value, op);
                next.applied.push(op.clone());
                next
            },
            rt.handle(),
        );

        let threads = 6;
        let per_thread = 150;
        let start = Arc::new(Barrier::new(threads));
        let handles: Vec<_> = (0..threads)
            .map(|origin| {
                let store = store.clone();
                let start = start.clone();
                thread::spawn(move || {
                    start.wait();
                    for seq in 0..per_thread {
                        if fastrand::u8(0..4) == 0 {
                            micro_pause();
                        }
                        store.dispatch(Op {
                            thread: origin,
                            seq,
                            double: fastrand::bool(),
                        });
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let total = threads * per_thread;
        assert!(wait_until(SETTLE, || store.last_state().applied.len() == total));

        let ledger = store.last_state();
        let folded = ledger.applied.iter().fold(0, apply);
        assert_eq!(ledger.value, folded);

        // Each thread's own dispatches keep their order
        for origin in 0..threads {
            let seqs: Vec<usize> = ledger
                .applied
                .iter()
                .filter(|op| op.thread == origin)
                .map(|op| op.seq)
                .collect();
            assert_eq!(seqs, (0..per_thread).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_register_churn_during_dispatch() {
        let rt = runtime();
        let store = create_store(
            TreeState::empty().with_value(CALC, 0),
            |state: &TreeState<i32>, _: &Calc| state.map_value(CALC, |v| v.map(|n| n + 1)),
            rt.handle(),
        );

        let churners: Vec<_> = (0..4)
            .map(|t| {
                let store = store.clone();
                thread::spawn(move || {
                    let id = format!("churn-{t}");
                    for _ in 0..100 {
                        let replayed = Arc::new(AtomicUsize::new(0));
                        let seen = replayed.clone();
                        store.register(&id, CALC, move |_| {
                            seen.fetch_add(1, Ordering::SeqCst);
                        });
                        // Replay happens before register returns
                        assert!(replayed.load(Ordering::SeqCst) >= 1);
                        assert!(store.unregister(&id, CALC));
                        assert!(!store.unregister(&id, CALC));
                    }
                })
            })
            .collect();

        for _ in 0..200 {
            store.dispatch(Calc::Add);
        }
        for handle in churners {
            handle.join().unwrap();
        }

        assert!(wait_until(SETTLE, || store.last_value(CALC) == Ok(200)));
        assert_eq!(store.subscription_count(), 0);
    }

    // ==========================================================================
    // Awaitables
    // ==========================================================================

    #[test]
    fn test_racing_waiters_share_one_result() {
        let rt = runtime();
        let runs = Arc::new(AtomicUsize::new(0));
        let counted = runs.clone();
        let job = AwaitableJob::spawn(rt.handle(), async move {
            counted.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            Ok(fastrand::u64(..))
        });

        let waiters: Vec<_> = (0..16)
            .map(|_| {
                let job = job.clone();
                thread::spawn(move || job.wait().unwrap())
            })
            .collect();
        let results: Vec<u64> = waiters.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(results.iter().all(|r| *r == results[0]));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_short_timeouts_return_promptly() {
        let rt = runtime();
        let job = AwaitableJob::<()>::spawn(rt.handle(), async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        });

        let waiters: Vec<_> = (0..8)
            .map(|_| {
                let job = job.clone();
                thread::spawn(move || {
                    let started = Instant::now();
                    let result = job.wait_timeout(Duration::from_millis(20));
                    (result, started.elapsed())
                })
            })
            .collect();

        for waiter in waiters {
            let (result, elapsed) = waiter.join().unwrap();
            assert!(result.unwrap_err().is_timed_out());
            assert!(elapsed < Duration::from_millis(500), "waited {elapsed:?}");
        }
    }

    // ==========================================================================
    // Monitor
    // ==========================================================================

    #[test]
    fn test_removed_dispatchers_never_fire() {
        let monitor = Arc::new(SagaMonitor::<u32>::new());
        let violations = Arc::new(AtomicUsize::new(0));
        let stop = Arc::new(AtomicBool::new(false));

        let broadcaster = {
            let monitor = monitor.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                let mut n = 0;
                while !stop.load(Ordering::SeqCst) {
                    monitor.dispatch(n);
                    n = n.wrapping_add(1);
                }
            })
        };

        let churners: Vec<_> = (0..4)
            .map(|_| {
                let monitor = monitor.clone();
                let violations = violations.clone();
                thread::spawn(move || {
                    for _ in 0..200 {
                        let removed = Arc::new(AtomicBool::new(false));
                        let hits = Arc::new(AtomicUsize::new(0));
                        let (flag, counter, bad) =
                            (removed.clone(), hits.clone(), violations.clone());
                        let dispatcher: Dispatcher<u32> =
                            Arc::new(move |_: u32| -> AwaitableJob<()> {
                                if flag.load(Ordering::SeqCst) {
                                    bad.fetch_add(1, Ordering::SeqCst);
                                }
                                counter.fetch_add(1, Ordering::SeqCst);
                                AwaitableJob::empty()
                            });

                        let id = monitor.next_id();
                        monitor.add_dispatcher(id, dispatcher);
                        // A broadcast starting after registration must reach it
                        monitor.dispatch(u32::MAX);
                        assert!(hits.load(Ordering::SeqCst) >= 1);

                        monitor.remove_dispatcher(id);
                        removed.store(true, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for handle in churners {
            handle.join().unwrap();
        }
        stop.store(true, Ordering::SeqCst);
        broadcaster.join().unwrap();

        assert_eq!(violations.load(Ordering::SeqCst), 0);
        assert!(monitor.is_empty());
    }

    // ==========================================================================
    // Sagas
    // ==========================================================================

    #[derive(Debug, Clone, PartialEq)]
    enum Job {
        Request(u32),
        Done(u32),
    }
    impl Action for Job {}

    #[test]
    fn test_take_every_handles_every_concurrent_request() {
        let rt = runtime();
        let store = create_store(
            TreeState::empty().with_value("done", 0u32),
            |state: &TreeState<u32>, action: &Job| match action {
                Job::Done(_) => state.map_value("done", |v| v.map(|n| n + 1)),
                Job::Request(_) => state.clone(),
            },
            rt.handle(),
        );
        let sagas = Arc::new(SagaMiddleware::builder(store).build().unwrap());

        sagas.run(|input: SagaInput<TreeState<u32>, Job>| {
            let worker = input.clone();
            input.take_every(
                |action| match action {
                    Job::Request(n) => Some(n),
                    Job::Done(_) => None,
                },
                move |n| worker.put(Job::Done(n)),
            )
        });

        let senders: Vec<_> = (0..4)
            .map(|t| {
                let sagas = sagas.clone();
                thread::spawn(move || {
                    for i in 0..50 {
                        micro_pause();
                        sagas.dispatch(Job::Request(t * 100 + i));
                    }
                })
            })
            .collect();
        for handle in senders {
            handle.join().unwrap();
        }

        assert!(wait_until(SETTLE, || {
            sagas.store().last_value("done") == Ok(200)
        }));
    }
}
