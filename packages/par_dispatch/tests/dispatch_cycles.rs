//! End-to-end dispatch scenarios through the public API only.

use std::collections::HashSet;
use std::process;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

use futures::executor::block_on;
use par_dispatch::{AsyncDispatcher, DispatchError, SyncDispatcher, UsageError};

const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(60);

/// Aborts the process if a multi-threaded scenario wedges, instead of letting the
/// whole test run hang.
fn with_watchdog<R>(f: impl FnOnce() -> R) -> R {
    let (done_tx, done_rx) = mpsc::channel::<()>();

    thread::spawn(move || match done_rx.recv_timeout(WATCHDOG_TIMEOUT) {
        Ok(()) | Err(RecvTimeoutError::Disconnected) => {}
        Err(RecvTimeoutError::Timeout) => {
            eprintln!("test watchdog expired - aborting the process");
            process::abort();
        }
    });

    let result = f();

    done_tx
        .send(())
        .expect("the watchdog waits for this signal");

    result
}

#[test]
fn two_increments() {
    with_watchdog(|| {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut dispatcher = SyncDispatcher::new(-1).expect("valid concurrency");

        for _ in 0..2 {
            let counter = Arc::clone(&counter);
            dispatcher
                .add(move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                })
                .expect("dispatcher is configuring");
        }

        dispatcher.execute_and_wait().expect("no action panics");
        assert_eq!(counter.load(Ordering::Relaxed), 2);

        dispatcher.dispose().expect("first dispose succeeds");
    });
}

#[test]
fn four_increments_with_concurrency_two() {
    with_watchdog(|| {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut dispatcher = SyncDispatcher::new(2).expect("valid concurrency");

        for _ in 0..4 {
            let counter = Arc::clone(&counter);
            dispatcher
                .add(move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                })
                .expect("dispatcher is configuring");
        }

        // Two run in the initial fan-out, two are stolen.
        dispatcher.execute_and_wait().expect("no action panics");
        assert_eq!(counter.load(Ordering::Relaxed), 4);

        dispatcher.dispose().expect("first dispose succeeds");
    });
}

#[test]
fn mixed_failures_surface_every_payload() {
    with_watchdog(|| {
        let mut dispatcher = SyncDispatcher::new(2).expect("valid concurrency");

        dispatcher.add(|| {}).expect("dispatcher is configuring");
        dispatcher
            .add(|| panic!("A"))
            .expect("dispatcher is configuring");
        dispatcher
            .add(|| panic!("B"))
            .expect("dispatcher is configuring");

        let error = dispatcher.execute_and_wait().expect_err("two actions panic");

        let DispatchError::Panicked(aggregate) = error else {
            panic!("expected an aggregated panic, got {error:?}");
        };

        assert_eq!(aggregate.panics().len(), 2);

        let messages: HashSet<_> = aggregate
            .panics()
            .iter()
            .map(|panic| panic.message().expect("string payloads"))
            .collect();
        assert_eq!(messages, HashSet::from(["A", "B"]));

        dispatcher.dispose().expect("first dispose succeeds");
    });
}

#[test]
fn repeated_triggers_with_a_worker_pool() {
    with_watchdog(|| {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut dispatcher = SyncDispatcher::new(2).expect("valid concurrency");

        for _ in 0..3 {
            let counter = Arc::clone(&counter);
            dispatcher
                .add(move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                })
                .expect("dispatcher is configuring");
        }

        const CYCLES: usize = 10_000;
        for _ in 0..CYCLES {
            dispatcher.execute_and_wait().expect("no action panics");
        }

        assert_eq!(counter.load(Ordering::Relaxed), CYCLES * 3);

        dispatcher.dispose().expect("first dispose succeeds");
    });
}

/// Completes on its second poll, waking itself in between.
fn yield_once() -> impl std::future::Future<Output = ()> {
    struct YieldOnce(bool);

    impl std::future::Future for YieldOnce {
        type Output = ();

        fn poll(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<()> {
            if self.0 {
                std::task::Poll::Ready(())
            } else {
                self.0 = true;
                cx.waker().wake_by_ref();
                std::task::Poll::Pending
            }
        }
    }

    YieldOnce(false)
}

#[test]
fn async_yielding_actions_complete() {
    with_watchdog(|| {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut dispatcher = AsyncDispatcher::new(2).expect("valid concurrency");

        for _ in 0..2 {
            let counter = Arc::clone(&counter);
            dispatcher
                .add(move || {
                    let counter = Arc::clone(&counter);
                    async move {
                        yield_once().await;
                        counter.fetch_add(1, Ordering::Relaxed);
                    }
                })
                .expect("dispatcher is configuring");
        }

        block_on(dispatcher.execute_and_wait_async().expect("trigger succeeds"))
            .expect("no action panics");

        assert_eq!(counter.load(Ordering::Relaxed), 2);

        dispatcher.dispose().expect("first dispose succeeds");
    });
}

#[test]
fn dispose_during_idle_then_further_use_fails() {
    with_watchdog(|| {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut dispatcher = SyncDispatcher::new(2).expect("valid concurrency");

        for _ in 0..2 {
            let counter = Arc::clone(&counter);
            dispatcher
                .add(move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                })
                .expect("dispatcher is configuring");
        }

        dispatcher.execute_and_wait().expect("no action panics");
        dispatcher.dispose().expect("first dispose succeeds");

        assert_eq!(dispatcher.add(|| {}), Err(UsageError::Disposed));
        assert_eq!(dispatcher.dispose(), Err(UsageError::Disposed));
    });
}

#[test]
fn sync_fan_out_uses_multiple_threads() {
    with_watchdog(|| {
        let seen: Arc<Mutex<HashSet<ThreadId>>> = Arc::new(Mutex::new(HashSet::new()));
        let mut dispatcher = SyncDispatcher::new(2).expect("valid concurrency");

        for _ in 0..2 {
            let seen = Arc::clone(&seen);
            dispatcher
                .add(move || {
                    seen.lock()
                        .expect("not poisoned")
                        .insert(thread::current().id());
                })
                .expect("dispatcher is configuring");
        }

        dispatcher.execute_and_wait().expect("no action panics");

        assert_eq!(seen.lock().expect("not poisoned").len(), 2);

        dispatcher.dispose().expect("first dispose succeeds");
    });
}
