//! Low-overhead fan-out/fan-in dispatching for multi-threaded micro-benchmarks.
//!
//! This package runs a fixed set of user-supplied actions in parallel, over and
//! over, from a benchmark timing loop. It exists because general-purpose
//! parallel-invoke facilities allocate and coordinate per invocation, which
//! drowns out the cost of short actions; this dispatcher moves all of that to a
//! one-time configuration phase so the steady-state trigger is cheap and
//! predictable.
//!
//! The core functionality includes:
//! - [`SyncDispatcher`] - registers plain actions; every trigger runs all of them
//!   in parallel and blocks until they have finished
//! - [`AsyncDispatcher`] - registers actions returning futures; every trigger
//!   fans them out and returns a [`CycleCompletion`] future, with workers moving
//!   on to other actions while one is suspended
//! - [`AggregatePanic`] - every panic raised by actions during a cycle, preserved
//!   losslessly and surfaced together at cycle end
//!
//! # Operating principles
//!
//! ## One-time configuration, many cheap cycles
//!
//! All heap allocation happens while registering actions: ring nodes, worker
//! threads and coordination state are built up front. A steady-state trigger
//! allocates nothing - it resets an atomic cursor, releases the parked workers
//! through a shared gate and counts chains back in.
//!
//! ## Work distribution
//!
//! With effective concurrency W and N registered actions, the first action runs
//! on the calling thread, the next W-1 start on dedicated long-lived workers, and
//! any leftovers are claimed dynamically: whoever finishes its starting action
//! advances a lock-free cursor through the remaining nodes. Execution order
//! beyond that is unspecified, and there is no fairness between actions.
//!
//! ## Failure containment
//!
//! A panicking action never aborts the cycle. Every remaining action still runs;
//! the panics are collected and surfaced once, at cycle end, with no payload
//! dropped.
//!
//! # Basic example
//!
//! ```
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! use par_dispatch::SyncDispatcher;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let counter = Arc::new(AtomicUsize::new(0));
//!
//! // -1 resolves the concurrency to the processor count.
//! let mut dispatcher = SyncDispatcher::new(-1)?;
//! for _ in 0..2 {
//!     let counter = Arc::clone(&counter);
//!     dispatcher.add(move || {
//!         counter.fetch_add(1, Ordering::Relaxed);
//!     })?;
//! }
//!
//! // The timing loop of a benchmark harness would sit here.
//! for _ in 0..1_000 {
//!     dispatcher.execute_and_wait()?;
//! }
//!
//! assert_eq!(counter.load(Ordering::Relaxed), 2_000);
//!
//! dispatcher.dispose()?;
//! # Ok(())
//! # }
//! ```
//!
//! # Asynchronous actions
//!
//! ```
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! use par_dispatch::AsyncDispatcher;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let counter = Arc::new(AtomicUsize::new(0));
//!
//! let mut dispatcher = AsyncDispatcher::new(2)?;
//! for _ in 0..2 {
//!     let counter = Arc::clone(&counter);
//!     dispatcher.add(move || {
//!         let counter = Arc::clone(&counter);
//!         async move {
//!             counter.fetch_add(1, Ordering::Relaxed);
//!         }
//!     })?;
//! }
//!
//! // Await the returned future from an executor, or block on it directly.
//! dispatcher.execute_and_wait_async()?.wait()?;
//! assert_eq!(counter.load(Ordering::Relaxed), 2);
//!
//! dispatcher.dispose()?;
//! # Ok(())
//! # }
//! ```

mod async_dispatcher;
mod completion;
mod cursor;
mod errors;
mod gate;
mod pool;
mod ring;
mod sink;
mod sync_dispatcher;

pub use async_dispatcher::{AsyncDispatcher, CycleCompletion};
pub use errors::{ActionPanic, AggregatePanic, DispatchError, MaxConcurrencyError, UsageError};
pub use sync_dispatcher::SyncDispatcher;

#[cfg(test)]
mod test_support {
    use std::process;
    use std::sync::mpsc::{self, RecvTimeoutError};
    use std::thread;
    use std::time::Duration;

    const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(60);

    /// Aborts the process if a multi-threaded test wedges, instead of letting the
    /// whole test run hang. A test that fails by panicking disarms the watchdog
    /// normally (the sender is dropped during unwinding).
    pub(crate) fn with_watchdog<R>(f: impl FnOnce() -> R) -> R {
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
}
