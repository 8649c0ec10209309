//! The fixed-capacity set of long-lived worker threads behind a dispatcher.

use std::num::NonZero;
use std::thread::{self, JoinHandle};

use crate::errors::MaxConcurrencyError;

/// Resolves a requested maximum concurrency to an effective thread count.
///
/// `-1` resolves to the processor count; explicit requests of at least 1 are used
/// as-is (oversubscription is the caller's business); everything else is rejected.
pub(crate) fn effective_concurrency(requested: i32) -> Result<usize, MaxConcurrencyError> {
    match requested {
        -1 => Ok(thread::available_parallelism().map_or(1, NonZero::get)),
        valid if valid >= 1 => Ok(usize::try_from(valid).expect("guarded by the match arm")),
        rejected => Err(MaxConcurrencyError {
            requested: rejected,
        }),
    }
}

/// Owns the dispatcher's worker threads.
///
/// Capacity is fixed at construction to one less than the effective concurrency -
/// the caller thread is the final worker. Threads are spawned lazily, one per
/// registered action while capacity remains, and live until the dispatcher is
/// disposed. Rust threads are detached until joined, so an un-disposed dispatcher
/// never keeps the process alive on its own.
pub(crate) struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    capacity: usize,
}

impl WorkerPool {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            handles: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub(crate) fn has_capacity(&self) -> bool {
        self.handles.len() < self.capacity
    }

    pub(crate) fn len(&self) -> usize {
        self.handles.len()
    }

    #[cfg_attr(test, mutants::skip)] // A worker that never starts shows up as a deadlock, not a failure.
    pub(crate) fn spawn(&mut self, entrypoint: impl FnOnce() + Send + 'static) {
        debug_assert!(self.has_capacity());

        let handle = thread::Builder::new()
            .name(format!("dispatch-worker-{}", self.handles.len()))
            .spawn(entrypoint)
            .expect("spawning a dispatch worker thread failed");

        self.handles.push(handle);
    }

    /// Joins every worker. The workers must already have been told to exit or this
    /// will block forever.
    pub(crate) fn join_all(&mut self) {
        for handle in self.handles.drain(..) {
            handle.join().expect("a dispatch worker thread panicked");
        }
    }
}
