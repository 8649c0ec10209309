//! The synchronous fan-out/fan-in dispatcher.

use std::fmt::{self, Debug, Formatter};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{self, AtomicBool};
use std::thread;

use crate::completion::SyncCompletion;
use crate::cursor::StealCursor;
use crate::errors::{DispatchError, MaxConcurrencyError, UsageError};
use crate::gate::BarrierGate;
use crate::pool::{WorkerPool, effective_concurrency};
use crate::ring::{NodePtr, RingNode, WorkRing};
use crate::sink::PanicSink;

/// A registered synchronous action.
type SyncAction = Box<dyn Fn() + Send + Sync>;

/// Coordination state shared between the driver and the workers.
///
/// Deliberately contains no work nodes: workers park on the gate between cycles
/// and only dereference ring pointers while a cycle is running, so the dispatcher
/// can quiesce them through `disposed` and then drop the ring safely. Because the
/// workers hold this block through an `Arc` and it holds nothing back, there is no
/// ownership cycle to leak.
struct Shared {
    gate: BarrierGate,
    cursor: StealCursor<SyncAction>,
    head: NodePtr<SyncAction>,
    sink: PanicSink,
    completion: SyncCompletion,
    disposed: AtomicBool,
}

/// Runs a fixed set of actions in parallel, once per trigger, with no heap
/// allocation in the steady state.
///
/// A dispatcher is configured once - every [`add`][Self::add] before the first
/// [`execute_and_wait`][Self::execute_and_wait] - and then triggered any number of
/// times from a timing loop. Each trigger releases the long-lived workers through
/// a shared gate, runs one action on the calling thread, lets everyone claim
/// leftover actions through a lock-free cursor, and blocks until all actions have
/// finished.
///
/// Panics raised by actions never abort the cycle; they are recorded and surfaced
/// together, at the end, as an [`AggregatePanic`][crate::AggregatePanic].
///
/// # Work distribution
///
/// With effective concurrency W and N registered actions: the first action always
/// runs on the calling thread; the next W-1 each start on a dedicated worker; any
/// further actions are claimed dynamically by whoever finishes its starting action
/// first. Which thread runs a stealable action is unspecified.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// use par_dispatch::SyncDispatcher;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let counter = Arc::new(AtomicUsize::new(0));
///
/// let mut dispatcher = SyncDispatcher::new(2)?;
/// for _ in 0..4 {
///     let counter = Arc::clone(&counter);
///     dispatcher.add(move || {
///         counter.fetch_add(1, Ordering::Relaxed);
///     })?;
/// }
///
/// dispatcher.execute_and_wait()?;
/// assert_eq!(counter.load(Ordering::Relaxed), 4);
///
/// dispatcher.dispose()?;
/// # Ok(())
/// # }
/// ```
pub struct SyncDispatcher {
    shared: Arc<Shared>,
    ring: WorkRing<SyncAction>,
    workers: WorkerPool,
    caller_node: Option<NodePtr<SyncAction>>,
    initial_steal: NodePtr<SyncAction>,
    max_concurrency: usize,
    sealed: bool,
    disposed: bool,
}

impl SyncDispatcher {
    /// Creates a dispatcher with the given maximum concurrency.
    ///
    /// `-1` resolves to the processor count. Explicit values of at least 1 are
    /// used as requested, even beyond the processor count.
    ///
    /// # Errors
    ///
    /// Returns [`MaxConcurrencyError`] for 0 or anything below -1.
    pub fn new(max_concurrency: i32) -> Result<Self, MaxConcurrencyError> {
        let effective = effective_concurrency(max_concurrency)?;

        let sentinel: SyncAction = Box::new(|| {});
        let ring = WorkRing::new(sentinel);

        let shared = Arc::new(Shared {
            gate: BarrierGate::new(),
            cursor: StealCursor::new(ring.head_ptr()),
            head: NodePtr::new(ring.head_ptr()),
            sink: PanicSink::new(),
            completion: SyncCompletion::new(),
            disposed: AtomicBool::new(false),
        });

        Ok(Self {
            shared,
            initial_steal: NodePtr::new(ring.head_ptr()),
            ring,
            workers: WorkerPool::new(effective.saturating_sub(1)),
            caller_node: None,
            max_concurrency: effective,
            sealed: false,
            disposed: false,
        })
    }

    /// The effective maximum concurrency: caller thread plus workers.
    #[must_use]
    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// How many actions have been registered.
    #[must_use]
    pub fn action_count(&self) -> usize {
        self.ring.len()
    }

    /// Registers one action.
    ///
    /// The first registered action runs on the calling thread each cycle. Each
    /// further action gets a dedicated worker thread while pool capacity remains;
    /// beyond that, actions become stealable leftovers.
    ///
    /// Must be called from the configuring thread (enforced by `&mut self`).
    ///
    /// # Errors
    ///
    /// [`UsageError::Disposed`] after dispose, [`UsageError::Sealed`] once the
    /// first cycle has been triggered.
    pub fn add<F>(&mut self, action: F) -> Result<(), UsageError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        if self.disposed {
            return Err(UsageError::Disposed);
        }
        if self.sealed {
            return Err(UsageError::Sealed);
        }

        let node = NodePtr::new(self.ring.append(Box::new(action)));

        if self.caller_node.is_none() {
            self.caller_node = Some(node);
        } else if self.workers.has_capacity() {
            // The new worker raises the gate threshold before it exists, so the
            // driver's next arrival waits for it too.
            self.shared.gate.add_participant();

            let shared = Arc::clone(&self.shared);
            self.workers
                .spawn(move || worker_entrypoint(&shared, node));
        } else if ptr::eq(self.initial_steal.as_ptr(), self.shared.head.as_ptr()) {
            // First action beyond capacity: the cursor starts here each cycle and
            // the rest of the leftovers chain behind it in ring order.
            self.initial_steal = node;
        }

        Ok(())
    }

    /// Triggers one cycle: runs every registered action in parallel and blocks
    /// until all of them have finished.
    ///
    /// # Errors
    ///
    /// [`UsageError`] variants (through [`DispatchError::Usage`]) when the
    /// dispatcher is disposed or has no actions; [`DispatchError::Panicked`] when
    /// the cycle completed but one or more actions panicked - the aggregate
    /// preserves every individual panic.
    pub fn execute_and_wait(&mut self) -> Result<(), DispatchError> {
        if self.disposed {
            return Err(UsageError::Disposed.into());
        }
        let Some(caller_node) = self.caller_node else {
            return Err(UsageError::NoActions.into());
        };

        self.sealed = true;

        self.shared.cursor.reset(self.initial_steal.as_ptr());
        let saved_next = self.ring.detach_head();
        self.shared.completion.begin(self.workers.len() + 1);

        // Releases every parked worker into the cycle; everything above is
        // published to them by the gate.
        self.shared.gate.signal_and_wait();

        run_chain(&self.shared, caller_node.as_ptr());

        self.shared.completion.wait();
        self.ring.reattach_head(saved_next);

        match self.shared.sink.take() {
            Some(aggregate) => Err(aggregate.into()),
            None => Ok(()),
        }
    }

    /// Shuts the dispatcher down: quiesces and joins every worker thread.
    ///
    /// After dispose returns, no worker thread belonging to this dispatcher is
    /// runnable, which matters when the next benchmark on the same host should not
    /// compete with leftover threads.
    ///
    /// # Errors
    ///
    /// [`UsageError::Disposed`] on a second dispose.
    pub fn dispose(&mut self) -> Result<(), UsageError> {
        if self.disposed {
            return Err(UsageError::Disposed);
        }

        self.disposed = true;
        self.caller_node = None;

        // Even a worker that somehow runs one more cycle only executes no-ops.
        for action in self.ring.iter_work_mut() {
            *action = Box::new(|| {});
        }

        self.shared.disposed.store(true, atomic::Ordering::Release);

        // One last release: workers wake, observe the disposed flag and exit.
        self.shared.gate.signal_and_wait();

        let worker_count = self.workers.len();
        self.workers.join_all();
        for _ in 0..worker_count {
            self.shared.gate.remove_participant();
        }

        Ok(())
    }
}

impl Debug for SyncDispatcher {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncDispatcher")
            .field("max_concurrency", &self.max_concurrency)
            .field("action_count", &self.ring.len())
            .field("worker_count", &self.workers.len())
            .field("sealed", &self.sealed)
            .field("disposed", &self.disposed)
            .finish()
    }
}

impl Drop for SyncDispatcher {
    fn drop(&mut self) {
        if self.disposed || thread::panicking() {
            return;
        }

        // Dispose-on-drop: a dispatcher leaked without dispose still quiesces its
        // workers before the ring goes away.
        _ = self.dispose();
    }
}

/// Executes nodes from `start` until the claim loop lands on the sentinel, then
/// reports the chain as done.
fn run_chain(shared: &Shared, start: *mut RingNode<SyncAction>) {
    let mut node = start;

    while !ptr::eq(node, shared.head.as_ptr()) {
        // SAFETY: ring nodes stay alive and unmutated for the whole cycle, and
        // each node is claimed by exactly one thread per cycle.
        let action = unsafe { &*node }.work();

        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| action())) {
            shared.sink.record(payload);
        }

        node = shared.cursor.take_next();
    }

    shared.completion.chain_done();
}

/// What each worker thread runs: rendezvous, check for disposal, run a chain
/// starting from this worker's own node, repeat.
fn worker_entrypoint(shared: &Shared, starting_node: NodePtr<SyncAction>) {
    loop {
        shared.gate.signal_and_wait();

        if shared.disposed.load(atomic::Ordering::Acquire) {
            return;
        }

        run_chain(shared, starting_node.as_ptr());
    }
}
