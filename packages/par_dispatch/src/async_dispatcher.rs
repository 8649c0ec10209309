//! The asynchronous fan-out/fan-in dispatcher.
//!
//! Shares the ring, gate and cursor structure of the synchronous variant, with one
//! twist: actions return futures, and a worker whose current future suspends does
//! not wait for it. Responsibility for "take the next node" transfers to a
//! per-node continuation - a [`std::task::Wake`] implementation - and the worker
//! thread returns straight to the rendezvous. When the future's waker fires, the
//! continuation re-polls it and, on completion, carries the drain loop onward from
//! wherever the cursor stands.

use std::fmt::{self, Debug, Formatter};
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{self, AtomicBool, AtomicU8};
use std::task::{Context, Poll, Wake, Waker};
use std::thread;

use parking_lot::Mutex;

use crate::completion::AsyncCompletion;
use crate::cursor::StealCursor;
use crate::errors::{AggregatePanic, MaxConcurrencyError, UsageError};
use crate::gate::BarrierGate;
use crate::pool::{WorkerPool, effective_concurrency};
use crate::ring::{NodePtr, RingNode, WorkRing};
use crate::sink::PanicSink;

/// The future produced by invoking a registered action.
type ActionFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A registered asynchronous action.
type AsyncAction = Box<dyn Fn() -> ActionFuture + Send + Sync>;

/// What an async ring node carries. `None` marks end-of-work: the sentinel always,
/// and every node once the dispatcher is disposed.
type NodeWork = Option<AsyncWork>;

struct AsyncWork {
    action: AsyncAction,
    continuation: Arc<NodeContinuation>,
}

/// Coordination state shared between the driver, the workers and every node
/// continuation. Holds no ring nodes; see the synchronous variant for why.
struct Shared {
    gate: BarrierGate,
    cursor: StealCursor<NodeWork>,
    head: NodePtr<NodeWork>,
    sink: PanicSink,
    completion: AsyncCompletion,
    disposed: AtomicBool,
}

// Continuation states. The state machine serialises polls of the node's future
// and turns a wake that lands during a poll into one more poll instead of a
// deadlock or a lost wakeup.
const IDLE: u8 = 0; // no future in the slot; wakes are stale
const WAITING: u8 = 1; // a suspended future is in the slot, waiting for a wake
const POLLING: u8 = 2; // some thread is polling the future right now
const NOTIFIED: u8 = 3; // woken mid-poll; the polling thread re-polls

/// How a chain segment ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ChainStep {
    /// The node's future completed (or its action panicked); the chain continues.
    Completed,
    /// The future suspended; this continuation now owns the rest of the chain.
    Suspended,
}

/// Drives one node's suspended future and, once it completes, carries the drain
/// loop onward in place of the worker that originally started the chain.
///
/// Waker clones of this object may outlive the cycle (a future can stash them
/// anywhere). A stale wake finds the slot empty - or the dispatcher disposed -
/// and backs out without touching the ring.
struct NodeContinuation {
    shared: Arc<Shared>,
    state: AtomicU8,
    /// The pending future. Only the thread that won the transition into `POLLING`
    /// touches the slot, so the mutex is never contended; it exists to keep the
    /// slot access safe without an `unsafe` cell.
    slot: Mutex<Option<ActionFuture>>,
}

impl NodeContinuation {
    fn new(shared: Arc<Shared>) -> Arc<Self> {
        Arc::new(Self {
            shared,
            state: AtomicU8::new(IDLE),
            slot: Mutex::new(None),
        })
    }

    /// Adopts a freshly invoked future for this cycle and performs its first poll.
    fn adopt(this: &Arc<Self>, future: ActionFuture) -> ChainStep {
        debug_assert_eq!(this.state.load(atomic::Ordering::Relaxed), IDLE);

        *this.slot.lock() = Some(future);
        this.state.store(POLLING, atomic::Ordering::Release);

        Self::poll_owned(this)
    }

    /// Polls the future in the slot until it either completes or suspends with no
    /// pending notification. Only called by the thread that owns the `POLLING`
    /// state.
    fn poll_owned(this: &Arc<Self>) -> ChainStep {
        let waker = Waker::from(Arc::clone(this));
        let mut cx = Context::from_waker(&waker);

        loop {
            let poll_result = {
                let mut slot = this.slot.lock();
                let future = slot
                    .as_mut()
                    .expect("the slot holds a future while its node is POLLING");

                // An inline wake during this poll only touches `state`, never the
                // slot, so holding the lock across the poll cannot deadlock.
                catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx)))
            };

            match poll_result {
                Ok(Poll::Ready(())) => {
                    *this.slot.lock() = None;
                    this.state.store(IDLE, atomic::Ordering::Release);
                    return ChainStep::Completed;
                }
                Err(payload) => {
                    *this.slot.lock() = None;
                    this.state.store(IDLE, atomic::Ordering::Release);
                    this.shared.sink.record(payload);
                    return ChainStep::Completed;
                }
                Ok(Poll::Pending) => {
                    match this.state.compare_exchange(
                        POLLING,
                        WAITING,
                        atomic::Ordering::AcqRel,
                        atomic::Ordering::Acquire,
                    ) {
                        Ok(_) => return ChainStep::Suspended,
                        Err(_) => {
                            // NOTIFIED: a wake raced the poll. Reclaim and re-poll.
                            this.state.store(POLLING, atomic::Ordering::Release);
                        }
                    }
                }
            }
        }
    }

    /// The wake path: claim the right to poll, and if the future then completes,
    /// resume the drain loop that was suspended at this node.
    fn on_wake(this: &Arc<Self>) {
        // A wake that arrives after dispose must not touch the ring.
        if this.shared.disposed.load(atomic::Ordering::Acquire) {
            return;
        }

        loop {
            match this.state.compare_exchange(
                WAITING,
                POLLING,
                atomic::Ordering::AcqRel,
                atomic::Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(POLLING) => {
                    // Someone is mid-poll; flag them to poll once more. If the flag
                    // does not stick, the state moved on - retry from scratch.
                    if this
                        .state
                        .compare_exchange(
                            POLLING,
                            NOTIFIED,
                            atomic::Ordering::AcqRel,
                            atomic::Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        return;
                    }
                }
                // IDLE: stale wake. NOTIFIED: already flagged. Nothing to do.
                Err(_) => return,
            }
        }

        if Self::poll_owned(this) == ChainStep::Completed {
            drive_chain(&this.shared, this.shared.cursor.take_next());
        }
    }
}

impl Wake for NodeContinuation {
    fn wake(self: Arc<Self>) {
        Self::on_wake(&self);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        Self::on_wake(self);
    }
}

/// Runs nodes starting at `start` until the chain suspends or reaches end-of-work,
/// reporting the chain done in the latter case.
fn drive_chain(shared: &Arc<Shared>, start: *mut RingNode<NodeWork>) {
    let mut node = start;

    loop {
        // SAFETY: ring nodes stay alive and unmutated for the whole cycle; a chain
        // only holds node references while its cycle is running.
        let Some(work) = unsafe { &*node }.work().as_ref() else {
            // The sentinel (or a disposed node): this chain has nothing left.
            shared.completion.chain_done();
            return;
        };

        let future = match catch_unwind(AssertUnwindSafe(|| (work.action)())) {
            Ok(future) => future,
            Err(payload) => {
                shared.sink.record(payload);
                node = shared.cursor.take_next();
                continue;
            }
        };

        match NodeContinuation::adopt(&work.continuation, future) {
            ChainStep::Completed => node = shared.cursor.take_next(),
            ChainStep::Suspended => return,
        }
    }
}

/// What each worker thread runs.
fn worker_entrypoint(shared: &Arc<Shared>, starting_node: NodePtr<NodeWork>) {
    loop {
        shared.gate.signal_and_wait();

        if shared.disposed.load(atomic::Ordering::Acquire) {
            return;
        }

        drive_chain(shared, starting_node.as_ptr());
    }
}

/// Runs a fixed set of asynchronous actions in parallel, once per trigger,
/// completing a future when all of them have finished.
///
/// The structure mirrors [`SyncDispatcher`][crate::SyncDispatcher]: long-lived
/// workers, a circular work list, lock-free stealing of leftovers. The difference
/// is that an action's future may suspend, in which case the worker moves on (back
/// to the rendezvous) and the future's own waker later resumes the drain from
/// where it stopped.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// use par_dispatch::AsyncDispatcher;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let counter = Arc::new(AtomicUsize::new(0));
///
/// let mut dispatcher = AsyncDispatcher::new(2)?;
/// for _ in 0..2 {
///     let counter = Arc::clone(&counter);
///     dispatcher.add(move || {
///         let counter = Arc::clone(&counter);
///         async move {
///             counter.fetch_add(1, Ordering::Relaxed);
///         }
///     })?;
/// }
///
/// // The returned future can be awaited or, as here, blocked on.
/// dispatcher.execute_and_wait_async()?.wait()?;
/// assert_eq!(counter.load(Ordering::Relaxed), 2);
///
/// dispatcher.dispose()?;
/// # Ok(())
/// # }
/// ```
pub struct AsyncDispatcher {
    shared: Arc<Shared>,
    ring: WorkRing<NodeWork>,
    workers: WorkerPool,
    caller_node: Option<NodePtr<NodeWork>>,
    initial_steal: NodePtr<NodeWork>,
    /// The saved sentinel link while a cycle is in flight; doubles as the
    /// "running" flag.
    saved_next: Option<NodePtr<NodeWork>>,
    max_concurrency: usize,
    sealed: bool,
    disposed: bool,
}

impl AsyncDispatcher {
    /// Creates a dispatcher with the given maximum concurrency.
    ///
    /// `-1` resolves to the processor count. Explicit values of at least 1 are
    /// used as requested.
    ///
    /// # Errors
    ///
    /// Returns [`MaxConcurrencyError`] for 0 or anything below -1.
    pub fn new(max_concurrency: i32) -> Result<Self, MaxConcurrencyError> {
        let effective = effective_concurrency(max_concurrency)?;

        let ring: WorkRing<NodeWork> = WorkRing::new(None);

        let shared = Arc::new(Shared {
            gate: BarrierGate::new(),
            cursor: StealCursor::new(ring.head_ptr()),
            head: NodePtr::new(ring.head_ptr()),
            sink: PanicSink::new(),
            completion: AsyncCompletion::new(),
            disposed: AtomicBool::new(false),
        });

        Ok(Self {
            shared,
            initial_steal: NodePtr::new(ring.head_ptr()),
            ring,
            workers: WorkerPool::new(effective.saturating_sub(1)),
            caller_node: None,
            saved_next: None,
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

    /// Registers one asynchronous action.
    ///
    /// Distribution rules match the synchronous variant: first action on the
    /// caller, one dedicated worker per further action while capacity remains,
    /// the rest stealable.
    ///
    /// # Errors
    ///
    /// [`UsageError::Disposed`] after dispose, [`UsageError::Sealed`] once the
    /// first cycle has been triggered.
    pub fn add<F, Fut>(&mut self, action: F) -> Result<(), UsageError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.disposed {
            return Err(UsageError::Disposed);
        }
        if self.sealed {
            return Err(UsageError::Sealed);
        }

        let action: AsyncAction = Box::new(move || {
            let future: ActionFuture = Box::pin(action());
            future
        });

        let work = Some(AsyncWork {
            action,
            continuation: NodeContinuation::new(Arc::clone(&self.shared)),
        });

        let node = NodePtr::new(self.ring.append(work));

        if self.caller_node.is_none() {
            self.caller_node = Some(node);
        } else if self.workers.has_capacity() {
            self.shared.gate.add_participant();

            let shared = Arc::clone(&self.shared);
            self.workers
                .spawn(move || worker_entrypoint(&shared, node));
        } else if std::ptr::eq(self.initial_steal.as_ptr(), self.shared.head.as_ptr()) {
            self.initial_steal = node;
        }

        Ok(())
    }

    /// Triggers one cycle and returns a future that completes when every action
    /// has finished.
    ///
    /// The calling thread starts the caller chain inline before returning: ready
    /// futures complete on the spot, the first suspension hands the chain to its
    /// continuation. The returned [`CycleCompletion`] can be awaited or blocked on
    /// via [`wait`][CycleCompletion::wait]; its output carries the cycle's
    /// aggregated panics, if any.
    ///
    /// Dropping the returned future abandons the cycle: it still runs to
    /// completion in the background, and its outcome is discarded when the next
    /// trigger finds it finished.
    ///
    /// # Errors
    ///
    /// [`UsageError::Disposed`], [`UsageError::NoActions`], or
    /// [`UsageError::CycleInProgress`] when an abandoned cycle has not finished
    /// yet.
    pub fn execute_and_wait_async(&mut self) -> Result<CycleCompletion<'_>, UsageError> {
        if self.disposed {
            return Err(UsageError::Disposed);
        }

        self.finish_abandoned_cycle()?;

        let Some(caller_node) = self.caller_node else {
            return Err(UsageError::NoActions);
        };

        self.sealed = true;

        self.shared.cursor.reset(self.initial_steal.as_ptr());
        self.saved_next = Some(NodePtr::new(self.ring.detach_head()));
        self.shared.completion.begin(self.workers.len() + 1);

        self.shared.gate.signal_and_wait();

        drive_chain(&self.shared, caller_node.as_ptr());

        Ok(CycleCompletion {
            dispatcher: self,
            finished: false,
        })
    }

    /// Shuts the dispatcher down: quiesces and joins every worker thread.
    ///
    /// # Errors
    ///
    /// [`UsageError::CycleInProgress`] while an abandoned cycle is still running;
    /// [`UsageError::Disposed`] on a second dispose.
    pub fn dispose(&mut self) -> Result<(), UsageError> {
        if self.disposed {
            return Err(UsageError::Disposed);
        }

        self.finish_abandoned_cycle()?;

        self.disposed = true;
        self.caller_node = None;

        // Absent work everywhere: a racing chain sees end-of-work immediately, and
        // the user's actions (with their captured state) are released now.
        for work in self.ring.iter_work_mut() {
            *work = None;
        }

        self.shared.disposed.store(true, atomic::Ordering::Release);
        self.shared.gate.signal_and_wait();

        let worker_count = self.workers.len();
        self.workers.join_all();
        for _ in 0..worker_count {
            self.shared.gate.remove_participant();
        }

        Ok(())
    }

    /// Performs the end-of-cycle bookkeeping once the completion cell has fired.
    fn finish_cycle(&mut self) -> Result<(), AggregatePanic> {
        debug_assert!(self.shared.completion.is_fired());

        let saved = self
            .saved_next
            .take()
            .expect("a cycle is in flight when its completion fires");
        self.ring.reattach_head(saved.as_ptr());
        self.shared.completion.reset();

        match self.shared.sink.take() {
            Some(aggregate) => Err(aggregate),
            None => Ok(()),
        }
    }

    /// Resolves a cycle whose [`CycleCompletion`] was dropped unconsumed: resets a
    /// finished one (discarding its outcome with the future that abandoned it) or
    /// reports one still in flight.
    fn finish_abandoned_cycle(&mut self) -> Result<(), UsageError> {
        if self.saved_next.is_none() {
            return Ok(());
        }

        if !self.shared.completion.is_fired() {
            return Err(UsageError::CycleInProgress);
        }

        _ = self.finish_cycle();
        Ok(())
    }
}

impl Debug for AsyncDispatcher {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncDispatcher")
            .field("max_concurrency", &self.max_concurrency)
            .field("action_count", &self.ring.len())
            .field("worker_count", &self.workers.len())
            .field("running", &self.saved_next.is_some())
            .field("sealed", &self.sealed)
            .field("disposed", &self.disposed)
            .finish()
    }
}

impl Drop for AsyncDispatcher {
    fn drop(&mut self) {
        if self.disposed {
            return;
        }

        if thread::panicking() {
            // No orderly shutdown mid-panic, but stale continuations must still
            // find the flag set instead of a freed ring.
            self.shared.disposed.store(true, atomic::Ordering::Release);
            return;
        }

        if self.saved_next.is_some() && !self.shared.completion.is_fired() {
            // An abandoned cycle is still running; wait it out before tearing the
            // ring down under the chains.
            self.shared.completion.wait();
        }

        _ = self.dispose();
    }
}

/// The future side of one dispatch cycle; completes when every action has
/// finished.
///
/// Single-shot: polling it after it returned `Ready` panics. For harnesses that
/// treat the cycle as blockable, [`wait`][Self::wait] parks the calling thread
/// instead of requiring an executor.
#[must_use = "the cycle outcome is only observable through this future"]
pub struct CycleCompletion<'d> {
    dispatcher: &'d mut AsyncDispatcher,
    finished: bool,
}

impl CycleCompletion<'_> {
    /// Blocks the calling thread until the cycle completes.
    ///
    /// # Errors
    ///
    /// Returns the cycle's [`AggregatePanic`] if any action panicked.
    ///
    /// # Panics
    ///
    /// Panics if the future already completed through [`Future::poll`].
    pub fn wait(self) -> Result<(), AggregatePanic> {
        assert!(
            !self.finished,
            "a cycle completion must not be waited on after it completes"
        );

        self.dispatcher.shared.completion.wait();

        self.dispatcher.finish_cycle()
    }
}

impl Future for CycleCompletion<'_> {
    type Output = Result<(), AggregatePanic>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        assert!(
            !this.finished,
            "a cycle completion must not be polled after it completes"
        );

        let completion = &this.dispatcher.shared.completion;
        if completion.is_fired() || completion.arm(cx.waker()) {
            this.finished = true;
            return Poll::Ready(this.dispatcher.finish_cycle());
        }

        Poll::Pending
    }
}

impl Debug for CycleCompletion<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("CycleCompletion")
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}
