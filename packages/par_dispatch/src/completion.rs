//! Signals that every chain of a dispatch cycle has finished.
//!
//! Both dispatcher variants count down the same way - one decrement per chain,
//! where a chain is a worker's (or the caller's) run from its starting node to the
//! sentinel - but differ in what "firing" means. The synchronous variant unblocks
//! the driver; the asynchronous variant completes a waker-based cell that backs
//! the cycle future, invoking whatever continuation the consumer installed exactly
//! once.

use std::hint::spin_loop;
use std::sync::Arc;
use std::sync::atomic::{self, AtomicU8, AtomicUsize};
use std::task::{Wake, Waker};
use std::thread::{self, Thread};

use parking_lot::{Condvar, Mutex};

/// How many times the driver checks the counter before escalating from busy
/// waiting to a condvar sleep. Chains are expected to be short, so most cycles
/// finish inside the spin window; the condvar only matters when the OS preempts
/// a worker mid-chain.
const SPIN_ITERS: usize = 200;

/// Completion signal for the synchronous dispatcher: the driver blocks on it
/// until every chain has reported done.
pub(crate) struct SyncCompletion {
    pending: AtomicUsize,
    lock: Mutex<()>,
    zeroed: Condvar,
}

impl SyncCompletion {
    pub(crate) fn new() -> Self {
        Self {
            pending: AtomicUsize::new(0),
            lock: Mutex::new(()),
            zeroed: Condvar::new(),
        }
    }

    /// Arms the signal for a cycle with `chains` participants (workers plus the
    /// caller). Driver-only, before the gate releases the workers.
    pub(crate) fn begin(&self, chains: usize) {
        debug_assert_eq!(self.pending.load(atomic::Ordering::Relaxed), 0);

        self.pending.store(chains, atomic::Ordering::Release);
    }

    /// Reports one chain as finished; the final report fires the signal.
    pub(crate) fn chain_done(&self) {
        if self.pending.fetch_sub(1, atomic::Ordering::AcqRel) == 1 {
            // Signalling under the lock closes the window where the driver has
            // observed a non-zero count but has not started waiting yet.
            let _guard = self.lock.lock();
            self.zeroed.notify_one();
        }
    }

    /// Blocks the driver until every chain has reported done.
    ///
    /// Busy-waits first, then escalates to a condvar sleep so a preempted worker
    /// does not pin the driver to a core.
    pub(crate) fn wait(&self) {
        for _ in 0..SPIN_ITERS {
            if self.pending.load(atomic::Ordering::Acquire) == 0 {
                return;
            }
            spin_loop();
        }

        let mut guard = self.lock.lock();
        while self.pending.load(atomic::Ordering::Acquire) != 0 {
            self.zeroed.wait(&mut guard);
        }
    }
}

const VACANT: u8 = 0;
const ARMED: u8 = 1;
const FIRED: u8 = 2;

/// Completion signal for the asynchronous dispatcher: a single-shot (per cycle)
/// waker cell with three states.
///
/// Legitimate transitions are VACANT -> ARMED (a consumer installs its waker) and
/// {VACANT, ARMED} -> FIRED (the last chain completes). A consumer that installs
/// after the fire loses the race on purpose: [`arm`] reports it and the caller
/// completes inline, which is what makes the install race-free.
///
/// [`arm`]: Self::arm
pub(crate) struct AsyncCompletion {
    pending: AtomicUsize,
    state: AtomicU8,
    waker: Mutex<Option<Waker>>,
}

impl AsyncCompletion {
    pub(crate) fn new() -> Self {
        Self {
            pending: AtomicUsize::new(0),
            state: AtomicU8::new(VACANT),
            waker: Mutex::new(None),
        }
    }

    /// Arms the signal for a cycle with `chains` participants. Driver-only; the
    /// cell must have been [`reset`][Self::reset] since the previous cycle.
    pub(crate) fn begin(&self, chains: usize) {
        debug_assert_eq!(self.pending.load(atomic::Ordering::Relaxed), 0);
        debug_assert_eq!(self.state.load(atomic::Ordering::Relaxed), VACANT);

        self.pending.store(chains, atomic::Ordering::Release);
    }

    /// Reports one chain as finished; the final report fires the cell.
    pub(crate) fn chain_done(&self) {
        if self.pending.fetch_sub(1, atomic::Ordering::AcqRel) == 1 {
            self.fire();
        }
    }

    fn fire(&self) {
        let previous = self.state.swap(FIRED, atomic::Ordering::AcqRel);

        if previous == ARMED {
            if let Some(waker) = self.waker.lock().take() {
                waker.wake();
            }
        }
    }

    pub(crate) fn is_fired(&self) -> bool {
        self.state.load(atomic::Ordering::Acquire) == FIRED
    }

    /// Installs `waker` as the continuation to invoke on fire.
    ///
    /// Returns `true` when the cell has already fired - the install lost the race
    /// and the caller must complete inline instead of waiting for a wake. Re-arming
    /// while already armed just replaces the stored waker.
    pub(crate) fn arm(&self, waker: &Waker) -> bool {
        *self.waker.lock() = Some(waker.clone());

        match self.state.compare_exchange(
            VACANT,
            ARMED,
            atomic::Ordering::AcqRel,
            atomic::Ordering::Acquire,
        ) {
            Ok(_) => false,
            Err(current) => current == FIRED,
        }
    }

    /// Blocks the calling thread until the cell fires.
    ///
    /// This is the blocking-consumer path: it installs a park-based waker and
    /// sleeps, so harnesses that treat the cycle future as blockable stay correct.
    pub(crate) fn wait(&self) {
        let waker = Waker::from(Arc::new(Unparker(thread::current())));

        loop {
            if self.arm(&waker) {
                return;
            }

            // An unpark that lands before the park is not lost; it is consumed by
            // the park. Spurious wakeups just travel around the loop again.
            thread::park();

            if self.is_fired() {
                return;
            }
        }
    }

    /// Returns the cell to its initial state between cycles. Driver-only, and only
    /// after the fire has been observed.
    pub(crate) fn reset(&self) {
        debug_assert_eq!(self.pending.load(atomic::Ordering::Relaxed), 0);

        self.state.store(VACANT, atomic::Ordering::Release);
        *self.waker.lock() = None;
    }
}

/// Wakes a parked thread; backs the blocking-consumer path.
struct Unparker(Thread);

impl Wake for Unparker {
    fn wake(self: Arc<Self>) {
        self.0.unpark();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.0.unpark();
    }
}
