//! Lock-free claiming of leftover work via an atomic cursor into the ring.

use std::sync::atomic::{self, AtomicPtr};

use crate::ring::RingNode;

/// An atomic pointer into the work ring from which workers claim nodes beyond
/// their initial fan-out assignment.
///
/// At the start of a cycle the driver positions the cursor at the first stealable
/// node (or at the sentinel when every node is covered by the fan-out). Claiming is
/// a CAS that advances the cursor to the claimed node's successor; because the ring
/// is closed, an exhausted cursor simply parks at the sentinel, where every further
/// claim returns the sentinel again.
pub(crate) struct StealCursor<W> {
    pos: AtomicPtr<RingNode<W>>,
}

impl<W> StealCursor<W> {
    pub(crate) fn new(start: *mut RingNode<W>) -> Self {
        Self {
            pos: AtomicPtr::new(start),
        }
    }

    /// Positions the cursor for the next cycle. Only the driver calls this, and
    /// only while no cycle is running.
    pub(crate) fn reset(&self, start: *mut RingNode<W>) {
        self.pos.store(start, atomic::Ordering::Release);
    }

    /// Claims the node the cursor is at and advances it to the successor.
    ///
    /// Callers recognise end-of-work by the returned node: it is the sentinel
    /// (compared by address, or observed through its empty work value). The claim
    /// loop performs no null checks - the ring invariant guarantees every `next`
    /// is a live node.
    pub(crate) fn take_next(&self) -> *mut RingNode<W> {
        let mut current = self.pos.load(atomic::Ordering::Acquire);

        loop {
            // SAFETY: every pointer that enters the cursor refers to a node owned by
            // the dispatcher's ring, which stays alive for the whole cycle; claimed
            // nodes are only read, never mutated, while the cycle runs.
            let next = unsafe { &*current }.next();

            match self.pos.compare_exchange_weak(
                current,
                next,
                atomic::Ordering::AcqRel,
                atomic::Ordering::Acquire,
            ) {
                Ok(_) => return current,
                Err(actual) => current = actual,
            }
        }
    }
}
