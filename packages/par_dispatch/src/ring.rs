//! The circular work list that dispatch cycles drain.
//!
//! Every registered action becomes one node in a singly-linked ring that terminates
//! at a head sentinel. The ring is closed at all times - every `next` pointer refers
//! to a live node - so the hot claim loop in the cursor never needs a null check.
//! The sentinel doubles as the end-of-work marker: its work value is recognisably
//! empty and reaching it means the cycle has nothing left to hand out.
//!
//! At the start of a cycle the driver splices the sentinel out (`head.next` is saved
//! and pointed back at the sentinel itself) so that a cursor which runs off the end
//! of the registered nodes parks at the sentinel instead of wrapping around into
//! nodes that were already claimed. The saved link is restored when the cycle ends.

use std::sync::atomic::{self, AtomicPtr};

/// One link in the circular work list.
pub(crate) struct RingNode<W> {
    /// Written only by the configuring thread while no cycle is running; read by any
    /// worker during a cycle. Publication to the workers happens via the
    /// release/acquire pair on the dispatcher's gate, so these accesses themselves
    /// carry no ordering obligations beyond atomicity.
    next: AtomicPtr<RingNode<W>>,

    work: W,
}

impl<W> RingNode<W> {
    pub(crate) fn work(&self) -> &W {
        &self.work
    }

    pub(crate) fn work_mut(&mut self) -> &mut W {
        &mut self.work
    }

    pub(crate) fn next(&self) -> *mut RingNode<W> {
        self.next.load(atomic::Ordering::Acquire)
    }
}

/// The set of work nodes registered with a dispatcher, linked into a ring behind
/// a head sentinel.
///
/// Nodes are boxed so their addresses stay stable for the lifetime of the ring;
/// the rest of the dispatcher refers to them by raw pointer. The ring exclusively
/// owns every node, so the pointers remain valid until the ring is dropped.
pub(crate) struct WorkRing<W> {
    head: Box<RingNode<W>>,
    nodes: Vec<Box<RingNode<W>>>,
}

impl<W> WorkRing<W> {
    /// Creates an empty ring whose sentinel carries `sentinel_work`.
    ///
    /// The sentinel's work value must be recognisably empty (a no-op or `None`),
    /// as a defence for any code path that executes it anyway.
    pub(crate) fn new(sentinel_work: W) -> Self {
        let head = Box::new(RingNode {
            next: AtomicPtr::new(std::ptr::null_mut()),
            work: sentinel_work,
        });

        let ring = Self {
            head,
            nodes: Vec::new(),
        };

        // An empty ring is the sentinel pointing at itself.
        ring.head.next.store(ring.head_ptr(), atomic::Ordering::Release);

        ring
    }

    /// The sentinel's address, used both as the "end of work" identity and as the
    /// parking position for an exhausted cursor.
    pub(crate) fn head_ptr(&self) -> *mut RingNode<W> {
        (&raw const *self.head).cast_mut()
    }

    /// Appends a node carrying `work` at the tail of the ring, immediately before
    /// the sentinel, and returns its stable address.
    pub(crate) fn append(&mut self, work: W) -> *mut RingNode<W> {
        let head_ptr = self.head_ptr();

        let node = Box::new(RingNode {
            next: AtomicPtr::new(head_ptr),
            work,
        });
        let node_ptr = (&raw const *node).cast_mut();

        let tail: &RingNode<W> = match self.nodes.last() {
            Some(tail) => tail,
            None => &self.head,
        };
        tail.next.store(node_ptr, atomic::Ordering::Release);

        self.nodes.push(node);

        node_ptr
    }

    /// Splices the sentinel out for the duration of a cycle: its outgoing link is
    /// saved and replaced with a self-link, so workers observe an "empty" ring once
    /// the real nodes are exhausted. Returns the saved link for [`reattach_head`].
    ///
    /// [`reattach_head`]: Self::reattach_head
    pub(crate) fn detach_head(&self) -> *mut RingNode<W> {
        let saved = self.head.next.load(atomic::Ordering::Relaxed);
        self.head.next.store(self.head_ptr(), atomic::Ordering::Release);
        saved
    }

    /// Restores the sentinel's outgoing link after a cycle.
    pub(crate) fn reattach_head(&self, saved: *mut RingNode<W>) {
        self.head.next.store(saved, atomic::Ordering::Release);
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Mutable access to every registered node's work value, used by the dispose
    /// protocol to overwrite actions with empty values.
    pub(crate) fn iter_work_mut(&mut self) -> impl Iterator<Item = &mut W> {
        self.nodes.iter_mut().map(|node| node.work_mut())
    }
}

/// A raw node address that may cross thread boundaries.
///
/// This is just an address: holders may only dereference it while the dispatcher
/// guarantees the ring is alive and the node's work value is not being mutated,
/// which is the case for the whole duration of a dispatch cycle.
pub(crate) struct NodePtr<W>(*mut RingNode<W>);

impl<W> NodePtr<W> {
    pub(crate) fn new(ptr: *mut RingNode<W>) -> Self {
        Self(ptr)
    }

    pub(crate) fn as_ptr(self) -> *mut RingNode<W> {
        self.0
    }
}

impl<W> Clone for NodePtr<W> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<W> Copy for NodePtr<W> {}

// SAFETY: A NodePtr is only dereferenced as a shared reference, and only while the
// owning dispatcher guarantees the ring outlives the access (workers are quiesced
// before the ring is dropped). Sharing &RingNode<W> across threads requires W: Sync.
unsafe impl<W> Send for NodePtr<W> where W: Sync {}

// SAFETY: See the Send impl; the same reasoning covers shared access.
unsafe impl<W> Sync for NodePtr<W> where W: Sync {}
