//! Proves the synchronous trigger allocates nothing in the steady state.
//!
//! A counting wrapper around the system allocator observes every allocation in
//! the process. After a warm-up phase (which absorbs lazily initialised
//! thread-parking state), a million consecutive trigger cycles must not allocate
//! at all - the dispatcher's whole point is that its per-cycle cost contains no
//! heap traffic.

use std::alloc::{GlobalAlloc, Layout, System};
use std::sync::atomic::{AtomicU64, Ordering};

use par_dispatch::SyncDispatcher;

static ALLOCATIONS: AtomicU64 = AtomicU64::new(0);

/// Counts allocation operations; deallocations are passed through untouched.
struct CountingAllocator;

// SAFETY: every operation delegates to the system allocator unchanged; the
// wrapper only increments a counter on the allocating paths.
unsafe impl GlobalAlloc for CountingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        ALLOCATIONS.fetch_add(1, Ordering::Relaxed);

        // SAFETY: forwarded as-is.
        unsafe { System.alloc(layout) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        // SAFETY: forwarded as-is.
        unsafe { System.dealloc(ptr, layout) }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        ALLOCATIONS.fetch_add(1, Ordering::Relaxed);

        // SAFETY: forwarded as-is.
        unsafe { System.alloc_zeroed(layout) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        ALLOCATIONS.fetch_add(1, Ordering::Relaxed);

        // SAFETY: forwarded as-is.
        unsafe { System.realloc(ptr, layout, new_size) }
    }
}

#[global_allocator]
static ALLOCATOR: CountingAllocator = CountingAllocator;

#[test]
fn a_million_cycles_allocate_nothing() {
    let mut dispatcher = SyncDispatcher::new(1).expect("1 is a valid concurrency");
    dispatcher.add(|| {}).expect("dispatcher is configuring");

    // Warm-up: the first cycles may create lazily initialised parking state.
    for _ in 0..1_000 {
        dispatcher.execute_and_wait().expect("no action panics");
    }

    let before = ALLOCATIONS.load(Ordering::SeqCst);

    for _ in 0..1_000_000 {
        dispatcher.execute_and_wait().expect("no action panics");
    }

    let after = ALLOCATIONS.load(Ordering::SeqCst);

    assert_eq!(
        after - before,
        0,
        "steady-state trigger cycles must not allocate"
    );

    dispatcher.dispose().expect("first dispose succeeds");
}
