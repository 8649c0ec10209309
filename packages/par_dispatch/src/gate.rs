//! A reusable rendezvous that parks workers between dispatch cycles.

use parking_lot::{Condvar, Mutex};

/// A reusable N-party rendezvous with a participant count that can grow while
/// other participants are already parked.
///
/// The gate starts with a single participant (the driver). Each worker thread adds
/// itself via the driver calling [`add_participant`] before the spawn. Workers park
/// at the gate between cycles; the driver's own arrival is what releases everybody
/// into the next cycle.
///
/// `std::sync::Barrier` cannot be used here because its participant count is fixed
/// at construction, while this dispatcher learns its worker count one action at a
/// time - with earlier workers already parked at the gate.
///
/// [`add_participant`]: Self::add_participant
pub(crate) struct BarrierGate {
    state: Mutex<GateState>,
    released: Condvar,
}

struct GateState {
    participants: usize,
    arrived: usize,
    generation: u64,
}

impl BarrierGate {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(GateState {
                participants: 1,
                arrived: 0,
                generation: 0,
            }),
            released: Condvar::new(),
        }
    }

    /// Registers one more participant.
    ///
    /// Safe to call while other participants are parked: the release threshold
    /// simply grows, and the parked participants stay parked until everyone -
    /// including the newcomer - has arrived.
    pub(crate) fn add_participant(&self) {
        let mut state = self.state.lock();
        state.participants += 1;
    }

    /// Deregisters one participant. Only valid while the gate is idle.
    pub(crate) fn remove_participant(&self) {
        let mut state = self.state.lock();
        debug_assert_eq!(state.arrived, 0, "participants may only leave an idle gate");
        state.participants -= 1;
    }

    /// Blocks until every registered participant has entered, then releases all of
    /// them together. The release carries the usual mutex ordering, so everything
    /// written before a participant entered is visible to every participant after
    /// the release.
    pub(crate) fn signal_and_wait(&self) {
        let mut state = self.state.lock();

        state.arrived += 1;

        if state.arrived == state.participants {
            state.arrived = 0;
            state.generation = state.generation.wrapping_add(1);
            self.released.notify_all();
            return;
        }

        let generation = state.generation;
        while state.generation == generation {
            self.released.wait(&mut state);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{self, AtomicUsize};
    use std::thread;

    use super::*;
    use crate::test_support::with_watchdog;

    #[test]
    fn single_participant_passes_straight_through() {
        let gate = BarrierGate::new();

        gate.signal_and_wait();
        gate.signal_and_wait();
    }

    #[test]
    fn all_parties_are_released_together() {
        with_watchdog(|| {
            let gate = Arc::new(BarrierGate::new());
            let passed = Arc::new(AtomicUsize::new(0));

            gate.add_participant();
            gate.add_participant();

            let workers: Vec<_> = (0..2)
                .map(|_| {
                    let gate = Arc::clone(&gate);
                    let passed = Arc::clone(&passed);
                    thread::spawn(move || {
                        gate.signal_and_wait();
                        passed.fetch_add(1, atomic::Ordering::SeqCst);
                    })
                })
                .collect();

            gate.signal_and_wait();

            for worker in workers {
                worker.join().expect("gate test worker panicked");
            }

            assert_eq!(passed.load(atomic::Ordering::SeqCst), 2);
        });
    }

    #[test]
    fn participant_added_while_another_is_parked() {
        with_watchdog(|| {
            let gate = Arc::new(BarrierGate::new());

            gate.add_participant();
            let early = {
                let gate = Arc::clone(&gate);
                thread::spawn(move || gate.signal_and_wait())
            };

            // The early worker may already be parked; the newcomer raises the
            // threshold regardless.
            gate.add_participant();
            let late = {
                let gate = Arc::clone(&gate);
                thread::spawn(move || gate.signal_and_wait())
            };

            gate.signal_and_wait();

            early.join().expect("early worker panicked");
            late.join().expect("late worker panicked");
        });
    }

    #[test]
    fn gate_is_reusable_across_generations() {
        with_watchdog(|| {
            let gate = Arc::new(BarrierGate::new());
            let rounds = 100;

            gate.add_participant();

            let worker = {
                let gate = Arc::clone(&gate);
                thread::spawn(move || {
                    for _ in 0..rounds {
                        gate.signal_and_wait();
                    }
                })
            };

            for _ in 0..rounds {
                gate.signal_and_wait();
            }

            worker.join().expect("gate test worker panicked");
        });
    }
}
