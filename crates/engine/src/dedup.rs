//! Per-checksum singleflight.
//!
//! At most one worker in this process builds the stored object for a given
//! fingerprint; everyone else blocks on the guard, then re-checks the dedup
//! index.  Cross-process duplicates are tolerated: equal checksum implies
//! equal plaintext, so a doubly written object is byte-idempotent waste, not
//! corruption.
//!
//! The tracker doubles as the process-local dedup index for rows that are
//! hashed but not yet committed by the batching writer, closing the window
//! where a concurrent worker would re-upload a block the database cannot
//! show it yet.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex};

use benji_common::{BlockUid, Checksum};

#[derive(Default)]
struct FlightState {
    in_flight: HashSet<Vec<u8>>,
    completed: HashMap<Vec<u8>, BlockUid>,
}

#[derive(Default)]
pub struct SingleFlight {
    state: Mutex<FlightState>,
    released: Condvar,
}

impl SingleFlight {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Uncommitted-but-written block for this fingerprint, if any.
    pub fn completed(&self, checksum: &Checksum) -> Option<BlockUid> {
        let state = self.state.lock().expect("singleflight mutex poisoned");
        state.completed.get(checksum.as_bytes()).copied()
    }

    /// Block until no other worker is building this fingerprint, then claim
    /// it.  The claim is released when the guard drops.
    pub fn acquire(self: &Arc<Self>, checksum: &Checksum) -> FlightGuard {
        let key = checksum.as_bytes().to_vec();
        let mut state = self.state.lock().expect("singleflight mutex poisoned");
        while state.in_flight.contains(&key) {
            state = self
                .released
                .wait(state)
                .expect("singleflight mutex poisoned");
        }
        state.in_flight.insert(key.clone());
        FlightGuard {
            tracker: Arc::clone(self),
            key,
        }
    }
}

pub struct FlightGuard {
    tracker: Arc<SingleFlight>,
    key: Vec<u8>,
}

impl FlightGuard {
    /// Record the stored object this fingerprint now maps to, for workers
    /// racing ahead of the row commit.
    pub fn complete(&self, uid: BlockUid) {
        let mut state = self
            .tracker
            .state
            .lock()
            .expect("singleflight mutex poisoned");
        state.completed.insert(self.key.clone(), uid);
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        let mut state = self
            .tracker
            .state
            .lock()
            .expect("singleflight mutex poisoned");
        state.in_flight.remove(&self.key);
        drop(state);
        self.tracker.released.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn checksum(byte: u8) -> Checksum {
        Checksum::from_bytes(vec![byte; 32])
    }

    #[test]
    fn completion_is_visible_after_release() {
        let tracker = SingleFlight::new();
        let guard = tracker.acquire(&checksum(1));
        guard.complete(BlockUid::new(1, 1));
        drop(guard);
        assert_eq!(tracker.completed(&checksum(1)), Some(BlockUid::new(1, 1)));
        assert_eq!(tracker.completed(&checksum(2)), None);
    }

    #[test]
    fn second_acquire_waits_for_the_first() {
        let tracker = SingleFlight::new();
        let guard = tracker.acquire(&checksum(3));

        let contender = {
            let tracker = Arc::clone(&tracker);
            std::thread::spawn(move || {
                let _guard = tracker.acquire(&checksum(3));
            })
        };
        // The contender cannot finish while we hold the claim.
        std::thread::sleep(Duration::from_millis(50));
        assert!(!contender.is_finished());

        drop(guard);
        contender.join().unwrap();
    }

    #[test]
    fn distinct_fingerprints_do_not_contend() {
        let tracker = SingleFlight::new();
        let _one = tracker.acquire(&checksum(4));
        let _two = tracker.acquire(&checksum(5));
    }
}
