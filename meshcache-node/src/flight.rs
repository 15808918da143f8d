//! # Single-Flight Load Coalescing
//!
//! Purpose: Guarantee that at most one loader runs per (cache, key) on this
//! node while concurrent callers block on the in-flight result.
//!
//! ## Design Principles
//! 1. **One Map, Small States**: A single map of `Idle -> Loading -> Idle`
//!    flights keyed by the (cache, key) pair; no separate lock-object map
//!    to leak, and no joined-string keys that could collide when a cache
//!    name or key contains a separator.
//! 2. **Loader Outside Locks**: The leader runs the loader with no map or
//!    slot lock held, so unrelated keys are never blocked behind it.
//! 3. **Reclaim On Completion**: The map entry is removed as soon as the
//!    outcome is published; the flight itself is freed when the last
//!    waiter drops its handle.
//! 4. **No Stranded Waiters**: A panicking loader still publishes a
//!    failure through a completion guard.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;

type FlightKey = (String, String);

#[derive(Debug)]
enum FlightSlot {
    Pending,
    Done(Arc<[u8]>),
    Failed(String),
}

#[derive(Debug)]
struct Flight {
    slot: Mutex<FlightSlot>,
    cv: Condvar,
}

/// Coalesces concurrent loads per (cache, key).
#[derive(Debug, Default)]
pub struct FlightGroup {
    flights: Mutex<HashMap<FlightKey, Arc<Flight>>>,
}

/// Publishes a failure if the leader unwinds before completing.
struct CompletionGuard<'a> {
    group: &'a FlightGroup,
    token: &'a FlightKey,
    flight: &'a Arc<Flight>,
    armed: bool,
}

impl CompletionGuard<'_> {
    fn complete(mut self, outcome: &Result<Arc<[u8]>, String>) {
        self.publish(match outcome {
            Ok(value) => FlightSlot::Done(Arc::clone(value)),
            Err(message) => FlightSlot::Failed(message.clone()),
        });
        self.armed = false;
    }

    fn publish(&self, slot: FlightSlot) {
        *self.flight.slot.lock() = slot;
        self.group.flights.lock().remove(self.token);
        self.flight.cv.notify_all();
    }
}

impl Drop for CompletionGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.publish(FlightSlot::Failed("loader panicked".to_string()));
        }
    }
}

impl FlightGroup {
    /// Creates an empty flight group.
    pub fn new() -> Self {
        FlightGroup::default()
    }

    /// Runs `leader_fn` once per concurrent burst for `(cache, key)`.
    ///
    /// The first caller becomes the leader and executes `leader_fn`; every
    /// caller that arrives before the outcome is published blocks and then
    /// observes the same outcome. Failed outcomes are never cached, so the
    /// next burst elects a fresh leader.
    pub fn execute<F>(&self, cache: &str, key: &str, leader_fn: F) -> Result<Arc<[u8]>, String>
    where
        F: FnOnce() -> Result<Arc<[u8]>, String>,
    {
        let token: FlightKey = (cache.to_string(), key.to_string());
        let (flight, is_leader) = {
            let mut flights = self.flights.lock();
            match flights.get(&token) {
                Some(flight) => (Arc::clone(flight), false),
                None => {
                    let flight = Arc::new(Flight {
                        slot: Mutex::new(FlightSlot::Pending),
                        cv: Condvar::new(),
                    });
                    flights.insert(token.clone(), Arc::clone(&flight));
                    (flight, true)
                }
            }
        };

        if is_leader {
            let guard = CompletionGuard {
                group: self,
                token: &token,
                flight: &flight,
                armed: true,
            };
            let outcome = leader_fn();
            guard.complete(&outcome);
            outcome
        } else {
            let mut slot = flight.slot.lock();
            loop {
                match &*slot {
                    FlightSlot::Pending => flight.cv.wait(&mut slot),
                    FlightSlot::Done(value) => return Ok(Arc::clone(value)),
                    FlightSlot::Failed(message) => return Err(message.clone()),
                }
            }
        }
    }

    /// Number of loads currently in flight.
    pub fn in_flight(&self) -> usize {
        self.flights.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    fn bytes(data: &str) -> Arc<[u8]> {
        Arc::from(data.as_bytes())
    }

    #[test]
    fn leader_runs_and_returns_value() {
        let group = FlightGroup::new();
        let value = group.execute("c", "k", || Ok(bytes("v"))).unwrap();
        assert_eq!(&*value, b"v");
        assert_eq!(group.in_flight(), 0);
    }

    #[test]
    fn concurrent_burst_elects_one_leader() {
        let group = Arc::new(FlightGroup::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(16));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let group = Arc::clone(&group);
                let calls = Arc::clone(&calls);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    group.execute("c", "k", || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(200));
                        Ok(bytes("shared"))
                    })
                })
            })
            .collect();

        for handle in handles {
            let value = handle.join().unwrap().unwrap();
            assert_eq!(&*value, b"shared");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(group.in_flight(), 0);
    }

    #[test]
    fn failure_reaches_every_waiter_and_is_not_cached() {
        let group = Arc::new(FlightGroup::new());
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let group = Arc::clone(&group);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    group.execute("c", "k", || {
                        thread::sleep(Duration::from_millis(100));
                        Err("backend down".to_string())
                    })
                })
            })
            .collect();

        for handle in handles {
            let result = handle.join().unwrap();
            assert_eq!(result.unwrap_err(), "backend down");
        }
        // The failed flight is gone; a fresh leader can run.
        assert_eq!(group.in_flight(), 0);
        let value = group.execute("c", "k", || Ok(bytes("recovered"))).unwrap();
        assert_eq!(&*value, b"recovered");
    }

    #[test]
    fn sequential_calls_each_elect_a_leader() {
        let group = FlightGroup::new();
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            group
                .execute("c", "k", || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(bytes("v"))
                })
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn distinct_keys_do_not_share_flights() {
        let group = Arc::new(FlightGroup::new());
        let barrier = Arc::new(Barrier::new(2));

        let slow = {
            let group = Arc::clone(&group);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                group.execute("c", "slow", || {
                    thread::sleep(Duration::from_millis(200));
                    Ok(bytes("slow"))
                })
            })
        };

        barrier.wait();
        thread::sleep(Duration::from_millis(20));
        let fast = group.execute("c", "fast", || Ok(bytes("fast"))).unwrap();
        assert_eq!(&*fast, b"fast");

        assert_eq!(&*slow.join().unwrap().unwrap(), b"slow");
    }

    #[test]
    fn separator_lookalike_pairs_do_not_collide() {
        let group = Arc::new(FlightGroup::new());
        let barrier = Arc::new(Barrier::new(2));

        // ("a", "b:c") and ("a:b", "c") would merge under joined-string
        // keying; they must run as independent flights.
        let first = {
            let group = Arc::clone(&group);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                group.execute("a", "b:c", || {
                    thread::sleep(Duration::from_millis(200));
                    Ok(bytes("first"))
                })
            })
        };

        barrier.wait();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(group.in_flight(), 1);
        let second = group.execute("a:b", "c", || Ok(bytes("second"))).unwrap();
        assert_eq!(&*second, b"second");

        assert_eq!(&*first.join().unwrap().unwrap(), b"first");
    }

    #[test]
    fn panicking_loader_fails_waiters_instead_of_stranding_them() {
        let group = Arc::new(FlightGroup::new());
        let barrier = Arc::new(Barrier::new(2));

        let waiter = {
            let group = Arc::clone(&group);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                thread::sleep(Duration::from_millis(50));
                group.execute("c", "k", || Ok(bytes("follower-should-not-run")))
            })
        };

        let leader = {
            let group = Arc::clone(&group);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                group.execute("c", "k", || {
                    thread::sleep(Duration::from_millis(150));
                    panic!("loader exploded");
                })
            })
        };

        assert!(leader.join().is_err());
        let result = waiter.join().unwrap();
        match result {
            // Waiter joined the doomed flight and saw the published failure.
            Err(message) => assert_eq!(message, "loader panicked"),
            // Or it arrived after cleanup and ran its own loader.
            Ok(value) => assert_eq!(&*value, b"follower-should-not-run"),
        }
        assert_eq!(group.in_flight(), 0);
    }
}
