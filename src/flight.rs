//! Provides the request coalescer which collapses concurrent loads of a key.
//!
//! When several tasks miss the local cache for the same key at the same moment,
//! only the first one actually performs the (potentially expensive) load - a peer
//! round-trip or a database lookup. All later arrivals find the in-flight entry
//! and simply await its outcome, so the backing store sees at most one request
//! per key at any instant.
//!
//! The coalescer only guards its in-flight table with a mutex; the lock is never
//! held while the computation runs. A failed computation surfaces the same
//! failure to every waiter of that key.
//!
//! # Example
//!
//! ```
//! # use nimbus::flight::Flight;
//! # #[tokio::main]
//! # async fn main() {
//! let flight: Flight<i32> = Flight::new();
//!
//! let value = flight.run("answer", || async { Ok(42) }).await.unwrap();
//! assert_eq!(value, 42);
//! # }
//! ```
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::sync::Mutex;

use tokio::sync::broadcast;

/// The failure of a coalesced computation as observed by every caller.
///
/// The error is shared among all waiters, therefore it carries the rendered
/// message rather than the (non-cloneable) original error.
#[derive(Clone, Debug)]
pub struct FlightError {
    message: String,
}

impl Display for FlightError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for FlightError {}

type Outcome<T> = Result<T, FlightError>;

/// Coalesces concurrent computations per key.
///
/// At any instant, at most one computation runs per key; every concurrent caller
/// receives the same outcome.
pub struct Flight<T> {
    inflight: Mutex<HashMap<String, broadcast::Sender<Outcome<T>>>>,
}

impl<T: Clone + Send + 'static> Flight<T> {
    /// Creates a new coalescer.
    pub fn new() -> Self {
        Flight {
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Runs the given computation for the given key, shared among concurrent
    /// callers.
    ///
    /// The first arrival installs an in-flight entry and runs **compute**; all
    /// subsequent arrivals await the shared outcome. Once settled, the entry is
    /// gone and a later call computes afresh.
    pub async fn run<F, Fut>(&self, key: &str, compute: F) -> Outcome<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        // Either join an in-flight computation or install ourselves as the one
        // performing it. The lock only guards the table, never the computation.
        let waiter = {
            let mut inflight = self.inflight.lock().unwrap();
            match inflight.get(key) {
                Some(sender) => Some(sender.subscribe()),
                None => {
                    let (sender, _) = broadcast::channel(1);
                    let _ = inflight.insert(key.to_owned(), sender);
                    None
                }
            }
        };

        if let Some(mut waiter) = waiter {
            return match waiter.recv().await {
                Ok(outcome) => outcome,
                Err(_) => Err(FlightError {
                    message: "The in-flight computation vanished without an outcome!".to_owned(),
                }),
            };
        }

        let outcome = compute().await.map_err(|error| FlightError {
            message: error.to_string(),
        });

        // Remove the entry before settling: a caller arriving now simply starts a
        // fresh computation. Everyone already subscribed receives our outcome.
        let sender = self.inflight.lock().unwrap().remove(key);
        if let Some(sender) = sender {
            let _ = sender.send(outcome.clone());
        }

        outcome
    }
}

impl<T: Clone + Send + 'static> Default for Flight<T> {
    fn default() -> Self {
        Flight::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn concurrent_callers_share_a_single_computation() {
        crate::testing::test_async(async {
            let flight: Arc<Flight<String>> = Arc::new(Flight::new());
            let invocations = Arc::new(AtomicUsize::new(0));

            let mut handles = Vec::new();
            for _ in 0..8 {
                let flight = flight.clone();
                let invocations = invocations.clone();
                handles.push(tokio::spawn(async move {
                    flight
                        .run("key", || async move {
                            let _ = invocations.fetch_add(1, Ordering::SeqCst);
                            // Keep the computation in flight long enough for all
                            // callers to pile up...
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok("value".to_owned())
                        })
                        .await
                }));
            }

            for handle in handles {
                assert_eq!(handle.await.unwrap().unwrap(), "value");
            }
            assert_eq!(invocations.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn distinct_keys_do_not_coalesce() {
        crate::testing::test_async(async {
            let flight: Flight<i32> = Flight::new();

            let first = flight.run("a", || async { Ok(1) }).await.unwrap();
            let second = flight.run("b", || async { Ok(2) }).await.unwrap();
            assert_eq!((first, second), (1, 2));
        });
    }

    #[test]
    fn a_settled_key_computes_afresh() {
        crate::testing::test_async(async {
            let flight: Flight<i32> = Flight::new();

            assert_eq!(flight.run("key", || async { Ok(1) }).await.unwrap(), 1);
            assert_eq!(flight.run("key", || async { Ok(2) }).await.unwrap(), 2);
        });
    }

    #[test]
    fn failures_reach_every_waiter() {
        crate::testing::test_async(async {
            let flight: Arc<Flight<i32>> = Arc::new(Flight::new());

            let mut handles = Vec::new();
            for _ in 0..4 {
                let flight = flight.clone();
                handles.push(tokio::spawn(async move {
                    flight
                        .run("key", || async {
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Err(anyhow::anyhow!("backing store down"))
                        })
                        .await
                }));
            }

            for handle in handles {
                let error = handle.await.unwrap().unwrap_err();
                assert_eq!(error.to_string(), "backing store down");
            }
        });
    }
}
