//! Coordinates the orderly wind-down of a node or gateway process.
//!
//! Every long running loop - the accept loop, the connection tasks, the registry
//! watcher, the HTTP gateway - holds a [Shutdown] handle. Loops which sit in a
//! `select!` await [stopped](Shutdown::stopped); loops with natural beats poll
//! [is_stopped](Shutdown::is_stopped) in between. Triggering is idempotent and
//! reaches every holder, no matter whether it started waiting before or after
//! the trigger.
//!
//! # Example
//!
//! ```
//! # use nimbus::shutdown::Shutdown;
//! # #[tokio::main]
//! # async fn main() {
//! let shutdown = Shutdown::new();
//! assert_eq!(shutdown.is_stopped(), false);
//!
//! shutdown.trigger();
//! shutdown.stopped().await;
//! assert_eq!(shutdown.is_stopped(), true);
//! # }
//! ```
use std::sync::Arc;

use tokio::sync::watch;

use crate::spawn;

/// The shared stop flag of a process.
///
/// Internally a watch channel: checking is a borrow, waiting is race free even
/// against a trigger which fires between the check and the wait.
pub struct Shutdown {
    sender: watch::Sender<bool>,
}

impl Shutdown {
    /// Creates a new handle in the "running" state.
    pub fn new() -> Arc<Self> {
        let (sender, _) = watch::channel(false);
        Arc::new(Shutdown { sender })
    }

    /// Requests the shutdown and wakes every waiter.
    pub fn trigger(&self) {
        let _ = self.sender.send(true);
    }

    /// Determines if the shutdown has been requested.
    pub fn is_stopped(&self) -> bool {
        *self.sender.borrow()
    }

    /// Completes once the shutdown has been requested.
    pub async fn stopped(&self) {
        let mut receiver = self.sender.subscribe();
        let _ = receiver.wait_for(|stopped| *stopped).await;
    }
}

/// Forks a task which triggers the given shutdown once SIGINT arrives.
///
/// This is what makes a Ctrl-C wind the node down gracefully: the server stops
/// accepting, the watcher ends and the binary gets to revoke its registry lease
/// before the process exits.
pub fn trigger_on_sigint(shutdown: Arc<Shutdown>) {
    spawn!(async move {
        match tokio::signal::ctrl_c().await {
            Ok(_) => {
                log::info!("Received SIGINT. Shutting down...");
                shutdown.trigger();
            }
            Err(error) => log::error!("Failed to listen for SIGINT: {}", error),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn waiters_observe_a_trigger_from_another_task() {
        crate::testing::test_async(async {
            let shutdown = Shutdown::new();

            let waiter = {
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    shutdown.stopped().await;
                    true
                })
            };

            tokio::time::sleep(Duration::from_millis(10)).await;
            assert_eq!(shutdown.is_stopped(), false);
            shutdown.trigger();

            assert_eq!(waiter.await.unwrap(), true);
        });
    }

    #[test]
    fn late_waiters_return_immediately() {
        crate::testing::test_async(async {
            let shutdown = Shutdown::new();
            shutdown.trigger();
            shutdown.trigger();

            // Waiting after the fact must not hang...
            shutdown.stopped().await;
            assert_eq!(shutdown.is_stopped(), true);
        });
    }
}
