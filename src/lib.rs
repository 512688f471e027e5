//! Nimbus is a distributed in-memory key→value cache.
//!
//! # Introduction
//! A **Nimbus** cluster consists of peer cache nodes which discover each other via
//! **etcd** and divide the key space among themselves using a consistent-hash ring
//! with virtual replicas. Every node runs the same binary: it serves a compact
//! RESP style RPC protocol (three verbs: get, set, delete - plus some management
//! commands), keeps a configurable local eviction engine per cache group and
//! forwards misses to the node owning the key. An HTTP gateway translates plain
//! REST calls into the RPC protocol for clients which do not want to speak it
//! directly.
//!
//! # Features
//! * **A family of eviction engines** - LRU, LRU-K, LFU, averaging LFU, sharded
//!   variants of both tiered engines and ARC with ghost lists and adaptive
//!   capacity transfer. Engines are selected and tuned per cache group in the
//!   settings file (see [cache] and [config]).
//! * **Distributed reads with request coalescing** - a cache miss is routed to the
//!   owning peer at most once, no matter how many local callers wait for the same
//!   key (see [flight] and [group]).
//! * **Best-effort write propagation** - writes and deletes are broadcast one hop
//!   to the owning peer; broadcast failures are logged, never surfaced.
//! * **100% async/await** - the node builds upon [tokio](https://tokio.rs/);
//!   every connection runs in its own task and dispatches its commands directly,
//!   so a peer round-trip never stalls other callers.
//!
//! # Modules
//! * [cache] - the eviction engines and the value envelope.
//! * [ring] - the consistent-hash ring with traffic aware rebalancing.
//! * [flight] - the request coalescer.
//! * [peer] / [picker] - the typed peer client and the registry fed peer directory.
//! * [registry] - lease based service registration against etcd.
//! * [group] - the cache group orchestrator and its RPC command handlers.
//! * [commands] / [server] - the dispatch table and the TCP server carrying it.
//! * [gateway] - the HTTP → RPC gateway.
//!
//! # Assembling a node
//! The pieces are wired explicitly - there is no framework container, a binary
//! simply hands each component what it needs:
//!
//! ```no_run
//! use std::sync::Arc;
//! use nimbus::commands::CommandTable;
//! use nimbus::group::GroupRegistry;
//! use nimbus::server::Server;
//! use nimbus::shutdown::Shutdown;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     nimbus::init_logging();
//!
//!     let shutdown = Shutdown::new();
//!     nimbus::shutdown::trigger_on_sigint(shutdown.clone());
//!
//!     let groups = GroupRegistry::new();
//!     // Register cache groups here...
//!
//!     let table = CommandTable::new();
//!     nimbus::group::install(&table, groups);
//!
//!     Server::bind("0.0.0.0:8001", table, shutdown).await?.serve().await;
//!     Ok(())
//! }
//! ```
#![deny(
    warnings,
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_results
)]
use std::sync::Once;

pub mod cache;
pub mod commands;
pub mod config;
pub mod flight;
pub mod gateway;
pub mod group;
pub mod peer;
pub mod picker;
pub mod registry;
pub mod request;
pub mod response;
pub mod ring;
pub mod server;
pub mod shutdown;

/// Contains the version of the nimbus library.
pub const NIMBUS_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initializes the logging system.
///
/// Logs to stdout via **simplelog**, which is all a containerized node needs.
/// Safe to call more than once (the integration tests would otherwise trip over
/// each other).
pub fn init_logging() {
    static INIT_LOGGING: Once = Once::new();

    INIT_LOGGING.call_once(|| {
        let config = simplelog::ConfigBuilder::new()
            .set_time_format_rfc3339()
            .set_target_level(simplelog::LevelFilter::Error)
            .build();

        if let Err(error) = simplelog::SimpleLogger::init(simplelog::LevelFilter::Debug, config) {
            panic!("Failed to initialize logging system: {}", error);
        }
    });
}

/// Provides a simple macro to execute an async lambda within `tokio::spawn`.
///
/// Note that this also applies std::mem::drop on the returned join handle to make
/// clippy happy.
///
/// # Example
/// ```rust
/// # #[macro_use] extern crate nimbus;
/// # #[tokio::main]
/// # async fn main() {
/// spawn!(async move {
///     // perform some async stuff here...
/// });
/// # }
#[macro_export]
macro_rules! spawn {
    ($e:expr) => {{
        std::mem::drop(tokio::spawn($e));
    }};
}

#[cfg(test)]
mod testing {
    use std::sync::Mutex;

    lazy_static::lazy_static! {
        /// Provides a global lock which has to be acquired if a test operates on
        /// shared resources - most notably the ports on which we start local
        /// nodes for integration tests. Using this lock, all other tests still
        /// execute in parallel and only block if required.
        pub static ref SHARED_TEST_RESOURCES: Mutex<()> = Mutex::new(());
    }

    /// Executes async code within a single threaded tokio runtime.
    pub fn test_async<F: std::future::Future>(future: F) {
        use tokio::runtime;

        let rt = runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let _ = rt.block_on(future);
    }
}
