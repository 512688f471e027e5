//! The cache node binary.
//!
//! Loads the settings, registers this node with the registry, attaches the peer
//! directory, creates the configured cache groups and serves the RPC protocol
//! until a SIGINT arrives. On shutdown the node stops accepting, revokes its
//! registry lease (so peers drop it immediately) and drains.
use std::collections::HashMap;
use std::panic::{set_hook, take_hook};
use std::sync::Arc;

use clap::Parser;

use nimbus::cache::Value;
use nimbus::commands::CommandTable;
use nimbus::config::{Settings, DEFAULT_CONFIG_PATH};
use nimbus::group::{CacheGroup, GroupRegistry, MissHandler};
use nimbus::picker::PeerPicker;
use nimbus::registry::Registry;
use nimbus::server::Server;
use nimbus::shutdown::Shutdown;

/// A distributed in-memory cache node.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The port the RPC server listens on (overrides the config file).
    #[arg(long)]
    port: Option<u16>,

    /// The host under which peers reach this node.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// The logical identifier of this node (used for logging only).
    #[arg(long, default_value = "A")]
    node: String,

    /// The path of the settings file.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Comma separated list of etcd endpoints.
    #[arg(long, default_value = "http://127.0.0.1:2379")]
    registry_endpoints: String,

    /// The service name under which all cache nodes register.
    #[arg(long, default_value = "nimbus")]
    service_name: String,
}

#[tokio::main]
async fn main() {
    // Install a panic handler which crashes the whole process instead of trying
    // to survive with a missing tokio background task. A node with a dead task
    // looks healthy from the outside but silently misbehaves, so we rather crash
    // and let an external supervisor start a fresh, consistent instance.
    let original_panic_handler = take_hook();
    set_hook(Box::new(move |panic_info| {
        original_panic_handler(panic_info);
        eprintln!("A panic occurred in a task. Crashing the whole process to enable a clean restart...");
        std::process::exit(-1);
    }));

    let args = Args::parse();
    nimbus::init_logging();

    let mut settings = match Settings::load(&args.config).await {
        Ok(settings) => settings,
        Err(error) => {
            log::error!("{:#}", error);
            std::process::exit(1);
        }
    };
    if let Some(port) = args.port {
        settings.port = port;
    }

    let advertised = format!("{}:{}", args.host, settings.port);
    log::info!(
        "Starting node {} of service {} (v {}) on {}...",
        args.node,
        args.service_name,
        nimbus::NIMBUS_VERSION,
        advertised
    );

    let shutdown = Shutdown::new();
    nimbus::shutdown::trigger_on_sigint(shutdown.clone());

    let endpoints: Vec<String> = args
        .registry_endpoints
        .split(',')
        .map(|endpoint| endpoint.trim().to_owned())
        .filter(|endpoint| !endpoint.is_empty())
        .collect();

    // Without a registration no peer will ever route to us - both failures here
    // are fatal.
    let registry = match Registry::connect(&endpoints).await {
        Ok(registry) => registry,
        Err(error) => {
            log::error!("{:#}", error);
            std::process::exit(1);
        }
    };
    if let Err(error) = registry.register(&args.service_name, &advertised).await {
        log::error!("{:#}", error);
        std::process::exit(1);
    }

    let picker = PeerPicker::new(&args.service_name, &advertised);
    if let Err(error) = picker.attach(shutdown.clone(), &endpoints).await {
        log::error!("{:#}", error);
        registry.unregister().await;
        std::process::exit(1);
    }

    let groups = GroupRegistry::new();
    create_groups(&settings, &groups, &picker);

    let table = CommandTable::new();
    nimbus::group::install(&table, groups);

    let server = match Server::bind(&settings.address(), table, shutdown.clone()).await {
        Ok(server) => server,
        Err(error) => {
            log::error!("{:#}", error);
            registry.unregister().await;
            std::process::exit(1);
        }
    };
    server.serve().await;

    registry.unregister().await;
    log::info!("Node {} stopped.", args.node);
}

/// Creates the cache groups listed in the settings.
///
/// Without any configured group, a single group named **test** with the default
/// engine is created so that a bare node is immediately usable.
fn create_groups(settings: &Settings, groups: &Arc<GroupRegistry>, picker: &Arc<PeerPicker>) {
    let miss_handler = static_dataset();

    for group in &settings.groups {
        log::info!(
            "Creating cache group {} ({})...",
            group.name,
            group.engine.engine
        );
        let _ = groups.register(CacheGroup::new(
            &group.name,
            group.engine.build(),
            picker.clone(),
            miss_handler.clone(),
        ));
    }

    if settings.groups.is_empty() {
        log::info!("No cache groups configured - creating the default group 'test'.");
        let _ = groups.register(CacheGroup::with_default_engine(
            "test",
            picker.clone(),
            miss_handler,
        ));
    }
}

/// The reference miss handler: a small static table standing in for a real
/// backing database.
fn static_dataset() -> MissHandler {
    let table: HashMap<String, String> = ["Tom", "Jack", "Alice", "Bob", "Charlie", "Diana"]
        .iter()
        .map(|name| (name.to_string(), name.to_string()))
        .collect();

    Arc::new(move |key: &str| {
        log::info!("Cache miss for key: {}", key);
        match table.get(key) {
            Some(value) => Some(Value::Str(value.clone())),
            None => {
                log::warn!("Key {} not found in the dataset", key);
                None
            }
        }
    })
}
