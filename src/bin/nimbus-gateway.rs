//! The HTTP gateway binary.
//!
//! Discovers the cache nodes via the registry and serves the REST surface,
//! forwarding each request to the node owning the key.
use std::panic::{set_hook, take_hook};

use clap::Parser;

use nimbus::picker::PeerPicker;
use nimbus::shutdown::Shutdown;

/// The HTTP gateway of a nimbus cache cluster.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The port the HTTP server listens on.
    #[arg(long, default_value_t = 9000)]
    http_port: u16,

    /// Comma separated list of etcd endpoints.
    #[arg(long, default_value = "http://127.0.0.1:2379")]
    registry_endpoints: String,

    /// The service name under which the cache nodes register.
    #[arg(long, default_value = "nimbus")]
    service_name: String,
}

#[tokio::main]
async fn main() {
    // As in the node: a gateway with a dead task is worse than a dead gateway.
    let original_panic_handler = take_hook();
    set_hook(Box::new(move |panic_info| {
        original_panic_handler(panic_info);
        eprintln!("A panic occurred in a task. Crashing the whole process to enable a clean restart...");
        std::process::exit(-1);
    }));

    let args = Args::parse();
    nimbus::init_logging();

    let shutdown = Shutdown::new();
    nimbus::shutdown::trigger_on_sigint(shutdown.clone());

    let endpoints: Vec<String> = args
        .registry_endpoints
        .split(',')
        .map(|endpoint| endpoint.trim().to_owned())
        .filter(|endpoint| !endpoint.is_empty())
        .collect();

    // An empty self address makes every node a remote peer.
    let picker = PeerPicker::new(&args.service_name, "");
    if let Err(error) = picker.attach(shutdown.clone(), &endpoints).await {
        log::error!("{:#}", error);
        std::process::exit(1);
    }

    if let Err(error) = nimbus::gateway::run(shutdown, args.http_port, picker).await {
        log::error!("{:#}", error);
        std::process::exit(1);
    }
}
