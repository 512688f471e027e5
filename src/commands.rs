//! Maps incoming requests onto the cache command handlers.
//!
//! The command set of a node is small and frozen once the binary has wired its
//! groups, so the [CommandTable] is nothing more than a swap-on-write map from
//! command name to [Handler]. A handler is a plain async closure over whatever
//! state it needs (usually the group registry); it consumes the parsed request
//! and returns the [Response] to put on the wire.
//!
//! There is deliberately no queue between the protocol loop and the handlers:
//! a connection task awaits its handler directly. A CACHE.GET spends most of its
//! time inside a peer round-trip, and funneling such calls through a shared
//! queue would let one slow peer stall every other caller - worse, two nodes
//! reading from each other could deadlock. With direct dispatch, every
//! connection makes progress on its own.
//!
//! A handler error is rendered as an `-ERR …` frame and leaves the connection
//! usable; only protocol level garbage (handled by the server) closes it.
//!
//! Two commands are built in: **PING** answers PONG, and **SYS.COMMANDS**
//! renders the call counters and average runtimes of all registered commands.
//!
//! # Example
//!
//! ```
//! # use std::sync::Arc;
//! # use nimbus::commands::CommandTable;
//! # use nimbus::request::Request;
//! # use nimbus::response::Response;
//! # #[tokio::main]
//! # async fn main() {
//! let table = CommandTable::new();
//! table.register(
//!     "HELLO",
//!     Arc::new(|request| {
//!         Box::pin(async move {
//!             let mut response = Response::new();
//!             response.bulk(format!("Hello {}!", request.str_parameter(0)?))?;
//!             Ok(response)
//!         })
//!     }),
//! );
//!
//! let reply = table.dispatch(Request::example(vec!["HELLO", "world"])).await;
//! assert_eq!(&reply[..], b"$12\r\nHello world!\r\n");
//! # }
//! ```
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use bytes::BytesMut;

use crate::request::Request;
use crate::response::Response;

/// The boxed future produced by a [Handler].
pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<Response>> + Send>>;

/// A command handler: consumes the parsed request, yields the response.
///
/// Errors are turned into `-ERR …` frames by the dispatcher, so a handler can
/// freely use `?` on parameter access and internal plumbing.
pub type Handler = Arc<dyn Fn(Request) -> HandlerFuture + Send + Sync>;

/// A registered command along with its utilization counters.
struct Registration {
    handler: Handler,
    calls: AtomicU64,
    busy_micros: AtomicU64,
}

/// The dispatch table of a node.
///
/// Registration copies the map and swaps it in, therefore dispatching is a
/// lock free load - registration only ever happens during startup, dispatching
/// on every request.
pub struct CommandTable {
    commands: ArcSwap<HashMap<&'static str, Arc<Registration>>>,
}

impl CommandTable {
    /// Creates an empty table (the built-ins need no registration).
    pub fn new() -> Arc<Self> {
        Arc::new(CommandTable {
            commands: ArcSwap::new(Arc::new(HashMap::new())),
        })
    }

    /// Registers a handler for the given command name.
    ///
    /// A name can only be taken once; a second registration is rejected with a
    /// complaint in the log, keeping the first handler in place.
    pub fn register(&self, name: &'static str, handler: Handler) {
        let current = self.commands.load();
        if current.contains_key(name) {
            log::error!(
                "Not going to register command {} as there is already a command present for this name",
                name
            );
            return;
        }

        log::debug!("Registering command {}...", name);
        let mut next = (**current).clone();
        let _ = next.insert(
            name,
            Arc::new(Registration {
                handler,
                calls: AtomicU64::new(0),
                busy_micros: AtomicU64::new(0),
            }),
        );
        self.commands.store(Arc::new(next));
    }

    /// Runs the handler for the given request and returns the wire bytes.
    ///
    /// Unknown commands yield an error frame; this never fails, as even a
    /// failing handler still has a well-formed error reply.
    pub async fn dispatch(&self, request: Request) -> BytesMut {
        let registration = self.commands.load().get(request.command()).cloned();

        let registration = match registration {
            Some(registration) => registration,
            None => return self.dispatch_built_in(&request),
        };

        let watch = Instant::now();
        let result = (registration.handler)(request).await;
        let _ = registration.calls.fetch_add(1, Ordering::Relaxed);
        let _ = registration
            .busy_micros
            .fetch_add(watch.elapsed().as_micros() as u64, Ordering::Relaxed);

        match result {
            Ok(response) => finish(response),
            Err(error) => error_frame(&error.to_string()),
        }
    }

    /// Answers the built-in commands; everything else is unknown.
    fn dispatch_built_in(&self, request: &Request) -> BytesMut {
        match request.command() {
            "PING" => {
                let mut response = Response::new();
                match response.simple("PONG") {
                    Ok(_) => finish(response),
                    Err(error) => error_frame(&error.to_string()),
                }
            }
            "SYS.COMMANDS" => match self.render_stats() {
                Ok(response) => finish(response),
                Err(error) => error_frame(&error.to_string()),
            },
            other => error_frame(&format!("Unknown command: {}", other)),
        }
    }

    /// Renders the utilization counters of all registered commands.
    fn render_stats(&self) -> anyhow::Result<Response> {
        let commands = self.commands.load();
        let mut names: Vec<&&str> = commands.keys().collect();
        names.sort_unstable();

        let mut text = String::new();
        text += format!("{:<30} {:>10} {:>20}\n", "Name", "Calls", "Avg. Duration").as_str();
        text += crate::response::SEPARATOR;
        for name in names {
            let registration = &commands[*name];
            let calls = registration.calls.load(Ordering::Relaxed);
            let busy = registration.busy_micros.load(Ordering::Relaxed);
            let average = if calls == 0 { 0 } else { busy / calls };
            text += format!("{:<30} {:>10} {:>17} us\n", name, calls, average).as_str();
        }
        text += crate::response::SEPARATOR;

        let mut response = Response::new();
        response.bulk(text)?;
        Ok(response)
    }
}

/// Serializes a completed response.
fn finish(response: Response) -> BytesMut {
    response.complete().unwrap_or_else(|error| {
        log::error!("Failed to serialize a response: {}", error);
        BytesMut::from(&b"-ERR Failed to serialize the response\r\n"[..])
    })
}

/// Builds an `-ERR …` frame for the given message.
fn error_frame(message: &str) -> BytesMut {
    let mut response = Response::new();
    match response.error(format!("ERR {}", message)) {
        Ok(_) => finish(response),
        Err(_) => BytesMut::from(&b"-ERR Failed to render the error\r\n"[..]),
    }
}
