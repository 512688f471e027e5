//! Contains the RPC server of a cache node.
//!
//! The server binds its TCP socket once at startup (a node which cannot bind has
//! nothing to offer, so this is fatal) and then accepts connections until the
//! shutdown is triggered. Each connection - peers and gateways alike - runs in
//! its own task: requests are parsed out of a pooled receive buffer and answered
//! through the [CommandTable], one reply per request, pipelining included.
//!
//! A shutdown first stops the accept loop; connection tasks notice it at their
//! next idle moment, so an exchange which is already in flight still completes
//! before the connection winds down.
//!
//! # Example
//!
//! ```no_run
//! use nimbus::commands::CommandTable;
//! use nimbus::server::Server;
//! use nimbus::shutdown::Shutdown;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let table = CommandTable::new();
//!     let shutdown = Shutdown::new();
//!
//!     // Register command handlers here...
//!
//!     Server::bind("0.0.0.0:8001", table, shutdown).await?.serve().await;
//!     Ok(())
//! }
//! ```
use std::sync::Arc;

use anyhow::Context;
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::commands::CommandTable;
use crate::request::Request;
use crate::shutdown::Shutdown;
use crate::spawn;

/// The pre-allocated receive buffer size per connection.
///
/// Most requests fit in here, so handling a command usually allocates nothing.
const RECEIVE_BUFFER_SIZE: usize = 8192;

/// The RPC server: a bound socket, the dispatch table and the stop flag.
pub struct Server {
    listener: TcpListener,
    table: Arc<CommandTable>,
    shutdown: Arc<Shutdown>,
}

impl Server {
    /// Binds the server socket on the given address.
    ///
    /// Performed eagerly and separately from [serve](Server::serve) so that a
    /// caller knows the node is reachable the moment this returns - and so that
    /// an occupied port surfaces as a startup error instead of a dead loop.
    pub async fn bind(
        address: &str,
        table: Arc<CommandTable>,
        shutdown: Arc<Shutdown>,
    ) -> anyhow::Result<Server> {
        let listener = TcpListener::bind(address)
            .await
            .with_context(|| format!("Failed to open the server socket on {}", address))?;
        log::info!("Opened server socket on {}...", address);

        Ok(Server {
            listener,
            table,
            shutdown,
        })
    }

    /// Accepts connections until the shutdown is triggered.
    pub async fn serve(self) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, address)) => {
                        log::debug!("Opened connection from {}...", address);
                        let table = self.table.clone();
                        let shutdown = self.shutdown.clone();
                        spawn!(async move {
                            if let Err(error) = connection_loop(table, shutdown, stream).await {
                                log::debug!("Connection from {} failed: {}", address, error);
                            }
                            log::debug!("Closed connection from {}.", address);
                        });
                    }
                    Err(error) => {
                        // Transient accept failures (fd pressure and the like)
                        // must not kill the server.
                        log::warn!("Failed to accept a connection: {}", error);
                    }
                },
                _ = self.shutdown.stopped() => break,
            }
        }

        log::info!("Stopped accepting connections.");
    }
}

/// Serves one client connection: read, parse, dispatch, reply.
async fn connection_loop(
    table: Arc<CommandTable>,
    shutdown: Arc<Shutdown>,
    mut stream: TcpStream,
) -> anyhow::Result<()> {
    let _ = stream.set_nodelay(true);
    let mut buffer = BytesMut::with_capacity(RECEIVE_BUFFER_SIZE);
    let (mut reader, mut writer) = stream.split();

    loop {
        tokio::select! {
            read = reader.read_buf(&mut buffer) => {
                match read {
                    // The client closed the connection.
                    Ok(0) => return Ok(()),
                    Ok(_) => (),
                    Err(error) => {
                        return Err(error).context("Failed to read from the client");
                    }
                }

                // Answer every complete request in the buffer; a partial one
                // stays put until more data arrives.
                loop {
                    match Request::parse(&buffer) {
                        Ok(Some(request)) => {
                            log::debug!("Received {}", request.command());
                            let request_len = request.len();

                            let reply = table.dispatch(request).await;
                            writer.write_all(&reply).await?;
                            writer.flush().await?;

                            buffer.advance(request_len);
                        }
                        Ok(None) => break,
                        Err(error) => {
                            // Protocol garbage - the framing is gone, so we
                            // report once and close.
                            writer
                                .write_all(
                                    format!("-ERR Malformed request: {}\r\n", error).as_bytes(),
                                )
                                .await?;
                            writer.flush().await?;
                            return Ok(());
                        }
                    }
                }

                // A drained buffer which grew for a large request shrinks back.
                if buffer.is_empty() && buffer.capacity() > RECEIVE_BUFFER_SIZE {
                    buffer = BytesMut::with_capacity(RECEIVE_BUFFER_SIZE);
                }
            }
            _ = shutdown.stopped() => return Ok(()),
        }
    }
}
