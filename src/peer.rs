//! Provides the typed client used to talk to a peer cache node.
//!
//! A [PeerClient] speaks the node's RESP protocol over a single pooled TCP
//! connection: get, set and delete for a (group, key) pair, plus a ping for
//! health probes. Get and delete carry a 3 second deadline; set relies on the
//! transport defaults. The connection is established lazily and dropped on any
//! IO error, so the next call transparently reconnects.
//!
//! Values travel type tagged: the [WireValue] trait is implemented for `String`,
//! `i32` and the generic [Value](crate::cache::Value) envelope, and using any
//! other type at a call site simply does not compile. A reply which cannot be
//! decoded into the requested type is a value-absent outcome (logged at warn),
//! never an error surfaced to the caller.
use std::time::Duration;

use anyhow::{anyhow, Context};
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;

use crate::cache::Value;

/// The deadline applied to get, delete and ping calls.
const CALL_DEADLINE: Duration = Duration::from_secs(3);

/// A single RESP reply frame as read off the wire.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Frame {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Vec<u8>),
    Nil,
}

/// The family of types which can travel through the cache protocol.
///
/// This is a closed set: UTF-8 strings and 32-bit signed integers (plus the
/// [Value](crate::cache::Value) envelope covering both). The RESP reply type
/// carries the tag on the wire - a bulk string is a string, an integer reply an
/// integer - while requests carry an explicit kind marker next to the rendered
/// payload.
pub(crate) trait WireValue: Sized {
    /// The kind marker sent along with a set request (`str` or `int`).
    fn wire_kind(&self) -> &'static str;

    /// Renders the payload as request parameter.
    fn render(&self) -> String;

    /// Decodes a reply frame into this type, if the tag matches.
    fn decode(frame: &Frame) -> Option<Self>;
}

impl WireValue for String {
    fn wire_kind(&self) -> &'static str {
        "str"
    }

    fn render(&self) -> String {
        self.clone()
    }

    fn decode(frame: &Frame) -> Option<Self> {
        match frame {
            Frame::Bulk(data) => String::from_utf8(data.clone()).ok(),
            _ => None,
        }
    }
}

impl WireValue for i32 {
    fn wire_kind(&self) -> &'static str {
        "int"
    }

    fn render(&self) -> String {
        self.to_string()
    }

    fn decode(frame: &Frame) -> Option<Self> {
        match frame {
            Frame::Integer(value) => i32::try_from(*value).ok(),
            _ => None,
        }
    }
}

impl WireValue for Value {
    fn wire_kind(&self) -> &'static str {
        match self {
            Value::Str(_) => "str",
            Value::Int(_) => "int",
        }
    }

    fn render(&self) -> String {
        match self {
            Value::Str(string) => string.clone(),
            Value::Int(number) => number.to_string(),
        }
    }

    fn decode(frame: &Frame) -> Option<Self> {
        match frame {
            Frame::Bulk(data) => String::from_utf8(data.clone()).ok().map(Value::Str),
            Frame::Integer(value) => i32::try_from(*value).ok().map(Value::Int),
            _ => None,
        }
    }
}

/// A client for one remote cache node.
///
/// The client pools a single connection; concurrent calls are serialized. This
/// matches the expected usage: one client per peer, shared via the peer
/// directory, with short request/response exchanges.
pub struct PeerClient {
    address: String,
    connection: tokio::sync::Mutex<Option<BufStream<TcpStream>>>,
}

impl PeerClient {
    /// Creates a client for the given `host:port` address.
    ///
    /// No connection is established yet; the first call connects.
    pub fn new(address: &str) -> Self {
        PeerClient {
            address: address.to_owned(),
            connection: tokio::sync::Mutex::new(None),
        }
    }

    /// Returns the address of the remote node.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Fetches the value of the given key in the given group.
    ///
    /// Transport failures, deadline overruns and undecodable replies all yield
    /// **None** (logged at warn) - a missing value and a broken peer look the
    /// same to the caller, which falls back to its miss handler either way.
    pub(crate) async fn get<T: WireValue>(&self, group: &str, key: &str) -> Option<T> {
        match self
            .exchange(&["CACHE.GET", group, key], Some(CALL_DEADLINE))
            .await
        {
            Ok(Frame::Nil) => None,
            Ok(Frame::Error(message)) => {
                log::warn!(
                    "Peer {} answered CACHE.GET {} {} with an error: {}",
                    self.address,
                    group,
                    key,
                    message
                );
                None
            }
            Ok(frame) => {
                let decoded = T::decode(&frame);
                if decoded.is_none() {
                    log::warn!(
                        "Failed to decode the reply of peer {} for key {} into the requested type",
                        self.address,
                        key
                    );
                }
                decoded
            }
            Err(error) => {
                log::warn!(
                    "CACHE.GET {} {} against peer {} failed: {}",
                    group,
                    key,
                    self.address,
                    error
                );
                None
            }
        }
    }

    /// Stores the given value for the given key in the given group.
    pub(crate) async fn set<T: WireValue>(&self, group: &str, key: &str, value: &T) -> bool {
        let rendered = value.render();
        match self
            .exchange(
                &["CACHE.SET", group, key, value.wire_kind(), &rendered],
                None,
            )
            .await
        {
            Ok(Frame::Simple(_)) => true,
            Ok(Frame::Error(message)) => {
                log::error!(
                    "CACHE.SET {} {} against peer {} was rejected: {}",
                    group,
                    key,
                    self.address,
                    message
                );
                false
            }
            Ok(_) => false,
            Err(error) => {
                log::error!(
                    "CACHE.SET {} {} against peer {} failed: {}",
                    group,
                    key,
                    self.address,
                    error
                );
                false
            }
        }
    }

    /// Deletes the given key in the given group.
    pub async fn delete(&self, group: &str, key: &str) -> bool {
        match self
            .exchange(&["CACHE.DEL", group, key], Some(CALL_DEADLINE))
            .await
        {
            Ok(Frame::Simple(_)) => true,
            Ok(Frame::Error(message)) => {
                log::error!(
                    "CACHE.DEL {} {} against peer {} was rejected: {}",
                    group,
                    key,
                    self.address,
                    message
                );
                false
            }
            Ok(_) => false,
            Err(error) => {
                log::error!(
                    "CACHE.DEL {} {} against peer {} failed: {}",
                    group,
                    key,
                    self.address,
                    error
                );
                false
            }
        }
    }

    /// Probes the remote node.
    pub async fn ping(&self) -> bool {
        matches!(
            self.exchange(&["PING"], Some(CALL_DEADLINE)).await,
            Ok(Frame::Simple(reply)) if reply == "PONG"
        )
    }

    /// Performs one request/response exchange, optionally bounded by a deadline.
    ///
    /// Any failure drops the pooled connection so the next call reconnects.
    async fn exchange(
        &self,
        parts: &[&str],
        deadline: Option<Duration>,
    ) -> anyhow::Result<Frame> {
        let mut connection = self.connection.lock().await;

        let result = match deadline {
            Some(deadline) => {
                match tokio::time::timeout(deadline, self.exchange_inner(&mut connection, parts))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(anyhow!("Deadline of {:?} exceeded", deadline)),
                }
            }
            None => self.exchange_inner(&mut connection, parts).await,
        };

        if result.is_err() {
            *connection = None;
        }

        result
    }

    async fn exchange_inner(
        &self,
        connection: &mut Option<BufStream<TcpStream>>,
        parts: &[&str],
    ) -> anyhow::Result<Frame> {
        if connection.is_none() {
            let stream = TcpStream::connect(&self.address)
                .await
                .with_context(|| format!("Failed to connect to peer {}", self.address))?;
            let _ = stream.set_nodelay(true);
            *connection = Some(BufStream::new(stream));
        }

        let stream = connection.as_mut().expect("connection was just established");

        let mut request = BytesMut::new();
        request.put_slice(format!("*{}\r\n", parts.len()).as_bytes());
        for part in parts {
            request.put_slice(format!("${}\r\n", part.len()).as_bytes());
            request.put_slice(part.as_bytes());
            request.put_slice(b"\r\n");
        }

        stream.write_all(&request).await?;
        stream.flush().await?;

        PeerClient::read_frame(stream).await
    }

    /// Reads a single reply frame.
    async fn read_frame(stream: &mut BufStream<TcpStream>) -> anyhow::Result<Frame> {
        let line = PeerClient::read_line(stream).await?;
        let (tag, payload) = line.split_at(1);

        match tag {
            "+" => Ok(Frame::Simple(payload.to_owned())),
            "-" => Ok(Frame::Error(payload.to_owned())),
            ":" => Ok(Frame::Integer(
                payload
                    .parse()
                    .with_context(|| format!("Malformed integer reply: {}", payload))?,
            )),
            "$" => {
                let length: i64 = payload
                    .parse()
                    .with_context(|| format!("Malformed bulk length: {}", payload))?;
                if length < 0 {
                    return Ok(Frame::Nil);
                }

                // Payload plus the trailing CRLF...
                let mut data = vec![0u8; length as usize + 2];
                let _ = stream.read_exact(&mut data).await?;
                data.truncate(length as usize);
                Ok(Frame::Bulk(data))
            }
            _ => Err(anyhow!("Unexpected reply tag: {}", line)),
        }
    }

    async fn read_line(stream: &mut BufStream<TcpStream>) -> anyhow::Result<String> {
        let mut line = Vec::new();
        let read = stream.read_until(b'\n', &mut line).await?;
        if read == 0 {
            return Err(anyhow!("The peer closed the connection"));
        }
        while line.last() == Some(&b'\n') || line.last() == Some(&b'\r') {
            let _ = line.pop();
        }
        if line.is_empty() {
            return Err(anyhow!("Received an empty reply line"));
        }

        String::from_utf8(line).context("Received a non UTF-8 reply line")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_values_render_their_kind_and_payload() {
        assert_eq!("hello".to_owned().wire_kind(), "str");
        assert_eq!("hello".to_owned().render(), "hello");
        assert_eq!(42i32.wire_kind(), "int");
        assert_eq!(42i32.render(), "42");

        assert_eq!(Value::Str("x".to_owned()).wire_kind(), "str");
        assert_eq!(Value::Int(-7).render(), "-7");
    }

    #[test]
    fn wire_values_decode_matching_frames_only() {
        assert_eq!(
            String::decode(&Frame::Bulk(b"abc".to_vec())),
            Some("abc".to_owned())
        );
        assert_eq!(String::decode(&Frame::Integer(1)), None);

        assert_eq!(i32::decode(&Frame::Integer(42)), Some(42));
        assert_eq!(i32::decode(&Frame::Integer(i64::MAX)), None);
        assert_eq!(i32::decode(&Frame::Bulk(b"42".to_vec())), None);

        assert_eq!(
            Value::decode(&Frame::Bulk(b"abc".to_vec())),
            Some(Value::Str("abc".to_owned()))
        );
        assert_eq!(Value::decode(&Frame::Integer(42)), Some(Value::Int(42)));
        assert_eq!(Value::decode(&Frame::Nil), None);
    }

    #[test]
    fn a_client_survives_an_unreachable_peer() {
        crate::testing::test_async(async {
            // Nothing listens here - every call reports a value-absent outcome or
            // a failure instead of erroring out...
            let client = PeerClient::new("127.0.0.1:1");
            assert_eq!(client.get::<Value>("g", "k").await, None);
            assert_eq!(client.set("g", "k", &Value::Int(1)).await, false);
            assert_eq!(client.delete("g", "k").await, false);
            assert_eq!(client.ping().await, false);
        });
    }
}
