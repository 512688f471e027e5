//! Provides a writer to assemble RESP responses.
//!
//! A [Response] buffers the serialized reply of a command and hands the completed
//! byte buffer back to the protocol loop, so writing the reply onto the wire takes
//! a single sys-call. Next to the classic RESP reply types (simple string, bulk
//! string, integer, error, array) the writer knows the **nil** bulk string which
//! the cache protocol uses to report "no value" - note that nil is distinct from
//! an empty string, which is a present (but empty) value.
//!
//! # Example
//!
//! ```
//! # use nimbus::response::Response;
//! let mut response = Response::new();
//! response.bulk("hello").unwrap();
//! assert_eq!(&response.complete().unwrap()[..], b"$5\r\nhello\r\n");
//! ```
use std::error::Error;
use std::fmt::{Display, Formatter};

use bytes::{BufMut, BytesMut};

/// Represents an error which occurred while producing a response.
///
/// We distinguish protocol errors (the handler produced structurally invalid
/// output) from IO errors surfaced by the underlying buffer. Both indicate that
/// the connection is in an inconsistent state and should be closed.
#[derive(Debug)]
pub enum OutputError {
    /// The response itself became structurally invalid.
    ProtocolError(anyhow::Error),
    /// Writing the response data failed.
    IoError(std::io::Error),
}

impl Display for OutputError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputError::ProtocolError(error) => write!(f, "Protocol error: {}", error),
            OutputError::IoError(error) => write!(f, "IO error: {}", error),
        }
    }
}

impl Error for OutputError {}

impl From<anyhow::Error> for OutputError {
    fn from(error: anyhow::Error) -> Self {
        OutputError::ProtocolError(error)
    }
}

/// The result type of all output operations.
pub type OutputResult = Result<(), OutputError>;

/// A horizontal rule used by the tabular diagnostic outputs.
pub const SEPARATOR: &str =
    "--------------------------------------------------------------------------------\n";

/// Assembles the RESP representation of a command result.
pub struct Response {
    buffer: BytesMut,
}

impl Default for Response {
    fn default() -> Self {
        Response::new()
    }
}

impl Response {
    /// Creates a new response with a pre-allocated buffer.
    pub fn new() -> Self {
        Response {
            buffer: BytesMut::with_capacity(512),
        }
    }

    /// Completes the response and returns the serialized bytes.
    pub fn complete(self) -> Result<BytesMut, OutputError> {
        Ok(self.buffer)
    }

    /// Emits an array header for the given number of items.
    ///
    /// The items themselves have to be emitted afterwards using the other
    /// methods.
    pub fn array(&mut self, items: i32) -> OutputResult {
        self.buffer
            .put_slice(format!("*{}\r\n", items).as_bytes());
        Ok(())
    }

    /// Emits `+OK`, the standard acknowledgement.
    pub fn ok(&mut self) -> OutputResult {
        self.simple("OK")
    }

    /// Emits the given number as RESP integer.
    pub fn number(&mut self, number: i64) -> OutputResult {
        self.buffer
            .put_slice(format!(":{}\r\n", number).as_bytes());
        Ok(())
    }

    /// Emits the given string as simple string.
    ///
    /// The string must not contain line breaks; use [bulk](Response::bulk) for
    /// arbitrary payload data.
    pub fn simple(&mut self, string: impl AsRef<str>) -> OutputResult {
        self.buffer.put_u8(b'+');
        self.buffer.put_slice(string.as_ref().as_bytes());
        self.buffer.put_slice(b"\r\n");
        Ok(())
    }

    /// Emits the given string as bulk string.
    pub fn bulk(&mut self, string: impl AsRef<str>) -> OutputResult {
        let string = string.as_ref();
        self.buffer
            .put_slice(format!("${}\r\n", string.len()).as_bytes());
        self.buffer.put_slice(string.as_bytes());
        self.buffer.put_slice(b"\r\n");
        Ok(())
    }

    /// Emits the nil bulk string which reports an absent value.
    pub fn nil(&mut self) -> OutputResult {
        self.buffer.put_slice(b"$-1\r\n");
        Ok(())
    }

    /// Emits the given message as RESP error.
    pub fn error(&mut self, message: impl AsRef<str>) -> OutputResult {
        self.buffer.put_u8(b'-');
        // An error frame is line based, so line breaks within the message would
        // tear the protocol apart.
        self.buffer
            .put_slice(message.as_ref().replace(['\r', '\n'], " ").as_bytes());
        self.buffer.put_slice(b"\r\n");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::response::Response;

    fn render(op: impl FnOnce(&mut Response)) -> String {
        let mut response = Response::new();
        op(&mut response);
        String::from_utf8(response.complete().unwrap().to_vec()).unwrap()
    }

    #[test]
    fn simple_strings_and_ok_are_rendered() {
        assert_eq!(render(|r| r.ok().unwrap()), "+OK\r\n");
        assert_eq!(render(|r| r.simple("PONG").unwrap()), "+PONG\r\n");
    }

    #[test]
    fn bulk_strings_and_nil_are_rendered() {
        assert_eq!(render(|r| r.bulk("hello").unwrap()), "$5\r\nhello\r\n");
        assert_eq!(render(|r| r.bulk("").unwrap()), "$0\r\n\r\n");
        assert_eq!(render(|r| r.nil().unwrap()), "$-1\r\n");
    }

    #[test]
    fn numbers_and_arrays_are_rendered() {
        assert_eq!(render(|r| r.number(-42).unwrap()), ":-42\r\n");
        assert_eq!(
            render(|r| {
                r.array(2).unwrap();
                r.number(1).unwrap();
                r.bulk("x").unwrap();
            }),
            "*2\r\n:1\r\n$1\r\nx\r\n"
        );
    }

    #[test]
    fn errors_are_rendered_on_a_single_line() {
        assert_eq!(
            render(|r| r.error("CLIENT: broken\r\nrequest").unwrap()),
            "-CLIENT: broken  request\r\n"
        );
    }
}
