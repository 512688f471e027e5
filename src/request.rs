//! Provides a parser and wrapper for incoming RESP requests.
//!
//! The node's RPC protocol is the request side of RESP ("REdis Serialization
//! Protocol"): a request is an array of bulk strings, e.g. `CACHE.GET users foo`
//! becomes `*3\r\n$9\r\nCACHE.GET\r\n$5\r\nusers\r\n$3\r\nfoo\r\n`. This is
//! trivially framed, fast to parse and for nearly every platform there is already
//! a client capable of speaking it.
//!
//! As requests arrive via TCP the buffer may hold a partial request at any time.
//! [Request::parse](Request::parse) therefore distinguishes three outcomes:
//! a parsed request, "not yet complete" and "malformed". Internally all results
//! are only offsets into the receive buffer, so no payload data is copied.
//!
//! # Examples
//!
//! ```
//! # use bytes::BytesMut;
//! # use nimbus::request::Request;
//! let buffer = BytesMut::from("*3\r\n$9\r\nCACHE.GET\r\n$5\r\nusers\r\n$3\r\nfoo\r\n");
//! let request = Request::parse(&buffer).unwrap().unwrap();
//!
//! assert_eq!(request.command(), "CACHE.GET");
//! assert_eq!(request.parameter_count(), 2);
//! assert_eq!(request.str_parameter(0).unwrap(), "users");
//! assert_eq!(request.str_parameter(1).unwrap(), "foo");
//! ```
use std::fmt::{Display, Formatter};

use anyhow::{anyhow, Context, Result};
use bytes::{Bytes, BytesMut};

/// The byte offsets of a single token (command or parameter) within the buffer.
#[derive(Copy, Clone, Debug)]
struct Token {
    start: usize,
    end: usize,
}

impl Token {
    /// Computes the offset of the subsequent token by skipping the trailing CRLF.
    fn next_offset(&self) -> usize {
        self.end + 3
    }
}

impl Display for Token {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// Represents a parsed RESP request.
///
/// The first array element is treated as the command; all remaining elements are
/// re-numbered as parameters starting at index 0. `CACHE.SET users foo str bar`
/// therefore has the command `CACHE.SET` and the parameters 0..=3.
pub struct Request {
    len: usize,
    data: Bytes,
    command: Token,
    parameters: Vec<Token>,
}

impl Request {
    const DOLLAR: u8 = b'$';
    const ASTERISK: u8 = b'*';
    const CR: u8 = b'\r';

    /// Tries to parse a RESP request from the given byte buffer.
    ///
    /// Returns an **Err** for malformed data, `Ok(None)` if only a partial request
    /// is present so far, and `Ok(Some(request))` once a full request is available.
    pub fn parse(data: &BytesMut) -> anyhow::Result<Option<Request>> {
        // Abort as early as possible if a partial request is present...
        if data.len() < 4 || data[data.len() - 2] != Request::CR {
            Ok(None)
        } else {
            Request::parse_inner(data)
        }
    }

    /// Provides a helper to create an example request in test environments.
    ///
    /// # Example
    /// ```
    /// # use nimbus::request::Request;
    /// let request = Request::example(vec!["PING"]);
    /// assert_eq!(request.command(), "PING");
    /// ```
    pub fn example(data: Vec<&str>) -> Request {
        let mut input = String::new();
        input.push_str(&format!("*{}\r\n", data.len()));
        for param in data {
            input.push_str(&format!("${}\r\n{}\r\n", param.len(), param));
        }

        Request::parse(&BytesMut::from(input.as_str()))
            .unwrap()
            .unwrap()
    }

    fn parse_inner(data: &BytesMut) -> anyhow::Result<Option<Request>> {
        let mut offset = 0;
        if data[0] != Request::ASTERISK {
            return Err(anyhow!("A request must be an array of bulk strings!"));
        } else {
            offset += 1;
        }

        // Parse the number of array elements...
        let (mut num_parameters, token) = match Request::read_int(data, offset)? {
            Some((num_args, token)) => (num_args - 1, token),
            _ => return Ok(None),
        };
        offset = token.next_offset();

        // The first element is the command...
        let command = match Request::read_bulk_string(data, offset)? {
            Some(token) => token,
            _ => return Ok(None),
        };
        offset = command.next_offset();

        // ...everything else a parameter.
        let mut parameters = Vec::with_capacity(num_parameters.max(0) as usize);
        while num_parameters > 0 {
            if let Some(token) = Request::read_bulk_string(data, offset)? {
                parameters.push(token);
                num_parameters -= 1;
                offset = token.next_offset();
            } else {
                return Ok(None);
            }
        }

        Ok(Some(Request {
            len: offset,
            data: data.clone().freeze(),
            command,
            parameters,
        }))
    }

    /// Tries to parse a non-negative number terminated by CR.
    ///
    /// The triple outcome mirrors [parse](Request::parse): a valid number, an
    /// error for garbage, or **None** while the terminating CR hasn't arrived yet.
    fn read_int(buffer: &BytesMut, offset: usize) -> anyhow::Result<Option<(i32, Token)>> {
        let mut value: i32 = 0;
        let mut index = offset;
        while index < buffer.len() {
            let digit = buffer[index];
            if digit == Request::CR {
                return Ok(Some((
                    value,
                    Token {
                        start: offset,
                        end: index - 1,
                    },
                )));
            }
            if !digit.is_ascii_digit() {
                return Err(anyhow!("Malformed integer at position {}", index));
            }

            value = value * 10 + (digit - b'0') as i32;
            index += 1;
        }

        Ok(None)
    }

    fn read_bulk_string(buffer: &BytesMut, offset: usize) -> anyhow::Result<Option<Token>> {
        if offset >= buffer.len() {
            return Ok(None);
        }
        if buffer[offset] != Request::DOLLAR {
            return Err(anyhow!("Expected a bulk string at {}", offset));
        }

        if let Some((length, token)) = Request::read_int(buffer, offset + 1)? {
            let next_offset = token.next_offset();
            if buffer.len() >= next_offset + length as usize + 2 {
                return Ok(Some(Token {
                    start: next_offset,
                    end: next_offset + length as usize - 1,
                }));
            }
        }

        Ok(None)
    }

    /// Returns the command of the request (the first array element).
    pub fn command(&self) -> &str {
        std::str::from_utf8(&self.data[self.command.start..=self.command.end]).unwrap_or("")
    }

    /// Returns the number of parameters (not counting the command itself).
    pub fn parameter_count(&self) -> usize {
        self.parameters.len()
    }

    /// Returns the n-th parameter as raw bytes.
    ///
    /// Returns an **Err** if the requested index is outside the range of detected
    /// parameters.
    pub fn parameter(&self, index: usize) -> Result<Bytes> {
        if index < self.parameters.len() {
            Ok(self
                .data
                .slice(self.parameters[index].start..=self.parameters[index].end))
        } else {
            Err(anyhow!(
                "Invalid parameter index {} (only {} are present)",
                index,
                self.parameters.len()
            ))
        }
    }

    /// Returns the n-th parameter as UTF-8 string.
    ///
    /// Returns an **Err** if either the requested index is out of range or the
    /// parameter data isn't a valid UTF-8 sequence.
    pub fn str_parameter(&self, index: usize) -> Result<&str> {
        if index < self.parameters.len() {
            let token = self.parameters[index];
            std::str::from_utf8(&self.data[token.start..=token.end]).with_context(|| {
                format!(
                    "Failed to parse parameter {} (range {}) as UTF-8 string!",
                    index, token
                )
            })
        } else {
            Err(anyhow!(
                "Invalid parameter index {} (only {} are present)",
                index,
                self.parameters.len()
            ))
        }
    }

    /// Returns the n-th parameter as 32-bit signed integer.
    pub fn int_parameter(&self, index: usize) -> Result<i32> {
        let string = self.str_parameter(index)?;
        string.parse().with_context(|| {
            format!(
                "Failed to parse parameter {} ('{}') as integer!",
                index, string
            )
        })
    }

    /// Returns the total length in bytes of this request within the buffer.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Determines if the request occupies no bytes (never the case for parsed
    /// requests, provided for completeness).
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use crate::request::Request;
    use bytes::BytesMut;

    #[test]
    fn a_command_is_successfully_parsed() {
        let request = Request::parse(&BytesMut::from(
            "*4\r\n$9\r\nCACHE.SET\r\n$5\r\nusers\r\n$3\r\nfoo\r\n$2\r\n42\r\n",
        ))
        .unwrap()
        .unwrap();

        assert_eq!(request.command(), "CACHE.SET");
        assert_eq!(request.parameter_count(), 3);
        assert_eq!(request.str_parameter(0).unwrap(), "users");
        assert_eq!(request.str_parameter(1).unwrap(), "foo");
        assert_eq!(request.int_parameter(2).unwrap(), 42);

        assert_eq!(request.str_parameter(3).is_err(), true);
        assert_eq!(request.parameter(3).is_err(), true);
    }

    #[test]
    fn missing_array_is_detected() {
        assert_eq!(Request::parse(&BytesMut::from("+GET\r\n")).is_err(), true);
    }

    #[test]
    fn non_bulk_string_is_detected() {
        assert_eq!(
            Request::parse(&BytesMut::from("*1\r\n+GET\r\n")).is_err(),
            true
        );
    }

    #[test]
    fn invalid_number_is_detected() {
        assert_eq!(Request::parse(&BytesMut::from("*GET\r\n")).is_err(), true);
    }

    #[test]
    fn an_incomplete_command_is_skipped() {
        for partial in [
            "",
            "*",
            "*1",
            "*1\r",
            "*1\r\n",
            "*2\r\n$9\r\nCACHE.GET",
            "*2\r\n$9\r\nCACHE.GET\r\n",
            "*2\r\n$9\r\nCACHE.GET\r\n$5\r\nuse",
        ] {
            let result = Request::parse(&BytesMut::from(partial)).unwrap();
            assert_eq!(result.is_none(), true);
        }
    }
}
