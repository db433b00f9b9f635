//! RESP (Redis Serialization Protocol) frame types.
//!
//! Every value exchanged with a client is one of five frame shapes,
//! selected by its first byte:
//!
//! - `+` simple string, `-` error, `:` integer
//! - `$` bulk string (binary safe, `$-1\r\n` is the nil bulk)
//! - `*` array (`*-1\r\n` is the nil array)
//!
//! All frames terminate lines with CRLF. The same enum is used for
//! decoded client commands and encoded server replies; replication and
//! pub/sub reuse it to build the frames they push.

use bytes::Bytes;
use std::fmt;

/// The CRLF line terminator used throughout RESP.
pub const CRLF: &[u8] = b"\r\n";

/// RESP type prefix bytes.
pub mod prefix {
    pub const SIMPLE_STRING: u8 = b'+';
    pub const ERROR: u8 = b'-';
    pub const INTEGER: u8 = b':';
    pub const BULK_STRING: u8 = b'$';
    pub const ARRAY: u8 = b'*';
}

/// A single RESP frame.
///
/// `Null` encodes as the nil bulk string (`$-1\r\n`) and `NullArray`
/// as the nil array (`*-1\r\n`); commands that must reply with one or
/// the other pick the variant explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// Non-binary line, e.g. `+OK\r\n`. Must not contain CRLF.
    SimpleString(String),

    /// Error reply, e.g. `-ERR unknown command\r\n`.
    Error(String),

    /// Signed 64-bit integer, e.g. `:42\r\n`.
    Integer(i64),

    /// Binary-safe string: `$<len>\r\n<bytes>\r\n`.
    BulkString(Bytes),

    /// Nil bulk string: `$-1\r\n`.
    Null,

    /// Nil array: `*-1\r\n`.
    NullArray,

    /// Array of frames, possibly nested: `*<count>\r\n<frames...>`.
    Array(Vec<RespValue>),
}

impl RespValue {
    pub fn simple_string(s: impl Into<String>) -> Self {
        RespValue::SimpleString(s.into())
    }

    pub fn error(s: impl Into<String>) -> Self {
        RespValue::Error(s.into())
    }

    pub fn integer(n: i64) -> Self {
        RespValue::Integer(n)
    }

    pub fn bulk_string(data: impl Into<Bytes>) -> Self {
        RespValue::BulkString(data.into())
    }

    pub fn array(values: Vec<RespValue>) -> Self {
        RespValue::Array(values)
    }

    /// The canonical `+OK\r\n` reply.
    pub fn ok() -> Self {
        RespValue::SimpleString("OK".to_string())
    }

    pub fn pong() -> Self {
        RespValue::SimpleString("PONG".to_string())
    }

    /// The standard reply for a type-mismatched key operation.
    pub fn wrong_type() -> Self {
        RespValue::Error(
            "WRONGTYPE Operation against a key holding the wrong kind of value".to_string(),
        )
    }

    /// Serializes this frame to its wire representation.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.serialize_into(&mut buf);
        buf
    }

    /// Serializes this frame into an existing buffer.
    pub fn serialize_into(&self, buf: &mut Vec<u8>) {
        match self {
            RespValue::SimpleString(s) => {
                buf.push(prefix::SIMPLE_STRING);
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(CRLF);
            }
            RespValue::Error(s) => {
                buf.push(prefix::ERROR);
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(CRLF);
            }
            RespValue::Integer(n) => {
                buf.push(prefix::INTEGER);
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.extend_from_slice(CRLF);
            }
            RespValue::BulkString(data) => {
                buf.push(prefix::BULK_STRING);
                buf.extend_from_slice(data.len().to_string().as_bytes());
                buf.extend_from_slice(CRLF);
                buf.extend_from_slice(data);
                buf.extend_from_slice(CRLF);
            }
            RespValue::Null => {
                buf.extend_from_slice(b"$-1\r\n");
            }
            RespValue::NullArray => {
                buf.extend_from_slice(b"*-1\r\n");
            }
            RespValue::Array(values) => {
                buf.push(prefix::ARRAY);
                buf.extend_from_slice(values.len().to_string().as_bytes());
                buf.extend_from_slice(CRLF);
                for value in values {
                    value.serialize_into(buf);
                }
            }
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RespValue::Error(_))
    }

    /// Extracts the inner text of a SimpleString or UTF-8 BulkString.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            RespValue::SimpleString(s) => Some(s),
            RespValue::BulkString(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Extracts the raw bytes of a BulkString.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            RespValue::BulkString(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[RespValue]> {
        match self {
            RespValue::Array(arr) => Some(arr),
            _ => None,
        }
    }
}

/// Encodes a command argv as an array of bulk strings.
///
/// This is the canonical form used on the replication link and by the
/// follower handshake: an argv of binary-safe tokens.
pub fn encode_command(args: &[Bytes]) -> Vec<u8> {
    let frame = RespValue::Array(
        args.iter()
            .map(|a| RespValue::BulkString(a.clone()))
            .collect(),
    );
    frame.serialize()
}

/// Convenience for building commands from string literals.
pub fn encode_command_str(args: &[&str]) -> Vec<u8> {
    let owned: Vec<Bytes> = args
        .iter()
        .map(|a| Bytes::copy_from_slice(a.as_bytes()))
        .collect();
    encode_command(&owned)
}

impl fmt::Display for RespValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RespValue::SimpleString(s) => write!(f, "\"{}\"", s),
            RespValue::Error(s) => write!(f, "(error) {}", s),
            RespValue::Integer(n) => write!(f, "(integer) {}", n),
            RespValue::BulkString(data) => {
                if let Ok(s) = std::str::from_utf8(data) {
                    write!(f, "\"{}\"", s)
                } else {
                    write!(f, "(binary data, {} bytes)", data.len())
                }
            }
            RespValue::Null => write!(f, "(nil)"),
            RespValue::NullArray => write!(f, "(nil array)"),
            RespValue::Array(values) => {
                if values.is_empty() {
                    write!(f, "(empty array)")
                } else {
                    writeln!(f)?;
                    for (i, v) in values.iter().enumerate() {
                        writeln!(f, "{}) {}", i + 1, v)?;
                    }
                    Ok(())
                }
            }
        }
    }
}
