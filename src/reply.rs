//! Language-Neutral Reply Values
//!
//! Commands return a [`Reply`]; turning it into bytes on a wire is the job of
//! whatever front-end sits in front of the engine. The only rendering provided here is
//! the human-readable `Display` form used by the interactive shell.
//!
//! ## Shapes
//!
//! - `Status`: a short status token such as `OK` or `PONG`
//! - `Error`: an error message, prefixed by its kind (`ERR`, `WRONGTYPE`)
//! - `Integer`: a signed 64-bit count or duration
//! - `Bulk`: a binary-safe byte string
//! - `Nil`: absence of a value
//! - `Array`: an ordered sequence of replies

use crate::error::EngineError;
use bytes::Bytes;
use std::fmt;

/// A command result handed back to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Status token (`OK`, `PONG`, type names)
    Status(String),

    /// Error message including its kind prefix
    Error(String),

    /// 64-bit signed integer
    Integer(i64),

    /// Binary-safe string
    Bulk(Bytes),

    /// Missing value
    Nil,

    /// Ordered sequence of replies
    Array(Vec<Reply>),
}

impl Reply {
    /// Creates a status reply.
    pub fn status(s: impl Into<String>) -> Self {
        Reply::Status(s.into())
    }

    /// Creates an error reply.
    pub fn error(s: impl Into<String>) -> Self {
        Reply::Error(s.into())
    }

    /// Creates an integer reply.
    pub fn integer(n: i64) -> Self {
        Reply::Integer(n)
    }

    /// Creates a bulk string reply.
    pub fn bulk(data: impl Into<Bytes>) -> Self {
        Reply::Bulk(data.into())
    }

    /// Creates an array of bulk strings.
    pub fn bulk_array(items: impl IntoIterator<Item = Bytes>) -> Self {
        Reply::Array(items.into_iter().map(Reply::Bulk).collect())
    }

    /// Common reply for successful operations
    pub fn ok() -> Self {
        Reply::Status("OK".to_string())
    }

    /// Returns true if this reply is an error.
    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }

    /// Returns true if this reply is nil.
    pub fn is_nil(&self) -> bool {
        matches!(self, Reply::Nil)
    }

    /// Attempts to extract the inner integer.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Reply::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Attempts to extract the inner bytes of a bulk reply.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Reply::Bulk(b) => Some(b),
            _ => None,
        }
    }

    /// Attempts to extract the inner array.
    pub fn as_array(&self) -> Option<&[Reply]> {
        match self {
            Reply::Array(arr) => Some(arr),
            _ => None,
        }
    }
}

impl From<EngineError> for Reply {
    fn from(err: EngineError) -> Self {
        Reply::Error(err.to_string())
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Status(s) => write!(f, "{}", s),
            Reply::Error(s) => write!(f, "(error) {}", s),
            Reply::Integer(n) => write!(f, "(integer) {}", n),
            Reply::Bulk(data) => match std::str::from_utf8(data) {
                Ok(s) => write!(f, "\"{}\"", s),
                Err(_) => write!(f, "(binary data, {} bytes)", data.len()),
            },
            Reply::Nil => write!(f, "(nil)"),
            Reply::Array(values) => {
                if values.is_empty() {
                    return write!(f, "(empty array)");
                }
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{}) {}", i + 1, v)?;
                }
                Ok(())
            }
        }
    }
}
