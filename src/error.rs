//! Engine error kinds.
//!
//! Every command either produces a [`Reply`](crate::reply::Reply) or one of these
//! errors. Validation errors (`InvalidArgument`, `WrongArity`, `UnknownCommand`) are
//! always raised before any hop is scheduled, so they never leave partial side effects.

use crate::engine::ShardId;
use thiserror::Error;

/// Errors produced by the sharded engine and the command layer.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Operation applied to a key holding an incompatible value type
    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,

    /// RENAME source does not exist
    #[error("ERR no such key")]
    NoSuchKey,

    /// Malformed argument (TTL, cursor, LIMIT, numeric value, ...)
    #[error("ERR {0}")]
    InvalidArgument(String),

    /// Arity check failed
    #[error("ERR wrong number of arguments for '{0}' command")]
    WrongArity(String),

    /// The dispatcher does not know this command
    #[error("ERR unknown command '{0}'")]
    UnknownCommand(String),

    /// A shard stopped executing hops; its partition can no longer be trusted
    #[error("ERR shard {0} aborted")]
    Aborted(ShardId),

    /// Failure while starting shard threads
    #[error("ERR failed to start shard: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Shorthand for an `InvalidArgument` error.
    pub fn invalid(msg: impl Into<String>) -> Self {
        EngineError::InvalidArgument(msg.into())
    }

    /// Shorthand for the generic "syntax error" reply.
    pub fn syntax() -> Self {
        EngineError::invalid("syntax error")
    }

    /// Shorthand for the "not an integer" reply.
    pub fn not_an_integer() -> Self {
        EngineError::invalid("value is not an integer or out of range")
    }
}

/// Result type used throughout the engine.
pub type EngineResult<T> = Result<T, EngineError>;
