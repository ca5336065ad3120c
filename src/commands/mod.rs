//! Command Layer
//!
//! Turns an argument vector into a validated [`Command`], builds the
//! [`Transaction`](crate::engine::Transaction) over the keys it touches, and runs the
//! per-family implementation against the shards.
//!
//! ## Architecture
//!
//! ```text
//! argv
//!   │
//!   ▼
//! ┌──────────────────┐
//! │ CommandHandler   │  parse + validate (no hops scheduled on error)
//! └────────┬─────────┘
//!          │ Invocation { command, transaction }
//!          ▼
//! ┌──────────────────┐
//! │ generic/strings/ │  decide what each hop does, merge results
//! │ collections/...  │
//! └────────┬─────────┘
//!          ▼
//!      ShardSet
//! ```
//!
//! ## Supported Commands
//!
//! ### Generic
//! - `DEL`, `EXISTS`, `TTL`, `PTTL`, `PERSIST`, `TYPE`, `KEYS`
//! - `EXPIRE`, `PEXPIRE`, `EXPIREAT`, `PEXPIREAT`
//! - `RENAME`, `SCAN`, `SORT`
//!
//! ### Strings
//! - `SET`, `GET`, `MSET`, `MGET`
//!
//! ### Collections
//! - `LPUSH`, `RPUSH`, `LRANGE`, `LLEN`
//! - `SADD`, `SCARD`, `ZADD`, `ZCARD`
//!
//! ### Server
//! - `PING`, `DBSIZE`, `FLUSHDB`, `FLUSHALL`

pub mod collections;
pub mod generic;
pub mod handler;
pub mod server;
pub mod strings;

pub use handler::{Command, CommandHandler, Invocation};

use crate::engine::{OpArgs, Transaction};
use crate::error::{EngineError, EngineResult};
use crate::storage::DbSlice;
use bytes::Bytes;

/// Runs `f` once on the shard owning the transaction's first key.
pub(crate) async fn single_key_hop<F, R>(tx: &mut Transaction, f: F) -> EngineResult<R>
where
    F: FnOnce(&Bytes, &mut DbSlice, &OpArgs) -> R + Send + 'static,
    R: Send + 'static,
{
    let key = tx
        .keys()
        .first()
        .cloned()
        .ok_or_else(|| EngineError::WrongArity(tx.name().to_string()))?;
    let shard = tx.route(&key);
    let result = tx.execute_on(shard, move |_, db, op| f(&key, db, op)).await?;
    tx.conclude();
    Ok(result)
}
