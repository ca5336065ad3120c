//! Sharded Transaction Engine
//!
//! The keyspace is split into a fixed number of shards. Each shard is a thread that
//! owns its partition and runs hops from a FIFO queue one at a time. Commands are
//! coordinated by a [`Transaction`], which routes keys to shards and drives hops on
//! them from an async task.
//!
//! ```text
//!                 ┌──────────────┐
//!   command ────> │ Transaction  │ ── route_key ──> { shard ids }
//!                 └──────┬───────┘
//!          arm / execute │ hops
//!        ┌───────────────┼───────────────┐
//!        ▼               ▼               ▼
//!   ┌─────────┐     ┌─────────┐     ┌─────────┐
//!   │ shard 0 │     │ shard 1 │ ... │ shard N │   one thread each,
//!   │ DbSlice │     │ DbSlice │     │ DbSlice │   hops run strictly FIFO
//!   └─────────┘     └─────────┘     └─────────┘
//! ```

pub mod cursor;
pub mod shard;
pub mod transaction;

pub use cursor::ScanCursor;
pub use shard::{HopHandle, OpArgs, ShardHold, ShardId, ShardSet, MAX_HOPS_PER_ITERATION};
pub use transaction::{HopBarrier, ShardKeys, Transaction, TxDebugInfo, TxPhase};
