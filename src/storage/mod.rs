//! Storage Module
//!
//! Everything a shard owns: the keyspace partition ([`DbSlice`]), the value model,
//! the clock used for expiry decisions, and the background sweeper that reclaims
//! expired keys nobody touches.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────── shard thread ─────────────────────────┐
//! │  DbSlice                                                       │
//! │  ┌────────┐ ┌────────┐ ┌────────┐        ┌────────────────┐    │
//! │  │ slot 0 │ │ slot 1 │ │ slot 2 │  ...   │ expires index  │    │
//! │  └────────┘ └────────┘ └────────┘        └────────────────┘    │
//! └────────────────────────────────────────────────────────────────┘
//!                            ▲
//!                            │ sweep hop
//!              ┌─────────────┴─────────────┐
//!              │     ExpirySweeper         │
//!              │  (Background Tokio Task)  │
//!              └───────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Owned partitions**: a `DbSlice` is touched only by hops on its shard
//! - **Lazy Expiry**: expired keys are removed when accessed
//! - **Active Expiry**: the sweeper removes expired keys nobody accesses
//! - **Stable scan slots**: SCAN positions survive concurrent inserts and deletes

pub mod clock;
pub mod db_slice;
pub mod expiry;
pub mod glob;
pub mod value;

pub use clock::Clock;
pub use db_slice::{key_hash, DbSlice, Entry, ScanFilter, ScanStep, SliceStats, SweepStats};
pub use expiry::{start_expiry_sweeper, sweep_once, ExpiryConfig, ExpirySweeper};
pub use glob::GlobPattern;
pub use value::{Direction, SortedSet, Value, ValueType};
