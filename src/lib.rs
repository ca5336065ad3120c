//! # shardkv - A Sharded Transaction Engine for an In-Memory Key-Value Store
//!
//! The keyspace is split into N shards, each owned by a dedicated thread. No data is
//! behind a lock: a command is turned into a [`Transaction`](engine::Transaction) that
//! schedules small closures ("hops") onto the shards owning its keys. Hops on one shard
//! run strictly in arrival order, so every shard behaves like a single-threaded store.
//! A multi-shard command holds all of its shards while it runs, so other commands see
//! it either not at all or completely.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                shardkv                                  │
//! │                                                                         │
//! │  ┌─────────────┐    ┌─────────────┐    ┌──────────────────┐             │
//! │  │   argv      │───>│  Command    │───>│   Transaction    │             │
//! │  │ (any front) │    │  Handler    │    │  arm / execute   │             │
//! │  └─────────────┘    └─────────────┘    └────────┬─────────┘             │
//! │                                                 │ hops                  │
//! │                                                 ▼                       │
//! │                     ┌──────────────────────────────────────────────┐    │
//! │                     │                 ShardSet                     │    │
//! │                     │  ┌────────┐ ┌────────┐ ┌────────┐ ┌────────┐ │    │
//! │                     │  │Shard 0 │ │Shard 1 │ │Shard 2 │ │...N    │ │    │
//! │                     │  │DbSlice │ │DbSlice │ │DbSlice │ │shards  │ │    │
//! │                     │  └────────┘ └────────┘ └────────┘ └────────┘ │    │
//! │                     └──────────────────────────────────────────────┘    │
//! │                                                 ▲                       │
//! │                                                 │ sweep hops            │
//! │                     ┌───────────────────────────┴─────────────────────┐ │
//! │                     │           ExpirySweeper                         │ │
//! │                     │      (Background Tokio Task)                    │ │
//! │                     └─────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use bytes::Bytes;
//! use shardkv::commands::CommandHandler;
//! use shardkv::config::EngineConfig;
//! use shardkv::engine::ShardSet;
//! use shardkv::storage::{start_expiry_sweeper, Clock};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let shards = Arc::new(ShardSet::new(&EngineConfig::default(), Clock::system())?);
//!     let _sweeper = start_expiry_sweeper(Arc::clone(&shards));
//!
//!     let mut handler = CommandHandler::new(Arc::clone(&shards));
//!     let argv = vec![Bytes::from("SET"), Bytes::from("greeting"), Bytes::from("hello")];
//!     println!("{}", handler.execute(argv).await);
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`engine`]: shards, hop scheduling, transactions, SCAN cursors
//! - [`storage`]: per-shard keyspace, values, clock, expiry
//! - [`commands`]: command parsing and the command families
//! - [`reply`]: command results
//! - [`config`]: engine configuration
//!
//! ## Design Highlights
//!
//! ### Shared-nothing shards
//!
//! A shard's data is reachable only from hops running on that shard's thread. There is
//! no mutex around any partition.
//!
//! ### Lazy + Active Expiry
//!
//! 1. **Lazy**: a past-due key is removed the moment a hop touches it
//! 2. **Active**: a background task schedules bounded sweep hops on every shard

pub mod commands;
pub mod config;
pub mod engine;
pub mod error;
pub mod reply;
pub mod storage;

// Re-export commonly used types for convenience
pub use commands::CommandHandler;
pub use config::EngineConfig;
pub use engine::{ShardSet, Transaction, TxDebugInfo};
pub use error::{EngineError, EngineResult};
pub use reply::Reply;
pub use storage::{start_expiry_sweeper, Clock, ExpiryConfig, ExpirySweeper};

/// Version of shardkv
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
