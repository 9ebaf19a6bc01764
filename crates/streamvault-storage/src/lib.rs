//! StreamVault Storage Engine
//!
//! This crate implements the delta-WAL ingestion and upload core of
//! StreamVault: producers append per-stream record batches, the engine makes
//! them durable in a write-ahead log while buffering them in a bounded
//! in-memory cache, and periodically coalesces cache blocks into stream-set
//! objects in S3-compatible storage, trimming the WAL after each commit.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌───────────┐ append                        ┌──────────────┐
//! │ Producers │──────────► DeltaStorage ◄─────│   Readers    │
//! └───────────┘                 │             └──────────────┘
//!                    ┌──────────┼──────────────────┐
//!                    ▼          ▼                  ▼
//!               ┌────────┐ ┌──────────┐      ┌────────────┐
//!               │  WAL   │ │ LogCache │      │ BlockCache │
//!               │ (disk) │ │  (RAM)   │      │ (objects)  │
//!               └────────┘ └────┬─────┘      └────────────┘
//!                               │ sealed blocks       ▲
//!                               ▼                     │
//!                      prepare → upload → commit ─────┘
//!                      (stream-set objects in S3)
//! ```
//!
//! ## Main Components
//!
//! - [`storage::DeltaStorage`]: the facade - append / read / force-upload /
//!   startup / shutdown
//! - [`log_cache::LogCache`]: tiered in-memory buffer of WAL-durable records
//! - [`wal::WriteAheadLog`]: the WAL device boundary, with an in-memory
//!   implementation for tests and embedded runs
//! - [`manager::ObjectManager`] / [`manager::StreamManager`]: metadata
//!   service boundaries
//! - [`block_cache::BlockCache`]: cold read path over committed objects
//!
//! ## Ordering Guarantees
//!
//! - per stream, append futures complete in WAL-offset order
//! - upload commits follow cache-block archive order, so committed object
//!   ids are monotone and every WAL trim point is safe
//! - readers observe archived blocks in commit order, then the active block

pub mod block_cache;
pub mod config;
pub mod error;
pub mod log_cache;
pub mod manager;
pub mod storage;
pub mod wal;

mod confirm;
mod recovery;
mod request;
mod sequencer;
mod upload;

pub use block_cache::{
    BlockCache, CacheAccessType, MemoryBlockCache, ObjectStoreBlockCache, ReadDataBlock,
};
pub use config::StorageConfig;
pub use error::{Error, Result};
pub use log_cache::{LogCache, LogCacheBlock, MATCH_ALL_STREAMS};
pub use manager::{
    MemoryObjectManager, MemoryStreamManager, ObjectManager, ObjectMetadata, StreamManager,
    StreamMetadata,
};
pub use storage::{DeltaStorage, ReadOptions};
pub use wal::{MemoryWal, RecoverRecord, WalAppendHandle, WriteAheadLog};
