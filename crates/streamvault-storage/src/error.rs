//! Storage Error Types
//!
//! This module defines all error types that can surface from the delta-WAL
//! engine.
//!
//! ## Error Categories
//!
//! ### Read Errors
//! - `FastReadFailFast`: a `fast_read` request missed the delta-WAL cache
//! - `ContinuityCheckFailed`: a merged read produced a gap between records
//!
//! ### Append Errors
//! - `WalOverCapacity`: the WAL rejected an append; handled internally by
//!   force-upload + backoff and never surfaced to producers
//! - `Wal`: any other failure reported by the WAL device
//!
//! ### Upload Errors
//! - `Persist`: prepare/upload of a stream-set object failed; propagates to
//!   the waiting force-upload callers. A failed *commit* has no variant -
//!   the engine terminates the process, because continuing would break the
//!   link between the WAL trim point and committed objects.
//!
//! ### Lifecycle Errors
//! - `Shutdown`: the engine is shut down; parked and new appends fail with it
//! - `RecoveryInvariant`: WAL replay found records inconsistent with the
//!   committed stream offsets; startup aborts
//!
//! All operations return `Result<T>`, aliased to `Result<T, Error>`.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("fast read missed the delta-WAL cache")]
    FastReadFailFast,

    #[error("continuity check failed for stream {stream_id}: expected offset {expected}, got {actual}")]
    ContinuityCheckFailed {
        stream_id: u64,
        expected: u64,
        actual: u64,
    },

    #[error("WAL over capacity")]
    WalOverCapacity,

    #[error("WAL error: {0}")]
    Wal(String),

    #[error("persist failed: {0}")]
    Persist(String),

    #[error("storage is shut down")]
    Shutdown,

    #[error("recovery invariant violated: {0}")]
    RecoveryInvariant(String),

    #[error("codec error: {0}")]
    Codec(#[from] streamvault_core::Error),

    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected: {0}")]
    Unexpected(String),
}
