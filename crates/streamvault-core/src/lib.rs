//! StreamVault Core
//!
//! This crate defines the data model shared by every StreamVault component:
//!
//! 1. **StreamRecordBatch**: one producer append to one stream, with its
//!    stable CRC-checked frame format - the unit the WAL persists and the
//!    cache buffers
//! 2. **Stream-set object format**: the immutable object-store artifact one
//!    upload produces, carrying record batches from many streams behind a
//!    per-stream index
//!
//! The engine itself (cache, sequencing, upload pipeline) lives in
//! `streamvault-storage`; this crate is deliberately runtime-free so codecs
//! can be reused from tools and tests without pulling in the engine.

pub mod error;
pub mod object;
pub mod record;

pub use error::{Error, Result};
pub use object::{FinishedObject, StreamRange, StreamSetObjectReader, StreamSetObjectWriter};
pub use record::StreamRecordBatch;
