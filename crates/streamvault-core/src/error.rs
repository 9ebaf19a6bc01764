//! Error Types for StreamVault Core
//!
//! This module defines the errors that can occur while encoding or decoding
//! record batch frames and stream-set objects.
//!
//! ## Error Categories
//!
//! ### Data Integrity Errors
//! - `InvalidMagic`: frame or object doesn't start with the expected magic bytes
//! - `CrcMismatch`: corruption detected via checksum
//!
//! ### Version Errors
//! - `UnsupportedVersion`: data was written by a newer format version
//!
//! ### Structural Errors
//! - `Truncated`: input ends in the middle of a frame
//! - `InvalidObject`: malformed stream-set object (bad index, non-contiguous records)
//! - `StreamNotFound`: the object carries no data for the requested stream
//!
//! All functions in this crate return `Result<T>`, aliased to
//! `Result<T, Error>`, so callers can propagate with `?`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid magic bytes")]
    InvalidMagic,

    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u16),

    #[error("CRC mismatch")]
    CrcMismatch,

    #[error("Truncated input: need {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("Stream not found in object: {0}")]
    StreamNotFound(u64),

    #[error("Invalid object: {0}")]
    InvalidObject(String),
}

pub type Result<T> = std::result::Result<T, Error>;
