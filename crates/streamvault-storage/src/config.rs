//! Engine Configuration
//!
//! This module defines configuration for the delta-WAL engine.
//!
//! ## StorageConfig
//!
//! Controls how much the in-memory cache may hold, when cache blocks are
//! sealed for upload, and the cadence of the background machinery:
//!
//! - **wal_cache_size**: admission limit for the delta-WAL cache (default: 200MB).
//!   Appends back off while the cache is at or above this size.
//! - **wal_upload_threshold**: seal the active cache block once it crosses
//!   this size (default: 100MB)
//! - **max_streams_per_block**: seal the active block once it holds this many
//!   distinct streams (default: 10,000), bounding per-object index size
//! - **upload_concurrency**: concurrent stream-set object store writes (default: 4)
//! - **stream_callback_locks**: striped locks serializing per-stream WAL
//!   completion callbacks (default: 128)
//! - **force_upload_debounce_ms**: window for coalescing force-upload bursts
//!   (default: 500ms)
//! - **confirm_tick_ms** / **backoff_drain_ms**: background tick periods
//!   (default: 100ms each)
//! - **read_watchdog_ms**: log-only watchdog for slow block-cache reads
//!   (default: 60s)
//! - **object_key_prefix**: object-store key prefix for uploaded objects
//!
//! ## Usage
//!
//! ```ignore
//! use streamvault_storage::StorageConfig;
//!
//! // Production config
//! let config = StorageConfig::default();
//!
//! // Small limits for tests
//! let config = StorageConfig {
//!     wal_cache_size: 1024,
//!     wal_upload_threshold: 512,
//!     force_upload_debounce_ms: 10,
//!     ..Default::default()
//! };
//! ```

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Delta-WAL cache admission limit in bytes (default: 200MB)
    #[serde(default = "default_wal_cache_size")]
    pub wal_cache_size: u64,

    /// Active cache block seal threshold in bytes (default: 100MB)
    #[serde(default = "default_wal_upload_threshold")]
    pub wal_upload_threshold: u64,

    /// Maximum distinct streams per cache block (default: 10,000)
    #[serde(default = "default_max_streams_per_block")]
    pub max_streams_per_block: usize,

    /// Concurrent stream-set object store writes (default: 4)
    #[serde(default = "default_upload_concurrency")]
    pub upload_concurrency: usize,

    /// Striped stream-callback lock count (default: 128)
    #[serde(default = "default_stream_callback_locks")]
    pub stream_callback_locks: usize,

    /// Force-upload debounce window in milliseconds (default: 500)
    #[serde(default = "default_force_upload_debounce_ms")]
    pub force_upload_debounce_ms: u64,

    /// Confirm-offset update period in milliseconds (default: 100)
    #[serde(default = "default_confirm_tick_ms")]
    pub confirm_tick_ms: u64,

    /// Backoff drain period in milliseconds (default: 100)
    #[serde(default = "default_backoff_drain_ms")]
    pub backoff_drain_ms: u64,

    /// Block-cache read watchdog in milliseconds, log-only (default: 60,000)
    #[serde(default = "default_read_watchdog_ms")]
    pub read_watchdog_ms: u64,

    /// Object-store key prefix for stream-set objects (default: "objects")
    #[serde(default = "default_object_key_prefix")]
    pub object_key_prefix: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            wal_cache_size: default_wal_cache_size(),
            wal_upload_threshold: default_wal_upload_threshold(),
            max_streams_per_block: default_max_streams_per_block(),
            upload_concurrency: default_upload_concurrency(),
            stream_callback_locks: default_stream_callback_locks(),
            force_upload_debounce_ms: default_force_upload_debounce_ms(),
            confirm_tick_ms: default_confirm_tick_ms(),
            backoff_drain_ms: default_backoff_drain_ms(),
            read_watchdog_ms: default_read_watchdog_ms(),
            object_key_prefix: default_object_key_prefix(),
        }
    }
}

fn default_wal_cache_size() -> u64 {
    200 * 1024 * 1024 // 200MB
}

fn default_wal_upload_threshold() -> u64 {
    100 * 1024 * 1024 // 100MB
}

fn default_max_streams_per_block() -> usize {
    10_000
}

fn default_upload_concurrency() -> usize {
    4
}

fn default_stream_callback_locks() -> usize {
    128
}

fn default_force_upload_debounce_ms() -> u64 {
    500
}

fn default_confirm_tick_ms() -> u64 {
    100
}

fn default_backoff_drain_ms() -> u64 {
    100
}

fn default_read_watchdog_ms() -> u64 {
    60_000
}

fn default_object_key_prefix() -> String {
    "objects".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StorageConfig::default();
        assert_eq!(config.wal_cache_size, 200 * 1024 * 1024);
        assert_eq!(config.wal_upload_threshold, 100 * 1024 * 1024);
        assert_eq!(config.max_streams_per_block, 10_000);
        assert_eq!(config.upload_concurrency, 4);
        assert_eq!(config.stream_callback_locks, 128);
        assert_eq!(config.force_upload_debounce_ms, 500);
        assert_eq!(config.confirm_tick_ms, 100);
        assert_eq!(config.backoff_drain_ms, 100);
        assert_eq!(config.read_watchdog_ms, 60_000);
        assert_eq!(config.object_key_prefix, "objects");
    }

    #[test]
    fn test_partial_deserialize_fills_defaults() {
        let config: StorageConfig = serde_json::from_str(r#"{"wal_cache_size": 1024}"#).unwrap();
        assert_eq!(config.wal_cache_size, 1024);
        assert_eq!(config.wal_upload_threshold, 100 * 1024 * 1024);
        assert_eq!(config.stream_callback_locks, 128);
    }

    #[test]
    fn test_serde_roundtrip() {
        let config = StorageConfig {
            wal_cache_size: 42,
            object_key_prefix: "delta".to_string(),
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: StorageConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.wal_cache_size, 42);
        assert_eq!(back.object_key_prefix, "delta");
    }
}
