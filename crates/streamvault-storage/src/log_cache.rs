//! Delta-WAL Log Cache
//!
//! This module implements the tiered in-memory buffer holding records that
//! are WAL-durable but not yet committed to the object store.
//!
//! ## Structure
//!
//! ```text
//! ┌───────────────────────────────────────────────────────┐
//! │ LogCache                                              │
//! │                                                       │
//! │  archived blocks (upload-commit order)    active      │
//! │  ┌─────────┐ ┌─────────┐ ┌─────────┐   ┌─────────┐    │
//! │  │ block 1 │→│ block 2 │→│ block 3 │ → │ block 4 │    │
//! │  │ sealed  │ │ sealed  │ │ sealed  │   │ appends │    │
//! │  └─────────┘ └─────────┘ └─────────┘   └─────────┘    │
//! └───────────────────────────────────────────────────────┘
//! ```
//!
//! Appends land in the *active* block. When the active block crosses the
//! size threshold (or holds too many distinct streams), `put` signals the
//! caller, which seals it: the block moves to the archived list and feeds
//! the upload pipeline, and a fresh active block takes over. After the
//! pipeline commits a block's stream-set object and trims the WAL, the block
//! is freed and its record references released.
//!
//! Readers scan archived blocks in commit order and then the active block,
//! so they observe records in exactly the order uploads will commit them.
//!
//! ## Invariants
//!
//! - Per stream, each block's record vector is strictly offset-contiguous
//! - A block's `confirm_offset` is at least the WAL offset of every record
//!   it contains, making it a safe WAL trim point once the block commits
//! - The cache size is tracked in an atomic so the admission check on the
//!   append path never takes the cache lock
//!
//! ## Memory Pressure
//!
//! `force_free` releases archived blocks whose object commit already
//! completed (their data is readable from the store, so dropping them only
//! costs a cache miss). Blocks still waiting on upload or commit are never
//! force-freed - their records exist nowhere else but here and the WAL.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use streamvault_core::StreamRecordBatch;
use tracing::{debug, warn};

/// Selector matching every stream, for archive/force-upload operations.
pub const MATCH_ALL_STREAMS: u64 = u64::MAX;

/// One sealed or active cache block.
pub struct LogCacheBlock {
    id: u64,
    created_at: Instant,
    records: HashMap<u64, Vec<StreamRecordBatch>>,
    size: u64,
    confirm_offset: i64,
    free: bool,
    committed: bool,
}

impl LogCacheBlock {
    pub(crate) fn new(id: u64) -> Self {
        Self {
            id,
            created_at: Instant::now(),
            records: HashMap::new(),
            size: 0,
            confirm_offset: 0,
            free: false,
            committed: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn confirm_offset(&self) -> i64 {
        self.confirm_offset
    }

    pub(crate) fn set_confirm_offset(&mut self, offset: i64) {
        if offset > self.confirm_offset {
            self.confirm_offset = offset;
        }
    }

    pub fn stream_count(&self) -> usize {
        self.records.len()
    }

    pub fn contains_stream(&self, stream_id: u64) -> bool {
        stream_id == MATCH_ALL_STREAMS && !self.records.is_empty()
            || self.records.contains_key(&stream_id)
    }

    pub fn records(&self) -> &HashMap<u64, Vec<StreamRecordBatch>> {
        &self.records
    }

    pub(crate) fn into_records(self) -> HashMap<u64, Vec<StreamRecordBatch>> {
        self.records
    }

    /// Append a record to this block's vector for its stream.
    pub(crate) fn put(&mut self, record: StreamRecordBatch) {
        self.size += record.size() as u64;
        let stream_records = self.records.entry(record.stream_id).or_default();
        if let Some(last) = stream_records.last() {
            if last.last_offset() != record.base_offset {
                warn!(
                    stream_id = record.stream_id,
                    expected = last.last_offset(),
                    actual = record.base_offset,
                    "non-contiguous record entered cache block"
                );
            }
        }
        stream_records.push(record);
    }

    /// Records of `stream_id` intersecting `[start_offset, end_offset)`, up
    /// to `max_bytes`. The record crossing the byte budget is included.
    ///
    /// If the block's records begin after `start_offset`, the suffix is
    /// returned; the caller decides whether that constitutes a hit.
    pub fn get(
        &self,
        stream_id: u64,
        start_offset: u64,
        end_offset: u64,
        max_bytes: usize,
    ) -> Vec<StreamRecordBatch> {
        let Some(records) = self.records.get(&stream_id) else {
            return Vec::new();
        };
        let (Some(first), Some(last)) = (records.first(), records.last()) else {
            return Vec::new();
        };
        if start_offset >= last.last_offset() || end_offset <= first.base_offset {
            return Vec::new();
        }

        let start_index = records.partition_point(|r| r.last_offset() <= start_offset);
        let mut out = Vec::new();
        let mut budget = max_bytes;
        for record in &records[start_index..] {
            if record.base_offset >= end_offset || budget == 0 {
                break;
            }
            budget = budget.saturating_sub(record.size());
            out.push(record.clone());
        }
        out
    }

    fn release(&mut self) {
        self.records.clear();
        self.free = true;
    }
}

/// A sealed block handed to the upload pipeline.
///
/// Holds its own record retains (the cheap `Bytes` kind), so the cache may
/// free the resident block independently; the pipeline refers back to it by
/// id only.
#[derive(Clone)]
pub struct ArchivedBlock {
    pub id: u64,
    pub created_at: Instant,
    pub size: u64,
    pub confirm_offset: i64,
    pub records: Arc<HashMap<u64, Vec<StreamRecordBatch>>>,
}

impl ArchivedBlock {
    pub fn contains_stream(&self, stream_id: u64) -> bool {
        stream_id == MATCH_ALL_STREAMS && !self.records.is_empty()
            || self.records.contains_key(&stream_id)
    }
}

struct CacheInner {
    active: LogCacheBlock,
    archived: VecDeque<LogCacheBlock>,
}

/// The tiered delta-WAL cache.
pub struct LogCache {
    capacity: u64,
    block_threshold: u64,
    max_streams_per_block: usize,
    size: AtomicU64,
    next_block_id: AtomicU64,
    inner: Mutex<CacheInner>,
}

impl LogCache {
    pub fn new(capacity: u64, block_threshold: u64, max_streams_per_block: usize) -> Self {
        Self {
            capacity,
            block_threshold,
            max_streams_per_block,
            size: AtomicU64::new(0),
            next_block_id: AtomicU64::new(1),
            inner: Mutex::new(CacheInner {
                active: LogCacheBlock::new(0),
                archived: VecDeque::new(),
            }),
        }
    }

    /// Admission limit this cache was configured with.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Total bytes across all non-free blocks. Lock-free.
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// Append a record to the active block.
    ///
    /// Returns true when the active block should be sealed (size threshold
    /// crossed or too many distinct streams). The cache never seals on its
    /// own; the caller drives the upload.
    pub fn put(&self, record: StreamRecordBatch) -> bool {
        let record_size = record.size() as u64;
        let mut inner = self.inner.lock().unwrap();
        inner.active.put(record);
        self.size.fetch_add(record_size, Ordering::AcqRel);
        inner.active.size() >= self.block_threshold
            || inner.active.stream_count() > self.max_streams_per_block
    }

    /// Raise the active block's confirm offset. Monotone non-decreasing.
    pub fn set_confirm_offset(&self, offset: i64) {
        self.inner.lock().unwrap().active.set_confirm_offset(offset);
    }

    /// Seal the active block if it contains `stream_id` (or anything at all
    /// for [`MATCH_ALL_STREAMS`]).
    ///
    /// The sealed block moves to the archived list; a fresh active block
    /// inheriting the running confirm offset takes over.
    pub fn archive_current_block_if_contains(&self, stream_id: u64) -> Option<ArchivedBlock> {
        let mut inner = self.inner.lock().unwrap();
        self.archive_locked(&mut inner, stream_id)
    }

    /// Atomically raise the active block's confirm offset and seal it if it
    /// contains `stream_id`. This is the upload entry point.
    pub fn seal(&self, stream_id: u64, confirm_offset: i64) -> Option<ArchivedBlock> {
        let mut inner = self.inner.lock().unwrap();
        inner.active.set_confirm_offset(confirm_offset);
        self.archive_locked(&mut inner, stream_id)
    }

    fn archive_locked(&self, inner: &mut CacheInner, stream_id: u64) -> Option<ArchivedBlock> {
        if inner.active.is_empty() || !inner.active.contains_stream(stream_id) {
            return None;
        }
        let next_id = self.next_block_id.fetch_add(1, Ordering::AcqRel);
        let mut fresh = LogCacheBlock::new(next_id);
        fresh.set_confirm_offset(inner.active.confirm_offset());
        let sealed = std::mem::replace(&mut inner.active, fresh);
        let handle = ArchivedBlock {
            id: sealed.id,
            created_at: sealed.created_at,
            size: sealed.size,
            confirm_offset: sealed.confirm_offset,
            records: Arc::new(sealed.records.clone()),
        };
        debug!(
            block_id = sealed.id,
            size = sealed.size,
            streams = sealed.stream_count(),
            confirm_offset = sealed.confirm_offset,
            "cache block sealed"
        );
        inner.archived.push_back(sealed);
        Some(handle)
    }

    /// Records of `stream_id` intersecting `[start_offset, end_offset)`,
    /// scanning archived blocks in commit order and then the active block.
    ///
    /// The result is a single contiguous run: collection stops at the byte
    /// budget or as soon as the next block would introduce a gap.
    pub fn get(
        &self,
        stream_id: u64,
        start_offset: u64,
        end_offset: u64,
        max_bytes: usize,
    ) -> Vec<StreamRecordBatch> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<StreamRecordBatch> = Vec::new();
        let mut next_start = start_offset;
        let mut budget = max_bytes;

        for block in inner.archived.iter().chain(std::iter::once(&inner.active)) {
            if block.free {
                continue;
            }
            let records = block.get(stream_id, next_start, end_offset, budget);
            if records.is_empty() {
                continue;
            }
            if let Some(last) = out.last() {
                if records[0].base_offset != last.last_offset() {
                    break;
                }
            }
            for record in &records {
                budget = budget.saturating_sub(record.size());
            }
            next_start = records.last().map(|r| r.last_offset()).unwrap_or(next_start);
            out.extend(records);
            if next_start >= end_offset || budget == 0 {
                break;
            }
        }
        out
    }

    /// True if any non-free block holds records for `stream_id`.
    pub fn contains_stream(&self, stream_id: u64) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .archived
            .iter()
            .chain(std::iter::once(&inner.active))
            .any(|b| !b.free && b.contains_stream(stream_id))
    }

    /// Record that `block_id`'s stream-set object committed; the block is now
    /// safe to drop under memory pressure.
    pub fn mark_committed(&self, block_id: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(block) = inner.archived.iter_mut().find(|b| b.id == block_id) {
            block.committed = true;
        }
    }

    /// Release every record of `block_id` and drop it from the archived list.
    pub fn mark_free(&self, block_id: u64) {
        let mut inner = self.inner.lock().unwrap();
        let Some(index) = inner.archived.iter().position(|b| b.id == block_id) else {
            return;
        };
        let mut block = inner.archived.remove(index).unwrap();
        self.size.fetch_sub(block.size, Ordering::AcqRel);
        block.release();
        debug!(block_id, size = block.size, "cache block freed");
    }

    /// Free committed archived blocks, oldest first, until `bytes_needed`
    /// bytes are released. Returns the bytes actually released.
    ///
    /// Invoked from the memory-pressure handler; side-effect-safe because it
    /// only touches blocks whose data is already readable from the store.
    pub fn force_free(&self, bytes_needed: u64) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let mut released = 0u64;
        while released < bytes_needed {
            let Some(index) = inner.archived.iter().position(|b| b.committed && !b.free) else {
                break;
            };
            let mut block = inner.archived.remove(index).unwrap();
            released += block.size;
            self.size.fetch_sub(block.size, Ordering::AcqRel);
            warn!(
                block_id = block.id,
                size = block.size,
                "force-freed committed cache block under memory pressure"
            );
            block.release();
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn batch(stream_id: u64, base_offset: u64, count: u32) -> StreamRecordBatch {
        StreamRecordBatch::new(stream_id, 1, base_offset, count, Bytes::from_static(b"payload"))
    }

    fn record_size() -> u64 {
        batch(0, 0, 1).size() as u64
    }

    // ---------------------------------------------------------------
    // put / seal signaling
    // ---------------------------------------------------------------

    #[test]
    fn test_put_signals_full_at_threshold() {
        let cache = LogCache::new(1 << 20, record_size() * 2, 100);
        assert!(!cache.put(batch(7, 0, 5)));
        assert!(cache.put(batch(7, 5, 5)));
    }

    #[test]
    fn test_put_signals_full_on_stream_count() {
        let cache = LogCache::new(1 << 20, 1 << 20, 2);
        assert!(!cache.put(batch(1, 0, 1)));
        assert!(!cache.put(batch(2, 0, 1)));
        assert!(cache.put(batch(3, 0, 1)));
    }

    #[test]
    fn test_size_tracks_records() {
        let cache = LogCache::new(1 << 20, 1 << 20, 100);
        assert_eq!(cache.size(), 0);
        cache.put(batch(7, 0, 5));
        cache.put(batch(7, 5, 5));
        assert_eq!(cache.size(), record_size() * 2);
    }

    // ---------------------------------------------------------------
    // archive
    // ---------------------------------------------------------------

    #[test]
    fn test_archive_empty_returns_none() {
        let cache = LogCache::new(1 << 20, 1 << 20, 100);
        assert!(cache.archive_current_block_if_contains(MATCH_ALL_STREAMS).is_none());
    }

    #[test]
    fn test_archive_other_stream_returns_none() {
        let cache = LogCache::new(1 << 20, 1 << 20, 100);
        cache.put(batch(7, 0, 5));
        assert!(cache.archive_current_block_if_contains(9).is_none());
        assert!(cache.contains_stream(7));
    }

    #[test]
    fn test_archive_returns_sealed_block() {
        let cache = LogCache::new(1 << 20, 1 << 20, 100);
        cache.put(batch(7, 0, 5));
        cache.set_confirm_offset(42);
        let sealed = cache.archive_current_block_if_contains(7).unwrap();
        assert_eq!(sealed.size, record_size());
        assert_eq!(sealed.confirm_offset, 42);
        assert!(sealed.contains_stream(7));
        assert!(!sealed.contains_stream(9));
    }

    #[test]
    fn test_fresh_block_inherits_confirm_offset() {
        let cache = LogCache::new(1 << 20, 1 << 20, 100);
        cache.put(batch(7, 0, 5));
        let sealed = cache.seal(MATCH_ALL_STREAMS, 42).unwrap();
        assert_eq!(sealed.confirm_offset, 42);
        // New active block starts from the running confirm offset
        cache.put(batch(7, 5, 5));
        let next = cache.seal(MATCH_ALL_STREAMS, 10).unwrap();
        assert_eq!(next.confirm_offset, 42); // monotone, 10 < 42 ignored
    }

    #[test]
    fn test_confirm_offset_monotone() {
        let cache = LogCache::new(1 << 20, 1 << 20, 100);
        cache.put(batch(7, 0, 5));
        cache.set_confirm_offset(42);
        cache.set_confirm_offset(7);
        let sealed = cache.archive_current_block_if_contains(7).unwrap();
        assert_eq!(sealed.confirm_offset, 42);
    }

    // ---------------------------------------------------------------
    // get
    // ---------------------------------------------------------------

    #[test]
    fn test_get_from_active_block() {
        let cache = LogCache::new(1 << 20, 1 << 20, 100);
        cache.put(batch(7, 0, 5));
        cache.put(batch(7, 5, 5));
        let records = cache.get(7, 0, 10, usize::MAX);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].base_offset, 0);
        assert_eq!(records[1].base_offset, 5);
    }

    #[test]
    fn test_get_spans_archived_and_active() {
        let cache = LogCache::new(1 << 20, 1 << 20, 100);
        cache.put(batch(7, 0, 5));
        cache.seal(MATCH_ALL_STREAMS, 0);
        cache.put(batch(7, 5, 5));
        let records = cache.get(7, 0, 10, usize::MAX);
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].base_offset, 5);
    }

    #[test]
    fn test_get_range_filter() {
        let cache = LogCache::new(1 << 20, 1 << 20, 100);
        cache.put(batch(7, 0, 5));
        cache.put(batch(7, 5, 5));
        cache.put(batch(7, 10, 5));
        let records = cache.get(7, 5, 10, usize::MAX);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].base_offset, 5);
    }

    #[test]
    fn test_get_returns_suffix_when_start_missing() {
        let cache = LogCache::new(1 << 20, 1 << 20, 100);
        cache.put(batch(7, 100, 10));
        let records = cache.get(7, 0, 200, usize::MAX);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].base_offset, 100);
    }

    #[test]
    fn test_get_byte_budget() {
        let cache = LogCache::new(1 << 20, 1 << 20, 100);
        cache.put(batch(7, 0, 5));
        cache.put(batch(7, 5, 5));
        cache.put(batch(7, 10, 5));
        // Budget for one record; the crossing record is included, then stop
        let records = cache.get(7, 0, 15, record_size() as usize);
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_get_stops_at_gap_between_blocks() {
        let cache = LogCache::new(1 << 20, 1 << 20, 100);
        cache.put(batch(7, 0, 5));
        cache.seal(MATCH_ALL_STREAMS, 0);
        // Simulate a trimmed/re-opened stream: active block starts past a gap
        cache.put(batch(7, 20, 5));
        let records = cache.get(7, 0, 100, usize::MAX);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].base_offset, 0);
    }

    #[test]
    fn test_get_unknown_stream() {
        let cache = LogCache::new(1 << 20, 1 << 20, 100);
        cache.put(batch(7, 0, 5));
        assert!(cache.get(9, 0, 10, usize::MAX).is_empty());
    }

    // ---------------------------------------------------------------
    // mark_free / force_free
    // ---------------------------------------------------------------

    #[test]
    fn test_mark_free_releases_size() {
        let cache = LogCache::new(1 << 20, 1 << 20, 100);
        cache.put(batch(7, 0, 5));
        let sealed = cache.seal(MATCH_ALL_STREAMS, 0).unwrap();
        assert_eq!(cache.size(), record_size());
        cache.mark_free(sealed.id);
        assert_eq!(cache.size(), 0);
        assert!(!cache.contains_stream(7));
        assert!(cache.get(7, 0, 10, usize::MAX).is_empty());
    }

    #[test]
    fn test_force_free_skips_uncommitted() {
        let cache = LogCache::new(1 << 20, 1 << 20, 100);
        cache.put(batch(7, 0, 5));
        cache.seal(MATCH_ALL_STREAMS, 0).unwrap();
        assert_eq!(cache.force_free(1024), 0);
        assert!(cache.contains_stream(7));
    }

    #[test]
    fn test_force_free_releases_committed_blocks() {
        let cache = LogCache::new(1 << 20, 1 << 20, 100);
        cache.put(batch(7, 0, 5));
        let first = cache.seal(MATCH_ALL_STREAMS, 0).unwrap();
        cache.put(batch(9, 0, 5));
        let second = cache.seal(MATCH_ALL_STREAMS, 0).unwrap();
        cache.mark_committed(first.id);
        cache.mark_committed(second.id);

        let released = cache.force_free(record_size());
        assert_eq!(released, record_size());
        assert!(!cache.contains_stream(7)); // oldest went first
        assert!(cache.contains_stream(9));
    }
}
