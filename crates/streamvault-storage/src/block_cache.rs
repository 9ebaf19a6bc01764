//! Block Cache Boundary (Cold Read Path)
//!
//! When a read misses the delta-WAL cache, the engine delegates the
//! uncovered head of the range to the block cache of already-committed
//! objects. The boundary is the `BlockCache` trait; two implementations
//! live here:
//!
//! - **ObjectStoreBlockCache**: the straightforward cold path - resolve the
//!   covering objects through the ObjectManager manifest, fetch each from
//!   the object store, and decode the requested stream range. It keeps no
//!   memory of its own, so every read reports `BlockCacheMiss`.
//! - **MemoryBlockCache**: a test double serving records planted directly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use object_store::{path::Path, ObjectStore};
use streamvault_core::{StreamRecordBatch, StreamSetObjectReader};
use tracing::debug;

use crate::error::Result;
use crate::manager::ObjectManager;

/// Where a read was ultimately served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheAccessType {
    /// Served entirely from the delta-WAL cache
    DeltaWalCacheHit,
    /// Served from the block cache's memory
    BlockCacheHit,
    /// Required an object-store fetch
    BlockCacheMiss,
}

/// A read result: records plus where they came from.
#[derive(Debug)]
pub struct ReadDataBlock {
    pub records: Vec<StreamRecordBatch>,
    pub access_type: CacheAccessType,
}

#[async_trait]
pub trait BlockCache: Send + Sync {
    /// Records of `stream_id` intersecting `[start_offset, end_offset)`, up
    /// to `max_bytes`, in offset order.
    async fn read(
        &self,
        stream_id: u64,
        start_offset: u64,
        end_offset: u64,
        max_bytes: usize,
    ) -> Result<ReadDataBlock>;
}

/// Cold path reading committed stream-set objects from the store.
pub struct ObjectStoreBlockCache {
    object_manager: Arc<dyn ObjectManager>,
    store: Arc<dyn ObjectStore>,
}

impl ObjectStoreBlockCache {
    pub fn new(object_manager: Arc<dyn ObjectManager>, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            object_manager,
            store,
        }
    }
}

#[async_trait]
impl BlockCache for ObjectStoreBlockCache {
    async fn read(
        &self,
        stream_id: u64,
        start_offset: u64,
        end_offset: u64,
        max_bytes: usize,
    ) -> Result<ReadDataBlock> {
        let objects = self
            .object_manager
            .get_objects(stream_id, start_offset, end_offset)
            .await?;

        let mut records: Vec<StreamRecordBatch> = Vec::new();
        let mut next_start = start_offset;
        let mut budget = max_bytes;
        for object in objects {
            if next_start >= end_offset || budget == 0 {
                break;
            }
            let path = Path::from(object.key.clone());
            let data = self.store.get(&path).await?.bytes().await?;
            debug!(
                object_id = object.object_id,
                stream_id,
                bytes = data.len(),
                "fetched stream set object"
            );
            let reader = StreamSetObjectReader::new(data)?;
            let chunk = reader.read_stream(stream_id, next_start, end_offset, budget)?;
            if chunk.is_empty() {
                continue;
            }
            if let Some(last) = records.last() {
                if chunk[0].base_offset != last.last_offset() {
                    break;
                }
            }
            for record in &chunk {
                budget = budget.saturating_sub(record.size());
            }
            next_start = chunk.last().map(|r| r.last_offset()).unwrap_or(next_start);
            records.extend(chunk);
        }

        Ok(ReadDataBlock {
            records,
            access_type: CacheAccessType::BlockCacheMiss,
        })
    }
}

/// Test double serving planted records from memory.
#[derive(Default)]
pub struct MemoryBlockCache {
    records: Mutex<HashMap<u64, Vec<StreamRecordBatch>>>,
}

impl MemoryBlockCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: StreamRecordBatch) {
        self.records
            .lock()
            .unwrap()
            .entry(record.stream_id)
            .or_default()
            .push(record);
    }
}

#[async_trait]
impl BlockCache for MemoryBlockCache {
    async fn read(
        &self,
        stream_id: u64,
        start_offset: u64,
        end_offset: u64,
        max_bytes: usize,
    ) -> Result<ReadDataBlock> {
        let records = self.records.lock().unwrap();
        let mut out = Vec::new();
        let mut budget = max_bytes;
        if let Some(stream_records) = records.get(&stream_id) {
            for record in stream_records {
                if record.last_offset() <= start_offset {
                    continue;
                }
                if record.base_offset >= end_offset || budget == 0 {
                    break;
                }
                budget = budget.saturating_sub(record.size());
                out.push(record.clone());
            }
        }
        Ok(ReadDataBlock {
            records: out,
            access_type: CacheAccessType::BlockCacheHit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::MemoryObjectManager;
    use bytes::Bytes;
    use object_store::memory::InMemory;
    use streamvault_core::StreamSetObjectWriter;

    fn batch(stream_id: u64, base_offset: u64, count: u32) -> StreamRecordBatch {
        StreamRecordBatch::new(stream_id, 1, base_offset, count, Bytes::from_static(b"data"))
    }

    #[tokio::test]
    async fn test_memory_block_cache_range() {
        let cache = MemoryBlockCache::new();
        cache.insert(batch(7, 0, 5));
        cache.insert(batch(7, 5, 5));

        let result = cache.read(7, 0, 10, usize::MAX).await.unwrap();
        assert_eq!(result.records.len(), 2);
        assert_eq!(result.access_type, CacheAccessType::BlockCacheHit);

        let result = cache.read(7, 5, 10, usize::MAX).await.unwrap();
        assert_eq!(result.records.len(), 1);
        assert_eq!(result.records[0].base_offset, 5);
    }

    #[tokio::test]
    async fn test_object_store_block_cache_reads_committed_object() {
        let object_manager = Arc::new(MemoryObjectManager::new());
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());

        // Write and commit one object by hand
        let mut writer = StreamSetObjectWriter::new();
        writer.put(7, &[batch(7, 0, 5), batch(7, 5, 5)]).unwrap();
        let finished = writer.finish().unwrap();
        let key = "objects/00000000000000000000.sso".to_string();
        store
            .put(&Path::from(key.clone()), finished.data.clone())
            .await
            .unwrap();
        object_manager
            .commit_object(crate::manager::ObjectMetadata {
                object_id: 0,
                key,
                size: finished.data.len() as u64,
                stream_ranges: finished.ranges,
            })
            .await
            .unwrap();

        let cache = ObjectStoreBlockCache::new(object_manager, store);
        let result = cache.read(7, 0, 10, usize::MAX).await.unwrap();
        assert_eq!(result.records.len(), 2);
        assert_eq!(result.records[0].base_offset, 0);
        assert_eq!(result.records[1].base_offset, 5);
        assert_eq!(result.access_type, CacheAccessType::BlockCacheMiss);
    }

    #[tokio::test]
    async fn test_object_store_block_cache_empty_manifest() {
        let object_manager = Arc::new(MemoryObjectManager::new());
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let cache = ObjectStoreBlockCache::new(object_manager, store);

        let result = cache.read(7, 0, 10, usize::MAX).await.unwrap();
        assert!(result.records.is_empty());
    }
}
