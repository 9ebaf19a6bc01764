//! Metadata Service Boundaries
//!
//! The engine talks to the stream/object metadata service through two small
//! traits:
//!
//! - **ObjectManager**: allocates object ids at prepare time, makes uploaded
//!   objects visible at commit time, and answers which committed objects
//!   cover a stream range (the block cache's manifest query)
//! - **StreamManager**: lists the streams that were open at the last
//!   shutdown (recovery input) and closes streams once recovery settles
//!   their end offsets
//!
//! `MemoryObjectManager` and `MemoryStreamManager` are complete in-memory
//! implementations used by tests and embedded runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use streamvault_core::StreamRange;
use tracing::{debug, info};

use crate::error::Result;

/// A stream that was open at the last shutdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMetadata {
    pub stream_id: u64,
    pub epoch: u64,
    pub start_offset: u64,
    /// Offset up to which the stream's records are committed in the store
    pub end_offset: u64,
}

/// A committed stream-set object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub object_id: u64,
    /// Object-store key the data was written under
    pub key: String,
    pub size: u64,
    pub stream_ranges: Vec<StreamRange>,
}

impl ObjectMetadata {
    pub fn range_of(&self, stream_id: u64) -> Option<StreamRange> {
        self.stream_ranges
            .iter()
            .find(|r| r.stream_id == stream_id)
            .copied()
    }
}

#[async_trait]
pub trait ObjectManager: Send + Sync {
    /// Reserve the next object id. Ids are handed out in prepare order, so
    /// the pipeline's ordered prepare stage keeps committed ids monotone.
    async fn prepare_object(&self) -> Result<u64>;

    /// Make an uploaded object visible. The WAL may be trimmed only after
    /// this returns.
    async fn commit_object(&self, metadata: ObjectMetadata) -> Result<()>;

    /// Committed objects covering `[start_offset, end_offset)` of a stream,
    /// in commit order.
    async fn get_objects(
        &self,
        stream_id: u64,
        start_offset: u64,
        end_offset: u64,
    ) -> Result<Vec<ObjectMetadata>>;
}

#[async_trait]
pub trait StreamManager: Send + Sync {
    async fn get_opening_streams(&self) -> Result<Vec<StreamMetadata>>;

    async fn close_stream(&self, stream_id: u64, epoch: u64) -> Result<()>;
}

/// In-memory object manager.
#[derive(Default)]
pub struct MemoryObjectManager {
    next_object_id: AtomicU64,
    committed: Mutex<Vec<ObjectMetadata>>,
}

impl MemoryObjectManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all committed objects, in commit order.
    pub fn committed_objects(&self) -> Vec<ObjectMetadata> {
        self.committed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ObjectManager for MemoryObjectManager {
    async fn prepare_object(&self) -> Result<u64> {
        let object_id = self.next_object_id.fetch_add(1, Ordering::AcqRel);
        debug!(object_id, "prepared object id");
        Ok(object_id)
    }

    async fn commit_object(&self, metadata: ObjectMetadata) -> Result<()> {
        info!(
            object_id = metadata.object_id,
            size = metadata.size,
            streams = metadata.stream_ranges.len(),
            "committed stream set object"
        );
        self.committed.lock().unwrap().push(metadata);
        Ok(())
    }

    async fn get_objects(
        &self,
        stream_id: u64,
        start_offset: u64,
        end_offset: u64,
    ) -> Result<Vec<ObjectMetadata>> {
        let committed = self.committed.lock().unwrap();
        Ok(committed
            .iter()
            .filter(|object| {
                object
                    .range_of(stream_id)
                    .map(|r| r.start_offset < end_offset && r.end_offset > start_offset)
                    .unwrap_or(false)
            })
            .cloned()
            .collect())
    }
}

/// In-memory stream manager.
#[derive(Default)]
pub struct MemoryStreamManager {
    streams: Mutex<HashMap<u64, StreamMetadata>>,
    closed: Mutex<Vec<(u64, u64)>>,
}

impl MemoryStreamManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_streams(streams: Vec<StreamMetadata>) -> Self {
        Self {
            streams: Mutex::new(streams.into_iter().map(|s| (s.stream_id, s)).collect()),
            closed: Mutex::new(Vec::new()),
        }
    }

    /// `(stream_id, epoch)` pairs closed so far, in close order.
    pub fn closed_streams(&self) -> Vec<(u64, u64)> {
        self.closed.lock().unwrap().clone()
    }
}

#[async_trait]
impl StreamManager for MemoryStreamManager {
    async fn get_opening_streams(&self) -> Result<Vec<StreamMetadata>> {
        let mut streams: Vec<_> = self.streams.lock().unwrap().values().cloned().collect();
        streams.sort_by_key(|s| s.stream_id);
        Ok(streams)
    }

    async fn close_stream(&self, stream_id: u64, epoch: u64) -> Result<()> {
        info!(stream_id, epoch, "closing stream");
        self.streams.lock().unwrap().remove(&stream_id);
        self.closed.lock().unwrap().push((stream_id, epoch));
        Ok(())
    }
}
