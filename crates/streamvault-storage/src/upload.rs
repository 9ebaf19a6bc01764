//! Stream-Set Object Upload Task
//!
//! One `UploadTask` turns one sealed cache block into one committed
//! stream-set object, in three stages driven by the facade's pipeline:
//!
//! 1. **prepare**: reserve an object id from the ObjectManager. The pipeline
//!    runs prepares in archive order, so ids are monotone across blocks.
//! 2. **upload**: assemble the object bytes, pace the write against the
//!    observed append rate, and put it to the object store (with retries).
//!    Uploads of different blocks may overlap freely.
//! 3. **commit**: after the upload settles, register the object's metadata.
//!    The pipeline serializes commits in archive order; only a successful
//!    commit makes the WAL trim and cache free safe.
//!
//! A prepare or upload failure parks its error in the task; `commit()`
//! surfaces it as a `Persist` error so the pipeline can fail this context
//! without disturbing commit ordering for the rest.

use std::collections::HashMap;
use std::pin::pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use object_store::{path::Path, ObjectStore};
use streamvault_core::{StreamRecordBatch, StreamSetObjectWriter};
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::log_cache::ArchivedBlock;
use crate::manager::{ObjectManager, ObjectMetadata};

const UPLOAD_RETRIES: u32 = 3;

/// Longest single pacing delay applied before a store write.
const MAX_PACING_DELAY: Duration = Duration::from_secs(5);

/// A one-shot completion cell multiple tasks can await.
pub(crate) struct Completion {
    state: Mutex<Option<std::result::Result<(), String>>>,
    notify: Notify,
}

impl Completion {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    /// Settle the cell. Later calls are no-ops.
    pub fn complete(&self, result: std::result::Result<(), String>) {
        let mut state = self.state.lock().unwrap();
        if state.is_none() {
            *state = Some(result);
            self.notify.notify_waiters();
        }
    }

    /// Wait for the cell to settle; failures surface as [`Error::Persist`].
    pub async fn wait(&self) -> Result<()> {
        loop {
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();
            if let Some(result) = self.state.lock().unwrap().clone() {
                return result.map_err(Error::Persist);
            }
            notified.await;
        }
    }
}

/// The upload-pipeline context wrapping one sealed cache block.
pub(crate) struct UploadContext {
    pub block: ArchivedBlock,
    pub force: bool,
    pub started: Instant,
    pub task: std::sync::OnceLock<Arc<UploadTask>>,
    pub completion: Completion,
}

impl UploadContext {
    pub fn new(block: ArchivedBlock, force: bool) -> Self {
        Self {
            block,
            force,
            started: Instant::now(),
            task: std::sync::OnceLock::new(),
            completion: Completion::new(),
        }
    }
}

pub(crate) struct UploadTask {
    records: Arc<HashMap<u64, Vec<StreamRecordBatch>>>,
    object_manager: Arc<dyn ObjectManager>,
    store: Arc<dyn ObjectStore>,
    key_prefix: String,
    /// Bytes per second; `f64::INFINITY` disables pacing
    rate_limit: f64,
    permits: Arc<Semaphore>,
    object_id: AtomicI64,
    uploaded: Mutex<Option<ObjectMetadata>>,
    upload_done: Completion,
}

impl UploadTask {
    pub fn new(
        records: Arc<HashMap<u64, Vec<StreamRecordBatch>>>,
        object_manager: Arc<dyn ObjectManager>,
        store: Arc<dyn ObjectStore>,
        key_prefix: String,
        rate_limit: f64,
        permits: Arc<Semaphore>,
    ) -> Self {
        Self {
            records,
            object_manager,
            store,
            key_prefix,
            rate_limit,
            permits,
            object_id: AtomicI64::new(-1),
            uploaded: Mutex::new(None),
            upload_done: Completion::new(),
        }
    }

    /// Reserve the object id. Must run before `upload`.
    pub async fn prepare(&self) -> Result<()> {
        match self.object_manager.prepare_object().await {
            Ok(object_id) => {
                self.object_id.store(object_id as i64, Ordering::Release);
                debug!(object_id, "prepared stream set object");
                Ok(())
            }
            Err(e) => {
                self.upload_done.complete(Err(e.to_string()));
                Err(e)
            }
        }
    }

    /// Build and write the object. Its outcome is parked for `commit`.
    pub async fn upload(&self) -> Result<()> {
        let result = self.upload0().await;
        match &result {
            Ok(()) => self.upload_done.complete(Ok(())),
            Err(e) => self.upload_done.complete(Err(e.to_string())),
        }
        result
    }

    async fn upload0(&self) -> Result<()> {
        let object_id = self.object_id.load(Ordering::Acquire);
        if object_id < 0 {
            return Err(Error::Unexpected("upload before prepare".to_string()));
        }
        let object_id = object_id as u64;

        let mut writer = StreamSetObjectWriter::new();
        let mut stream_ids: Vec<u64> = self.records.keys().copied().collect();
        stream_ids.sort_unstable();
        for stream_id in stream_ids {
            writer.put(stream_id, &self.records[&stream_id])?;
        }
        let finished = writer.finish()?;
        let size = finished.data.len();

        // Pace the write against the append rate so a slowly-filled block
        // does not burst the network it never needed.
        if self.rate_limit.is_finite() && self.rate_limit > 0.0 {
            let delay = Duration::from_secs_f64(size as f64 / self.rate_limit)
                .min(MAX_PACING_DELAY);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }

        let key = object_key(&self.key_prefix, object_id);
        let path = Path::from(key.clone());
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| Error::Shutdown)?;
        self.put_with_retries(&path, finished.data.clone()).await?;

        *self.uploaded.lock().unwrap() = Some(ObjectMetadata {
            object_id,
            key,
            size: size as u64,
            stream_ranges: finished.ranges,
        });
        Ok(())
    }

    async fn put_with_retries(&self, path: &Path, data: bytes::Bytes) -> Result<()> {
        for attempt in 0..UPLOAD_RETRIES {
            match self.store.put(path, data.clone()).await {
                Ok(_) => {
                    debug!(
                        key = %path,
                        size = data.len(),
                        attempt = attempt + 1,
                        "uploaded stream set object"
                    );
                    return Ok(());
                }
                Err(e) if attempt < UPLOAD_RETRIES - 1 => {
                    let backoff_ms = 100 * 2_u64.pow(attempt);
                    warn!(
                        key = %path,
                        attempt = attempt + 1,
                        backoff_ms,
                        error = %e,
                        "stream set object upload failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                }
                Err(e) => {
                    error!(key = %path, error = %e, "stream set object upload failed after all retries");
                    return Err(e.into());
                }
            }
        }
        unreachable!()
    }

    /// Register the object's metadata, after the upload settles.
    ///
    /// Errors from earlier stages surface here as [`Error::Persist`]; an
    /// error from the metadata commit itself comes back verbatim and the
    /// pipeline treats it as fatal.
    pub async fn commit(&self) -> Result<ObjectMetadata> {
        self.upload_done.wait().await?;
        let metadata = self
            .uploaded
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::Unexpected("commit before upload".to_string()))?;
        self.object_manager.commit_object(metadata.clone()).await?;
        Ok(metadata)
    }
}

pub(crate) fn object_key(prefix: &str, object_id: u64) -> String {
    format!("{prefix}/{object_id:020}.sso")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::MemoryObjectManager;
    use bytes::Bytes;
    use object_store::memory::InMemory;
    use streamvault_core::StreamSetObjectReader;

    fn records() -> Arc<HashMap<u64, Vec<StreamRecordBatch>>> {
        let mut map = HashMap::new();
        map.insert(
            7,
            vec![
                StreamRecordBatch::new(7, 1, 0, 5, Bytes::from_static(b"aaaa")),
                StreamRecordBatch::new(7, 1, 5, 5, Bytes::from_static(b"bbbb")),
            ],
        );
        Arc::new(map)
    }

    fn task(
        object_manager: Arc<MemoryObjectManager>,
        store: Arc<dyn ObjectStore>,
    ) -> UploadTask {
        UploadTask::new(
            records(),
            object_manager,
            store,
            "objects".to_string(),
            f64::INFINITY,
            Arc::new(Semaphore::new(4)),
        )
    }

    #[tokio::test]
    async fn test_prepare_upload_commit() {
        let object_manager = Arc::new(MemoryObjectManager::new());
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let task = task(object_manager.clone(), store.clone());

        task.prepare().await.unwrap();
        task.upload().await.unwrap();
        let metadata = task.commit().await.unwrap();

        assert_eq!(metadata.object_id, 0);
        assert_eq!(metadata.stream_ranges.len(), 1);
        assert_eq!(metadata.stream_ranges[0].start_offset, 0);
        assert_eq!(metadata.stream_ranges[0].end_offset, 10);
        assert_eq!(object_manager.committed_objects().len(), 1);

        // The stored object decodes back to the original records
        let data = store
            .get(&Path::from(metadata.key.clone()))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        let reader = StreamSetObjectReader::new(data).unwrap();
        let decoded = reader.read_stream(7, 0, 10, usize::MAX).unwrap();
        assert_eq!(decoded.len(), 2);
    }

    #[tokio::test]
    async fn test_upload_before_prepare_fails() {
        let object_manager = Arc::new(MemoryObjectManager::new());
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let task = task(object_manager, store);
        assert!(task.upload().await.is_err());
    }

    #[tokio::test]
    async fn test_commit_waits_for_upload() {
        let object_manager = Arc::new(MemoryObjectManager::new());
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let task = Arc::new(task(object_manager, store));
        task.prepare().await.unwrap();

        let committer = {
            let task = task.clone();
            tokio::spawn(async move { task.commit().await })
        };
        // Commit cannot finish before upload settles
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!committer.is_finished());

        task.upload().await.unwrap();
        let metadata = committer.await.unwrap().unwrap();
        assert_eq!(metadata.object_id, 0);
    }

    #[tokio::test]
    async fn test_failed_upload_surfaces_at_commit_as_persist() {
        let object_manager = Arc::new(MemoryObjectManager::new());
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let task = task(object_manager, store);
        task.prepare().await.unwrap();
        // Park a failure the way the pipeline does when upload0 errors
        task.upload_done.complete(Err("disk on fire".to_string()));
        assert!(matches!(task.commit().await, Err(Error::Persist(_))));
    }

    #[tokio::test]
    async fn test_completion_multiple_waiters() {
        let completion = Arc::new(Completion::new());
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let completion = completion.clone();
                tokio::spawn(async move { completion.wait().await })
            })
            .collect();
        completion.complete(Ok(()));
        for waiter in waiters {
            assert!(waiter.await.unwrap().is_ok());
        }
    }

    #[test]
    fn test_object_key_format() {
        assert_eq!(object_key("objects", 7), "objects/00000000000000000007.sso");
    }
}
