//! Delta Storage Facade
//!
//! `DeltaStorage` is the engine's public surface. It wires the WAL, the
//! delta-WAL cache, the callback sequencer, the confirm-offset calculator
//! and the upload pipeline into four operations: `append`, `read`,
//! `force_upload` and the `startup`/`shutdown` lifecycle.
//!
//! ## Append Path
//!
//! ```text
//! append(record)
//!     ↓
//! admission (cache below limit? backoff queue empty?)
//!     ↓
//! WAL append               ← under the shared confirm-calculator lock
//!     ↓ offset + future
//! sequencer.before / confirm.add
//!     ↓ WAL completion (any order)
//! sequencer.after          ← under the striped stream-callback lock
//!     ↓ contiguous prefix
//! cache.put                ← block full? kick an upload
//!     ↓
//! producer promise completes, in per-stream offset order
//! ```
//!
//! Appends that cannot be admitted park on a backoff queue drained by a
//! background tick; a WAL over-capacity rejection additionally forces a
//! confirm-offset update and an upload of everything in the cache.
//!
//! ## Upload Pipeline
//!
//! Sealed cache blocks flow through prepare → upload → commit. Prepares run
//! one at a time in archive order (so object ids are monotone), uploads
//! overlap freely, commits are serialized in archive order again - the WAL
//! trim point of a block is only safe once every earlier block is visible
//! in the object store. A failed commit therefore aborts the process; a
//! failed prepare/upload only fails that block's waiters.
//!
//! ## Read Path
//!
//! Reads served entirely by the cache return immediately. Otherwise the
//! uncovered head of the range is delegated to the block cache and merged
//! with the cache suffix, with a continuity check guarding the seam.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use object_store::ObjectStore;
use streamvault_core::StreamRecordBatch;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::block_cache::{BlockCache, CacheAccessType, ReadDataBlock};
use crate::config::StorageConfig;
use crate::confirm::ConfirmOffsetCalculator;
use crate::error::{Error, Result};
use crate::log_cache::{LogCache, MATCH_ALL_STREAMS};
use crate::manager::{ObjectManager, StreamManager};
use crate::recovery::recover_continuous_records;
use crate::request::WalWriteRequest;
use crate::sequencer::CallbackSequencer;
use crate::upload::{UploadContext, UploadTask};
use crate::wal::WriteAheadLog;

/// Per-read options.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
    /// Fail fast instead of touching the block cache on a cache miss.
    pub fast_read: bool,
}

/// Coalesces force-upload bursts into one upload per debounce window.
struct ForceUploadTicker {
    window: Duration,
    pending: Mutex<Option<(std::time::Instant, Shared<BoxFuture<'static, ()>>)>>,
}

impl ForceUploadTicker {
    fn new(window: Duration) -> Self {
        Self {
            window,
            pending: Mutex::new(None),
        }
    }

    /// A future completing when the current debounce window elapses. Callers
    /// arriving within one window share the same tick.
    fn tick(&self) -> Shared<BoxFuture<'static, ()>> {
        let mut pending = self.pending.lock().unwrap();
        let now = std::time::Instant::now();
        if let Some((created, tick)) = &*pending {
            if now.duration_since(*created) < self.window {
                return tick.clone();
            }
        }
        let window = self.window;
        let tick = async move { tokio::time::sleep(window).await }.boxed().shared();
        *pending = Some((now, tick.clone()));
        tick
    }
}

/// The delta-WAL storage engine.
pub struct DeltaStorage {
    config: StorageConfig,
    wal: Arc<dyn WriteAheadLog>,
    cache: LogCache,
    sequencer: CallbackSequencer,
    confirm: ConfirmOffsetCalculator,
    stream_manager: Arc<dyn StreamManager>,
    object_manager: Arc<dyn ObjectManager>,
    block_cache: Arc<dyn BlockCache>,
    store: Arc<dyn ObjectStore>,

    stream_callback_locks: Vec<tokio::sync::Mutex<()>>,
    backoff: Mutex<VecDeque<Arc<WalWriteRequest>>>,
    prepare_queue: Mutex<VecDeque<Arc<UploadContext>>>,
    commit_queue: Mutex<VecDeque<Arc<UploadContext>>>,
    /// Serialize seal + pipeline entry so the prepare queue lists blocks in
    /// archive order.
    upload_entry_lock: Mutex<()>,
    /// Serialize the stage runners: stages must observe archive order even
    /// when kicked from concurrent tasks.
    prepare_stage_lock: tokio::sync::Mutex<()>,
    commit_stage_lock: tokio::sync::Mutex<()>,
    inflight: Mutex<Vec<Arc<UploadContext>>>,
    upload_permits: Arc<Semaphore>,
    force_upload_ticker: ForceUploadTicker,

    /// Running max of observed append rates, as f64 bits (non-negative f64
    /// bit patterns order like the floats themselves)
    max_write_rate: AtomicU64,
    last_backoff_log: AtomicI64,
    closed: AtomicBool,
    confirm_task: Mutex<Option<JoinHandle<()>>>,
    drain_task: Mutex<Option<JoinHandle<()>>>,
}

impl DeltaStorage {
    pub fn new(
        config: StorageConfig,
        wal: Arc<dyn WriteAheadLog>,
        stream_manager: Arc<dyn StreamManager>,
        object_manager: Arc<dyn ObjectManager>,
        block_cache: Arc<dyn BlockCache>,
        store: Arc<dyn ObjectStore>,
    ) -> Arc<Self> {
        let cache = LogCache::new(
            config.wal_cache_size,
            config.wal_upload_threshold,
            config.max_streams_per_block,
        );
        let stream_callback_locks = (0..config.stream_callback_locks.max(1))
            .map(|_| tokio::sync::Mutex::new(()))
            .collect();
        let upload_permits = Arc::new(Semaphore::new(config.upload_concurrency.max(1)));
        let force_upload_ticker =
            ForceUploadTicker::new(Duration::from_millis(config.force_upload_debounce_ms));
        Arc::new(Self {
            config,
            wal,
            cache,
            sequencer: CallbackSequencer::new(),
            confirm: ConfirmOffsetCalculator::new(),
            stream_manager,
            object_manager,
            block_cache,
            store,
            stream_callback_locks,
            backoff: Mutex::new(VecDeque::new()),
            prepare_queue: Mutex::new(VecDeque::new()),
            commit_queue: Mutex::new(VecDeque::new()),
            upload_entry_lock: Mutex::new(()),
            prepare_stage_lock: tokio::sync::Mutex::new(()),
            commit_stage_lock: tokio::sync::Mutex::new(()),
            inflight: Mutex::new(Vec::new()),
            upload_permits,
            force_upload_ticker,
            max_write_rate: AtomicU64::new(0),
            last_backoff_log: AtomicI64::new(0),
            closed: AtomicBool::new(false),
            confirm_task: Mutex::new(None),
            drain_task: Mutex::new(None),
        })
    }

    /// Recover from the WAL, then start the background machinery.
    pub async fn startup(self: &Arc<Self>) -> Result<()> {
        info!("delta storage starting");
        self.recover().await?;
        self.start_background_tasks();
        info!("delta storage started");
        Ok(())
    }

    async fn recover(&self) -> Result<()> {
        self.wal.start().await?;
        let streams = self.stream_manager.get_opening_streams().await?;
        let block = recover_continuous_records(self.wal.recover(), &streams)?;

        let mut end_offsets: HashMap<u64, u64> = streams
            .iter()
            .map(|s| (s.stream_id, s.end_offset))
            .collect();
        for (stream_id, records) in block.records() {
            if let Some(last) = records.last() {
                end_offsets.insert(*stream_id, last.last_offset());
            }
        }

        if !block.is_empty() {
            info!(bytes = block.size(), "recovering unuploaded WAL records");
            let task = UploadTask::new(
                Arc::new(block.into_records()),
                self.object_manager.clone(),
                self.store.clone(),
                self.config.object_key_prefix.clone(),
                f64::INFINITY,
                self.upload_permits.clone(),
            );
            task.prepare().await?;
            task.upload().await?;
            task.commit().await?;
        }

        self.wal.reset().await?;
        for stream in &streams {
            let end_offset = end_offsets
                .get(&stream.stream_id)
                .copied()
                .unwrap_or(stream.end_offset);
            info!(
                stream_id = stream.stream_id,
                end_offset, "closing stream after recovery"
            );
            self.stream_manager
                .close_stream(stream.stream_id, stream.epoch)
                .await?;
        }
        Ok(())
    }

    fn start_background_tasks(self: &Arc<Self>) {
        let this = self.clone();
        *self.confirm_task.lock().unwrap() = Some(tokio::spawn(async move {
            let mut tick =
                tokio::time::interval(Duration::from_millis(this.config.confirm_tick_ms.max(1)));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                this.confirm.update();
            }
        }));

        let this = self.clone();
        *self.drain_task.lock().unwrap() = Some(tokio::spawn(async move {
            let mut tick =
                tokio::time::interval(Duration::from_millis(this.config.backoff_drain_ms.max(1)));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                this.try_drain_backoff();
            }
        }));
    }

    /// Fail pending backoff requests, stop the WAL, stop the background
    /// machinery - the reverse of startup order.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);

        if let Some(task) = self.drain_task.lock().unwrap().take() {
            task.abort();
        }
        let parked: Vec<_> = self.backoff.lock().unwrap().drain(..).collect();
        for request in parked {
            request.complete(Err(Error::Shutdown));
        }

        if let Err(e) = self.wal.shutdown_gracefully().await {
            warn!(error = %e, "WAL shutdown failed");
        }

        let confirm_task = self.confirm_task.lock().unwrap().take();
        if let Some(task) = confirm_task {
            task.abort();
            if tokio::time::timeout(Duration::from_secs(10), task)
                .await
                .is_err()
            {
                warn!("background scheduler did not stop within 10s");
            }
        }
        info!("delta storage shutdown complete");
    }

    // ---------------------------------------------------------------
    // Append path
    // ---------------------------------------------------------------

    /// Append a record batch. The returned future completes once the record
    /// is WAL-durable and placed in the cache - in per-stream offset order.
    ///
    /// Per-stream callers must serialize their appends; offsets within a
    /// stream are assigned in call order.
    pub async fn append(self: &Arc<Self>, record: StreamRecordBatch) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }
        let (request, receiver) = WalWriteRequest::new(record);
        self.sequencer.before(request.clone());
        self.append0(&request, false);
        match receiver.await {
            Ok(result) => result,
            Err(_) => Err(Error::Unexpected(
                "append completion dropped".to_string(),
            )),
        }
    }

    /// Try to push one request into the WAL. Returns true when the request
    /// was (or stays) parked for backoff.
    fn append0(self: &Arc<Self>, request: &Arc<WalWriteRequest>, from_backoff: bool) -> bool {
        // Preserve order: while older requests are parked, new ones park too.
        if !from_backoff && !self.backoff.lock().unwrap().is_empty() {
            self.backoff.lock().unwrap().push_back(request.clone());
            return true;
        }
        if !self.try_acquire_permit() {
            if !from_backoff {
                self.backoff.lock().unwrap().push_back(request.clone());
            }
            self.log_backoff_throttled("log cache full");
            return true;
        }

        let append_result = {
            let _shared = self.confirm.append_lock();
            self.wal.append(request.record.encode())
        };
        let handle = match append_result {
            Ok(handle) => handle,
            Err(Error::WalOverCapacity) => {
                // The WAL is full before the cache block is: flush everything
                // so the next trim frees WAL space.
                self.confirm.update();
                let this = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = this.force_upload(MATCH_ALL_STREAMS).await {
                        warn!(error = %e, "force upload after WAL over-capacity failed");
                    }
                });
                if !from_backoff {
                    self.backoff.lock().unwrap().push_back(request.clone());
                }
                self.log_backoff_throttled("WAL over capacity");
                return true;
            }
            Err(e) => {
                error!(error = %e, "WAL append failed");
                request.complete(Err(e));
                return false;
            }
        };

        request.set_offset(handle.record_offset);
        self.confirm.add(request.clone());

        let this = self.clone();
        let request = request.clone();
        tokio::spawn(async move {
            match handle.done.await {
                Ok(Ok(())) => this.handle_append_callback(request).await,
                Ok(Err(e)) => {
                    error!(error = %e, "WAL persistence failed");
                    request.complete(Err(e));
                }
                Err(_) => {
                    request.complete(Err(Error::Unexpected(
                        "WAL completion channel closed".to_string(),
                    )));
                }
            }
        });
        false
    }

    fn try_acquire_permit(&self) -> bool {
        self.cache.size() < self.config.wal_cache_size
    }

    fn log_backoff_throttled(&self, reason: &str) {
        let now = now_millis();
        let last = self.last_backoff_log.load(Ordering::Relaxed);
        if now - last > 1000
            && self
                .last_backoff_log
                .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            warn!(
                reason,
                cache_size = self.cache.size(),
                cache_limit = self.config.wal_cache_size,
                "append backoff"
            );
        }
    }

    fn try_drain_backoff(self: &Arc<Self>) {
        loop {
            let Some(request) = self.backoff.lock().unwrap().front().cloned() else {
                break;
            };
            if self.append0(&request, true) {
                debug!("backoff drain stopped, head still backing off");
                break;
            }
            self.backoff.lock().unwrap().pop_front();
        }
    }

    /// WAL completion for one request: restore per-stream order, place the
    /// drained prefix in the cache, complete producer promises.
    async fn handle_append_callback(self: &Arc<Self>, request: Arc<WalWriteRequest>) {
        let stream_id = request.record.stream_id;
        let lock_index = (stream_id % self.stream_callback_locks.len() as u64) as usize;
        let drained = {
            let _stream_lock = self.stream_callback_locks[lock_index].lock().await;
            let drained = self.sequencer.after(&request);
            for ready in &drained {
                if self.cache.put(ready.record.clone()) {
                    // Active block crossed its threshold: seal and upload.
                    self.upload_delta_wal(MATCH_ALL_STREAMS, false);
                }
            }
            drained
        };
        // Promises complete outside the stream lock.
        for ready in drained {
            ready.complete(Ok(()));
        }
    }

    // ---------------------------------------------------------------
    // Read path
    // ---------------------------------------------------------------

    /// Read `[start_offset, end_offset)` of a stream, up to `max_bytes`.
    pub async fn read(
        &self,
        stream_id: u64,
        start_offset: u64,
        end_offset: u64,
        max_bytes: usize,
        options: ReadOptions,
    ) -> Result<ReadDataBlock> {
        let cache_records = self.cache.get(stream_id, start_offset, end_offset, max_bytes);
        if let Some(first) = cache_records.first() {
            if first.base_offset <= start_offset {
                return Ok(ReadDataBlock {
                    records: cache_records,
                    access_type: CacheAccessType::DeltaWalCacheHit,
                });
            }
        }
        if options.fast_read {
            drop(cache_records);
            return Err(Error::FastReadFailFast);
        }

        // The cache covers a suffix at most; fetch the uncovered head.
        let head_end = cache_records
            .first()
            .map(|r| r.base_offset)
            .unwrap_or(end_offset);

        let watchdog = {
            let timeout = Duration::from_millis(self.config.read_watchdog_ms);
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                warn!(
                    stream_id,
                    start_offset, max_bytes, "read from block cache is taking too long"
                );
            })
        };
        let block_result = self
            .block_cache
            .read(stream_id, start_offset, head_end, max_bytes)
            .await;
        watchdog.abort();

        let block_records = match block_result {
            Ok(block) => block,
            Err(e) => {
                error!(
                    stream_id,
                    start_offset,
                    end_offset = head_end,
                    max_bytes,
                    error = %e,
                    "read from block cache failed"
                );
                return Err(e);
            }
        };

        let mut records = block_records.records;
        let consumed: usize = records.iter().map(|r| r.size()).sum();
        let mut remaining = max_bytes.saturating_sub(consumed);
        for record in cache_records {
            if remaining == 0 {
                break; // unused cache suffix is released on drop
            }
            remaining = remaining.saturating_sub(record.size());
            records.push(record);
        }

        if let Err(e) = continuity_check(&records) {
            drop(records); // release everything fetched
            return Err(e);
        }
        Ok(ReadDataBlock {
            records,
            access_type: block_records.access_type,
        })
    }

    // ---------------------------------------------------------------
    // Upload pipeline
    // ---------------------------------------------------------------

    /// Seal the current cache block for `stream_id` (or everything for
    /// [`MATCH_ALL_STREAMS`]) and await every inflight upload containing the
    /// stream. Bursts within the debounce window share one seal.
    pub async fn force_upload(self: &Arc<Self>, stream_id: u64) -> Result<()> {
        self.force_upload_ticker.tick().await;
        self.upload_delta_wal(stream_id, true);

        let waiters: Vec<Arc<UploadContext>> = self
            .inflight
            .lock()
            .unwrap()
            .iter()
            .filter(|ctx| ctx.block.contains_stream(stream_id))
            .cloned()
            .collect();
        let mut result = Ok(());
        for ctx in waiters {
            if let Err(e) = ctx.completion.wait().await {
                result = Err(e);
            }
        }
        if stream_id != MATCH_ALL_STREAMS {
            self.sequencer.try_free(stream_id);
        }
        result
    }

    /// Seal the active block (if it contains the stream) and hand it to the
    /// pipeline. Returns the context for observability; completion flows
    /// through it.
    ///
    /// Sealing and enqueueing happen under one lock: the prepare queue must
    /// list blocks in archive order or the commit stage would trim the WAL
    /// out of order.
    fn upload_delta_wal(self: &Arc<Self>, stream_id: u64, force: bool) -> Option<Arc<UploadContext>> {
        let (context, prepare_was_empty) = {
            let _order = self.upload_entry_lock.lock().unwrap();
            let block = self.cache.seal(stream_id, self.confirm.get())?;
            let context = Arc::new(UploadContext::new(block, force));
            let rate_limit = self.upload_rate(&context);
            let task = Arc::new(UploadTask::new(
                context.block.records.clone(),
                self.object_manager.clone(),
                self.store.clone(),
                self.config.object_key_prefix.clone(),
                rate_limit,
                self.upload_permits.clone(),
            ));
            let _ = context.task.set(task);
            self.inflight.lock().unwrap().push(context.clone());
            let mut queue = self.prepare_queue.lock().unwrap();
            let was_empty = queue.is_empty();
            queue.push_back(context.clone());
            (context, was_empty)
        };
        if prepare_was_empty {
            let this = self.clone();
            tokio::spawn(async move {
                this.run_prepare_stage().await;
            });
        }
        Some(context)
    }

    /// Upload-rate budget: unlimited for forced uploads and blocks that
    /// filled within 100ms; otherwise the block's own fill rate, floored by
    /// the running max so large batches are never starved.
    fn upload_rate(&self, context: &UploadContext) -> f64 {
        let elapsed_ms = context.block.created_at.elapsed().as_millis() as u64;
        if context.force || elapsed_ms <= 100 {
            return f64::INFINITY;
        }
        let rate = context.block.size as f64 * 1000.0 / elapsed_ms.min(5000) as f64;
        let previous = f64::from_bits(self.max_write_rate.load(Ordering::Acquire));
        if rate > previous {
            self.max_write_rate
                .fetch_max(rate.to_bits(), Ordering::AcqRel);
            rate
        } else {
            previous
        }
    }

    /// Run prepares head-to-tail. Prepares are serialized in archive order
    /// so object ids stay monotone; each success fires its upload and feeds
    /// the commit queue.
    async fn run_prepare_stage(self: &Arc<Self>) {
        let _stage = self.prepare_stage_lock.lock().await;
        loop {
            let Some(context) = self.prepare_queue.lock().unwrap().front().cloned() else {
                break;
            };
            let Some(task) = context.task.get().cloned() else {
                break;
            };
            if let Err(e) = task.prepare().await {
                error!(block_id = context.block.id, error = %e, "stream set object prepare failed");
                // The parked error surfaces at this context's commit turn.
            } else {
                let upload_task = task.clone();
                let block_id = context.block.id;
                tokio::spawn(async move {
                    if let Err(e) = upload_task.upload().await {
                        warn!(block_id, error = %e, "stream set object upload failed");
                    }
                });
            }
            self.prepare_queue.lock().unwrap().pop_front();

            let commit_was_empty = {
                let mut queue = self.commit_queue.lock().unwrap();
                let was_empty = queue.is_empty();
                queue.push_back(context);
                was_empty
            };
            if commit_was_empty {
                let this = self.clone();
                tokio::spawn(async move {
                    this.run_commit_stage().await;
                });
            }
        }
    }

    /// Commit strictly in archive order. Success trims the WAL to the
    /// block's confirm offset and frees the block; a commit failure is fatal.
    async fn run_commit_stage(self: &Arc<Self>) {
        let _stage = self.commit_stage_lock.lock().await;
        loop {
            let Some(context) = self.commit_queue.lock().unwrap().front().cloned() else {
                break;
            };
            let Some(task) = context.task.get().cloned() else {
                break;
            };
            match task.commit().await {
                Ok(metadata) => {
                    self.commit_queue.lock().unwrap().pop_front();
                    self.cache.mark_committed(context.block.id);
                    if context.block.confirm_offset > 0 {
                        info!(
                            confirm_offset = context.block.confirm_offset,
                            object_id = metadata.object_id,
                            "trimming WAL"
                        );
                        if let Err(e) = self.wal.trim(context.block.confirm_offset).await {
                            warn!(error = %e, "WAL trim failed");
                        }
                    }
                    self.cache.mark_free(context.block.id);
                    self.finish_upload(&context, Ok(()));
                }
                Err(Error::Persist(message)) => {
                    // Prepare or upload failed earlier: fail this block's
                    // waiters, keep committing the rest in order.
                    self.commit_queue.lock().unwrap().pop_front();
                    self.finish_upload(&context, Err(message));
                }
                Err(e) => {
                    error!(
                        block_id = context.block.id,
                        error = %e,
                        "stream set object commit failed, aborting: the WAL trim point \
                         would no longer match the committed objects"
                    );
                    self.finish_upload(&context, Err(e.to_string()));
                    std::process::exit(1);
                }
            }
        }
    }

    fn finish_upload(&self, context: &Arc<UploadContext>, result: std::result::Result<(), String>) {
        if let Err(message) = &result {
            error!(block_id = context.block.id, error = %message, "upload failed");
        } else {
            debug!(
                block_id = context.block.id,
                elapsed_ms = context.started.elapsed().as_millis() as u64,
                "upload complete"
            );
        }
        context.completion.complete(result);
        self.inflight
            .lock()
            .unwrap()
            .retain(|c| !Arc::ptr_eq(c, context));
    }

    // ---------------------------------------------------------------
    // Introspection / pressure hooks
    // ---------------------------------------------------------------

    /// The confirm offset as of the last calculator tick.
    pub fn confirm_offset(&self) -> i64 {
        self.confirm.get()
    }

    /// Bytes currently buffered in the delta-WAL cache.
    pub fn cache_size(&self) -> u64 {
        self.cache.size()
    }

    /// True if the cache still buffers records of `stream_id`.
    pub fn cache_contains_stream(&self, stream_id: u64) -> bool {
        self.cache.contains_stream(stream_id)
    }

    /// Number of uploads currently in flight.
    pub fn inflight_uploads(&self) -> usize {
        self.inflight.lock().unwrap().len()
    }

    /// Memory-pressure hook for the host's buffer allocator: drop committed
    /// cache blocks to release up to `bytes_required` bytes. Returns the
    /// bytes actually released.
    pub fn handle_out_of_memory(&self, bytes_required: u64) -> u64 {
        self.cache.force_free(bytes_required)
    }
}

fn continuity_check(records: &[StreamRecordBatch]) -> Result<()> {
    let mut expected: Option<u64> = None;
    for record in records {
        if let Some(expected) = expected {
            if record.base_offset != expected {
                return Err(Error::ContinuityCheckFailed {
                    stream_id: record.stream_id,
                    expected,
                    actual: record.base_offset,
                });
            }
        }
        expected = Some(record.last_offset());
    }
    Ok(())
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn batch(stream_id: u64, base_offset: u64, count: u32) -> StreamRecordBatch {
        StreamRecordBatch::new(stream_id, 1, base_offset, count, Bytes::from_static(b"x"))
    }

    #[test]
    fn test_continuity_check_accepts_contiguous() {
        let records = vec![batch(7, 0, 5), batch(7, 5, 5), batch(7, 10, 5)];
        assert!(continuity_check(&records).is_ok());
    }

    #[test]
    fn test_continuity_check_rejects_gap() {
        let records = vec![batch(7, 0, 50), batch(7, 100, 10)];
        let err = continuity_check(&records).unwrap_err();
        assert!(matches!(
            err,
            Error::ContinuityCheckFailed {
                expected: 50,
                actual: 100,
                ..
            }
        ));
    }

    #[test]
    fn test_continuity_check_empty_and_single() {
        assert!(continuity_check(&[]).is_ok());
        assert!(continuity_check(&[batch(7, 3, 4)]).is_ok());
    }

    #[tokio::test]
    async fn test_force_upload_ticker_shares_window() {
        let ticker = ForceUploadTicker::new(Duration::from_millis(50));
        let first = ticker.tick();
        let second = ticker.tick();
        // Both callers share one tick future
        assert!(Shared::ptr_eq(&first, &second));
        first.await;
        second.await;
    }
}
