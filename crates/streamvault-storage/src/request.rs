//! In-flight append request state.
//!
//! A `WalWriteRequest` is created when an append enters the engine and lives
//! until its producer promise is settled. It is shared (via `Arc`) between
//! the per-stream callback sequencer and the confirm-offset queue, so the
//! mutable pieces - the WAL-assigned offset and the persisted flag - are
//! atomics.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use streamvault_core::StreamRecordBatch;
use tokio::sync::oneshot;

use crate::error::Result;

/// Offset value before the WAL has assigned one.
pub(crate) const NOOP_OFFSET: i64 = -1;

pub(crate) struct WalWriteRequest {
    pub record: StreamRecordBatch,
    offset: AtomicI64,
    persisted: AtomicBool,
    completion: Mutex<Option<oneshot::Sender<Result<()>>>>,
}

impl WalWriteRequest {
    pub fn new(record: StreamRecordBatch) -> (Arc<Self>, oneshot::Receiver<Result<()>>) {
        let (tx, rx) = oneshot::channel();
        let request = Arc::new(Self {
            record,
            offset: AtomicI64::new(NOOP_OFFSET),
            persisted: AtomicBool::new(false),
            completion: Mutex::new(Some(tx)),
        });
        (request, rx)
    }

    /// The WAL-assigned record offset, or `NOOP_OFFSET` before assignment.
    pub fn offset(&self) -> i64 {
        self.offset.load(Ordering::Acquire)
    }

    pub fn set_offset(&self, offset: u64) {
        self.offset.store(offset as i64, Ordering::Release);
    }

    pub fn persisted(&self) -> bool {
        self.persisted.load(Ordering::Acquire)
    }

    pub fn mark_persisted(&self) {
        self.persisted.store(true, Ordering::Release);
    }

    /// Settle the producer promise. Later calls are no-ops.
    pub fn complete(&self, result: Result<()>) {
        let sender = self.completion.lock().unwrap().take();
        if let Some(tx) = sender {
            // A dropped receiver just means the producer went away.
            let _ = tx.send(result);
        }
    }
}
