//! Write-Ahead Log Boundary
//!
//! The engine treats the WAL device as an external collaborator: it appends
//! opaque byte blocks, hands back a monotone record offset plus a completion
//! future, and can replay everything after the last trim point on restart.
//!
//! ## The Contract
//!
//! - `append` assigns the record offset synchronously (the caller holds the
//!   confirm-calculator's shared append lock while calling it, so offset
//!   assignment is ordered against confirm-offset snapshots) and returns a
//!   handle whose future resolves once the block is durable
//! - completion futures may resolve in **any order** - the engine's callback
//!   sequencer restores per-stream order
//! - `trim(offset)` releases everything at or below `offset`; `reset` drops
//!   the whole log after recovery has re-uploaded it
//! - `recover` yields the surviving records in offset order
//!
//! ## MemoryWal
//!
//! `MemoryWal` is a complete in-memory device used by tests and embedded
//! runs. It can complete appends immediately or hold them for the caller to
//! complete in an arbitrary order (exercising the sequencer), and it can
//! enforce a capacity limit to exercise the over-capacity backoff path.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Result of a WAL append: the assigned offset and the persistence future.
#[derive(Debug)]
pub struct WalAppendHandle {
    /// Monotone offset the device assigned to this record
    pub record_offset: u64,
    /// Resolves once the record is durable
    pub done: oneshot::Receiver<Result<()>>,
}

/// One record yielded by WAL recovery.
#[derive(Debug, Clone)]
pub struct RecoverRecord {
    pub record_offset: u64,
    pub data: Bytes,
}

#[async_trait]
pub trait WriteAheadLog: Send + Sync {
    async fn start(&self) -> Result<()>;

    async fn shutdown_gracefully(&self) -> Result<()>;

    /// Append an opaque block. Fails with [`Error::WalOverCapacity`] when the
    /// device cannot accept more data until a trim.
    fn append(&self, data: Bytes) -> Result<WalAppendHandle>;

    /// Replay all records after the last trim point, in offset order.
    fn recover(&self) -> Box<dyn Iterator<Item = RecoverRecord> + Send>;

    /// Drop the entire log. Called after recovery has re-uploaded it.
    async fn reset(&self) -> Result<()>;

    /// Release every record at or below `offset`.
    async fn trim(&self, offset: i64) -> Result<()>;
}

/// How [`MemoryWal`] settles append completion futures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompletionMode {
    /// Complete each append as it arrives.
    Immediate,
    /// Hold completions until [`MemoryWal::complete`] is called.
    Manual,
}

struct MemoryWalInner {
    next_offset: u64,
    entries: BTreeMap<u64, Bytes>,
    pending: VecDeque<(u64, oneshot::Sender<Result<()>>)>,
    size: u64,
}

/// In-memory WAL device.
pub struct MemoryWal {
    mode: CompletionMode,
    capacity: Option<u64>,
    inner: Mutex<MemoryWalInner>,
}

impl Default for MemoryWal {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryWal {
    /// Unlimited capacity, appends complete immediately.
    pub fn new() -> Self {
        Self::build(CompletionMode::Immediate, None)
    }

    /// Immediate completion with a byte capacity; appends past the limit fail
    /// with [`Error::WalOverCapacity`] until a trim or reset.
    pub fn with_capacity(capacity: u64) -> Self {
        Self::build(CompletionMode::Immediate, Some(capacity))
    }

    /// Appends stay pending until completed through [`MemoryWal::complete`],
    /// letting tests drive completion order.
    pub fn manual() -> Self {
        Self::build(CompletionMode::Manual, None)
    }

    fn build(mode: CompletionMode, capacity: Option<u64>) -> Self {
        Self {
            mode,
            capacity,
            inner: Mutex::new(MemoryWalInner {
                next_offset: 0,
                entries: BTreeMap::new(),
                pending: VecDeque::new(),
                size: 0,
            }),
        }
    }

    /// Offsets of appends whose completion is still pending (manual mode).
    pub fn pending_offsets(&self) -> Vec<u64> {
        self.inner
            .lock()
            .unwrap()
            .pending
            .iter()
            .map(|(offset, _)| *offset)
            .collect()
    }

    /// Complete the pending append at `offset`. Returns false if unknown.
    pub fn complete(&self, offset: u64) -> bool {
        let entry = {
            let mut inner = self.inner.lock().unwrap();
            let index = inner.pending.iter().position(|(o, _)| *o == offset);
            index.and_then(|i| inner.pending.remove(i))
        };
        match entry {
            Some((_, tx)) => {
                let _ = tx.send(Ok(()));
                true
            }
            None => false,
        }
    }

    /// Complete every pending append, oldest first.
    pub fn complete_all(&self) {
        let pending: Vec<_> = {
            let mut inner = self.inner.lock().unwrap();
            inner.pending.drain(..).collect()
        };
        for (_, tx) in pending {
            let _ = tx.send(Ok(()));
        }
    }

    /// Bytes currently held (appended and not trimmed).
    pub fn size(&self) -> u64 {
        self.inner.lock().unwrap().size
    }
}

#[async_trait]
impl WriteAheadLog for MemoryWal {
    async fn start(&self) -> Result<()> {
        info!("memory WAL started");
        Ok(())
    }

    async fn shutdown_gracefully(&self) -> Result<()> {
        info!("memory WAL shut down");
        Ok(())
    }

    fn append(&self, data: Bytes) -> Result<WalAppendHandle> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(capacity) = self.capacity {
            if inner.size + data.len() as u64 > capacity {
                return Err(Error::WalOverCapacity);
            }
        }
        let record_offset = inner.next_offset;
        inner.next_offset += data.len() as u64;
        inner.size += data.len() as u64;
        inner.entries.insert(record_offset, data);

        let (tx, rx) = oneshot::channel();
        match self.mode {
            CompletionMode::Immediate => {
                let _ = tx.send(Ok(()));
            }
            CompletionMode::Manual => {
                inner.pending.push_back((record_offset, tx));
            }
        }
        Ok(WalAppendHandle {
            record_offset,
            done: rx,
        })
    }

    fn recover(&self) -> Box<dyn Iterator<Item = RecoverRecord> + Send> {
        let records: Vec<RecoverRecord> = self
            .inner
            .lock()
            .unwrap()
            .entries
            .iter()
            .map(|(offset, data)| RecoverRecord {
                record_offset: *offset,
                data: data.clone(),
            })
            .collect();
        info!(records = records.len(), "memory WAL recovery");
        Box::new(records.into_iter())
    }

    async fn reset(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.clear();
        inner.size = 0;
        info!("memory WAL reset");
        Ok(())
    }

    async fn trim(&self, offset: i64) -> Result<()> {
        if offset < 0 {
            return Ok(());
        }
        let mut inner = self.inner.lock().unwrap();
        let keep = inner.entries.split_off(&(offset as u64 + 1));
        inner.entries = keep;
        inner.size = inner.entries.values().map(|d| d.len() as u64).sum();
        debug!(offset, size = inner.size, "memory WAL trimmed");
        Ok(())
    }
}
