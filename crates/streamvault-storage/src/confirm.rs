//! WAL Confirm-Offset Calculator
//!
//! Reports the greatest WAL offset such that every request at or below it is
//! persisted - the safe WAL trim point and the confirm offset stamped onto
//! sealed cache blocks.
//!
//! ## Algorithm
//!
//! Requests enter a global FIFO in WAL-offset order. `update()` inserts a
//! sentinel and scans:
//!
//! 1. find the minimum unpersisted offset before the sentinel
//! 2. remove every persisted entry below that minimum, tracking the maximum
//!    removed offset, and remove the sentinel
//! 3. publish the maximum atomically (monotone non-decreasing)
//!
//! ## Locking
//!
//! The read/write lock is used *inversely*: appenders take the READ side
//! around WAL offset assignment (many appenders run concurrently), while
//! `update()` takes the WRITE side only for the sentinel insertion. The
//! sentinel therefore cleanly separates requests whose offsets were assigned
//! before the scan from those assigned after, without stalling appends for
//! the scan itself.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};

use tracing::debug;

use crate::request::{WalWriteRequest, NOOP_OFFSET};

enum Entry {
    Request(Arc<WalWriteRequest>),
    Sentinel,
}

pub(crate) struct ConfirmOffsetCalculator {
    append_lock: RwLock<()>,
    queue: Mutex<VecDeque<Entry>>,
    update_lock: Mutex<()>,
    confirmed: AtomicI64,
}

impl ConfirmOffsetCalculator {
    pub fn new() -> Self {
        Self {
            append_lock: RwLock::new(()),
            queue: Mutex::new(VecDeque::new()),
            update_lock: Mutex::new(()),
            confirmed: AtomicI64::new(NOOP_OFFSET),
        }
    }

    /// Shared lock appenders hold while the WAL assigns a record offset.
    pub fn append_lock(&self) -> RwLockReadGuard<'_, ()> {
        self.append_lock.read().unwrap()
    }

    /// Enqueue a request whose offset was just assigned under [`append_lock`].
    pub fn add(&self, request: Arc<WalWriteRequest>) {
        debug_assert_ne!(request.offset(), NOOP_OFFSET);
        self.queue.lock().unwrap().push_back(Entry::Request(request));
    }

    /// The confirm offset as of the last `update()`. Lagging but monotone.
    pub fn get(&self) -> i64 {
        self.confirmed.load(Ordering::Acquire)
    }

    /// Recompute and publish the confirm offset.
    pub fn update(&self) {
        let _serialize = self.update_lock.lock().unwrap();
        let offset = self.calculate();
        if offset != NOOP_OFFSET {
            let previous = self.confirmed.fetch_max(offset, Ordering::AcqRel);
            if offset > previous {
                debug!(confirm_offset = offset, "confirm offset advanced");
            }
        }
    }

    fn calculate(&self) -> i64 {
        {
            let _exclusive = self.append_lock.write().unwrap();
            self.queue.lock().unwrap().push_back(Entry::Sentinel);
        }

        let mut queue = self.queue.lock().unwrap();

        // Pass 1: minimum unpersisted offset before the sentinel.
        let mut min_unconfirmed = i64::MAX;
        for entry in queue.iter() {
            match entry {
                Entry::Sentinel => break,
                Entry::Request(request) => {
                    if !request.persisted() {
                        min_unconfirmed = min_unconfirmed.min(request.offset());
                    }
                }
            }
        }

        // Pass 2: remove persisted entries below the minimum, up to and
        // including the sentinel.
        let mut confirmed = NOOP_OFFSET;
        let mut sentinel_seen = false;
        let drained = std::mem::take(&mut *queue);
        for entry in drained {
            if sentinel_seen {
                queue.push_back(entry);
                continue;
            }
            match entry {
                Entry::Sentinel => sentinel_seen = true,
                Entry::Request(request) => {
                    if request.persisted() && request.offset() < min_unconfirmed {
                        confirmed = confirmed.max(request.offset());
                    } else {
                        queue.push_back(Entry::Request(request));
                    }
                }
            }
        }
        confirmed
    }
}
