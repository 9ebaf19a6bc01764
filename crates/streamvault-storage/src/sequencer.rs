//! WAL Callback Sequencer
//!
//! WAL completion futures resolve in an arbitrary order, even within a
//! single stream (the device pipelines writes). Producers, however, must be
//! acknowledged in per-stream offset order. The sequencer keeps one FIFO per
//! stream: requests enter in offset order before the WAL append, and on each
//! completion the contiguous persisted prefix is popped and acknowledged.
//!
//! Concurrency contract (enforced by the caller):
//! - `before` calls for the same stream are serialized and offset-ascending
//!   (the append path holds the shared WAL-append lock across offset
//!   assignment)
//! - `after` calls for the same stream are serialized by the facade's
//!   striped stream-callback locks; different streams proceed concurrently

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;

use crate::request::WalWriteRequest;

pub(crate) struct CallbackSequencer {
    stream_requests: DashMap<u64, VecDeque<Arc<WalWriteRequest>>>,
}

impl CallbackSequencer {
    pub fn new() -> Self {
        Self {
            stream_requests: DashMap::new(),
        }
    }

    /// Register a request in its stream's FIFO, before the WAL append.
    pub fn before(&self, request: Arc<WalWriteRequest>) {
        self.stream_requests
            .entry(request.record.stream_id)
            .or_insert_with(VecDeque::new)
            .push_back(request);
    }

    /// Mark `request` persisted and pop the contiguous persisted prefix of
    /// its stream's FIFO. Returns the popped requests in offset order; empty
    /// when the stream head is still unpersisted.
    pub fn after(&self, request: &Arc<WalWriteRequest>) -> Vec<Arc<WalWriteRequest>> {
        request.mark_persisted();

        let stream_id = request.record.stream_id;
        let Some(mut queue) = self.stream_requests.get_mut(&stream_id) else {
            return Vec::new();
        };
        match queue.front() {
            Some(head) if head.offset() == request.offset() => {}
            _ => return Vec::new(),
        }

        let mut popped = Vec::new();
        popped.push(queue.pop_front().unwrap());
        while let Some(peek) = queue.front() {
            if !peek.persisted() {
                break;
            }
            let next = queue.pop_front().unwrap();
            debug_assert_eq!(
                next.record.base_offset,
                popped.last().unwrap().record.last_offset(),
                "sequencer popped a non-contiguous request"
            );
            popped.push(next);
        }
        popped
    }

    /// Drop the stream's FIFO if it is empty. Cleanup for retiring streams.
    pub fn try_free(&self, stream_id: u64) {
        self.stream_requests
            .remove_if(&stream_id, |_, queue| queue.is_empty());
    }

    #[cfg(test)]
    fn queued(&self, stream_id: u64) -> usize {
        self.stream_requests
            .get(&stream_id)
            .map(|q| q.len())
            .unwrap_or(0)
    }
}
