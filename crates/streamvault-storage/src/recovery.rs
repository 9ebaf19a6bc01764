//! Crash Recovery
//!
//! On startup the engine replays the WAL into a single cache block:
//!
//! 1. records of streams that are not in the opening set were safely closed
//!    before the crash - dropped
//! 2. records below a stream's committed end offset already live in the
//!    object store - dropped
//! 3. records breaking per-stream continuity indicate corruption downstream
//!    of the committed range - logged at ERROR and dropped
//!
//! After the replay, the first surviving record of every stream must sit
//! exactly at that stream's committed end offset; anything else means WAL
//! data was lost and startup must abort rather than silently open a gap.

use std::collections::HashMap;

use streamvault_core::StreamRecordBatch;
use tracing::{error, info};

use crate::error::{Error, Result};
use crate::log_cache::LogCacheBlock;
use crate::manager::StreamMetadata;
use crate::request::NOOP_OFFSET;
use crate::wal::RecoverRecord;

/// Replay WAL records into one cache block, filtering against the committed
/// stream offsets.
pub(crate) fn recover_continuous_records(
    records: impl Iterator<Item = RecoverRecord>,
    opening_streams: &[StreamMetadata],
) -> Result<LogCacheBlock> {
    let end_offsets: HashMap<u64, u64> = opening_streams
        .iter()
        .map(|s| (s.stream_id, s.end_offset))
        .collect();

    let mut block = LogCacheBlock::new(0);
    let mut log_end_offset = NOOP_OFFSET;
    let mut next_offsets: HashMap<u64, u64> = HashMap::new();

    for recovered in records {
        log_end_offset = recovered.record_offset as i64;
        let mut data = recovered.data.clone();
        let record = StreamRecordBatch::decode(&mut data)?;

        let Some(&committed_end) = end_offsets.get(&record.stream_id) else {
            // Stream was safely closed before the crash
            continue;
        };
        if record.base_offset < committed_end {
            // Already committed to the object store
            continue;
        }
        match next_offsets.get(&record.stream_id) {
            Some(&expected) if expected != record.base_offset => {
                error!(
                    stream_id = record.stream_id,
                    expected,
                    base_offset = record.base_offset,
                    "unexpected WAL record, dropping"
                );
            }
            _ => {
                next_offsets.insert(record.stream_id, record.last_offset());
                block.put(record);
            }
        }
    }

    if log_end_offset >= 0 {
        block.set_confirm_offset(log_end_offset);
    }

    for (stream_id, stream_records) in block.records() {
        if let Some(first) = stream_records.first() {
            let expected = end_offsets
                .get(stream_id)
                .copied()
                .unwrap_or(first.base_offset);
            if first.base_offset != expected {
                return Err(Error::RecoveryInvariant(format!(
                    "WAL data may be lost: stream {stream_id} committed up to {expected} \
                     but recovered records start at {}",
                    first.base_offset
                )));
            }
        }
    }

    info!(
        bytes = block.size(),
        streams = block.stream_count(),
        confirm_offset = block.confirm_offset(),
        "WAL replay complete"
    );
    Ok(block)
}
