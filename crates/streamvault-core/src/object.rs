//! Stream-Set Object Format
//!
//! This module implements the writer and reader for *stream-set objects* -
//! the immutable object-store artifacts produced by uploading one delta-WAL
//! cache block. One object carries record batches from many streams.
//!
//! ## Layout
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │ Header: magic "SSOB" (4) | version (2)         │
//! │         stream count (4)                       │
//! ├────────────────────────────────────────────────┤
//! │ Data: per-stream sections of encoded record    │
//! │       frames, streams in ascending id order,   │
//! │       records in offset order                  │
//! ├────────────────────────────────────────────────┤
//! │ Index: one entry per stream                    │
//! │   stream_id (8) | start_offset (8)             │
//! │   end_offset (8) | position (8) | size (4)     │
//! │   record_count (4)                             │
//! ├────────────────────────────────────────────────┤
//! │ Footer: index position (8) | CRC32 (4)         │
//! │         magic "SSOB" (4)                       │
//! └────────────────────────────────────────────────┘
//! ```
//!
//! The CRC32 covers everything before the checksum field, so a reader can
//! validate the whole object before trusting the index.
//!
//! ## Why Per-Stream Sections?
//!
//! Readers almost always want one stream's range. Grouping record frames per
//! stream means a single index lookup bounds the bytes that need decoding,
//! and the data section stays a plain concatenation of the same frames the
//! WAL carried - no re-encoding on upload.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::record::StreamRecordBatch;

pub const OBJECT_MAGIC: [u8; 4] = *b"SSOB";
pub const OBJECT_VERSION: u16 = 1;

/// magic(4) + version(2) + stream_count(4)
pub const OBJECT_HEADER_SIZE: usize = 10;

/// index_position(8) + crc32(4) + magic(4)
pub const OBJECT_FOOTER_SIZE: usize = 16;

/// stream_id(8) + start(8) + end(8) + position(8) + size(4) + record_count(4)
const INDEX_ENTRY_SIZE: usize = 40;

/// The offset range one stream-set object covers for one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRange {
    pub stream_id: u64,
    pub start_offset: u64,
    pub end_offset: u64,
}

#[derive(Debug, Clone)]
struct IndexEntry {
    stream_id: u64,
    start_offset: u64,
    end_offset: u64,
    position: u64,
    size: u32,
    record_count: u32,
}

/// A finished object: its bytes plus the stream ranges it covers.
#[derive(Debug)]
pub struct FinishedObject {
    pub data: Bytes,
    pub ranges: Vec<StreamRange>,
}

/// Builds a stream-set object from per-stream record batches.
pub struct StreamSetObjectWriter {
    sections: Vec<(IndexEntry, BytesMut)>,
    last_stream_id: Option<u64>,
}

impl Default for StreamSetObjectWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamSetObjectWriter {
    pub fn new() -> Self {
        Self {
            sections: Vec::new(),
            last_stream_id: None,
        }
    }

    /// Append one stream's records as a new section.
    ///
    /// Streams must be added in ascending id order and each stream's records
    /// must be offset-contiguous.
    pub fn put(&mut self, stream_id: u64, records: &[StreamRecordBatch]) -> Result<()> {
        if records.is_empty() {
            return Err(Error::InvalidObject(format!(
                "empty record list for stream {stream_id}"
            )));
        }
        if let Some(last) = self.last_stream_id {
            if stream_id <= last {
                return Err(Error::InvalidObject(format!(
                    "stream {stream_id} added after stream {last}"
                )));
            }
        }
        let mut buf = BytesMut::new();
        let mut expect = records[0].base_offset;
        for record in records {
            if record.stream_id != stream_id {
                return Err(Error::InvalidObject(format!(
                    "record for stream {} in section for stream {stream_id}",
                    record.stream_id
                )));
            }
            if record.base_offset != expect {
                return Err(Error::InvalidObject(format!(
                    "non-contiguous records for stream {stream_id}: expected offset {expect}, got {}",
                    record.base_offset
                )));
            }
            expect = record.last_offset();
            record.encode_into(&mut buf);
        }
        let entry = IndexEntry {
            stream_id,
            start_offset: records[0].base_offset,
            end_offset: expect,
            position: 0, // fixed up in finish()
            size: buf.len() as u32,
            record_count: records.len() as u32,
        };
        self.sections.push((entry, buf));
        self.last_stream_id = Some(stream_id);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    /// Assemble the object bytes and report the covered stream ranges.
    pub fn finish(self) -> Result<FinishedObject> {
        if self.sections.is_empty() {
            return Err(Error::InvalidObject("no streams written".to_string()));
        }

        let data_size: usize = self.sections.iter().map(|(_, buf)| buf.len()).sum();
        let index_size = self.sections.len() * INDEX_ENTRY_SIZE;
        let total = OBJECT_HEADER_SIZE + data_size + index_size + OBJECT_FOOTER_SIZE;
        let mut out = BytesMut::with_capacity(total);

        // Header
        out.put_slice(&OBJECT_MAGIC);
        out.put_u16(OBJECT_VERSION);
        out.put_u32(self.sections.len() as u32);

        // Data sections, recording final positions
        let mut entries = Vec::with_capacity(self.sections.len());
        for (mut entry, buf) in self.sections {
            entry.position = out.len() as u64;
            out.put_slice(&buf);
            entries.push(entry);
        }

        // Index
        let index_position = out.len() as u64;
        for entry in &entries {
            out.put_u64(entry.stream_id);
            out.put_u64(entry.start_offset);
            out.put_u64(entry.end_offset);
            out.put_u64(entry.position);
            out.put_u32(entry.size);
            out.put_u32(entry.record_count);
        }

        // Footer
        out.put_u64(index_position);
        let crc = crc32fast::hash(&out[..]);
        out.put_u32(crc);
        out.put_slice(&OBJECT_MAGIC);

        let ranges = entries
            .iter()
            .map(|e| StreamRange {
                stream_id: e.stream_id,
                start_offset: e.start_offset,
                end_offset: e.end_offset,
            })
            .collect();

        Ok(FinishedObject {
            data: out.freeze(),
            ranges,
        })
    }
}

/// Reads record batches back out of a stream-set object.
pub struct StreamSetObjectReader {
    data: Bytes,
    index: Vec<IndexEntry>,
}

impl StreamSetObjectReader {
    /// Validate the object (magic, version, checksum) and parse its index.
    pub fn new(data: Bytes) -> Result<Self> {
        if data.len() < OBJECT_HEADER_SIZE + OBJECT_FOOTER_SIZE {
            return Err(Error::Truncated {
                needed: OBJECT_HEADER_SIZE + OBJECT_FOOTER_SIZE,
                remaining: data.len(),
            });
        }
        if data[..4] != OBJECT_MAGIC || data[data.len() - 4..] != OBJECT_MAGIC {
            return Err(Error::InvalidMagic);
        }

        let mut header = data.slice(4..OBJECT_HEADER_SIZE);
        let version = header.get_u16();
        if version != OBJECT_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let stream_count = header.get_u32() as usize;

        let crc_position = data.len() - 8;
        let expected_crc = u32::from_be_bytes([
            data[crc_position],
            data[crc_position + 1],
            data[crc_position + 2],
            data[crc_position + 3],
        ]);
        let actual_crc = crc32fast::hash(&data[..crc_position]);
        if expected_crc != actual_crc {
            return Err(Error::CrcMismatch);
        }

        let mut footer = data.slice(data.len() - OBJECT_FOOTER_SIZE..);
        let index_position = footer.get_u64() as usize;
        let index_end = index_position + stream_count * INDEX_ENTRY_SIZE;
        if index_position < OBJECT_HEADER_SIZE || index_end > crc_position {
            return Err(Error::InvalidObject(format!(
                "index position {index_position} out of bounds"
            )));
        }

        let mut index_buf = data.slice(index_position..index_end);
        let mut index = Vec::with_capacity(stream_count);
        for _ in 0..stream_count {
            index.push(IndexEntry {
                stream_id: index_buf.get_u64(),
                start_offset: index_buf.get_u64(),
                end_offset: index_buf.get_u64(),
                position: index_buf.get_u64(),
                size: index_buf.get_u32(),
                record_count: index_buf.get_u32(),
            });
        }

        Ok(Self { data, index })
    }

    /// The stream ranges this object covers.
    pub fn stream_ranges(&self) -> Vec<StreamRange> {
        self.index
            .iter()
            .map(|e| StreamRange {
                stream_id: e.stream_id,
                start_offset: e.start_offset,
                end_offset: e.end_offset,
            })
            .collect()
    }

    /// Decode the records of one stream intersecting `[start_offset, end_offset)`,
    /// up to `max_bytes` of encoded frames.
    ///
    /// The record crossing the byte budget is included, mirroring the cache
    /// read semantics.
    pub fn read_stream(
        &self,
        stream_id: u64,
        start_offset: u64,
        end_offset: u64,
        max_bytes: usize,
    ) -> Result<Vec<StreamRecordBatch>> {
        let entry = self
            .index
            .iter()
            .find(|e| e.stream_id == stream_id)
            .ok_or(Error::StreamNotFound(stream_id))?;

        let mut section = self
            .data
            .slice(entry.position as usize..entry.position as usize + entry.size as usize);
        let mut out = Vec::new();
        let mut budget = max_bytes;
        for _ in 0..entry.record_count {
            let record = StreamRecordBatch::decode(&mut section)?;
            if record.last_offset() <= start_offset {
                continue;
            }
            if record.base_offset >= end_offset || budget == 0 {
                break;
            }
            budget = budget.saturating_sub(record.size());
            out.push(record);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(stream_id: u64, base_offset: u64, count: u32, payload: &'static [u8]) -> StreamRecordBatch {
        StreamRecordBatch::new(stream_id, 1, base_offset, count, Bytes::from_static(payload))
    }

    fn build_object() -> FinishedObject {
        let mut writer = StreamSetObjectWriter::new();
        writer
            .put(7, &[batch(7, 0, 5, b"aaaa"), batch(7, 5, 5, b"bbbb")])
            .unwrap();
        writer.put(9, &[batch(9, 100, 10, b"cccc")]).unwrap();
        writer.finish().unwrap()
    }

    // ---------------------------------------------------------------
    // Writer
    // ---------------------------------------------------------------

    #[test]
    fn test_writer_reports_ranges() {
        let finished = build_object();
        assert_eq!(
            finished.ranges,
            vec![
                StreamRange { stream_id: 7, start_offset: 0, end_offset: 10 },
                StreamRange { stream_id: 9, start_offset: 100, end_offset: 110 },
            ]
        );
    }

    #[test]
    fn test_writer_rejects_empty_section() {
        let mut writer = StreamSetObjectWriter::new();
        assert!(writer.put(7, &[]).is_err());
    }

    #[test]
    fn test_writer_rejects_out_of_order_streams() {
        let mut writer = StreamSetObjectWriter::new();
        writer.put(9, &[batch(9, 0, 1, b"x")]).unwrap();
        assert!(writer.put(7, &[batch(7, 0, 1, b"x")]).is_err());
    }

    #[test]
    fn test_writer_rejects_gap() {
        let mut writer = StreamSetObjectWriter::new();
        let result = writer.put(7, &[batch(7, 0, 5, b"a"), batch(7, 6, 5, b"b")]);
        assert!(matches!(result, Err(Error::InvalidObject(_))));
    }

    #[test]
    fn test_writer_rejects_foreign_stream_record() {
        let mut writer = StreamSetObjectWriter::new();
        assert!(writer.put(7, &[batch(8, 0, 1, b"x")]).is_err());
    }

    #[test]
    fn test_finish_empty_fails() {
        let writer = StreamSetObjectWriter::new();
        assert!(writer.finish().is_err());
    }

    // ---------------------------------------------------------------
    // Reader
    // ---------------------------------------------------------------

    #[test]
    fn test_roundtrip_all_streams() {
        let finished = build_object();
        let reader = StreamSetObjectReader::new(finished.data).unwrap();

        let stream7 = reader.read_stream(7, 0, 10, usize::MAX).unwrap();
        assert_eq!(stream7.len(), 2);
        assert_eq!(stream7[0], batch(7, 0, 5, b"aaaa"));
        assert_eq!(stream7[1], batch(7, 5, 5, b"bbbb"));

        let stream9 = reader.read_stream(9, 100, 110, usize::MAX).unwrap();
        assert_eq!(stream9, vec![batch(9, 100, 10, b"cccc")]);
    }

    #[test]
    fn test_reader_ranges_match_writer() {
        let finished = build_object();
        let ranges = finished.ranges.clone();
        let reader = StreamSetObjectReader::new(finished.data).unwrap();
        assert_eq!(reader.stream_ranges(), ranges);
    }

    #[test]
    fn test_read_stream_range_filter() {
        let finished = build_object();
        let reader = StreamSetObjectReader::new(finished.data).unwrap();

        // Only the second batch intersects [5, 10)
        let records = reader.read_stream(7, 5, 10, usize::MAX).unwrap();
        assert_eq!(records, vec![batch(7, 5, 5, b"bbbb")]);

        // [0, 5) stops before the second batch
        let records = reader.read_stream(7, 0, 5, usize::MAX).unwrap();
        assert_eq!(records, vec![batch(7, 0, 5, b"aaaa")]);
    }

    #[test]
    fn test_read_stream_byte_budget_includes_crossing_record() {
        let finished = build_object();
        let reader = StreamSetObjectReader::new(finished.data).unwrap();

        // A budget of one byte still returns the first (crossing) record
        let records = reader.read_stream(7, 0, 10, 1).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].base_offset, 0);
    }

    #[test]
    fn test_read_unknown_stream() {
        let finished = build_object();
        let reader = StreamSetObjectReader::new(finished.data).unwrap();
        assert!(matches!(
            reader.read_stream(42, 0, 10, usize::MAX),
            Err(Error::StreamNotFound(42))
        ));
    }

    // ---------------------------------------------------------------
    // Validation
    // ---------------------------------------------------------------

    #[test]
    fn test_reader_rejects_bad_magic() {
        let finished = build_object();
        let mut corrupted = BytesMut::from(&finished.data[..]);
        corrupted[0] = b'X';
        assert!(matches!(
            StreamSetObjectReader::new(corrupted.freeze()),
            Err(Error::InvalidMagic)
        ));
    }

    #[test]
    fn test_reader_rejects_flipped_data_byte() {
        let finished = build_object();
        let mut corrupted = BytesMut::from(&finished.data[..]);
        corrupted[OBJECT_HEADER_SIZE + 3] ^= 0x01;
        assert!(matches!(
            StreamSetObjectReader::new(corrupted.freeze()),
            Err(Error::CrcMismatch)
        ));
    }

    #[test]
    fn test_reader_rejects_short_input() {
        assert!(matches!(
            StreamSetObjectReader::new(Bytes::from_static(b"SSOB")),
            Err(Error::Truncated { .. })
        ));
    }

    // ---------------------------------------------------------------
    // StreamRange serde
    // ---------------------------------------------------------------

    #[test]
    fn test_stream_range_serde_roundtrip() {
        let range = StreamRange {
            stream_id: 7,
            start_offset: 10,
            end_offset: 20,
        };
        let json = serde_json::to_string(&range).expect("serialize");
        let back: StreamRange = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(range, back);
    }
}
