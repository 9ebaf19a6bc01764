//! Stream Record Batch and Codec
//!
//! This module defines `StreamRecordBatch` - the fundamental unit of data in
//! StreamVault - and its stable binary frame format.
//!
//! ## What is a Record Batch?
//!
//! A record batch is one producer append to one stream:
//! - **stream_id**: which append-only log it belongs to
//! - **epoch**: the writer epoch that produced it (fencing)
//! - **base_offset**: the logical offset of the first record in the batch
//! - **count**: how many records the batch covers
//! - **payload**: the opaque record bytes
//!
//! The derived `last_offset` is `base_offset + count`, so two batches are
//! contiguous when `a.last_offset() == b.base_offset`.
//!
//! ## Frame Format
//!
//! The encoded frame is what goes into the WAL and into stream-set objects.
//! Every field is big-endian, and the whole frame is covered by a CRC32
//! trailer:
//!
//! ```text
//! ┌───────┬─────────┬───────────┬───────┬─────────────┬───────┬─────────────┬─────────┬───────┐
//! │ Magic │ Version │ Stream ID │ Epoch │ Base Offset │ Count │ Payload Len │ Payload │ CRC32 │
//! │ (1)   │ (1)     │ (8)       │ (8)   │ (8)         │ (4)   │ (4)         │ (N)     │ (4)   │
//! └───────┴─────────┴───────────┴───────┴─────────────┴───────┴─────────────┴─────────┴───────┘
//! ```
//!
//! ## Design Decisions
//! - Uses `bytes::Bytes` for the payload, so every handoff (WAL, cache,
//!   reader result) is a reference-counted retain, not a copy
//! - `size()` reports the encoded frame length, which is the unit every
//!   capacity/threshold decision in the engine works in
//! - Decode is zero-copy: the payload of a decoded batch is a slice of the
//!   input buffer

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// First byte of every encoded record frame.
pub const RECORD_MAGIC: u8 = 0x56;

/// Current frame format version.
pub const RECORD_VERSION: u8 = 1;

/// magic(1) + version(1) + stream_id(8) + epoch(8) + base_offset(8) + count(4) + payload_len(4)
pub const RECORD_HEADER_SIZE: usize = 34;

/// CRC32 trailer.
pub const RECORD_TRAILER_SIZE: usize = 4;

/// A batch of records appended to a single stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRecordBatch {
    /// Stream this batch belongs to
    pub stream_id: u64,

    /// Writer epoch that produced the batch
    pub epoch: u64,

    /// Logical offset of the first record in the batch
    pub base_offset: u64,

    /// Number of records covered by the batch
    pub count: u32,

    /// Opaque record bytes (reference-counted)
    pub payload: Bytes,
}

impl StreamRecordBatch {
    pub fn new(stream_id: u64, epoch: u64, base_offset: u64, count: u32, payload: Bytes) -> Self {
        Self {
            stream_id,
            epoch,
            base_offset,
            count,
            payload,
        }
    }

    /// Offset one past the last record in the batch.
    pub fn last_offset(&self) -> u64 {
        self.base_offset + self.count as u64
    }

    /// Encoded frame length in bytes.
    pub fn size(&self) -> usize {
        RECORD_HEADER_SIZE + self.payload.len() + RECORD_TRAILER_SIZE
    }

    /// Encode this batch into a standalone frame.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.size());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Encode this batch, appending the frame to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        let start = buf.len();
        buf.put_u8(RECORD_MAGIC);
        buf.put_u8(RECORD_VERSION);
        buf.put_u64(self.stream_id);
        buf.put_u64(self.epoch);
        buf.put_u64(self.base_offset);
        buf.put_u32(self.count);
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        let crc = crc32fast::hash(&buf[start..]);
        buf.put_u32(crc);
    }

    /// Decode one frame from the front of `buf`, advancing it past the frame.
    ///
    /// The returned payload is a zero-copy slice of `buf`.
    pub fn decode(buf: &mut Bytes) -> Result<Self> {
        if buf.remaining() < RECORD_HEADER_SIZE {
            return Err(Error::Truncated {
                needed: RECORD_HEADER_SIZE,
                remaining: buf.remaining(),
            });
        }

        let mut cursor = buf.clone();
        let magic = cursor.get_u8();
        if magic != RECORD_MAGIC {
            return Err(Error::InvalidMagic);
        }
        let version = cursor.get_u8();
        if version != RECORD_VERSION {
            return Err(Error::UnsupportedVersion(version as u16));
        }
        let stream_id = cursor.get_u64();
        let epoch = cursor.get_u64();
        let base_offset = cursor.get_u64();
        let count = cursor.get_u32();
        let payload_len = cursor.get_u32() as usize;

        let frame_len = RECORD_HEADER_SIZE + payload_len + RECORD_TRAILER_SIZE;
        if buf.remaining() < frame_len {
            return Err(Error::Truncated {
                needed: frame_len,
                remaining: buf.remaining(),
            });
        }

        let body_len = RECORD_HEADER_SIZE + payload_len;
        let expected_crc = u32::from_be_bytes([
            buf[body_len],
            buf[body_len + 1],
            buf[body_len + 2],
            buf[body_len + 3],
        ]);
        let actual_crc = crc32fast::hash(&buf[..body_len]);
        if expected_crc != actual_crc {
            return Err(Error::CrcMismatch);
        }

        let payload = cursor.copy_to_bytes(payload_len);
        buf.advance(frame_len);

        Ok(Self {
            stream_id,
            epoch,
            base_offset,
            count,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StreamRecordBatch {
        StreamRecordBatch::new(7, 3, 100, 5, Bytes::from_static(b"hello world"))
    }

    // ---------------------------------------------------------------
    // Derived fields
    // ---------------------------------------------------------------

    #[test]
    fn test_last_offset() {
        let batch = sample();
        assert_eq!(batch.last_offset(), 105);
    }

    #[test]
    fn test_last_offset_zero_count() {
        let batch = StreamRecordBatch::new(1, 0, 42, 0, Bytes::new());
        assert_eq!(batch.last_offset(), 42);
    }

    #[test]
    fn test_size_matches_encoded_length() {
        let batch = sample();
        assert_eq!(batch.size(), batch.encode().len());
    }

    #[test]
    fn test_size_empty_payload() {
        let batch = StreamRecordBatch::new(1, 1, 0, 1, Bytes::new());
        assert_eq!(batch.size(), RECORD_HEADER_SIZE + RECORD_TRAILER_SIZE);
        assert_eq!(batch.size(), batch.encode().len());
    }

    // ---------------------------------------------------------------
    // Encode / decode round trip
    // ---------------------------------------------------------------

    #[test]
    fn test_roundtrip() {
        let batch = sample();
        let mut encoded = batch.encode();
        let decoded = StreamRecordBatch::decode(&mut encoded).unwrap();
        assert_eq!(decoded, batch);
        assert!(encoded.is_empty());
    }

    #[test]
    fn test_roundtrip_empty_payload() {
        let batch = StreamRecordBatch::new(0, 0, 0, 0, Bytes::new());
        let mut encoded = batch.encode();
        let decoded = StreamRecordBatch::decode(&mut encoded).unwrap();
        assert_eq!(decoded, batch);
    }

    #[test]
    fn test_roundtrip_max_values() {
        let batch = StreamRecordBatch::new(u64::MAX, u64::MAX, u64::MAX - 10, 10, Bytes::from_static(b"x"));
        let mut encoded = batch.encode();
        let decoded = StreamRecordBatch::decode(&mut encoded).unwrap();
        assert_eq!(decoded, batch);
    }

    #[test]
    fn test_decode_sequence_of_frames() {
        let mut buf = BytesMut::new();
        let batches = vec![
            StreamRecordBatch::new(7, 1, 0, 5, Bytes::from_static(b"one")),
            StreamRecordBatch::new(7, 1, 5, 5, Bytes::from_static(b"two")),
            StreamRecordBatch::new(9, 1, 0, 2, Bytes::from_static(b"three")),
        ];
        for b in &batches {
            b.encode_into(&mut buf);
        }
        let mut bytes = buf.freeze();
        for expected in &batches {
            let decoded = StreamRecordBatch::decode(&mut bytes).unwrap();
            assert_eq!(&decoded, expected);
        }
        assert!(bytes.is_empty());
    }

    #[test]
    fn test_decode_is_zero_copy() {
        let batch = sample();
        let mut encoded = batch.encode();
        let before = encoded.clone();
        let decoded = StreamRecordBatch::decode(&mut encoded).unwrap();
        // The decoded payload aliases the input buffer
        assert_eq!(
            decoded.payload.as_ptr() as usize,
            before.as_ptr() as usize + RECORD_HEADER_SIZE
        );
    }

    // ---------------------------------------------------------------
    // Corruption handling
    // ---------------------------------------------------------------

    #[test]
    fn test_decode_bad_magic() {
        let batch = sample();
        let mut corrupted = BytesMut::from(&batch.encode()[..]);
        corrupted[0] = 0xFF;
        let mut bytes = corrupted.freeze();
        assert!(matches!(
            StreamRecordBatch::decode(&mut bytes),
            Err(Error::InvalidMagic)
        ));
    }

    #[test]
    fn test_decode_bad_version() {
        let batch = sample();
        let mut corrupted = BytesMut::from(&batch.encode()[..]);
        corrupted[1] = 99;
        let mut bytes = corrupted.freeze();
        assert!(matches!(
            StreamRecordBatch::decode(&mut bytes),
            Err(Error::UnsupportedVersion(99))
        ));
    }

    #[test]
    fn test_decode_flipped_payload_byte_fails_crc() {
        let batch = sample();
        let mut corrupted = BytesMut::from(&batch.encode()[..]);
        corrupted[RECORD_HEADER_SIZE] ^= 0x01;
        let mut bytes = corrupted.freeze();
        assert!(matches!(
            StreamRecordBatch::decode(&mut bytes),
            Err(Error::CrcMismatch)
        ));
    }

    #[test]
    fn test_decode_truncated_header() {
        let mut bytes = Bytes::from_static(&[RECORD_MAGIC, RECORD_VERSION, 0, 0]);
        assert!(matches!(
            StreamRecordBatch::decode(&mut bytes),
            Err(Error::Truncated { .. })
        ));
    }

    #[test]
    fn test_decode_truncated_payload() {
        let batch = sample();
        let encoded = batch.encode();
        let mut bytes = encoded.slice(..encoded.len() - 6);
        assert!(matches!(
            StreamRecordBatch::decode(&mut bytes),
            Err(Error::Truncated { .. })
        ));
    }
}
