//! Frame encoding for a single record.
//!
//! On-disk layout (little-endian): `[ length:i32 | index:i64 | asqn:i64 |
//! checksum:u32 | payload:bytes ]`. `length` covers the entire frame,
//! including itself.

use crate::error::{Error, Result};

/// Sentinel [`Record::asqn`] meaning "no application sequence number".
pub const ASQN_IGNORE: i64 = -1;

const LENGTH_LEN: usize = 4;
const INDEX_LEN: usize = 8;
const ASQN_LEN: usize = 8;
const CHECKSUM_LEN: usize = 4;

/// Size of a frame's fixed-width fields, not counting the payload.
pub const HEADER_LEN: usize = LENGTH_LEN + INDEX_LEN + ASQN_LEN + CHECKSUM_LEN;

/// A decoded record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub index: u64,
    pub asqn: i64,
    pub payload: Vec<u8>,
}

impl Record {
    /// Size in bytes of this record's on-disk frame.
    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }
}

/// Number of bytes the frame for a `payload_len`-byte payload occupies.
pub fn encoded_len(payload_len: usize) -> usize {
    HEADER_LEN + payload_len
}

/// Encode a record frame. Fails with [`Error::EmptyPayload`] if `payload`
/// is empty, per the data model's `payload.len >= 1` invariant.
pub fn encode(index: u64, asqn: i64, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.is_empty() {
        return Err(Error::EmptyPayload);
    }
    let frame_len = encoded_len(payload.len());
    let mut buf = Vec::with_capacity(frame_len);
    buf.extend_from_slice(&(frame_len as i32).to_le_bytes());
    buf.extend_from_slice(&index.to_le_bytes());
    buf.extend_from_slice(&asqn.to_le_bytes());
    buf.extend_from_slice(&checksum(index, asqn, frame_len as i32, payload).to_le_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Peek the `length` prefix of a frame. Returns `None` if it reads as zero
/// or negative, which marks the physical end of valid records (either
/// pre-allocated unused space, or a torn write).
pub fn peek_length(prefix: [u8; LENGTH_LEN]) -> Option<usize> {
    let length = i32::from_le_bytes(prefix);
    if length <= 0 {
        None
    } else {
        Some(length as usize)
    }
}

/// Decode a complete frame, i.e. the full `length` bytes a prior
/// [`peek_length`] reported. Verifies both that `length` matches the slice
/// actually supplied and the frame's checksum.
pub fn decode(frame: &[u8]) -> Result<Record> {
    if frame.len() < HEADER_LEN {
        return Err(Error::Corrupt { segment_id: 0, offset: 0 });
    }

    let length = i32::from_le_bytes(frame[0..LENGTH_LEN].try_into().unwrap());
    if length < 0 || length as usize != frame.len() {
        return Err(Error::Corrupt { segment_id: 0, offset: 0 });
    }

    let index = u64::from_le_bytes(frame[LENGTH_LEN..LENGTH_LEN + INDEX_LEN].try_into().unwrap());
    let asqn_start = LENGTH_LEN + INDEX_LEN;
    let asqn = i64::from_le_bytes(frame[asqn_start..asqn_start + ASQN_LEN].try_into().unwrap());
    let checksum_start = asqn_start + ASQN_LEN;
    let stored_checksum =
        u32::from_le_bytes(frame[checksum_start..checksum_start + CHECKSUM_LEN].try_into().unwrap());
    let payload = &frame[HEADER_LEN..];

    let expected = checksum(index, asqn, length, payload);
    if expected != stored_checksum {
        return Err(Error::Corrupt {
            segment_id: 0,
            offset: 0,
        });
    }

    Ok(Record {
        index,
        asqn,
        payload: payload.to_vec(),
    })
}

fn checksum(index: u64, asqn: i64, length: i32, payload: &[u8]) -> u32 {
    let mut crc = crc32c::crc32c(&index.to_le_bytes());
    crc = crc32c::crc32c_append(crc, &asqn.to_le_bytes());
    crc = crc32c::crc32c_append(crc, &length.to_le_bytes());
    crc32c::crc32c_append(crc, payload)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn roundtrip() {
        let frame = encode(7, 42, b"hello").unwrap();
        let [a, b, c, d] = frame[..4].try_into().unwrap();
        let len = peek_length([a, b, c, d]).unwrap();
        assert_eq!(len, frame.len());
        let record = decode(&frame).unwrap();
        assert_eq!(record.index, 7);
        assert_eq!(record.asqn, 42);
        assert_eq!(record.payload, b"hello");
    }

    #[test]
    fn empty_payload_rejected() {
        assert!(matches!(encode(1, ASQN_IGNORE, &[]), Err(Error::EmptyPayload)));
    }

    #[test]
    fn zero_length_prefix_is_end_of_data() {
        assert_eq!(peek_length([0, 0, 0, 0]), None);
    }

    proptest! {
        #[test]
        fn bitflip_detected(
            index in any::<u64>(),
            asqn in any::<i64>(),
            payload in proptest::collection::vec(any::<u8>(), 1..256),
            pos in 0usize..256,
            mask in any::<u8>().prop_filter("nonzero", |m| *m != 0),
        ) {
            let mut frame = encode(index, asqn, &payload).unwrap();
            let pos = pos % frame.len();
            frame[pos] ^= mask;
            let is_corrupt = matches!(decode(&frame), Err(Error::Corrupt { .. }));
            prop_assert!(is_corrupt);
        }
    }
}
