use std::path::PathBuf;

use thiserror::Error;

/// Errors produced by this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// The current segment has no room left for the next frame; the writer
    /// must roll to a new one.
    #[error("segment {segment_id} has insufficient space for a {needed}-byte frame ({available} available)")]
    SegmentFull {
        segment_id: u64,
        needed: usize,
        available: usize,
    },

    /// A frame's checksum did not match its contents.
    #[error("checksum mismatch in segment {segment_id} at offset {offset}")]
    Corrupt { segment_id: u64, offset: u64 },

    /// The disk-space policy refused to create a new segment.
    #[error("out of disk space in {directory}: need {needed} bytes free, have {available}")]
    OutOfDiskSpace {
        directory: PathBuf,
        needed: u64,
        available: u64,
    },

    /// An underlying read/write/fsync call failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// `append_record` was called with a non-contiguous index.
    #[error("append with index {actual} is not contiguous with expected next index {expected}")]
    InvalidIndex { expected: u64, actual: u64 },

    /// A seek target fell outside `[first_index, last_index]`.
    #[error("index {index} is out of range [{first_index}, {last_index}]")]
    OutOfRange {
        index: u64,
        first_index: u64,
        last_index: i64,
    },

    /// An operation was attempted on a journal after `close`.
    #[error("journal is closed")]
    Closed,

    /// A record was appended with an empty payload.
    #[error("record payload must not be empty")]
    EmptyPayload,

    /// A segment header failed to decode, or a segment does not chain from
    /// its predecessor's `last_index`.
    #[error("invalid segment header: {0}")]
    InvalidSegmentHeader(String),

    /// `next()` observed a truncation that moved the cursor past the tail
    /// before the reader was rewound.
    #[error("no record at index {index}; reader is being truncated")]
    NoSuchIndex { index: u64 },

    /// An [`crate::Options`] value failed validation.
    #[error("invalid journal options: {0}")]
    InvalidOptions(String),
}

pub type Result<T> = std::result::Result<T, Error>;
