//! One fixed-size segment file: a 64-byte header followed by a sequence of
//! record frames (see [`crate::record`]).

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use log::warn;

use crate::error::{Error, Result};
use crate::record::{self, Record};

pub const MAGIC: u32 = 0x5A45_4542; // "ZEEB"
pub const FORMAT_VERSION: u16 = 1;

/// Size in bytes of a segment's fixed header.
pub const HEADER_LEN: usize = 64;

/// How many bytes to zero past the live write offset when trimming a
/// partial tail, so a subsequent scan reliably finds `length == 0`.
const ZERO_BOUND: u64 = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub segment_id: u64,
    pub first_index: u64,
    pub max_size: u32,
}

impl Header {
    fn encode(self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        buf[4..6].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        // bytes 6..8 are `flags`, currently unused.
        buf[8..16].copy_from_slice(&self.segment_id.to_le_bytes());
        buf[16..24].copy_from_slice(&self.first_index.to_le_bytes());
        buf[24..28].copy_from_slice(&self.max_size.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8; HEADER_LEN]) -> Result<Self> {
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != MAGIC {
            return Err(Error::InvalidSegmentHeader(format!("bad magic {magic:#010x}")));
        }
        let version = u16::from_le_bytes(buf[4..6].try_into().unwrap());
        if version == 0 || version > FORMAT_VERSION {
            return Err(Error::InvalidSegmentHeader(format!(
                "unsupported segment format version {version}"
            )));
        }
        let segment_id = u64::from_le_bytes(buf[8..16].try_into().unwrap());
        let first_index = u64::from_le_bytes(buf[16..24].try_into().unwrap());
        let max_size = u32::from_le_bytes(buf[24..28].try_into().unwrap());
        Ok(Self {
            segment_id,
            first_index,
            max_size,
        })
    }
}

/// One journal segment file.
///
/// A segment opened via [`Segment::create`]/[`Segment::open`] is writable:
/// the journal's single writer uses it to append and truncate. A segment
/// opened via [`Segment::open_read_only`] supports only [`Segment::read_at`]
/// and is safe to use concurrently with the writer mutating the same
/// underlying file, since it never scans or rewrites the file on open.
pub struct Segment {
    file: File,
    path: PathBuf,
    pub header: Header,
    write_offset: u64,
    last_index: Option<u64>,
    writable: bool,
}

impl Segment {
    /// The on-disk filename for segment `segment_id` of journal `name`.
    pub fn filename(name: &str, segment_id: u64) -> String {
        format!("{name}-{segment_id:020}.log")
    }

    /// Create a brand-new segment file. Fails if `path` already exists.
    pub fn create(path: PathBuf, header: Header, preallocate: bool) -> Result<Self> {
        let file = File::options().read(true).write(true).create_new(true).open(&path)?;
        file.write_all_at(&header.encode(), 0)?;
        let initial_len = if preallocate && header.max_size > 0 {
            header.max_size as u64
        } else {
            HEADER_LEN as u64
        };
        file.set_len(initial_len)?;
        file.sync_all()?;
        Ok(Self {
            file,
            path,
            header,
            write_offset: HEADER_LEN as u64,
            last_index: None,
            writable: true,
        })
    }

    /// Open an existing segment for writing, scanning it to recover
    /// `write_offset`/`last_index` and trimming a partial tail if found.
    pub fn open(path: PathBuf) -> Result<Self> {
        let file = File::options().read(true).write(true).open(&path)?;
        let header = read_header(&file)?;
        let mut segment = Self {
            file,
            path,
            header,
            write_offset: HEADER_LEN as u64,
            last_index: None,
            writable: true,
        };
        segment.recover()?;
        Ok(segment)
    }

    /// Open an existing segment for read-only, positional access. Does not
    /// scan the file; intended for readers that only ever call
    /// [`Segment::read_at`], so it is safe to call while the writer holds
    /// the same segment open for appends.
    pub fn open_read_only(path: PathBuf) -> Result<Self> {
        let file = File::options().read(true).open(&path)?;
        let header = read_header(&file)?;
        Ok(Self {
            file,
            path,
            header,
            write_offset: HEADER_LEN as u64,
            last_index: None,
            writable: false,
        })
    }

    fn file_len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn recover(&mut self) -> Result<()> {
        let len = self.file_len()?;
        let mut offset = HEADER_LEN as u64;
        let mut last_index = None;
        loop {
            match self.try_read_frame(offset, len) {
                Ok(Some(record)) => {
                    last_index = Some(record.index);
                    offset += record.frame_len() as u64;
                }
                Ok(None) => break,
                Err(Error::Corrupt { segment_id, offset: bad_offset }) => {
                    warn!("segment {segment_id}: checksum mismatch at offset {bad_offset}, trimming tail");
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        self.zero_from(offset)?;
        self.write_offset = offset;
        self.last_index = last_index;
        Ok(())
    }

    fn try_read_frame(&self, offset: u64, len: u64) -> Result<Option<Record>> {
        if offset + record::HEADER_LEN as u64 > len {
            return Ok(None);
        }
        let mut prefix = [0u8; 4];
        self.file.read_exact_at(&mut prefix, offset)?;
        let Some(frame_len) = record::peek_length(prefix) else {
            return Ok(None);
        };
        if offset + frame_len as u64 > len {
            return Ok(None);
        }
        let mut frame = vec![0u8; frame_len];
        self.file.read_exact_at(&mut frame, offset)?;
        match record::decode(&frame) {
            Ok(record) => Ok(Some(record)),
            Err(_) => Err(Error::Corrupt {
                segment_id: self.header.segment_id,
                offset,
            }),
        }
    }

    fn zero_from(&self, offset: u64) -> Result<()> {
        let len = self.file_len()?;
        if offset >= len {
            return Ok(());
        }
        let bound = (len - offset).min(ZERO_BOUND) as usize;
        self.file.write_all_at(&vec![0u8; bound], offset)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn segment_id(&self) -> u64 {
        self.header.segment_id
    }

    pub fn first_index(&self) -> u64 {
        self.header.first_index
    }

    pub fn last_index(&self) -> Option<u64> {
        self.last_index
    }

    pub fn write_offset(&self) -> u64 {
        self.write_offset
    }

    pub fn is_empty(&self) -> bool {
        self.last_index.is_none()
    }

    /// Append a record, returning the file offset its frame starts at.
    pub fn append(&mut self, index: u64, asqn: i64, payload: &[u8]) -> Result<u64> {
        if !self.writable {
            return Err(Error::Closed);
        }
        let frame = record::encode(index, asqn, payload)?;
        let needed = frame.len() as u64;
        let capacity = self.header.max_size as u64;
        if self.write_offset + needed > capacity {
            return Err(Error::SegmentFull {
                segment_id: self.header.segment_id,
                needed: needed as usize,
                available: capacity.saturating_sub(self.write_offset) as usize,
            });
        }
        let offset = self.write_offset;
        self.file.write_all_at(&frame, offset)?;
        self.write_offset += needed;
        self.last_index = Some(index);
        Ok(offset)
    }

    /// Read the frame at `offset`. Returns `Ok(None)` at the physical end of
    /// written data (unused pre-allocated space, or a torn tail).
    pub fn read_at(&self, offset: u64) -> Result<Option<Record>> {
        let len = self.file_len()?;
        self.try_read_frame(offset, len)
    }

    /// Discard every frame with `index` greater than the given one.
    pub fn truncate_to(&mut self, index: u64) -> Result<()> {
        if !self.writable {
            return Err(Error::Closed);
        }
        let len = self.file_len()?;
        let mut offset = HEADER_LEN as u64;
        let mut new_last = None;
        while let Some(record) = self.try_read_frame(offset, len)? {
            if record.index > index {
                break;
            }
            new_last = Some(record.index);
            offset += record.frame_len() as u64;
        }
        self.zero_from(offset)?;
        self.write_offset = offset;
        self.last_index = new_last;
        Ok(())
    }

    /// Force the segment's data to stable storage.
    pub fn flush(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Close and delete this segment's file.
    pub fn remove(self) -> Result<()> {
        let path = self.path.clone();
        drop(self.file);
        std::fs::remove_file(path)?;
        Ok(())
    }
}

fn read_header(file: &File) -> Result<Header> {
    let mut buf = [0u8; HEADER_LEN];
    file.read_exact_at(&mut buf, 0)?;
    Header::decode(&buf)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn header(segment_id: u64, first_index: u64) -> Header {
        Header {
            segment_id,
            first_index,
            max_size: 4096,
        }
    }

    #[test]
    fn append_and_read_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("j-00000000000000000001.log");
        let mut seg = Segment::create(path, header(1, 1), false).unwrap();

        let off_a = seg.append(1, record::ASQN_IGNORE, b"a").unwrap();
        let off_b = seg.append(2, record::ASQN_IGNORE, b"bb").unwrap();

        assert_eq!(seg.read_at(off_a).unwrap().unwrap().payload, b"a");
        assert_eq!(seg.read_at(off_b).unwrap().unwrap().payload, b"bb");
        assert_eq!(seg.last_index(), Some(2));
    }

    #[test]
    fn segment_full_when_out_of_space() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("j-00000000000000000001.log");
        let mut seg = Segment::create(path, header(1, 1), false).unwrap();
        let big = vec![0u8; 4096];
        assert!(matches!(
            seg.append(1, record::ASQN_IGNORE, &big),
            Err(Error::SegmentFull { .. })
        ));
    }

    #[test]
    fn reopen_recovers_write_offset() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("j-00000000000000000001.log");
        {
            let mut seg = Segment::create(path.clone(), header(1, 1), false).unwrap();
            seg.append(1, record::ASQN_IGNORE, b"a").unwrap();
            seg.append(2, record::ASQN_IGNORE, b"bb").unwrap();
        }
        let reopened = Segment::open(path).unwrap();
        assert_eq!(reopened.last_index(), Some(2));
    }

    #[test]
    fn reopen_trims_torn_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("j-00000000000000000001.log");
        let good_offset;
        {
            let mut seg = Segment::create(path.clone(), header(1, 1), false).unwrap();
            seg.append(1, record::ASQN_IGNORE, b"a").unwrap();
            good_offset = seg.write_offset();
            seg.append(2, record::ASQN_IGNORE, b"bb").unwrap();
        }
        // Simulate a crash mid-frame: truncate the file partway into record 2.
        let file = File::options().write(true).open(&path).unwrap();
        file.set_len(good_offset + 3).unwrap();

        let reopened = Segment::open(path).unwrap();
        assert_eq!(reopened.last_index(), Some(1));
        assert_eq!(reopened.write_offset(), good_offset);
    }

    #[test]
    fn truncate_to_drops_later_frames() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("j-00000000000000000001.log");
        let mut seg = Segment::create(path.clone(), header(1, 1), false).unwrap();
        seg.append(1, record::ASQN_IGNORE, b"a").unwrap();
        let off2 = seg.append(2, record::ASQN_IGNORE, b"b").unwrap();
        seg.append(3, record::ASQN_IGNORE, b"c").unwrap();

        seg.truncate_to(2).unwrap();
        assert_eq!(seg.last_index(), Some(2));
        assert_eq!(seg.write_offset(), off2 + record::encoded_len(1) as u64);

        let reopened = Segment::open(path).unwrap();
        assert_eq!(reopened.last_index(), Some(2));
    }

    #[test]
    fn read_only_segment_does_not_mutate_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("j-00000000000000000001.log");
        let mut seg = Segment::create(path.clone(), header(1, 1), false).unwrap();
        seg.append(1, record::ASQN_IGNORE, b"a").unwrap();
        drop(seg);

        let before = std::fs::read(&path).unwrap();
        let reader = Segment::open_read_only(path.clone()).unwrap();
        assert_eq!(reader.read_at(HEADER_LEN as u64).unwrap().unwrap().payload, b"a");
        let after = std::fs::read(&path).unwrap();
        assert_eq!(before, after);
    }
}
