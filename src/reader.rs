//! A forward cursor over a journal, safe to use concurrently with the
//! writer appending to the same directory.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::journal::{Inner, Journal, ReaderSlot, SharedInner};
use crate::record::{self, Record};
use crate::segment::{self, Segment};

/// Where a reader would resume from: the next index to return, and the
/// exact `(segment_id, offset)` of its frame.
#[derive(Clone, Copy, Debug)]
struct Position {
    next_index: u64,
    segment_id: u64,
    offset: u64,
}

pub struct JournalReader {
    inner: SharedInner,
    id: u64,
    slot: Arc<ReaderSlot>,
    position: Position,
    segment_cache: Option<Segment>,
    closed: bool,
}

impl JournalReader {
    pub(crate) fn new(inner: SharedInner, id: u64, slot: Arc<ReaderSlot>, start_index: u64) -> Result<Self> {
        let guard = inner.read().unwrap();
        let position = locate(&guard, start_index)?;
        drop(guard);
        Ok(Self {
            inner,
            id,
            slot,
            position,
            segment_cache: None,
            closed: false,
        })
    }

    /// Whether a call to [`JournalReader::next`] would return a record.
    pub fn has_next(&mut self) -> Result<bool> {
        let inner = self.inner.clone();
        let guard = inner.read().unwrap();
        self.guard_open(&guard)?;
        self.apply_pending_rewind(&guard)?;
        Ok(guard.segments.last_index().is_some_and(|last| self.position.next_index <= last))
    }

    /// Return the next record, or `None` if the reader has caught up to the
    /// tail.
    pub fn next(&mut self) -> Result<Option<Record>> {
        let inner = self.inner.clone();
        let guard = inner.read().unwrap();
        self.guard_open(&guard)?;
        self.apply_pending_rewind(&guard)?;

        loop {
            let Position {
                next_index,
                segment_id,
                offset,
            } = self.position;

            if next_index < guard.segments.first_index() {
                return Err(Error::NoSuchIndex { index: next_index });
            }

            let seg = self.segment_for(&guard, segment_id)?;
            match seg.read_at(offset)? {
                Some(record) => {
                    let advanced = offset + record.frame_len() as u64;
                    self.position = Position {
                        next_index: next_index + 1,
                        segment_id,
                        offset: advanced,
                    };
                    self.slot.publish(next_index + 1);
                    return Ok(Some(record));
                }
                None => match guard.segments.next_segment_id(segment_id) {
                    Some(next_id) if next_id != segment_id => {
                        self.position = Position {
                            next_index,
                            segment_id: next_id,
                            offset: segment::HEADER_LEN as u64,
                        };
                        self.segment_cache = None;
                    }
                    _ => return Ok(None),
                },
            }
        }
    }

    /// Position the reader so the next call to [`JournalReader::next`]
    /// returns the record at `index`.
    pub fn seek(&mut self, index: u64) -> Result<()> {
        let guard = self.inner.read().unwrap();
        self.guard_open(&guard)?;
        self.position = locate(&guard, index)?;
        self.segment_cache = None;
        self.slot.publish(self.position.next_index);
        Ok(())
    }

    pub fn seek_to_first(&mut self) -> Result<()> {
        let guard = self.inner.read().unwrap();
        self.guard_open(&guard)?;
        let target = guard.segments.first_index();
        self.position = locate(&guard, target)?;
        self.segment_cache = None;
        self.slot.publish(self.position.next_index);
        Ok(())
    }

    pub fn seek_to_last(&mut self) -> Result<()> {
        let guard = self.inner.read().unwrap();
        self.guard_open(&guard)?;
        let target = guard.segments.last_index().unwrap_or_else(|| guard.segments.first_index());
        self.position = locate(&guard, target)?;
        self.segment_cache = None;
        self.slot.publish(self.position.next_index);
        Ok(())
    }

    /// Scan for the record with the largest index whose `asqn <= target`,
    /// positioning the reader there. Returns whether a match was found; ASQN
    /// order is not guaranteed, so this is a full linear scan from
    /// `first_index`, not a sparse-index lookup. Falls back to
    /// `seek_to_first` if nothing matches.
    pub fn seek_to_asqn(&mut self, target: i64) -> Result<bool> {
        let guard = self.inner.read().unwrap();
        self.guard_open(&guard)?;
        match scan_for_asqn(&guard, target)? {
            Some(position) => {
                self.position = position;
                self.segment_cache = None;
                self.slot.publish(self.position.next_index);
                Ok(true)
            }
            None => {
                let first = guard.segments.first_index();
                self.position = locate(&guard, first)?;
                self.segment_cache = None;
                self.slot.publish(self.position.next_index);
                Ok(false)
            }
        }
    }

    /// The index the next call to [`JournalReader::next`] would return.
    pub fn current_index(&self) -> u64 {
        self.position.next_index
    }

    /// Deregister this reader from the journal.
    pub fn close(mut self) {
        self.closed = true;
        Journal::close_reader(&self.inner, self.id);
    }

    fn guard_open(&self, guard: &Inner) -> Result<()> {
        if self.closed || guard.closed {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn apply_pending_rewind(&mut self, guard: &Inner) -> Result<()> {
        if let Some(target) = self.slot.take_rewind() {
            self.position = locate(guard, target)?;
            self.segment_cache = None;
        }
        Ok(())
    }

    fn segment_for(&mut self, guard: &Inner, segment_id: u64) -> Result<&Segment> {
        let needs_reopen = match &self.segment_cache {
            Some(seg) => seg.segment_id() != segment_id,
            None => true,
        };
        if needs_reopen {
            self.segment_cache = Some(guard.segments.open_segment_for_read(segment_id)?);
        }
        Ok(self.segment_cache.as_ref().unwrap())
    }
}

impl Drop for JournalReader {
    fn drop(&mut self) {
        if !self.closed {
            Journal::close_reader(&self.inner, self.id);
        }
    }
}

/// Resolve the `(segment_id, offset)` a cursor at `target` should read from.
/// `find_segment` picks the segment authoritatively; the sparse index is
/// then consulted only as a within-segment scan-start shortcut, falling
/// back to the segment's own first frame otherwise.
fn locate(inner: &Inner, target: u64) -> Result<Position> {
    let first = inner.segments.first_index();
    let last = inner.segments.last_index();
    let range_end = last.map(|l| l + 1).unwrap_or(first);
    if target < first || target > range_end {
        return Err(Error::OutOfRange {
            index: target,
            first_index: first,
            last_index: last.map(|l| l as i64).unwrap_or(-1),
        });
    }

    let segment_id = inner.segments.find_segment(target).unwrap_or_else(|| inner.segments.first_segment_id());

    if let Some((floor_key, entry)) = inner.sparse_index.floor_entry(target) {
        if entry.segment_id == segment_id {
            if floor_key == target {
                return Ok(Position {
                    next_index: target,
                    segment_id,
                    offset: entry.offset,
                });
            }
            return scan_to(inner, segment_id, entry.offset, floor_key, target);
        }
    }

    let segment_first = inner.segments.segment_first_index(segment_id).unwrap_or(first);
    scan_to(inner, segment_id, segment::HEADER_LEN as u64, segment_first, target)
}

fn scan_to(inner: &Inner, mut segment_id: u64, mut offset: u64, mut index: u64, target: u64) -> Result<Position> {
    let mut seg = inner.segments.open_segment_for_read(segment_id)?;
    loop {
        if index == target {
            return Ok(Position {
                next_index: index,
                segment_id,
                offset,
            });
        }
        match seg.read_at(offset)? {
            Some(record) => {
                offset += record.frame_len() as u64;
                index += 1;
            }
            None => match inner.segments.next_segment_id(segment_id) {
                Some(next_id) if next_id != segment_id => {
                    segment_id = next_id;
                    offset = segment::HEADER_LEN as u64;
                    seg = inner.segments.open_segment_for_read(segment_id)?;
                }
                _ => {
                    return Err(Error::OutOfRange {
                        index: target,
                        first_index: inner.segments.first_index(),
                        last_index: inner.segments.last_index().map(|l| l as i64).unwrap_or(-1),
                    })
                }
            },
        }
    }
}

fn scan_for_asqn(inner: &Inner, target: i64) -> Result<Option<Position>> {
    let Some(_last) = inner.segments.last_index() else {
        return Ok(None);
    };
    let mut segment_id = inner.segments.first_segment_id();
    let mut offset = segment::HEADER_LEN as u64;
    let mut seg = inner.segments.open_segment_for_read(segment_id)?;
    let mut best: Option<Position> = None;

    loop {
        match seg.read_at(offset)? {
            Some(record) => {
                if record.asqn != record::ASQN_IGNORE && record.asqn <= target {
                    best = Some(Position {
                        next_index: record.index,
                        segment_id,
                        offset,
                    });
                }
                offset += record.frame_len() as u64;
            }
            None => match inner.segments.next_segment_id(segment_id) {
                Some(next_id) if next_id != segment_id => {
                    segment_id = next_id;
                    offset = segment::HEADER_LEN as u64;
                    seg = inner.segments.open_segment_for_read(segment_id)?;
                }
                _ => break,
            },
        }
    }

    Ok(best)
}
