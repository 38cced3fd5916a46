//! The single writable handle onto a journal: appends, truncation, and
//! reset. All operations take the facade's write lock; since the journal
//! has exactly one writer by contract, that lock is never contended by a
//! concurrent append.

use std::sync::RwLockWriteGuard;

use fs4::available_space;
use log::debug;

use crate::error::{Error, Result};
use crate::journal::{Inner, SharedInner};
use crate::record::{self, Record, ASQN_IGNORE};

/// Minimum free disk space demanded before rolling or creating a segment,
/// as a multiple of the configured segment size, so a burst of appends
/// right after a roll cannot immediately run the filesystem dry.
const MIN_FREE_SEGMENTS: u64 = 3;

pub struct JournalWriter {
    inner: SharedInner,
}

impl JournalWriter {
    pub(crate) fn new(inner: SharedInner) -> Self {
        Self { inner }
    }

    /// Append `payload` with `asqn = ASQN_IGNORE`, returning the assigned
    /// index.
    pub fn append_payload(&self, payload: &[u8]) -> Result<u64> {
        self.append(ASQN_IGNORE, payload)
    }

    /// Append `payload` tagged with `asqn`, returning the assigned index.
    pub fn append(&self, asqn: i64, payload: &[u8]) -> Result<u64> {
        if payload.is_empty() {
            return Err(Error::EmptyPayload);
        }
        let start = std::time::Instant::now();
        let mut guard = self.inner.write().unwrap();
        if guard.closed {
            return Err(Error::Closed);
        }
        let index = guard.segments.last_index().map_or(guard.segments.first_index(), |i| i + 1);

        ensure_room(&guard, payload.len())?;

        let offset = match guard.segments.current_mut().append(index, asqn, payload) {
            Ok(offset) => offset,
            Err(Error::SegmentFull { .. }) => {
                roll(&mut guard)?;
                guard.segments.current_mut().append(index, asqn, payload)?
            }
            Err(e) => return Err(e),
        };
        record_in_index(&mut guard, index, offset);
        guard.publish_counters();
        guard.metrics.record_append(payload.len(), start.elapsed());
        Ok(index)
    }

    /// Append a record whose index was assigned by another source (e.g. a
    /// replicated leader). Fails with [`Error::InvalidIndex`] unless
    /// `record.index` is exactly the next expected index.
    pub fn append_record(&self, record: &Record) -> Result<()> {
        if record.payload.is_empty() {
            return Err(Error::EmptyPayload);
        }
        let start = std::time::Instant::now();
        let mut guard = self.inner.write().unwrap();
        if guard.closed {
            return Err(Error::Closed);
        }
        let expected = guard.segments.last_index().map_or(guard.segments.first_index(), |i| i + 1);
        if record.index != expected {
            return Err(Error::InvalidIndex {
                expected,
                actual: record.index,
            });
        }

        ensure_room(&guard, record.payload.len())?;

        let append_result = guard
            .segments
            .current_mut()
            .append(record.index, record.asqn, &record.payload);
        let offset = match append_result {
            Ok(offset) => offset,
            Err(Error::SegmentFull { .. }) => {
                roll(&mut guard)?;
                guard.segments.current_mut().append(record.index, record.asqn, &record.payload)?
            }
            Err(e) => return Err(e),
        };
        record_in_index(&mut guard, record.index, offset);
        guard.publish_counters();
        guard.metrics.record_append(record.payload.len(), start.elapsed());
        Ok(())
    }

    /// Discard every record with index greater than `index_exclusive`. Live
    /// readers positioned past the new tail are rewound to it.
    pub fn delete_after(&self, index_exclusive: u64) -> Result<()> {
        let mut guard = self.inner.write().unwrap();
        if guard.closed {
            return Err(Error::Closed);
        }
        let first_index = guard.segments.first_index();
        if index_exclusive + 1 <= first_index {
            guard.segments.reset(first_index)?;
            guard.sparse_index.clear();
        } else {
            guard.segments.truncate_after(index_exclusive)?;
            guard.sparse_index.delete_after(index_exclusive);
        }
        let has_readers = !guard.readers.is_empty();
        guard.rewind_readers_after(index_exclusive);
        guard.publish_counters();
        guard.metrics.observe_segment_truncation(has_readers);
        Ok(())
    }

    /// Discard every segment fully before `index`, keeping the current
    /// segment untouched.
    pub fn delete_until(&self, index: u64) -> Result<()> {
        let mut guard = self.inner.write().unwrap();
        if guard.closed {
            return Err(Error::Closed);
        }
        guard.segments.delete_until(index)?;
        let new_first = guard.segments.first_index();
        guard.sparse_index.delete_before(new_first);
        guard.rewind_readers_before(new_first);
        guard.publish_counters();
        Ok(())
    }

    /// Wipe the journal and start over at `next_index`: after this call the
    /// journal is empty, `first_index() == next_index`. Every live reader is
    /// rewound to `next_index`.
    pub fn reset(&self, next_index: u64) -> Result<()> {
        let mut guard = self.inner.write().unwrap();
        if guard.closed {
            return Err(Error::Closed);
        }
        guard.segments.reset(next_index)?;
        guard.sparse_index.clear();
        guard.records_since_index = 0;
        guard.rewind_all_readers(next_index);
        guard.publish_counters();
        Ok(())
    }

    /// Force the current segment's data to stable storage.
    pub fn flush(&self) -> Result<()> {
        let guard = self.inner.read().unwrap();
        if guard.closed {
            return Err(Error::Closed);
        }
        guard.segments.current().flush()
    }
}

fn record_in_index(guard: &mut Inner, index: u64, offset: u64) {
    let segment_id = guard.segments.current().segment_id();
    if guard.sparse_index.is_empty() || guard.records_since_index >= guard.index_stride {
        guard.sparse_index.put(index, segment_id, offset);
        guard.records_since_index = 0;
    } else {
        guard.records_since_index += 1;
    }
}

fn roll(guard: &mut Inner) -> Result<()> {
    let start = std::time::Instant::now();
    guard.segments.current().flush()?;
    guard.segments.create_next_segment()?;
    guard.metrics.observe_segment_roll(start.elapsed());
    Ok(())
}

/// Require enough headroom for a few more full segments before letting a
/// roll or fresh creation proceed, so sustained writes don't run a
/// filesystem bone dry one record at a time.
fn ensure_room(guard: &RwLockWriteGuard<'_, Inner>, payload_len: usize) -> Result<()> {
    let current = guard.segments.current();
    let remaining_in_segment = (current.header.max_size as u64).saturating_sub(current.write_offset());
    if remaining_in_segment >= record::encoded_len(payload_len) as u64 {
        return Ok(());
    }
    let needed = (current.header.max_size as u64 * MIN_FREE_SEGMENTS).max(guard.min_free_disk_space);
    let available = available_space(guard.segments.directory())?;
    if available < needed {
        debug!(
            "refusing to roll segment: {available} bytes free, need {needed}",
        );
        return Err(Error::OutOfDiskSpace {
            directory: guard.segments.directory().to_path_buf(),
            needed,
            available,
        });
    }
    Ok(())
}
