//! Lifecycle, reader registry, and read/write coordination for a journal
//! directory.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use log::debug;

use crate::error::{Error, Result};
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::options::Options;
use crate::reader::JournalReader;
use crate::segments::SegmentsManager;
use crate::sparse_index::SparseIndex;
use crate::writer::JournalWriter;

/// No rewind pending.
const NO_REWIND: u64 = u64::MAX;

/// Per-reader position bookkeeping shared between a [`JournalReader`] and
/// the registry in [`Inner`]. Lock-free: the reader publishes its own
/// position after every successful read, and a truncating writer (holding
/// the write lock) may post a rewind target that the reader picks up and
/// applies the next time it is driven.
#[derive(Debug, Default)]
pub(crate) struct ReaderSlot {
    position: AtomicU64,
    rewind_to: AtomicU64,
}

impl ReaderSlot {
    fn new(initial_position: u64) -> Self {
        Self {
            position: AtomicU64::new(initial_position),
            rewind_to: AtomicU64::new(NO_REWIND),
        }
    }

    pub(crate) fn publish(&self, next_index: u64) {
        self.position.store(next_index, Ordering::SeqCst);
    }

    pub(crate) fn take_rewind(&self) -> Option<u64> {
        match self.rewind_to.swap(NO_REWIND, Ordering::SeqCst) {
            NO_REWIND => None,
            target => Some(target),
        }
    }

    fn request_rewind(&self, target: u64) {
        self.rewind_to.store(target, Ordering::SeqCst);
    }

    fn position(&self) -> u64 {
        self.position.load(Ordering::SeqCst)
    }
}

/// State shared, under a single [`RwLock`], between the writer, every live
/// reader, and the facade itself.
pub(crate) struct Inner {
    pub(crate) segments: SegmentsManager,
    pub(crate) sparse_index: SparseIndex,
    pub(crate) index_stride: u64,
    pub(crate) min_free_disk_space: u64,
    pub(crate) records_since_index: u64,
    pub(crate) readers: HashMap<u64, Arc<ReaderSlot>>,
    pub(crate) next_reader_id: u64,
    pub(crate) closed: bool,
    pub(crate) metrics: Arc<dyn MetricsSink>,
}

impl Inner {
    /// Rewind every reader positioned strictly past `new_last_index + 1`.
    pub(crate) fn rewind_readers_after(&self, new_last_index_exclusive: u64) {
        let cutoff = new_last_index_exclusive.saturating_add(1);
        for slot in self.readers.values() {
            if slot.position() > cutoff {
                slot.request_rewind(cutoff);
            }
        }
    }

    /// Rewind every reader positioned strictly before `new_first_index`.
    pub(crate) fn rewind_readers_before(&self, new_first_index: u64) {
        for slot in self.readers.values() {
            if slot.position() < new_first_index {
                slot.request_rewind(new_first_index);
            }
        }
    }

    /// Force every reader back to `index`, unconditionally (used by `reset`).
    pub(crate) fn rewind_all_readers(&self, index: u64) {
        for slot in self.readers.values() {
            slot.request_rewind(index);
        }
    }

    pub(crate) fn publish_counters(&self) {
        self.metrics.set_segment_count(self.segments.segment_count());
        self.metrics.set_first_index(self.segments.first_index());
        self.metrics
            .set_last_index(self.segments.last_index().map(|i| i as i64).unwrap_or(-1));
    }
}

/// The journal facade: owns the segments, the sparse index, and the
/// read/write lock shared between [`JournalWriter`] and every
/// [`JournalReader`].
pub struct Journal {
    inner: Arc<RwLock<Inner>>,
}

impl Journal {
    /// Open (or create) the journal described by `opts`.
    pub fn open(opts: Options) -> Result<Self> {
        Self::open_with_metrics(opts, Arc::new(NoopMetrics))
    }

    /// Open the journal, wiring up a custom [`MetricsSink`].
    pub fn open_with_metrics(opts: Options, metrics: Arc<dyn MetricsSink>) -> Result<Self> {
        opts.validate()?;

        let max_segment_size: u32 = opts
            .max_segment_size
            .try_into()
            .map_err(|_| Error::InvalidOptions("max_segment_size does not fit in u32".into()))?;

        let mut segments = SegmentsManager::open(
            opts.directory.clone(),
            opts.name.clone(),
            max_segment_size,
            opts.preallocate_segment_files,
        )?;

        if let Some(hint) = opts.last_written_index {
            if segments.last_index().is_some_and(|last| last > hint) {
                debug!("last_written_index hint {hint} below recovered tail, truncating");
                segments.truncate_after(hint)?;
            }
        }

        let sparse_index = rebuild_sparse_index(&segments, opts.index_stride)?;

        let inner = Inner {
            segments,
            sparse_index,
            index_stride: opts.index_stride,
            min_free_disk_space: opts.min_free_disk_space,
            records_since_index: 0,
            readers: HashMap::new(),
            next_reader_id: 0,
            closed: false,
            metrics,
        };
        inner.publish_counters();

        Ok(Self {
            inner: Arc::new(RwLock::new(inner)),
        })
    }

    /// A handle for appending, truncating, and resetting this journal.
    pub fn writer(&self) -> JournalWriter {
        JournalWriter::new(Arc::clone(&self.inner))
    }

    /// Create a new forward cursor positioned at `first_index`.
    pub fn open_reader(&self) -> Result<JournalReader> {
        let mut guard = self.inner.write().unwrap();
        if guard.closed {
            return Err(Error::Closed);
        }
        let id = guard.next_reader_id;
        guard.next_reader_id += 1;
        let start = guard.segments.first_index();
        let slot = Arc::new(ReaderSlot::new(start));
        guard.readers.insert(id, Arc::clone(&slot));
        drop(guard);
        JournalReader::new(Arc::clone(&self.inner), id, slot, start)
    }

    /// Deregister a reader. Idempotent.
    pub(crate) fn close_reader(inner: &Arc<RwLock<Inner>>, id: u64) {
        if let Ok(mut guard) = inner.write() {
            guard.readers.remove(&id);
        }
    }

    pub fn is_empty(&self) -> bool {
        let guard = self.inner.read().unwrap();
        guard.segments.last_index().is_none()
    }

    pub fn first_index(&self) -> u64 {
        self.inner.read().unwrap().segments.first_index()
    }

    pub fn last_index(&self) -> Option<u64> {
        self.inner.read().unwrap().segments.last_index()
    }

    /// Close the journal. Idempotent; subsequent operations on this journal
    /// or any of its readers/writer fail with [`Error::Closed`].
    pub fn close(&self) -> Result<()> {
        let mut guard = self.inner.write().unwrap();
        if guard.closed {
            return Ok(());
        }
        guard.segments.current_mut().flush()?;
        guard.closed = true;
        Ok(())
    }
}

fn rebuild_sparse_index(segments: &SegmentsManager, stride: u64) -> Result<SparseIndex> {
    let mut index = SparseIndex::new();
    let mut since_last = 0u64;
    for segment_id in segments.segment_ids() {
        let seg = segments.open_segment_for_read(segment_id)?;
        let mut offset = crate::segment::HEADER_LEN as u64;
        let mut first = true;
        while let Some(record) = seg.read_at(offset)? {
            if first || since_last >= stride {
                index.put(record.index, segment_id, offset);
                since_last = 0;
                first = false;
            }
            since_last += 1;
            offset += record.frame_len() as u64;
        }
    }
    Ok(index)
}

pub(crate) type SharedInner = Arc<RwLock<Inner>>;
