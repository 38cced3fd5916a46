//! Discovers, opens, creates, and deletes segment files for one journal
//! directory.

use std::fs;
use std::path::{Path, PathBuf};

use log::debug;

use crate::error::{Error, Result};
use crate::segment::{Header, Segment};

/// What the manager remembers about a sealed (read-only, non-current)
/// segment without keeping its file open.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SegmentSummary {
    pub segment_id: u64,
    pub first_index: u64,
    pub last_index: Option<u64>,
}

pub struct SegmentsManager {
    directory: PathBuf,
    name: String,
    max_segment_size: u32,
    preallocate: bool,
    sealed: Vec<SegmentSummary>,
    current: Segment,
}

impl SegmentsManager {
    /// Discover existing segments in `directory`, or create segment 1 if
    /// none exist.
    pub fn open(directory: PathBuf, name: String, max_segment_size: u32, preallocate: bool) -> Result<Self> {
        fs::create_dir_all(&directory)?;
        let mut ids = discover(&directory, &name)?;

        if ids.is_empty() {
            debug!("no segments found in {}, starting fresh journal '{name}'", directory.display());
            let header = Header {
                segment_id: 1,
                first_index: 1,
                max_size: max_segment_size,
            };
            let current = Segment::create(segment_path(&directory, &name, 1), header, preallocate)?;
            return Ok(Self {
                directory,
                name,
                max_segment_size,
                preallocate,
                sealed: Vec::new(),
                current,
            });
        }

        let mut opened = Vec::with_capacity(ids.len());
        for &id in &ids {
            opened.push(Segment::open(segment_path(&directory, &name, id))?);
        }

        // A completely empty last segment is a leftover from a crash right
        // after a roll; drop it and resume the previous segment for writing.
        if opened.len() > 1 && opened.last().unwrap().is_empty() {
            let stale = opened.pop().unwrap();
            debug!("dropping empty trailing segment {}", stale.segment_id());
            stale.remove()?;
            ids.pop();
        }

        let mut prev_last_index = None;
        for seg in &opened[..opened.len() - 1] {
            if let Some(prev) = prev_last_index {
                if seg.first_index() != prev + 1 {
                    return Err(Error::InvalidSegmentHeader(format!(
                        "segment {} firstIndex {} does not chain from previous lastIndex {prev}",
                        seg.segment_id(),
                        seg.first_index()
                    )));
                }
            }
            prev_last_index = Some(seg.last_index().unwrap_or(seg.first_index().saturating_sub(1)));
        }

        let current = opened.pop().unwrap();
        if let Some(prev) = prev_last_index {
            if current.first_index() != prev + 1 {
                return Err(Error::InvalidSegmentHeader(format!(
                    "current segment {} firstIndex {} does not chain from previous lastIndex {prev}",
                    current.segment_id(),
                    current.first_index()
                )));
            }
        }

        let sealed = opened
            .into_iter()
            .map(|seg| SegmentSummary {
                segment_id: seg.segment_id(),
                first_index: seg.first_index(),
                last_index: seg.last_index(),
            })
            .collect();

        debug!(
            "resumed journal '{name}': {} sealed segment(s), current segment {}",
            ids.len() - 1,
            current.segment_id()
        );

        Ok(Self {
            directory,
            name,
            max_segment_size,
            preallocate,
            sealed,
            current,
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn current(&self) -> &Segment {
        &self.current
    }

    pub fn current_mut(&mut self) -> &mut Segment {
        &mut self.current
    }

    pub fn sealed_count(&self) -> usize {
        self.sealed.len()
    }

    pub fn segment_count(&self) -> usize {
        self.sealed.len() + 1
    }

    /// The lowest retained index, across sealed and current segments.
    pub fn first_index(&self) -> u64 {
        self.sealed.first().map(|s| s.first_index).unwrap_or_else(|| self.current.first_index())
    }

    /// The highest appended index, or `None` if the journal is empty.
    pub fn last_index(&self) -> Option<u64> {
        self.current.last_index().or_else(|| self.sealed.last().and_then(|s| s.last_index))
    }

    /// Roll: seal the current segment and create a new one starting right
    /// after it.
    pub fn create_next_segment(&mut self) -> Result<()> {
        let next_first_index = self.current.last_index().map_or(self.current.first_index(), |i| i + 1);
        let next_id = self.current.segment_id() + 1;
        let header = Header {
            segment_id: next_id,
            first_index: next_first_index,
            max_size: self.max_segment_size,
        };
        let new_current = Segment::create(segment_path(&self.directory, &self.name, next_id), header, self.preallocate)?;
        let old = std::mem::replace(&mut self.current, new_current);
        debug!("rolled to segment {next_id} (first_index={next_first_index})");
        self.sealed.push(SegmentSummary {
            segment_id: old.segment_id(),
            first_index: old.first_index(),
            last_index: old.last_index(),
        });
        Ok(())
    }

    /// Find the segment id whose `[first_index, last_index]` range contains
    /// `index`, if any is currently retained.
    pub fn find_segment(&self, index: u64) -> Option<u64> {
        if self.current.first_index() <= index {
            return Some(self.current.segment_id());
        }
        // `sealed` is sorted ascending by segment_id/first_index; binary search
        // by first_index works because ranges are contiguous and non-overlapping.
        match self.sealed.binary_search_by(|s| s.first_index.cmp(&index)) {
            Ok(i) => Some(self.sealed[i].segment_id),
            Err(0) => None,
            Err(i) => Some(self.sealed[i - 1].segment_id),
        }
    }

    /// The segment id immediately after `segment_id`, if one is retained.
    pub fn next_segment_id(&self, segment_id: u64) -> Option<u64> {
        if self.is_current(segment_id) {
            return None;
        }
        let pos = self.sealed.iter().position(|s| s.segment_id == segment_id)?;
        Some(
            self.sealed
                .get(pos + 1)
                .map(|s| s.segment_id)
                .unwrap_or(self.current.segment_id()),
        )
    }

    pub fn is_current(&self, segment_id: u64) -> bool {
        segment_id == self.current.segment_id()
    }

    /// The `first_index` of a retained segment, without opening its file.
    pub fn segment_first_index(&self, segment_id: u64) -> Option<u64> {
        if self.is_current(segment_id) {
            return Some(self.current.first_index());
        }
        self.sealed.iter().find(|s| s.segment_id == segment_id).map(|s| s.first_index)
    }

    /// The id of the oldest retained segment.
    pub fn first_segment_id(&self) -> u64 {
        self.sealed.first().map(|s| s.segment_id).unwrap_or_else(|| self.current.segment_id())
    }

    /// Ids of every retained segment, oldest first.
    pub fn segment_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.sealed.iter().map(|s| s.segment_id).chain(std::iter::once(self.current.segment_id()))
    }

    /// Open a read-only handle to the segment, safe to use concurrently with
    /// the writer appending to `current`.
    pub fn open_segment_for_read(&self, segment_id: u64) -> Result<Segment> {
        Segment::open_read_only(segment_path(&self.directory, &self.name, segment_id))
    }

    /// Delete every sealed segment whose `last_index < index`. The current
    /// segment is never removed by this call.
    pub fn delete_until(&mut self, index: u64) -> Result<()> {
        let mut keep = Vec::with_capacity(self.sealed.len());
        for summary in self.sealed.drain(..) {
            let fully_before = summary.last_index.map(|last| last < index).unwrap_or(true);
            if fully_before {
                debug!("deleting segment {} (before first_index={index})", summary.segment_id);
                Segment::open(segment_path(&self.directory, &self.name, summary.segment_id))?.remove()?;
            } else {
                keep.push(summary);
            }
        }
        self.sealed = keep;
        Ok(())
    }

    /// Remove every persisted record with index greater than
    /// `index_exclusive`, walking backwards through sealed segments as
    /// needed to find the one the cut point falls in.
    pub fn truncate_after(&mut self, index_exclusive: u64) -> Result<()> {
        if !self.last_index().is_some_and(|last| last > index_exclusive) {
            return Ok(());
        }
        if self.current.first_index() <= index_exclusive {
            self.current.truncate_to(index_exclusive)?;
            return Ok(());
        }
        loop {
            let prev = self.sealed.pop().expect("cut point must fall within a retained segment");
            let reopened = Segment::open(segment_path(&self.directory, &self.name, prev.segment_id))?;
            let stale = std::mem::replace(&mut self.current, reopened);
            stale.remove()?;
            debug!("dropped segment {} while truncating after index {index_exclusive}", prev.segment_id);
            if self.current.first_index() <= index_exclusive {
                self.current.truncate_to(index_exclusive)?;
                return Ok(());
            }
        }
    }

    /// Delete all segments and create a fresh segment 1 rooted at
    /// `first_index`.
    pub fn reset(&mut self, first_index: u64) -> Result<()> {
        for summary in self.sealed.drain(..) {
            Segment::open(segment_path(&self.directory, &self.name, summary.segment_id))?.remove()?;
        }
        // Unlinking the current segment's path while its file is still open
        // is safe on unix: the directory entry goes away immediately, the
        // inode is reclaimed once `self.current` is dropped below.
        fs::remove_file(self.current.path())?;
        let header = Header {
            segment_id: 1,
            first_index,
            max_size: self.max_segment_size,
        };
        self.current = Segment::create(segment_path(&self.directory, &self.name, 1), header, self.preallocate)?;
        Ok(())
    }
}

fn discover(directory: &Path, name: &str) -> Result<Vec<u64>> {
    let mut ids = Vec::new();
    let prefix = format!("{name}-");
    for entry in fs::read_dir(directory)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let file_name = entry.file_name();
        let file_name = file_name.to_string_lossy();
        let Some(rest) = file_name.strip_prefix(prefix.as_str()).and_then(|s| s.strip_suffix(".log")) else {
            continue;
        };
        if let Ok(id) = rest.parse::<u64>() {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

fn segment_path(directory: &Path, name: &str, segment_id: u64) -> PathBuf {
    directory.join(Segment::filename(name, segment_id))
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::record;

    #[test]
    fn fresh_directory_creates_segment_one() {
        let dir = tempdir().unwrap();
        let mgr = SegmentsManager::open(dir.path().to_path_buf(), "j".into(), 4096, false).unwrap();
        assert_eq!(mgr.segment_count(), 1);
        assert_eq!(mgr.current().segment_id(), 1);
        assert_eq!(mgr.first_index(), 1);
        assert_eq!(mgr.last_index(), None);
    }

    #[test]
    fn roll_chains_first_index() {
        let dir = tempdir().unwrap();
        let mut mgr = SegmentsManager::open(dir.path().to_path_buf(), "j".into(), 4096, false).unwrap();
        mgr.current_mut().append(1, record::ASQN_IGNORE, b"a").unwrap();
        mgr.current_mut().append(2, record::ASQN_IGNORE, b"b").unwrap();
        mgr.create_next_segment().unwrap();
        assert_eq!(mgr.current().first_index(), 3);
        assert_eq!(mgr.segment_count(), 2);
    }

    #[test]
    fn reopen_discovers_segments_in_order() {
        let dir = tempdir().unwrap();
        {
            let mut mgr = SegmentsManager::open(dir.path().to_path_buf(), "j".into(), 4096, false).unwrap();
            mgr.current_mut().append(1, record::ASQN_IGNORE, b"a").unwrap();
            mgr.create_next_segment().unwrap();
            mgr.current_mut().append(2, record::ASQN_IGNORE, b"b").unwrap();
        }
        let mgr = SegmentsManager::open(dir.path().to_path_buf(), "j".into(), 4096, false).unwrap();
        assert_eq!(mgr.segment_count(), 2);
        assert_eq!(mgr.first_index(), 1);
        assert_eq!(mgr.last_index(), Some(2));
    }

    #[test]
    fn delete_until_keeps_current() {
        let dir = tempdir().unwrap();
        let mut mgr = SegmentsManager::open(dir.path().to_path_buf(), "j".into(), 4096, false).unwrap();
        mgr.current_mut().append(1, record::ASQN_IGNORE, b"a").unwrap();
        mgr.create_next_segment().unwrap();
        mgr.current_mut().append(2, record::ASQN_IGNORE, b"b").unwrap();

        mgr.delete_until(2).unwrap();
        assert_eq!(mgr.sealed_count(), 0);
        assert_eq!(mgr.segment_count(), 1);
    }

    #[test]
    fn truncate_after_drops_later_segments_and_trims_the_cut_one() {
        let dir = tempdir().unwrap();
        let mut mgr = SegmentsManager::open(dir.path().to_path_buf(), "j".into(), 4096, false).unwrap();
        mgr.current_mut().append(1, record::ASQN_IGNORE, b"a").unwrap();
        mgr.current_mut().append(2, record::ASQN_IGNORE, b"b").unwrap();
        mgr.create_next_segment().unwrap();
        mgr.current_mut().append(3, record::ASQN_IGNORE, b"c").unwrap();
        mgr.create_next_segment().unwrap();
        mgr.current_mut().append(4, record::ASQN_IGNORE, b"d").unwrap();

        mgr.truncate_after(2).unwrap();

        assert_eq!(mgr.segment_count(), 1);
        assert_eq!(mgr.current().segment_id(), 1);
        assert_eq!(mgr.last_index(), Some(2));
    }

    #[test]
    fn truncate_after_is_a_noop_when_nothing_is_beyond_the_cut() {
        let dir = tempdir().unwrap();
        let mut mgr = SegmentsManager::open(dir.path().to_path_buf(), "j".into(), 4096, false).unwrap();
        mgr.current_mut().append(1, record::ASQN_IGNORE, b"a").unwrap();

        mgr.truncate_after(5).unwrap();

        assert_eq!(mgr.last_index(), Some(1));
    }

    #[test]
    fn reset_drops_all_segments() {
        let dir = tempdir().unwrap();
        let mut mgr = SegmentsManager::open(dir.path().to_path_buf(), "j".into(), 4096, false).unwrap();
        mgr.current_mut().append(1, record::ASQN_IGNORE, b"a").unwrap();
        mgr.create_next_segment().unwrap();
        mgr.current_mut().append(2, record::ASQN_IGNORE, b"b").unwrap();

        mgr.reset(100).unwrap();
        assert_eq!(mgr.segment_count(), 1);
        assert_eq!(mgr.first_index(), 100);
        assert_eq!(mgr.last_index(), None);
    }
}
