use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::segment;

/// Smallest `max_segment_size` that can hold the header plus one minimal frame.
const MIN_SEGMENT_SIZE: u64 = segment::HEADER_LEN as u64 + crate::record::HEADER_LEN as u64 + 1;

/// [`crate::journal::Journal`] configuration.
///
/// Construct via [`OptionsBuilder`], or start from [`Options::default`] and
/// override individual fields.
#[derive(Clone, Debug)]
pub struct Options {
    /// Filename prefix for this journal's segment files.
    pub name: String,
    /// Directory in which segment files are stored. Must exist and be writable.
    pub directory: PathBuf,
    /// Per-segment file size. Appends that would exceed the remaining space
    /// in the current segment trigger a roll to a new one.
    ///
    /// Default: 128 MiB.
    pub max_segment_size: u64,
    /// Minimum usable disk space, in bytes, required before a new segment is
    /// created. The writer's actual requirement is
    /// `max(max_segment_size * 3, min_free_disk_space)`.
    ///
    /// Default: 0 (only the `max_segment_size * 3` floor applies).
    pub min_free_disk_space: u64,
    /// If `true`, newly created segments are immediately sized to
    /// `max_segment_size` instead of growing on demand.
    ///
    /// Default: `false`.
    pub preallocate_segment_files: bool,
    /// On open, a hint used to discard uncommitted tail records: any record
    /// with an index strictly above this value is treated as not committed.
    ///
    /// Default: `None` (trust whatever a checksum-valid scan finds).
    pub last_written_index: Option<u64>,
    /// Number of records between sparse-index entries.
    ///
    /// Default: 64.
    pub index_stride: u64,
}

impl Options {
    /// Validate the combination of fields, as required once by
    /// [`crate::journal::Journal::open`].
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidOptions("name must not be empty".into()));
        }
        if self.max_segment_size < MIN_SEGMENT_SIZE {
            return Err(Error::InvalidOptions(format!(
                "max_segment_size must be at least {MIN_SEGMENT_SIZE} bytes"
            )));
        }
        if self.max_segment_size > u32::MAX as u64 {
            return Err(Error::InvalidOptions(format!(
                "max_segment_size must fit in a u32, got {}",
                self.max_segment_size
            )));
        }
        if self.index_stride == 0 {
            return Err(Error::InvalidOptions("index_stride must be at least 1".into()));
        }
        Ok(())
    }
}

impl Default for Options {
    fn default() -> Self {
        Self {
            name: "journal".to_string(),
            directory: PathBuf::new(),
            max_segment_size: 128 * 1024 * 1024,
            min_free_disk_space: 0,
            preallocate_segment_files: false,
            last_written_index: None,
            index_stride: 64,
        }
    }
}

/// Ergonomic builder for [`Options`].
#[derive(Clone, Debug)]
pub struct OptionsBuilder {
    opts: Options,
}

impl OptionsBuilder {
    pub fn new(name: impl Into<String>, directory: impl AsRef<Path>) -> Self {
        Self {
            opts: Options {
                name: name.into(),
                directory: directory.as_ref().to_path_buf(),
                ..Options::default()
            },
        }
    }

    pub fn max_segment_size(mut self, bytes: u64) -> Self {
        self.opts.max_segment_size = bytes;
        self
    }

    pub fn min_free_disk_space(mut self, bytes: u64) -> Self {
        self.opts.min_free_disk_space = bytes;
        self
    }

    pub fn preallocate_segment_files(mut self, yes: bool) -> Self {
        self.opts.preallocate_segment_files = yes;
        self
    }

    pub fn last_written_index(mut self, index: u64) -> Self {
        self.opts.last_written_index = Some(index);
        self
    }

    pub fn index_stride(mut self, stride: u64) -> Self {
        self.opts.index_stride = stride;
        self
    }

    pub fn build(self) -> Result<Options> {
        self.opts.validate()?;
        Ok(self.opts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_name() {
        let opts = OptionsBuilder::new("", ".").build();
        assert!(matches!(opts, Err(Error::InvalidOptions(_))));
    }

    #[test]
    fn rejects_tiny_segment_size() {
        let opts = OptionsBuilder::new("j", ".").max_segment_size(8).build();
        assert!(matches!(opts, Err(Error::InvalidOptions(_))));
    }

    #[test]
    fn rejects_zero_stride() {
        let opts = OptionsBuilder::new("j", ".").index_stride(0).build();
        assert!(matches!(opts, Err(Error::InvalidOptions(_))));
    }

    #[test]
    fn builder_defaults_match_default() {
        let built = OptionsBuilder::new("journal", "").build().unwrap();
        let default = Options {
            directory: PathBuf::new(),
            ..Options::default()
        };
        assert_eq!(built.name, default.name);
        assert_eq!(built.max_segment_size, default.max_segment_size);
        assert_eq!(built.index_stride, default.index_stride);
    }
}
