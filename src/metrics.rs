use std::time::Duration;

/// Observability hook consumed by [`crate::writer::JournalWriter`] and
/// [`crate::journal::Journal`].
///
/// The core never depends on a concrete metrics backend; callers wire up
/// their own implementation (Prometheus, StatsD, ...) and pass it to
/// [`crate::journal::Journal::open`].
pub trait MetricsSink: Send + Sync {
    /// Called after a successful `append`/`append_record`.
    fn record_append(&self, _bytes: usize, _latency: Duration) {}

    /// Called after a segment roll completes.
    fn observe_segment_roll(&self, _latency: Duration) {}

    /// Called after `delete_after`/`reset` truncate the journal.
    ///
    /// `blocking` indicates whether the call had to wait for in-flight
    /// readers to be rewound before returning.
    fn observe_segment_truncation(&self, _blocking: bool) {}

    /// Called whenever the number of on-disk segments changes.
    fn set_segment_count(&self, _count: usize) {}

    /// Called whenever `first_index` changes.
    fn set_first_index(&self, _index: u64) {}

    /// Called whenever `last_index` changes.
    fn set_last_index(&self, _index: i64) {}
}

/// Default [`MetricsSink`] that discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {}
