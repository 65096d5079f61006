//! Lock-free per-stream pipeline metrics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Per-stream counters updated from the publisher, spill and process tasks.
#[derive(Debug, Default)]
pub struct StreamMetrics {
    /// Records accepted into the stream queue.
    pub records_queued: AtomicU64,
    /// Bytes accepted into the stream queue.
    pub bytes_queued: AtomicU64,
    /// Records written to spool files.
    pub records_spooled: AtomicU64,
    /// Spool files written.
    pub batches_spooled: AtomicU64,
    /// Batches that reached `Persisted` or `Complete`.
    pub batches_persisted: AtomicU64,
    /// Records covered by persisted batches.
    pub records_persisted: AtomicU64,
    /// Destination calls made (`process_records` + `process_batch`).
    pub process_calls: AtomicU64,
}

impl StreamMetrics {
    /// Records one queued record.
    pub fn record_queued(&self, bytes: u64) {
        self.records_queued.fetch_add(1, Ordering::Relaxed);
        self.bytes_queued.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Records one spool file.
    pub fn record_spooled(&self, records: u64) {
        self.batches_spooled.fetch_add(1, Ordering::Relaxed);
        self.records_spooled.fetch_add(records, Ordering::Relaxed);
    }

    /// Records one destination call.
    pub fn record_process_call(&self) {
        self.process_calls.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one persisted batch.
    pub fn record_persisted(&self, records: u64) {
        self.batches_persisted.fetch_add(1, Ordering::Relaxed);
        self.records_persisted.fetch_add(records, Ordering::Relaxed);
    }

    /// Returns a snapshot of the current metrics.
    #[must_use]
    pub fn snapshot(&self) -> StreamMetricsSnapshot {
        StreamMetricsSnapshot {
            records_queued: self.records_queued.load(Ordering::Relaxed),
            bytes_queued: self.bytes_queued.load(Ordering::Relaxed),
            records_spooled: self.records_spooled.load(Ordering::Relaxed),
            batches_spooled: self.batches_spooled.load(Ordering::Relaxed),
            batches_persisted: self.batches_persisted.load(Ordering::Relaxed),
            records_persisted: self.records_persisted.load(Ordering::Relaxed),
            process_calls: self.process_calls.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time snapshot of [`StreamMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamMetricsSnapshot {
    /// Records accepted into the stream queue.
    pub records_queued: u64,
    /// Bytes accepted into the stream queue.
    pub bytes_queued: u64,
    /// Records written to spool files.
    pub records_spooled: u64,
    /// Spool files written.
    pub batches_spooled: u64,
    /// Batches that reached `Persisted` or `Complete`.
    pub batches_persisted: u64,
    /// Records covered by persisted batches.
    pub records_persisted: u64,
    /// Destination calls made.
    pub process_calls: u64,
}
