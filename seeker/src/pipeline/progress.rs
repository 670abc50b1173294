use super::report::{BatchReport, IndexReport};
use crate::schema::DocumentDescriptor;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Receives progress of a reindex run
pub trait ProgressSink: Send + Sync {
    /// `total` is the source's record count, when it could be read
    fn on_start(&self, _descriptor: &DocumentDescriptor, _total: Option<u64>) {}

    fn on_batch(&self, _batch: &BatchReport) {}

    fn on_finish(&self, _report: &IndexReport) {}
}

/// Discards progress
pub struct NoProgress;

impl ProgressSink for NoProgress {}

/// Logs progress through `tracing`
pub struct LogProgress {
    total: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    start: Mutex<Option<Instant>>,
}

impl Default for LogProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl LogProgress {
    pub fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            start: Mutex::new(None),
        }
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

impl ProgressSink for LogProgress {
    fn on_start(&self, descriptor: &DocumentDescriptor, total: Option<u64>) {
        self.total.store(total.unwrap_or(0), Ordering::Relaxed);
        self.processed.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
        *self.start.lock() = Some(Instant::now());
        info!(
            index = descriptor.index_name(),
            doc_type = descriptor.doc_type(),
            total = total,
            "Reindex started"
        );
    }

    fn on_batch(&self, batch: &BatchReport) {
        let processed =
            self.processed.fetch_add(batch.records as u64, Ordering::Relaxed) + batch.records as u64;
        self.failed.fetch_add(batch.failed as u64, Ordering::Relaxed);
        let total = self.total.load(Ordering::Relaxed);
        let percent = if total > 0 {
            (processed as f64 / total as f64 * 100.0).min(100.0)
        } else {
            0.0
        };
        let percent = format!("{:.1}", percent);
        info!(
            batch = batch.sequence,
            processed,
            total,
            percent = %percent,
            failed = batch.failed,
            "Batch done"
        );
    }

    fn on_finish(&self, report: &IndexReport) {
        let start = *self.start.lock();
        let elapsed = format!("{:.1}", start.map(|s| s.elapsed().as_secs_f64()).unwrap_or(0.0));
        info!(
            index = %report.index,
            doc_type = %report.doc_type,
            indexed = report.indexed,
            failed = self.failed(),
            pruned = report.pruned(),
            cancelled = report.cancelled,
            elapsed_secs = %elapsed,
            "Reindex finished"
        );
    }
}
