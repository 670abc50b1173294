//! Indexing and query metrics
//!
//! Recorded through the `metrics` facade; installing an exporter is up
//! to the host application. Covers:
//! - Documents indexed, failed and pruned per index
//! - Batch submissions, failures and duration
//! - Backend call retries
//! - Query duration and errors

use std::time::{Duration, Instant};

/// Record documents written by one batch
pub fn record_documents_indexed(index: &str, count: u64) {
    metrics::counter!(
        "seeker_documents_indexed_total",
        "index" => index.to_string(),
    )
    .increment(count);
}

/// Record records that could not be indexed
pub fn record_records_failed(index: &str, count: u64) {
    metrics::counter!(
        "seeker_records_failed_total",
        "index" => index.to_string(),
    )
    .increment(count);
}

/// Record stale documents deleted after a reindex
pub fn record_documents_pruned(index: &str, count: u64) {
    metrics::counter!(
        "seeker_documents_pruned_total",
        "index" => index.to_string(),
    )
    .increment(count);
}

/// Record a batch submission and its duration
pub fn record_batch(index: &str, ok: bool, duration: Duration) {
    metrics::counter!(
        "seeker_batches_total",
        "index" => index.to_string(),
        "status" => if ok { "ok" } else { "failed" },
    )
    .increment(1);

    metrics::histogram!(
        "seeker_batch_duration_seconds",
        "index" => index.to_string(),
    )
    .record(duration.as_secs_f64());
}

/// Record a retried backend call
pub fn record_retry(operation: &str) {
    metrics::counter!(
        "seeker_backend_retries_total",
        "operation" => operation.to_string(),
    )
    .increment(1);
}

/// Record query duration
pub fn record_query_duration(index: &str, duration: Duration) {
    metrics::histogram!(
        "seeker_query_duration_seconds",
        "index" => index.to_string(),
    )
    .record(duration.as_secs_f64());
}

/// Record a failed query
pub fn record_query_error(index: &str, error_type: &str) {
    metrics::counter!(
        "seeker_query_errors_total",
        "index" => index.to_string(),
        "error_type" => error_type.to_string(),
    )
    .increment(1);
}

/// Guard for timing queries
pub struct QueryTimer {
    index: String,
    start: Instant,
}

impl QueryTimer {
    pub fn new(index: &str) -> Self {
        Self {
            index: index.to_string(),
            start: Instant::now(),
        }
    }

    /// Record success and duration
    pub fn success(self) {
        record_query_duration(&self.index, self.start.elapsed());
    }

    /// Record error and duration
    pub fn error(self, error_type: &str) {
        record_query_duration(&self.index, self.start.elapsed());
        record_query_error(&self.index, error_type);
    }
}
