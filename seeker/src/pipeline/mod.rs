//! Indexing pipeline
//!
//! Streams records out of a descriptor's source in keyset batches, writes
//! them to the backend and prunes documents whose record no longer exists.
//! Single records are indexed and deleted through the same descriptor.

pub mod progress;
pub mod report;

pub use progress::{LogProgress, NoProgress, ProgressSink};
pub use report::{
    BatchReport, BatchStatus, DescriptorReindex, IndexReport, PruneOutcome, PruneSkip,
    RecordFailure,
};

use crate::backend::{BulkOutcome, IndexBackend};
use crate::config::{RetryConfig, SeekerConfig};
use crate::dsl::BulkOperation;
use crate::error::{BackendError, Error, Result};
use crate::metrics;
use crate::registry::Registry;
use crate::retry::with_retry;
use crate::schema::{DocumentDescriptor, Record, RecordKey};
use futures::stream::{FuturesOrdered, StreamExt};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct ReindexOptions {
    /// Delete the index before recreating it
    pub drop_index: bool,
    /// Only create the index and apply the mapping
    pub schema_only: bool,
    /// Refresh the index once the run is done
    pub refresh: bool,
    pub cancel: Option<CancellationToken>,
}

impl Default for ReindexOptions {
    fn default() -> Self {
        Self {
            drop_index: false,
            schema_only: false,
            refresh: true,
            cancel: None,
        }
    }
}

impl ReindexOptions {
    pub fn drop_index(mut self, drop: bool) -> Self {
        self.drop_index = drop;
        self
    }

    pub fn schema_only(mut self, schema_only: bool) -> Self {
        self.schema_only = schema_only;
        self
    }

    pub fn refresh(mut self, refresh: bool) -> Self {
        self.refresh = refresh;
        self
    }

    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|t| t.is_cancelled())
    }
}

/// What a single-record write did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOutcome {
    Indexed,
    /// Excluded by the should-index policy, so its document was deleted
    Removed,
}

/// Bookkeeping for a batch while its bulk call is in flight
struct BatchMeta {
    sequence: usize,
    first_key: RecordKey,
    last_key: RecordKey,
    records: usize,
    submitted: usize,
    skipped: usize,
    record_failures: usize,
    keys_by_id: HashMap<String, RecordKey>,
}

struct Submission {
    result: std::result::Result<BulkOutcome, BackendError>,
    elapsed: Duration,
}

pub struct Indexer {
    backend: Arc<dyn IndexBackend>,
    retry: RetryConfig,
    timeout: Duration,
    max_concurrent_batches: usize,
    timestamp_index: Option<String>,
    doc_locks: DocLocks,
}

type DocLocks = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

/// A caller's claim on one document's write lock.
///
/// Dropping it, including when the owning future is cancelled, forgets
/// the map entry once no other caller holds or waits on it. The count is
/// checked under the map lock, where new claims are made.
struct DocLock<'a> {
    locks: &'a DocLocks,
    key: String,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl<'a> DocLock<'a> {
    fn claim(locks: &'a DocLocks, key: String) -> Self {
        let lock = locks.lock().entry(key.clone()).or_default().clone();
        Self { locks, key, lock }
    }

    async fn acquire(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.lock.lock().await
    }
}

impl Drop for DocLock<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock();
        // Only the map and this claim left
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.key);
        }
    }
}

impl Indexer {
    pub fn new(backend: Arc<dyn IndexBackend>, config: &SeekerConfig) -> Self {
        Self {
            backend,
            retry: config.retry.clone(),
            timeout: config.request_timeout(),
            max_concurrent_batches: config.max_concurrent_batches.max(1),
            timestamp_index: config
                .update_timestamp_index
                .then(|| config.timestamp_index_name.clone()),
            doc_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn backend(&self) -> &Arc<dyn IndexBackend> {
        &self.backend
    }

    pub async fn reindex(
        &self,
        descriptor: &DocumentDescriptor,
        progress: &dyn ProgressSink,
    ) -> Result<IndexReport> {
        self.reindex_with(descriptor, ReindexOptions::default(), progress)
            .await
    }

    /// Rebuild the descriptor's documents from its record source.
    ///
    /// Failing to prepare the index is an error; everything after that
    /// (source failures, failed batches, failed records) is reported in the
    /// returned `IndexReport`.
    pub async fn reindex_with(
        &self,
        descriptor: &DocumentDescriptor,
        options: ReindexOptions,
        progress: &dyn ProgressSink,
    ) -> Result<IndexReport> {
        let start = Instant::now();
        let index = descriptor.index_name();
        let doc_type = descriptor.doc_type();
        info!(index, doc_type, drop = options.drop_index, "Starting reindex");

        if options.drop_index {
            self.call("drop_index", || self.backend.drop_index(index))
                .await?;
        }
        let mapping = descriptor.mapping();
        self.call("ensure_index", || self.backend.ensure_index(index, &mapping))
            .await?;

        let mut report = IndexReport::new(index, doc_type);
        if options.schema_only {
            report.elapsed_ms = start.elapsed().as_millis() as u64;
            progress.on_finish(&report);
            return Ok(report);
        }

        let total = match descriptor.source().count().await {
            Ok(total) => Some(total),
            Err(e) => {
                warn!(index, doc_type, error = %e, "Could not count records");
                None
            }
        };
        progress.on_start(descriptor, total);

        let mut produced: HashSet<String> = HashSet::new();
        let mut in_flight = FuturesOrdered::new();
        let mut last_key: Option<RecordKey> = None;
        let mut sequence = 0;

        loop {
            if options.is_cancelled() {
                info!(index, doc_type, batches = sequence, "Reindex cancelled");
                report.cancelled = true;
                break;
            }

            let records = match descriptor
                .source()
                .fetch_after(last_key, descriptor.batch_size())
                .await
            {
                Ok(records) => records,
                Err(e) => {
                    error!(index, doc_type, error = %e, "Record source failed");
                    report.source_error = Some(e.to_string());
                    break;
                }
            };
            if records.is_empty() {
                break;
            }

            let mut records: Vec<_> = records
                .into_iter()
                .filter(|r| last_key.map_or(true, |k| r.key() > k))
                .collect();
            if records.is_empty() {
                let message = format!("record source did not advance past key {:?}", last_key);
                error!(index, doc_type, "{}", message);
                report.source_error = Some(message);
                break;
            }
            records.sort_by_key(|r| r.key());
            last_key = records.last().map(|r| r.key());

            let (meta, ops) =
                prepare_batch(descriptor, sequence, &records, &mut produced, &mut report);
            debug!(
                index,
                batch = sequence,
                records = meta.records,
                submitted = meta.submitted,
                "Submitting batch"
            );
            let handle = tokio::spawn(submit_batch(
                self.backend.clone(),
                self.retry.clone(),
                self.timeout,
                ops,
            ));
            in_flight.push_back(join_batch(meta, handle));
            sequence += 1;

            while in_flight.len() >= self.max_concurrent_batches {
                match in_flight.next().await {
                    Some((meta, joined)) => {
                        self.finish_batch(index, meta, joined, &mut report, progress)
                    }
                    None => break,
                }
            }
        }

        // Every batch must land before the produced id set is trusted
        while let Some((meta, joined)) = in_flight.next().await {
            self.finish_batch(index, meta, joined, &mut report, progress);
        }

        report.prune = if report.cancelled {
            PruneOutcome::Skipped {
                reason: PruneSkip::Cancelled,
            }
        } else if report.source_error.is_some() {
            PruneOutcome::Skipped {
                reason: PruneSkip::SourceFailed,
            }
        } else if !descriptor.prune_on_reindex() {
            PruneOutcome::Skipped {
                reason: PruneSkip::Disabled,
            }
        } else {
            self.prune(descriptor, &produced).await
        };

        if options.refresh && !report.cancelled {
            if let Err(e) = self.call("refresh", || self.backend.refresh(index)).await {
                warn!(index, error = %e, "Refresh after reindex failed");
            }
        }
        if report.indexed > 0 || report.pruned() > 0 {
            self.touch_timestamp(index).await;
        }

        report.elapsed_ms = start.elapsed().as_millis() as u64;
        info!(
            index,
            doc_type,
            indexed = report.indexed,
            skipped = report.skipped,
            failed = report.failed,
            pruned = report.pruned(),
            elapsed_ms = report.elapsed_ms,
            "Reindex finished"
        );
        progress.on_finish(&report);
        Ok(report)
    }

    /// Reindex every descriptor in the registry, or in one namespace.
    ///
    /// With `drop_index`, each distinct index is dropped once up front so
    /// descriptors sharing an index don't wipe each other's documents; a
    /// failed drop aborts before anything is written. A descriptor that
    /// fails after that is reported and the rest still run.
    pub async fn reindex_all(
        &self,
        registry: &Registry,
        namespace: Option<&str>,
        options: ReindexOptions,
        progress: &dyn ProgressSink,
    ) -> Result<Vec<DescriptorReindex>> {
        let descriptors = match namespace {
            Some(ns) => registry.namespace(ns),
            None => registry.all(),
        };

        if options.drop_index {
            let mut dropped = HashSet::new();
            for descriptor in &descriptors {
                let index = descriptor.index_name();
                if dropped.insert(index.to_string()) {
                    self.call("drop_index", || self.backend.drop_index(index))
                        .await?;
                }
            }
        }

        let per_descriptor = ReindexOptions {
            drop_index: false,
            ..options.clone()
        };
        let mut runs = Vec::with_capacity(descriptors.len());
        for descriptor in &descriptors {
            if options.is_cancelled() {
                break;
            }
            let result = self
                .reindex_with(descriptor, per_descriptor.clone(), progress)
                .await;
            if let Err(e) = &result {
                error!(
                    index = descriptor.index_name(),
                    doc_type = descriptor.doc_type(),
                    error = %e,
                    "Reindex of descriptor failed"
                );
            }
            runs.push(DescriptorReindex {
                index: descriptor.index_name().to_string(),
                doc_type: descriptor.doc_type().to_string(),
                result,
            });
        }
        Ok(runs)
    }

    /// Write one record's document, or delete it if the record is excluded
    /// by the should-index policy.
    pub async fn index(
        &self,
        descriptor: &DocumentDescriptor,
        record: &dyn Record,
    ) -> Result<IndexOutcome> {
        let index = descriptor.index_name();
        let id = descriptor.get_id(record);
        let (op, outcome) = if descriptor.should_index(record) {
            let payload = descriptor.serialize(record)?;
            (
                BulkOperation::Upsert {
                    id: id.clone(),
                    index: index.to_string(),
                    payload,
                },
                IndexOutcome::Indexed,
            )
        } else {
            (
                BulkOperation::Delete {
                    id: id.clone(),
                    index: index.to_string(),
                },
                IndexOutcome::Removed,
            )
        };

        self.write_one(index, &id, op).await?;
        debug!(index, id = %id, outcome = ?outcome, "Indexed record");
        Ok(outcome)
    }

    /// Delete one record's document. A missing document is not an error.
    pub async fn delete(&self, descriptor: &DocumentDescriptor, record: &dyn Record) -> Result<()> {
        let index = descriptor.index_name();
        let id = descriptor.get_id(record);
        let op = BulkOperation::Delete {
            id: id.clone(),
            index: index.to_string(),
        };
        self.write_one(index, &id, op).await?;
        debug!(index, id = %id, "Deleted record");
        Ok(())
    }

    /// Apply one operation while holding the document's lock, so writes
    /// to the same document reach the backend in call order.
    async fn write_one(&self, index: &str, id: &str, op: BulkOperation) -> Result<()> {
        let claim = DocLock::claim(&self.doc_locks, format!("{}/{}", index, id));
        let result = {
            let _guard = claim.acquire().await;
            let ops = [op];
            self.call("bulk", || self.backend.bulk(&ops)).await
        };
        drop(claim);

        let outcome = result?;
        if let Some(failure) = outcome.failures.into_iter().next() {
            metrics::record_records_failed(index, 1);
            return Err(Error::Backend(BackendError::Rejected {
                status: failure.status,
                reason: failure.reason,
            }));
        }
        self.touch_timestamp(index).await;
        Ok(())
    }

    fn finish_batch(
        &self,
        index: &str,
        meta: BatchMeta,
        joined: std::result::Result<Submission, JoinError>,
        report: &mut IndexReport,
        progress: &dyn ProgressSink,
    ) {
        let (status, indexed, item_failures, elapsed) = match joined {
            Ok(Submission {
                result: Ok(outcome),
                elapsed,
            }) => {
                let failures: Vec<RecordFailure> = outcome
                    .failures
                    .into_iter()
                    .map(|f| RecordFailure {
                        key: meta.keys_by_id.get(&f.id).copied().unwrap_or_default(),
                        error: format!("rejected ({}): {}", f.status, f.reason),
                        id: f.id,
                    })
                    .collect();
                let status = if meta.submitted == 0 {
                    BatchStatus::Empty
                } else {
                    BatchStatus::Indexed
                };
                let indexed = meta.submitted - failures.len().min(meta.submitted);
                (status, indexed, failures, elapsed)
            }
            Ok(Submission {
                result: Err(e),
                elapsed,
            }) => (
                BatchStatus::Failed {
                    error: e.to_string(),
                },
                0,
                Vec::new(),
                elapsed,
            ),
            Err(e) => (
                BatchStatus::Failed {
                    error: format!("batch task failed: {}", e),
                },
                0,
                Vec::new(),
                Duration::ZERO,
            ),
        };

        let failed = match status {
            BatchStatus::Failed { .. } => meta.submitted + meta.record_failures,
            _ => item_failures.len() + meta.record_failures,
        };
        if let BatchStatus::Failed { error } = &status {
            error!(
                index,
                batch = meta.sequence,
                first_key = meta.first_key,
                last_key = meta.last_key,
                error = %error,
                "Batch failed"
            );
        }
        if meta.submitted > 0 {
            metrics::record_batch(index, !matches!(status, BatchStatus::Failed { .. }), elapsed);
        }
        metrics::record_documents_indexed(index, indexed as u64);
        metrics::record_records_failed(index, (failed - meta.record_failures) as u64);

        report.indexed += indexed as u64;
        report.failed += (failed - meta.record_failures) as u64;
        report.record_failures.extend(item_failures);

        let batch = BatchReport {
            sequence: meta.sequence,
            first_key: meta.first_key,
            last_key: meta.last_key,
            records: meta.records,
            submitted: meta.submitted,
            indexed,
            skipped: meta.skipped,
            failed,
            status,
        };
        progress.on_batch(&batch);
        report.batches.push(batch);
    }

    async fn prune(&self, descriptor: &DocumentDescriptor, produced: &HashSet<String>) -> PruneOutcome {
        let index = descriptor.index_name();
        let doc_type = descriptor.doc_type();
        let existing = match self
            .call("document_ids", || self.backend.document_ids(index, doc_type))
            .await
        {
            Ok(ids) => ids,
            Err(e) => {
                error!(index, doc_type, error = %e, "Could not list documents to prune");
                return PruneOutcome::Failed {
                    deleted: 0,
                    error: e.to_string(),
                };
            }
        };

        let mut stale: Vec<String> = existing.difference(produced).cloned().collect();
        stale.sort();
        if stale.is_empty() {
            return PruneOutcome::Completed { deleted: 0 };
        }

        let mut deleted = 0u64;
        for chunk in stale.chunks(descriptor.batch_size()) {
            let ops: Vec<BulkOperation> = chunk
                .iter()
                .map(|id| BulkOperation::Delete {
                    id: id.clone(),
                    index: index.to_string(),
                })
                .collect();
            match self.call("bulk", || self.backend.bulk(&ops)).await {
                Ok(outcome) => {
                    deleted += (ops.len() - outcome.failures.len().min(ops.len())) as u64;
                    if let Some(failure) = outcome.failures.first() {
                        warn!(
                            index,
                            id = %failure.id,
                            failures = outcome.failures.len(),
                            "Some stale documents could not be deleted"
                        );
                    }
                }
                Err(e) => {
                    error!(index, doc_type, deleted, error = %e, "Prune failed");
                    metrics::record_documents_pruned(index, deleted);
                    return PruneOutcome::Failed {
                        deleted,
                        error: e.to_string(),
                    };
                }
            }
        }

        info!(index, doc_type, deleted, "Pruned stale documents");
        metrics::record_documents_pruned(index, deleted);
        PruneOutcome::Completed { deleted }
    }

    /// Record the last write to `index`. Failures are only logged.
    async fn touch_timestamp(&self, index: &str) {
        let Some(timestamp_index) = &self.timestamp_index else {
            return;
        };
        let ops = [BulkOperation::Upsert {
            id: index.to_string(),
            index: timestamp_index.clone(),
            payload: json!({
                "index_name": index,
                "last_access": chrono::Utc::now().to_rfc3339(),
            }),
        }];
        match self.call("bulk", || self.backend.bulk(&ops)).await {
            Ok(outcome) if outcome.is_success() => {}
            Ok(outcome) => warn!(
                index,
                timestamp_index = %timestamp_index,
                failures = outcome.failures.len(),
                "Timestamp update rejected"
            ),
            Err(e) => warn!(
                index,
                timestamp_index = %timestamp_index,
                error = %e,
                "Timestamp update failed"
            ),
        }
    }

    async fn call<F, Fut, T>(&self, operation: &str, call: F) -> std::result::Result<T, BackendError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, BackendError>>,
    {
        with_retry(operation, &self.retry, self.timeout, call).await
    }
}

/// Turn fetched records into bulk operations.
///
/// Ids of records that fail to serialize still go into `produced`: their
/// existing documents stay until a later run can rewrite them.
fn prepare_batch(
    descriptor: &DocumentDescriptor,
    sequence: usize,
    records: &[Arc<dyn Record>],
    produced: &mut HashSet<String>,
    report: &mut IndexReport,
) -> (BatchMeta, Vec<BulkOperation>) {
    let index = descriptor.index_name();
    let mut ops = Vec::with_capacity(records.len());
    let mut keys_by_id = HashMap::with_capacity(records.len());
    let mut skipped = 0;
    let mut record_failures = 0;

    for record in records {
        if !descriptor.should_index(record.as_ref()) {
            skipped += 1;
            continue;
        }
        let id = descriptor.get_id(record.as_ref());
        produced.insert(id.clone());
        match descriptor.serialize(record.as_ref()) {
            Ok(payload) => {
                keys_by_id.insert(id.clone(), record.key());
                ops.push(BulkOperation::Upsert {
                    id,
                    index: index.to_string(),
                    payload,
                });
            }
            Err(e) => {
                warn!(index, key = record.key(), id = %id, error = %e, "Record skipped");
                record_failures += 1;
                report.record_failures.push(RecordFailure {
                    key: record.key(),
                    id,
                    error: e.to_string(),
                });
            }
        }
    }

    report.skipped += skipped as u64;
    report.failed += record_failures as u64;
    if record_failures > 0 {
        metrics::record_records_failed(index, record_failures as u64);
    }

    let meta = BatchMeta {
        sequence,
        first_key: records.first().map(|r| r.key()).unwrap_or_default(),
        last_key: records.last().map(|r| r.key()).unwrap_or_default(),
        records: records.len(),
        submitted: ops.len(),
        skipped,
        record_failures,
        keys_by_id,
    };
    (meta, ops)
}

async fn submit_batch(
    backend: Arc<dyn IndexBackend>,
    retry: RetryConfig,
    timeout: Duration,
    ops: Vec<BulkOperation>,
) -> Submission {
    let start = Instant::now();
    let result = if ops.is_empty() {
        Ok(BulkOutcome::default())
    } else {
        with_retry("bulk", &retry, timeout, || backend.bulk(&ops)).await
    };
    Submission {
        result,
        elapsed: start.elapsed(),
    }
}

async fn join_batch(
    meta: BatchMeta,
    handle: JoinHandle<Submission>,
) -> (BatchMeta, std::result::Result<Submission, JoinError>) {
    let joined = handle.await;
    (meta, joined)
}
