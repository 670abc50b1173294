use crate::schema::RecordKey;
use serde::Serialize;

/// A record that did not make it into the index
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordFailure {
    pub key: RecordKey,
    pub id: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BatchStatus {
    /// Submitted; individual records may still have failed
    Indexed,
    /// Nothing left to submit after policy and serialization
    Empty,
    /// The bulk call failed after all retries
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchReport {
    /// Position of the batch in the run, from 0
    pub sequence: usize,
    pub first_key: RecordKey,
    pub last_key: RecordKey,
    /// Records fetched from the source
    pub records: usize,
    /// Operations sent to the backend
    pub submitted: usize,
    pub indexed: usize,
    /// Records excluded by the should-index policy
    pub skipped: usize,
    pub failed: usize,
    #[serde(flatten)]
    pub status: BatchStatus,
}

impl BatchReport {
    pub fn is_failed(&self) -> bool {
        matches!(self.status, BatchStatus::Failed { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PruneSkip {
    /// The descriptor opts out of pruning
    Disabled,
    Cancelled,
    /// The record source failed, so the produced id set is incomplete
    SourceFailed,
    /// Only the schema was updated
    SchemaOnly,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "prune", rename_all = "snake_case")]
pub enum PruneOutcome {
    Skipped { reason: PruneSkip },
    Completed { deleted: u64 },
    Failed { deleted: u64, error: String },
}

/// Outcome of one reindex run.
///
/// Every failed batch and every failed record is listed; nothing is
/// dropped silently.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexReport {
    pub index: String,
    pub doc_type: String,
    pub batches: Vec<BatchReport>,
    pub record_failures: Vec<RecordFailure>,
    pub indexed: u64,
    pub skipped: u64,
    pub failed: u64,
    pub prune: PruneOutcome,
    /// Stopped early at a batch boundary
    pub cancelled: bool,
    pub source_error: Option<String>,
    pub elapsed_ms: u64,
}

impl IndexReport {
    pub fn new(index: impl Into<String>, doc_type: impl Into<String>) -> Self {
        Self {
            index: index.into(),
            doc_type: doc_type.into(),
            batches: Vec::new(),
            record_failures: Vec::new(),
            indexed: 0,
            skipped: 0,
            failed: 0,
            prune: PruneOutcome::Skipped {
                reason: PruneSkip::SchemaOnly,
            },
            cancelled: false,
            source_error: None,
            elapsed_ms: 0,
        }
    }

    pub fn failed_batches(&self) -> impl Iterator<Item = &BatchReport> {
        self.batches.iter().filter(|b| b.is_failed())
    }

    pub fn pruned(&self) -> u64 {
        match self.prune {
            PruneOutcome::Completed { deleted } | PruneOutcome::Failed { deleted, .. } => deleted,
            PruneOutcome::Skipped { .. } => 0,
        }
    }

    /// Ran to the end with no failure of any kind
    pub fn is_complete(&self) -> bool {
        !self.cancelled
            && self.source_error.is_none()
            && self.record_failures.is_empty()
            && self.failed_batches().next().is_none()
            && !matches!(self.prune, PruneOutcome::Failed { .. })
    }
}

/// One descriptor's run within a registry-wide reindex
#[derive(Debug)]
pub struct DescriptorReindex {
    pub index: String,
    pub doc_type: String,
    pub result: crate::error::Result<IndexReport>,
}

impl DescriptorReindex {
    pub fn report(&self) -> Option<&IndexReport> {
        self.result.as_ref().ok()
    }
}
