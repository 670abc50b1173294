//! Change notifications from the record store
//!
//! The host application forwards save and delete events here; nothing
//! subscribes on its own.

use crate::error::Error;
use crate::pipeline::{IndexOutcome, Indexer};
use crate::registry::Registry;
use crate::schema::{Record, RecordKey};
use std::sync::Arc;
use tracing::{debug, error};

#[derive(Clone)]
pub enum ChangeEvent {
    Saved {
        record_type: String,
        record: Arc<dyn Record>,
    },
    Deleted {
        record_type: String,
        record: Arc<dyn Record>,
    },
}

impl ChangeEvent {
    pub fn saved(record_type: impl Into<String>, record: Arc<dyn Record>) -> Self {
        ChangeEvent::Saved {
            record_type: record_type.into(),
            record,
        }
    }

    pub fn deleted(record_type: impl Into<String>, record: Arc<dyn Record>) -> Self {
        ChangeEvent::Deleted {
            record_type: record_type.into(),
            record,
        }
    }

    pub fn record_type(&self) -> &str {
        match self {
            ChangeEvent::Saved { record_type, .. } | ChangeEvent::Deleted { record_type, .. } => {
                record_type
            }
        }
    }

    pub fn record(&self) -> &Arc<dyn Record> {
        match self {
            ChangeEvent::Saved { record, .. } | ChangeEvent::Deleted { record, .. } => record,
        }
    }
}

impl std::fmt::Debug for ChangeEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            ChangeEvent::Saved { .. } => "Saved",
            ChangeEvent::Deleted { .. } => "Deleted",
        };
        f.debug_struct(kind)
            .field("record_type", &self.record_type())
            .field("key", &self.record().key())
            .finish()
    }
}

/// What happened to one descriptor's document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOutcome {
    Indexed,
    Removed,
    Deleted,
}

#[derive(Debug)]
pub struct DescriptorResult {
    pub index: String,
    pub doc_type: String,
    pub key: RecordKey,
    pub outcome: Result<ChangeOutcome, Error>,
}

pub struct ChangeListener {
    registry: Arc<Registry>,
    indexer: Arc<Indexer>,
}

impl ChangeListener {
    pub fn new(registry: Arc<Registry>, indexer: Arc<Indexer>) -> Self {
        Self { registry, indexer }
    }

    /// Apply an event to every descriptor registered for its record type.
    ///
    /// Failures are logged and returned per descriptor; one failing
    /// descriptor does not stop the others.
    pub async fn handle(&self, event: &ChangeEvent) -> Vec<DescriptorResult> {
        let descriptors = self.registry.for_record_type(event.record_type());
        if descriptors.is_empty() {
            debug!(record_type = event.record_type(), "No descriptor for change event");
        }

        let record = event.record().as_ref();
        let mut results = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            let outcome = match event {
                ChangeEvent::Saved { .. } => {
                    self.indexer
                        .index(&descriptor, record)
                        .await
                        .map(|outcome| match outcome {
                            IndexOutcome::Indexed => ChangeOutcome::Indexed,
                            IndexOutcome::Removed => ChangeOutcome::Removed,
                        })
                }
                ChangeEvent::Deleted { .. } => self
                    .indexer
                    .delete(&descriptor, record)
                    .await
                    .map(|()| ChangeOutcome::Deleted),
            };
            if let Err(e) = &outcome {
                error!(
                    record_type = event.record_type(),
                    index = descriptor.index_name(),
                    record = record.key(),
                    error = %e,
                    "Failed to apply change event"
                );
            }
            results.push(DescriptorResult {
                index: descriptor.index_name().to_string(),
                doc_type: descriptor.doc_type().to_string(),
                key: record.key(),
                outcome,
            });
        }
        results
    }
}
