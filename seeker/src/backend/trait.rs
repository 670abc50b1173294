use crate::dsl::{BulkOperation, SearchRequest};
use crate::error::BackendError;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

/// An item of a bulk write the backend refused
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BulkItemFailure {
    pub id: String,
    pub status: u16,
    pub reason: String,
}

/// Result of a bulk write that reached the backend.
///
/// The call itself succeeded; individual items may still have failed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BulkOutcome {
    pub failures: Vec<BulkItemFailure>,
}

impl BulkOutcome {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    pub source: Value,
    /// First highlighted fragment per field. Only fields with a match appear.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub highlight: BTreeMap<String, String>,
}

impl SearchHit {
    pub fn new(id: impl Into<String>, score: Option<f64>, source: Value) -> Self {
        Self {
            id: id.into(),
            score,
            source,
            highlight: BTreeMap::new(),
        }
    }

    /// The highlighted fragment of `field`, else its stored text
    pub fn highlighted(&self, field: &str) -> Option<&str> {
        self.highlight
            .get(field)
            .map(String::as_str)
            .or_else(|| self.source.get(field).and_then(Value::as_str))
    }

    /// Score as a percentage of the best score in the response.
    ///
    /// 0 when either score is missing or the best score is not positive.
    pub fn percentile(&self, max_score: Option<f64>) -> f64 {
        match (self.score, max_score) {
            (Some(score), Some(max)) if max > 0.0 => score / max * 100.0,
            _ => 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResponse {
    pub total: u64,
    /// Best relevance score among all matches, when the backend scored them
    pub max_score: Option<f64>,
    pub hits: Vec<SearchHit>,
    /// Raw `aggregations` object, parsed by the facet layer
    pub aggregations: Value,
}

/// A search engine the pipeline and query executor talk to
#[async_trait]
pub trait IndexBackend: Send + Sync {
    /// Short name for logs and metrics
    fn name(&self) -> &str;

    /// Create the index with this mapping, or merge the mapping into an
    /// existing index
    async fn ensure_index(&self, index: &str, mapping: &Value) -> Result<(), BackendError>;

    /// Delete the index. A missing index is not an error.
    async fn drop_index(&self, index: &str) -> Result<(), BackendError>;

    /// Apply upserts and deletes. Deleting a missing document succeeds.
    async fn bulk(&self, operations: &[BulkOperation]) -> Result<BulkOutcome, BackendError>;

    /// Ids of every document of `doc_type` in the index
    async fn document_ids(&self, index: &str, doc_type: &str)
        -> Result<HashSet<String>, BackendError>;

    async fn search(&self, request: &SearchRequest) -> Result<SearchResponse, BackendError>;

    /// Make recent writes visible to search
    async fn refresh(&self, index: &str) -> Result<(), BackendError>;
}
