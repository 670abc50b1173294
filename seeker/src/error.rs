use crate::schema::RecordKey;
use thiserror::Error;

/// Errors raised by a search backend.
///
/// Kept separate from [`Error`] so backend implementations only have to
/// speak about transport and protocol failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request timed out after {0}ms")]
    Timeout(u64),

    #[error("Backend rejected request (status {status}): {reason}")]
    Rejected { status: u16, reason: String },

    #[error("Unexpected backend response: {0}")]
    Protocol(String),
}

impl BackendError {
    /// Whether repeating the same request verbatim may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout(_) => true,
            Self::Rejected { status, .. } => *status == 429 || *status >= 500,
            Self::Protocol(_) => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid filter field '{field}': {reason}")]
    InvalidFilterField { field: String, reason: String },

    #[error("Range filter on '{0}' has neither a lower nor an upper bound")]
    EmptyRange(String),

    #[error("Boolean {0} expression has no children")]
    EmptyComposition(&'static str),

    #[error("Invalid facet field '{field}': {reason}")]
    InvalidFacetField { field: String, reason: String },

    #[error("Invalid sort '{sort}': {reason}")]
    InvalidSortField { sort: String, reason: String },

    #[error("Invalid highlight field '{field}': {reason}")]
    InvalidHighlightField { field: String, reason: String },

    #[error("Record {record} has no value for mapped field '{field}'")]
    UnmappedField { field: String, record: RecordKey },

    #[error("Serializer for field '{field}' failed on record {record}: {reason}")]
    Serializer {
        field: String,
        record: RecordKey,
        reason: String,
    },

    #[error("Invalid document descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Descriptor already registered for {0}")]
    DuplicateRegistration(String),

    #[error("No descriptor registered for {0}")]
    NotRegistered(String),

    #[error("Record source error: {0}")]
    Source(String),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Validation errors are raised before any backend call and are never retried.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidFilterField { .. }
                | Self::EmptyRange(_)
                | Self::EmptyComposition(_)
                | Self::InvalidFacetField { .. }
                | Self::InvalidSortField { .. }
                | Self::InvalidHighlightField { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
