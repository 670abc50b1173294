//! Configuration for seeker
//!
//! Every option has a default, so an empty TOML file is a valid config.
//! `index_hosts` has no default and must be supplied before a network
//! backend can be built (see [`SeekerConfig::require_hosts`]).
//!
//! ```toml
//! index_hosts = ["http://localhost:9200"]
//! default_operator = "OR"
//! batch_size = 500
//!
//! [retry]
//! max_retries = 5
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SeekerConfig {
    /// Search engine endpoints (e.g. "http://localhost:9200")
    #[serde(default)]
    pub index_hosts: Vec<String>,

    /// Index used by descriptors that do not name one
    #[serde(default = "default_index_name")]
    pub default_index_name: String,

    /// Prefix for per-type indices (`{prefix}-{doc_type}`)
    #[serde(default = "default_index_prefix")]
    pub index_prefix: String,

    /// Operator joining free-text terms in the backend query string
    #[serde(default)]
    pub default_operator: DefaultOperator,

    /// Use `simple_query_string` instead of `query_string` for free text
    #[serde(default)]
    pub use_simple_query: bool,

    /// Records per indexing batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Analyzer for text fields that do not name one
    #[serde(default = "default_analyzer")]
    pub default_analyzer: String,

    /// Facet template name, passed through to the render layer untouched
    #[serde(default)]
    pub default_facet_template: Option<String>,

    /// Behaviour on duplicate registry keys
    #[serde(default)]
    pub registration_mode: RegistrationMode,

    /// Delete documents whose records vanished during a reindex
    #[serde(default = "default_true")]
    pub prune_on_reindex: bool,

    /// Batch submissions allowed in flight during one reindex
    #[serde(default = "default_max_concurrent_batches")]
    pub max_concurrent_batches: usize,

    /// Timeout for a single backend call (one batch, one query)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default)]
    pub retry: RetryConfig,

    /// Record the last write time of every index in a side index
    #[serde(default)]
    pub update_timestamp_index: bool,

    #[serde(default = "default_timestamp_index_name")]
    pub timestamp_index_name: String,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

fn default_index_name() -> String {
    "seeker".to_string()
}

fn default_index_prefix() -> String {
    "seeker".to_string()
}

fn default_batch_size() -> usize {
    1000
}

fn default_analyzer() -> String {
    "snowball".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_concurrent_batches() -> usize {
    1
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_timestamp_index_name() -> String {
    "timestamp".to_string()
}

impl Default for SeekerConfig {
    fn default() -> Self {
        Self {
            index_hosts: Vec::new(),
            default_index_name: default_index_name(),
            index_prefix: default_index_prefix(),
            default_operator: DefaultOperator::default(),
            use_simple_query: false,
            batch_size: default_batch_size(),
            default_analyzer: default_analyzer(),
            default_facet_template: None,
            registration_mode: RegistrationMode::default(),
            prune_on_reindex: true,
            max_concurrent_batches: default_max_concurrent_batches(),
            request_timeout_ms: default_request_timeout_ms(),
            retry: RetryConfig::default(),
            update_timestamp_index: false,
            timestamp_index_name: default_timestamp_index_name(),
            observability: ObservabilityConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DefaultOperator {
    #[default]
    And,
    Or,
}

impl DefaultOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::And => "AND",
            Self::Or => "OR",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistrationMode {
    /// A second registration for the same key fails
    #[default]
    Strict,
    /// A second registration for the same key replaces the first
    Permissive,
}

/// Bounded exponential backoff for retryable backend failures
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    /// Retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub factor: f64,
}

fn default_max_retries() -> usize {
    3
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    2000
}

fn default_backoff_factor() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            factor: default_backoff_factor(),
        }
    }
}

impl RetryConfig {
    /// No waiting between attempts. Meant for tests.
    pub fn immediate(max_retries: usize) -> Self {
        Self {
            max_retries,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
            factor: 1.0,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: usize) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let ms = (self.initial_backoff_ms as f64) * self.factor.max(1.0).powi(exp);
        Duration::from_millis(ms.min(self.max_backoff_ms as f64) as u64)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log output format: "pretty" or "json"
    /// Override with LOG_FORMAT env var
    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// Log level filter string
    /// Override with RUST_LOG env var
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_log_level() -> String {
    "info,seeker=debug".to_string()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_format: default_log_format(),
            log_level: default_log_level(),
        }
    }
}

impl SeekerConfig {
    /// Load and validate config from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Cannot read '{}': {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate config from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: SeekerConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be positive".to_string()));
        }
        if self.max_concurrent_batches == 0 {
            return Err(Error::Config(
                "max_concurrent_batches must be positive".to_string(),
            ));
        }
        if self.request_timeout_ms == 0 {
            return Err(Error::Config(
                "request_timeout_ms must be positive".to_string(),
            ));
        }
        if self.default_index_name.trim().is_empty() {
            return Err(Error::Config("default_index_name is empty".to_string()));
        }
        if self.index_prefix.trim().is_empty() {
            return Err(Error::Config("index_prefix is empty".to_string()));
        }
        for host in &self.index_hosts {
            url::Url::parse(host)
                .map_err(|e| Error::Config(format!("Invalid index host '{}': {}", host, e)))?;
        }
        Ok(())
    }

    /// Hosts are required by network backends; there is no usable default.
    pub fn require_hosts(&self) -> Result<&[String]> {
        if self.index_hosts.is_empty() {
            return Err(Error::Config(
                "index_hosts must list at least one endpoint".to_string(),
            ));
        }
        Ok(&self.index_hosts)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Name of the dedicated index for a doc type
    pub fn prefixed_index(&self, doc_type: &str) -> String {
        format!("{}-{}", self.index_prefix, doc_type)
    }
}
