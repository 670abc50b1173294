//! seeker-es: Elasticsearch / OpenSearch backend for seeker
//!
//! Talks to the cluster's REST API over HTTP:
//! - Index creation and mapping updates
//! - NDJSON `_bulk` writes with per-item failure reporting
//! - Scrolled id listing for pruning
//! - `_search` with aggregations

pub mod bulk;
pub mod client;
pub mod response;

pub use client::EsBackend;
