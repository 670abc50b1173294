//! seeker: keeps a search index in sync with a record store
//!
//! - Document descriptors map record types to index documents
//! - The indexing pipeline rebuilds, updates and prunes documents
//! - Filters, facets and sorts compile to backend queries

pub mod backend;
pub mod config;
pub mod dsl;
pub mod error;
pub mod facets;
pub mod filter;
pub mod listener;
pub mod metrics;
pub mod pipeline;
pub mod query;
pub mod registry;
pub mod retry;
pub mod schema;
pub mod telemetry;

pub use backend::{IndexBackend, MemoryBackend};
pub use config::SeekerConfig;
pub use error::{BackendError, Error, Result};
pub use facets::{FacetResult, FacetSpec};
pub use filter::F;
pub use listener::{ChangeEvent, ChangeListener};
pub use pipeline::{IndexReport, Indexer, LogProgress, ReindexOptions};
pub use query::{Page, QueryExecutor, QueryRequest, QueryResult};
pub use registry::{Registry, RegistryKey};
pub use schema::{DocumentDescriptor, FieldSchema, Record, RecordSource};
