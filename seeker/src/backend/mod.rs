pub mod memory;
pub mod r#trait;

pub use memory::{query_matches, MemoryBackend, Operation};
pub use r#trait::{BulkItemFailure, BulkOutcome, IndexBackend, SearchHit, SearchResponse};
