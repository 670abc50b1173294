//! Document schema: fields, descriptors and the record source contract.

mod descriptor;
mod field;
mod record;

pub use descriptor::{
    DescriptorBuilder, DocumentDescriptor, FieldSerializer, IdFn, ResolvedField, ShouldIndexFn,
};
pub use field::{FieldKind, FieldSchema, RAW_SUFFIX};
pub use record::{
    JsonRecord, MemorySource, Record, RecordKey, RecordSource, SourceField, SourceFieldKind,
};

/// Keyword field tagging every document with its doc type, so several
/// descriptors can share one index.
pub const TYPE_FIELD: &str = "seeker_type";
