use crate::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Primary key of a record in the external store
pub type RecordKey = i64;

/// A record read from the external store.
///
/// `get_field` is the accessor the pipeline uses for default field
/// serialization; it returns `None` when the record has no such attribute.
pub trait Record: Send + Sync {
    fn key(&self) -> RecordKey;

    fn get_field(&self, name: &str) -> Option<Value>;
}

/// Kind of a field as the record store declares it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFieldKind {
    Text,
    Slug,
    Integer,
    Decimal,
    Float,
    Date,
    DateTime,
    Boolean,
    ManyToMany,
    OneToMany,
}

/// A field of the record type, used to derive a document schema
#[derive(Debug, Clone)]
pub struct SourceField {
    pub name: String,
    pub kind: SourceFieldKind,
    /// Reverse relations and other fields the store creates on its own
    pub auto_created: bool,
}

impl SourceField {
    pub fn new(name: impl Into<String>, kind: SourceFieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            auto_created: false,
        }
    }

    pub fn auto_created(mut self) -> Self {
        self.auto_created = true;
        self
    }
}

/// Read contract of the external record store
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Identity of the record type (e.g. "Book")
    fn record_type(&self) -> &str;

    /// The record type's own field list
    fn fields(&self) -> Vec<SourceField>;

    /// Total number of records (for progress reporting)
    async fn count(&self) -> Result<u64>;

    /// Records with key strictly greater than `after`, ascending, at most `limit`
    async fn fetch_after(
        &self,
        after: Option<RecordKey>,
        limit: usize,
    ) -> Result<Vec<Arc<dyn Record>>>;
}

/// A record backed by a JSON object
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRecord {
    pub key: RecordKey,
    pub fields: Map<String, Value>,
}

impl JsonRecord {
    pub fn new(key: RecordKey, fields: Value) -> Self {
        let fields = match fields {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self { key, fields }
    }
}

impl Record for JsonRecord {
    fn key(&self) -> RecordKey {
        self.key
    }

    fn get_field(&self, name: &str) -> Option<Value> {
        self.fields.get(name).cloned()
    }
}

/// In-process record source over a key-ordered map.
///
/// Records can be added and removed while a reindex is running; the
/// pipeline only ever sees what `fetch_after` returns at each call.
pub struct MemorySource {
    record_type: String,
    fields: Vec<SourceField>,
    records: RwLock<BTreeMap<RecordKey, Arc<dyn Record>>>,
}

impl MemorySource {
    pub fn new(record_type: impl Into<String>, fields: Vec<SourceField>) -> Self {
        Self {
            record_type: record_type.into(),
            fields,
            records: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn insert(&self, record: impl Record + 'static) {
        self.records.write().insert(record.key(), Arc::new(record));
    }

    pub fn remove(&self, key: RecordKey) -> Option<Arc<dyn Record>> {
        self.records.write().remove(&key)
    }

    pub fn get(&self, key: RecordKey) -> Option<Arc<dyn Record>> {
        self.records.read().get(&key).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl RecordSource for MemorySource {
    fn record_type(&self) -> &str {
        &self.record_type
    }

    fn fields(&self) -> Vec<SourceField> {
        self.fields.clone()
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.records.read().len() as u64)
    }

    async fn fetch_after(
        &self,
        after: Option<RecordKey>,
        limit: usize,
    ) -> Result<Vec<Arc<dyn Record>>> {
        let records = self.records.read();
        let batch = match after {
            Some(key) => records
                .range((std::ops::Bound::Excluded(key), std::ops::Bound::Unbounded))
                .take(limit)
                .map(|(_, r)| r.clone())
                .collect(),
            None => records.values().take(limit).cloned().collect(),
        };
        Ok(batch)
    }
}
