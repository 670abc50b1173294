use super::field::{FieldKind, FieldSchema, RAW_SUFFIX};
use super::record::{Record, RecordSource, SourceField, SourceFieldKind};
use super::TYPE_FIELD;
use crate::config::SeekerConfig;
use crate::error::{Error, Result};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Custom serializer for one field. `Err` carries the failure reason.
pub type FieldSerializer =
    Arc<dyn Fn(&dyn Record) -> std::result::Result<Value, String> + Send + Sync>;

pub type ShouldIndexFn = Arc<dyn Fn(&dyn Record) -> bool + Send + Sync>;

pub type IdFn = Arc<dyn Fn(&dyn Record) -> String + Send + Sync>;

/// Binds a record type to its document schema and serialization.
///
/// Built once with [`DescriptorBuilder`], then read-only. Indexing and
/// querying never mutate it.
pub struct DocumentDescriptor {
    index_name: String,
    doc_type: String,
    batch_size: usize,
    default_analyzer: String,
    prune_on_reindex: bool,
    fields: BTreeMap<String, FieldSchema>,
    serializers: HashMap<String, FieldSerializer>,
    should_index: Option<ShouldIndexFn>,
    id_fn: Option<IdFn>,
    source: Arc<dyn RecordSource>,
}

/// A field path resolved against a descriptor
#[derive(Debug, Clone)]
pub struct ResolvedField<'a> {
    pub schema: &'a FieldSchema,
    /// Path to use for exact matching and sorting
    pub exact_path: String,
}

impl DocumentDescriptor {
    pub fn builder(source: Arc<dyn RecordSource>) -> DescriptorBuilder {
        DescriptorBuilder::from_config(&SeekerConfig::default(), source)
    }

    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    pub fn doc_type(&self) -> &str {
        &self.doc_type
    }

    pub fn record_type(&self) -> &str {
        self.source.record_type()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn prune_on_reindex(&self) -> bool {
        self.prune_on_reindex
    }

    pub fn source(&self) -> &Arc<dyn RecordSource> {
        &self.source
    }

    /// Fields in name order
    pub fn fields(&self) -> impl Iterator<Item = &FieldSchema> {
        self.fields.values()
    }

    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.get(name)
    }

    /// Backend mapping, deterministic across runs
    pub fn mapping(&self) -> Value {
        let mut properties: Map<String, Value> = self
            .fields
            .values()
            .map(|f| (f.name.clone(), f.to_mapping(&self.default_analyzer)))
            .collect();
        properties.insert(TYPE_FIELD.to_string(), json!({"type": "keyword"}));
        json!({ "properties": properties })
    }

    /// Resolve a dotted path (`author.name`, `title.raw`) to its field.
    pub fn resolve_field(&self, path: &str) -> Option<ResolvedField<'_>> {
        let segments: Vec<&str> = path.split('.').collect();
        let mut current = self.fields.get(*segments.first()?)?;

        for (i, segment) in segments.iter().enumerate().skip(1) {
            let last = i == segments.len() - 1;
            match &current.kind {
                FieldKind::Object(children) => {
                    current = children.iter().find(|f| f.name == *segment)?;
                }
                FieldKind::RawString if last && *segment == RAW_SUFFIX => {
                    return Some(ResolvedField {
                        schema: current,
                        exact_path: path.to_string(),
                    });
                }
                _ => return None,
            }
        }

        let exact_path = match current.kind {
            FieldKind::RawString => format!("{}.{}", path, RAW_SUFFIX),
            _ => path.to_string(),
        };
        Some(ResolvedField {
            schema: current,
            exact_path,
        })
    }

    pub fn get_id(&self, record: &dyn Record) -> String {
        match &self.id_fn {
            Some(id_fn) => id_fn(record),
            None => record.key().to_string(),
        }
    }

    pub fn should_index(&self, record: &dyn Record) -> bool {
        match &self.should_index {
            Some(policy) => policy(record),
            None => true,
        }
    }

    /// Build the document payload for a record.
    ///
    /// Each field comes from its custom serializer if one is registered,
    /// else from the record's accessor. A field with neither is
    /// `UnmappedField`.
    pub fn serialize(&self, record: &dyn Record) -> Result<Value> {
        let mut doc = Map::new();
        for (name, field) in &self.fields {
            let value = match self.serializers.get(name) {
                Some(serializer) => serializer(record).map_err(|reason| Error::Serializer {
                    field: name.clone(),
                    record: record.key(),
                    reason,
                })?,
                None => {
                    let raw = record.get_field(name).ok_or_else(|| Error::UnmappedField {
                        field: name.clone(),
                        record: record.key(),
                    })?;
                    project(field, raw, name, record)?
                }
            };
            doc.insert(name.clone(), value);
        }
        doc.insert(TYPE_FIELD.to_string(), Value::String(self.doc_type.clone()));
        Ok(Value::Object(doc))
    }
}

/// Shape a raw accessor value to the field's sub-schema
fn project(field: &FieldSchema, value: Value, path: &str, record: &dyn Record) -> Result<Value> {
    let children = match field.children() {
        Some(children) => children,
        None => return Ok(value),
    };

    match value {
        Value::Null => Ok(Value::Null),
        Value::Array(items) => items
            .into_iter()
            .map(|item| project(field, item, path, record))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Value::Object(mut map) => {
            let mut out = Map::new();
            for child in children {
                let child_path = format!("{}.{}", path, child.name);
                let child_value = map.remove(&child.name).ok_or_else(|| Error::UnmappedField {
                    field: child_path.clone(),
                    record: record.key(),
                })?;
                out.insert(
                    child.name.clone(),
                    project(child, child_value, &child_path, record)?,
                );
            }
            Ok(Value::Object(out))
        }
        other => Err(Error::Serializer {
            field: path.to_string(),
            record: record.key(),
            reason: format!("expected an object, got {}", other),
        }),
    }
}

impl fmt::Debug for DocumentDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentDescriptor")
            .field("index_name", &self.index_name)
            .field("doc_type", &self.doc_type)
            .field("record_type", &self.source.record_type())
            .field("batch_size", &self.batch_size)
            .field("fields", &self.fields.keys().collect::<Vec<_>>())
            .field("serializers", &self.serializers.keys().collect::<Vec<_>>())
            .field("prune_on_reindex", &self.prune_on_reindex)
            .finish_non_exhaustive()
    }
}

/// Builder for [`DocumentDescriptor`]
pub struct DescriptorBuilder {
    source: Arc<dyn RecordSource>,
    index_name: Option<String>,
    own_index: bool,
    index_prefix: String,
    default_index_name: String,
    doc_type: Option<String>,
    batch_size: usize,
    default_analyzer: String,
    prune_on_reindex: bool,
    fields: Vec<FieldSchema>,
    derived: Vec<FieldSchema>,
    serializers: HashMap<String, FieldSerializer>,
    should_index: Option<ShouldIndexFn>,
    id_fn: Option<IdFn>,
}

impl DescriptorBuilder {
    pub fn from_config(config: &SeekerConfig, source: Arc<dyn RecordSource>) -> Self {
        Self {
            source,
            index_name: None,
            own_index: false,
            index_prefix: config.index_prefix.clone(),
            default_index_name: config.default_index_name.clone(),
            doc_type: None,
            batch_size: config.batch_size,
            default_analyzer: config.default_analyzer.clone(),
            prune_on_reindex: config.prune_on_reindex,
            fields: Vec::new(),
            derived: Vec::new(),
            serializers: HashMap::new(),
            should_index: None,
            id_fn: None,
        }
    }

    pub fn index_name(mut self, name: impl Into<String>) -> Self {
        self.index_name = Some(name.into());
        self
    }

    /// Use a dedicated `{index_prefix}-{doc_type}` index
    pub fn own_index(mut self) -> Self {
        self.own_index = true;
        self
    }

    pub fn doc_type(mut self, doc_type: impl Into<String>) -> Self {
        self.doc_type = Some(doc_type.into());
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn default_analyzer(mut self, analyzer: impl Into<String>) -> Self {
        self.default_analyzer = analyzer.into();
        self
    }

    pub fn prune_on_reindex(mut self, prune: bool) -> Self {
        self.prune_on_reindex = prune;
        self
    }

    /// Declare a field. Replaces a derived field of the same name.
    pub fn field(mut self, field: FieldSchema) -> Self {
        self.fields.push(field);
        self
    }

    /// Derive fields from the record type's own field list.
    ///
    /// An empty `include` means every field. Auto-created fields and
    /// one-to-many relations are skipped.
    pub fn derive_fields(mut self, include: &[&str], exclude: &[&str]) -> Self {
        for source_field in self.source.fields() {
            if source_field.auto_created || source_field.kind == SourceFieldKind::OneToMany {
                continue;
            }
            if !include.is_empty() && !include.contains(&source_field.name.as_str()) {
                continue;
            }
            if exclude.contains(&source_field.name.as_str()) {
                continue;
            }
            self.derived.push(derived_schema(&source_field));
        }
        self
    }

    pub fn serializer<F>(mut self, field: impl Into<String>, serializer: F) -> Self
    where
        F: Fn(&dyn Record) -> std::result::Result<Value, String> + Send + Sync + 'static,
    {
        self.serializers.insert(field.into(), Arc::new(serializer));
        self
    }

    pub fn should_index<F>(mut self, policy: F) -> Self
    where
        F: Fn(&dyn Record) -> bool + Send + Sync + 'static,
    {
        self.should_index = Some(Arc::new(policy));
        self
    }

    pub fn id_with<F>(mut self, id_fn: F) -> Self
    where
        F: Fn(&dyn Record) -> String + Send + Sync + 'static,
    {
        self.id_fn = Some(Arc::new(id_fn));
        self
    }

    pub fn build(self) -> Result<DocumentDescriptor> {
        if self.batch_size == 0 {
            return Err(Error::InvalidDescriptor(
                "batch_size must be positive".to_string(),
            ));
        }

        let doc_type = self
            .doc_type
            .unwrap_or_else(|| self.source.record_type().to_lowercase());
        if doc_type.trim().is_empty() {
            return Err(Error::InvalidDescriptor("doc_type is empty".to_string()));
        }

        let mut fields = BTreeMap::new();
        for field in self.fields {
            validate_field(&field)?;
            let name = field.name.clone();
            if fields.insert(name.clone(), field).is_some() {
                return Err(Error::InvalidDescriptor(format!(
                    "field '{}' declared twice",
                    name
                )));
            }
        }
        for field in self.derived {
            validate_field(&field)?;
            fields.entry(field.name.clone()).or_insert(field);
        }

        for name in self.serializers.keys() {
            if !fields.contains_key(name) {
                return Err(Error::InvalidDescriptor(format!(
                    "serializer registered for undeclared field '{}'",
                    name
                )));
            }
        }

        let index_name = match (self.index_name, self.own_index) {
            (Some(name), _) => name,
            (None, true) => format!("{}-{}", self.index_prefix, doc_type),
            (None, false) => self.default_index_name,
        };

        Ok(DocumentDescriptor {
            index_name,
            doc_type,
            batch_size: self.batch_size,
            default_analyzer: self.default_analyzer,
            prune_on_reindex: self.prune_on_reindex,
            fields,
            serializers: self.serializers,
            should_index: self.should_index,
            id_fn: self.id_fn,
            source: self.source,
        })
    }
}

fn derived_schema(source_field: &SourceField) -> FieldSchema {
    let name = source_field.name.clone();
    match source_field.kind {
        SourceFieldKind::Date | SourceFieldKind::DateTime => FieldSchema::date(name),
        SourceFieldKind::Integer => FieldSchema::integer(name),
        SourceFieldKind::Decimal | SourceFieldKind::Float => FieldSchema::number(name),
        SourceFieldKind::Boolean => FieldSchema::boolean(name),
        SourceFieldKind::Slug => FieldSchema::keyword(name),
        SourceFieldKind::Text | SourceFieldKind::ManyToMany | SourceFieldKind::OneToMany => {
            FieldSchema::raw_string(name)
        }
    }
}

fn validate_field(field: &FieldSchema) -> Result<()> {
    if field.name.is_empty() || field.name.contains('.') {
        return Err(Error::InvalidDescriptor(format!(
            "invalid field name '{}'",
            field.name
        )));
    }
    if field.name == TYPE_FIELD {
        return Err(Error::InvalidDescriptor(format!(
            "'{}' is reserved",
            TYPE_FIELD
        )));
    }
    if let Some(children) = field.children() {
        let mut seen = HashSet::new();
        for child in children {
            if !seen.insert(child.name.as_str()) {
                return Err(Error::InvalidDescriptor(format!(
                    "field '{}.{}' declared twice",
                    field.name, child.name
                )));
            }
            validate_field(child)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{JsonRecord, MemorySource};
    use serde_json::json;

    fn source() -> Arc<MemorySource> {
        Arc::new(MemorySource::new(
            "Book",
            vec![
                SourceField::new("id", SourceFieldKind::Integer).auto_created(),
                SourceField::new("title", SourceFieldKind::Text),
                SourceField::new("slug", SourceFieldKind::Slug),
                SourceField::new("year", SourceFieldKind::Integer),
                SourceField::new("price", SourceFieldKind::Decimal),
                SourceField::new("published", SourceFieldKind::Date),
                SourceField::new("in_print", SourceFieldKind::Boolean),
                SourceField::new("tags", SourceFieldKind::ManyToMany),
                SourceField::new("reviews", SourceFieldKind::OneToMany),
            ],
        ))
    }

    #[test]
    fn test_derive_fields() {
        let descriptor = DocumentDescriptor::builder(source())
            .derive_fields(&[], &["price"])
            .build()
            .unwrap();

        let names: Vec<_> = descriptor.fields().map(|f| f.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["in_print", "published", "slug", "tags", "title", "year"]
        );
        assert_eq!(descriptor.field("slug").unwrap().kind, FieldKind::Keyword);
        assert_eq!(descriptor.field("tags").unwrap().kind, FieldKind::RawString);
        assert_eq!(descriptor.field("published").unwrap().kind, FieldKind::Date);
        assert_eq!(descriptor.doc_type(), "book");
        assert_eq!(descriptor.index_name(), "seeker");
    }

    #[test]
    fn test_explicit_field_overrides_derived() {
        let descriptor = DocumentDescriptor::builder(source())
            .derive_fields(&["title", "year"], &[])
            .field(FieldSchema::string("title"))
            .build()
            .unwrap();
        assert_eq!(descriptor.field("title").unwrap().kind, FieldKind::String);
        assert_eq!(descriptor.fields().count(), 2);
    }

    #[test]
    fn test_build_rejects_invalid_descriptors() {
        let dup = DocumentDescriptor::builder(source())
            .field(FieldSchema::keyword("a"))
            .field(FieldSchema::integer("a"))
            .build();
        assert!(matches!(dup, Err(Error::InvalidDescriptor(_))));

        let reserved = DocumentDescriptor::builder(source())
            .field(FieldSchema::keyword(TYPE_FIELD))
            .build();
        assert!(matches!(reserved, Err(Error::InvalidDescriptor(_))));

        let orphan = DocumentDescriptor::builder(source())
            .field(FieldSchema::keyword("a"))
            .serializer("b", |_| Ok(json!(1)))
            .build();
        assert!(matches!(orphan, Err(Error::InvalidDescriptor(_))));

        let zero = DocumentDescriptor::builder(source()).batch_size(0).build();
        assert!(matches!(zero, Err(Error::InvalidDescriptor(_))));
    }

    #[test]
    fn test_own_index_name() {
        let descriptor = DocumentDescriptor::builder(source())
            .own_index()
            .doc_type("novel")
            .build()
            .unwrap();
        assert_eq!(descriptor.index_name(), "seeker-novel");
    }

    #[test]
    fn test_mapping_is_deterministic_and_tagged() {
        let build = || {
            DocumentDescriptor::builder(source())
                .field(FieldSchema::integer("year"))
                .field(FieldSchema::raw_string("title"))
                .build()
                .unwrap()
        };
        let mapping = build().mapping();
        assert_eq!(mapping, build().mapping());
        assert_eq!(mapping["properties"][TYPE_FIELD]["type"], "keyword");
        assert_eq!(mapping["properties"]["title"]["fields"]["raw"]["type"], "keyword");
    }

    #[test]
    fn test_resolve_field_paths() {
        let descriptor = DocumentDescriptor::builder(source())
            .field(FieldSchema::raw_string("title"))
            .field(FieldSchema::object(
                "author",
                vec![FieldSchema::raw_string("name"), FieldSchema::integer("born")],
            ))
            .build()
            .unwrap();

        assert_eq!(descriptor.resolve_field("title").unwrap().exact_path, "title.raw");
        assert_eq!(descriptor.resolve_field("title.raw").unwrap().exact_path, "title.raw");
        assert_eq!(
            descriptor.resolve_field("author.name").unwrap().exact_path,
            "author.name.raw"
        );
        assert_eq!(descriptor.resolve_field("author.born").unwrap().exact_path, "author.born");
        assert!(descriptor.resolve_field("author.missing").is_none());
        assert!(descriptor.resolve_field("title.raw.x").is_none());
        assert!(descriptor.resolve_field("nope").is_none());
    }

    #[test]
    fn test_serialize_uses_serializer_then_accessor() {
        let descriptor = DocumentDescriptor::builder(source())
            .field(FieldSchema::raw_string("title"))
            .field(FieldSchema::keyword("shelf"))
            .serializer("shelf", |r| Ok(json!(format!("S{}", r.key()))))
            .build()
            .unwrap();

        let doc = descriptor
            .serialize(&JsonRecord::new(4, json!({"title": "Dune"})))
            .unwrap();
        assert_eq!(doc, json!({"title": "Dune", "shelf": "S4", TYPE_FIELD: "book"}));
    }

    #[test]
    fn test_serialize_unmapped_field() {
        let descriptor = DocumentDescriptor::builder(source())
            .field(FieldSchema::raw_string("title"))
            .field(FieldSchema::integer("year"))
            .build()
            .unwrap();

        let err = descriptor
            .serialize(&JsonRecord::new(9, json!({"title": "Dune"})))
            .unwrap_err();
        match err {
            Error::UnmappedField { field, record } => {
                assert_eq!(field, "year");
                assert_eq!(record, 9);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_serialize_projects_objects() {
        let descriptor = DocumentDescriptor::builder(source())
            .field(FieldSchema::object(
                "authors",
                vec![FieldSchema::raw_string("name")],
            ))
            .build()
            .unwrap();

        let doc = descriptor
            .serialize(&JsonRecord::new(
                1,
                json!({"authors": [{"name": "Frank", "age": 60}, {"name": "Brian"}]}),
            ))
            .unwrap();
        assert_eq!(doc["authors"], json!([{"name": "Frank"}, {"name": "Brian"}]));

        let err = descriptor
            .serialize(&JsonRecord::new(2, json!({"authors": [{"age": 1}]})))
            .unwrap_err();
        assert!(matches!(err, Error::UnmappedField { ref field, .. } if field == "authors.name"));
    }

    #[test]
    fn test_serializer_error_names_record() {
        let descriptor = DocumentDescriptor::builder(source())
            .field(FieldSchema::integer("year"))
            .serializer("year", |_| Err("bad year".to_string()))
            .build()
            .unwrap();
        let err = descriptor
            .serialize(&JsonRecord::new(3, json!({})))
            .unwrap_err();
        assert!(matches!(err, Error::Serializer { record: 3, .. }));
    }

    #[test]
    fn test_id_and_policy_defaults() {
        let descriptor = DocumentDescriptor::builder(source()).build().unwrap();
        let record = JsonRecord::new(12, json!({}));
        assert_eq!(descriptor.get_id(&record), "12");
        assert!(descriptor.should_index(&record));

        let descriptor = DocumentDescriptor::builder(source())
            .id_with(|r| format!("book-{}", r.key()))
            .should_index(|r| r.key() % 2 == 0)
            .build()
            .unwrap();
        assert_eq!(descriptor.get_id(&record), "book-12");
        assert!(!descriptor.should_index(&JsonRecord::new(13, json!({}))));
    }
}
