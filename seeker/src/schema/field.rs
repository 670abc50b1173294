use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Sub-field holding the un-analyzed copy of a `RawString` field
pub const RAW_SUFFIX: &str = "raw";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    /// Analyzed full text
    String,
    /// Exact value, not analyzed
    Keyword,
    /// Analyzed text with an exact `raw` sub-field
    RawString,
    Integer,
    Number,
    Date,
    Boolean,
    /// Nested structure with its own fields
    Object(Vec<FieldSchema>),
}

impl FieldKind {
    pub fn facetable_by_default(&self) -> bool {
        !matches!(self, FieldKind::String | FieldKind::Object(_))
    }

    pub fn is_text(&self) -> bool {
        matches!(self, FieldKind::String | FieldKind::RawString)
    }
}

/// One document field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub name: String,
    pub kind: FieldKind,
    #[serde(default = "default_true")]
    pub indexed: bool,
    pub facetable: bool,
    /// Falls back to the descriptor's default analyzer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analyzer: Option<String>,
}

fn default_true() -> bool {
    true
}

impl FieldSchema {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        let facetable = kind.facetable_by_default();
        Self {
            name: name.into(),
            kind,
            indexed: true,
            facetable,
            analyzer: None,
        }
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::String)
    }

    pub fn keyword(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Keyword)
    }

    pub fn raw_string(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::RawString)
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Integer)
    }

    pub fn number(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Number)
    }

    pub fn date(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Date)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Boolean)
    }

    pub fn object(name: impl Into<String>, fields: Vec<FieldSchema>) -> Self {
        Self::new(name, FieldKind::Object(fields))
    }

    /// Stored in the document but not searchable
    pub fn not_indexed(mut self) -> Self {
        self.indexed = false;
        self.facetable = false;
        self
    }

    pub fn facetable(mut self, facetable: bool) -> Self {
        self.facetable = facetable;
        self
    }

    pub fn analyzer(mut self, analyzer: impl Into<String>) -> Self {
        self.analyzer = Some(analyzer.into());
        self
    }

    /// Sub-fields of an `Object` field
    pub fn children(&self) -> Option<&[FieldSchema]> {
        match &self.kind {
            FieldKind::Object(fields) => Some(fields),
            _ => None,
        }
    }

    /// Backend mapping fragment for this field
    pub fn to_mapping(&self, default_analyzer: &str) -> Value {
        let analyzer = self.analyzer.as_deref().unwrap_or(default_analyzer);
        let mut mapping = match &self.kind {
            FieldKind::String => json!({"type": "text", "analyzer": analyzer}),
            FieldKind::Keyword => json!({"type": "keyword"}),
            FieldKind::RawString => json!({
                "type": "text",
                "analyzer": analyzer,
                "fields": {"raw": {"type": "keyword"}}
            }),
            FieldKind::Integer => json!({"type": "long"}),
            FieldKind::Number => json!({"type": "double"}),
            FieldKind::Date => json!({"type": "date"}),
            FieldKind::Boolean => json!({"type": "boolean"}),
            FieldKind::Object(fields) => {
                let mut sorted: Vec<&FieldSchema> = fields.iter().collect();
                sorted.sort_by(|a, b| a.name.cmp(&b.name));
                let properties: Map<String, Value> = sorted
                    .into_iter()
                    .map(|f| (f.name.clone(), f.to_mapping(default_analyzer)))
                    .collect();
                json!({"type": "object", "properties": properties})
            }
        };

        if !self.indexed {
            if let Value::Object(map) = &mut mapping {
                match self.kind {
                    FieldKind::Object(_) => {
                        map.insert("enabled".to_string(), Value::Bool(false));
                        map.remove("properties");
                    }
                    _ => {
                        map.insert("index".to_string(), Value::Bool(false));
                    }
                }
            }
        }
        mapping
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_facetability() {
        assert!(!FieldSchema::string("body").facetable);
        assert!(FieldSchema::raw_string("genre").facetable);
        assert!(FieldSchema::integer("year").facetable);
        assert!(!FieldSchema::object("author", vec![]).facetable);
        assert!(!FieldSchema::keyword("isbn").not_indexed().facetable);
    }

    #[test]
    fn test_raw_string_mapping() {
        let mapping = FieldSchema::raw_string("title").to_mapping("snowball");
        assert_eq!(mapping["type"], "text");
        assert_eq!(mapping["analyzer"], "snowball");
        assert_eq!(mapping["fields"]["raw"]["type"], "keyword");
    }

    #[test]
    fn test_custom_analyzer_and_not_indexed() {
        let mapping = FieldSchema::string("body")
            .analyzer("english")
            .not_indexed()
            .to_mapping("snowball");
        assert_eq!(mapping["analyzer"], "english");
        assert_eq!(mapping["index"], false);
    }

    #[test]
    fn test_object_mapping_is_name_ordered() {
        let field = FieldSchema::object(
            "author",
            vec![FieldSchema::raw_string("name"), FieldSchema::integer("born")],
        );
        let mapping = field.to_mapping("snowball");
        let keys: Vec<_> = mapping["properties"]
            .as_object()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        assert_eq!(keys, vec!["born", "name"]);
        assert_eq!(mapping["properties"]["born"]["type"], "long");
    }
}
