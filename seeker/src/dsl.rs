//! Compiled backend request types
//!
//! The subset of the Elasticsearch query DSL that filters, facets and
//! queries compile to. Serializes to the wire shape ES and OpenSearch
//! accept, so HTTP backends can send it as-is.

use crate::config::DefaultOperator;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

/// Compiled query tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DslQuery {
    MatchAll(MatchAllQuery),

    /// Exact match on one field
    Term(BTreeMap<String, Value>),

    /// Exact match on any of several values
    Terms(BTreeMap<String, Vec<Value>>),

    Range(BTreeMap<String, RangeParams>),

    Bool(BoolQuery),

    /// Match by document id
    Ids(IdsQuery),

    /// Free text, parsed by the backend
    QueryString(QueryStringQuery),

    SimpleQueryString(QueryStringQuery),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchAllQuery {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RangeParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gt: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gte: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lt: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lte: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BoolQuery {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub must: Vec<DslQuery>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub should: Vec<DslQuery>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub must_not: Vec<DslQuery>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filter: Vec<DslQuery>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum_should_match: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdsQuery {
    pub values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryStringQuery {
    pub query: String,
    pub default_operator: String,
}

impl DslQuery {
    pub fn match_all() -> Self {
        DslQuery::MatchAll(MatchAllQuery {})
    }

    pub fn term(field: impl Into<String>, value: Value) -> Self {
        DslQuery::Term(BTreeMap::from([(field.into(), value)]))
    }

    pub fn terms(field: impl Into<String>, values: Vec<Value>) -> Self {
        DslQuery::Terms(BTreeMap::from([(field.into(), values)]))
    }

    pub fn range(field: impl Into<String>, params: RangeParams) -> Self {
        DslQuery::Range(BTreeMap::from([(field.into(), params)]))
    }

    /// All clauses must match, without scoring
    pub fn filter_all(clauses: Vec<DslQuery>) -> Self {
        DslQuery::Bool(BoolQuery {
            filter: clauses,
            ..Default::default()
        })
    }

    /// At least one clause must match
    pub fn any(clauses: Vec<DslQuery>) -> Self {
        DslQuery::Bool(BoolQuery {
            should: clauses,
            minimum_should_match: Some(1),
            ..Default::default()
        })
    }

    pub fn none_of(clauses: Vec<DslQuery>) -> Self {
        DslQuery::Bool(BoolQuery {
            must_not: clauses,
            ..Default::default()
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortClause {
    pub field: String,
    pub order: SortOrder,
}

impl SortClause {
    /// Missing values always sort last
    pub fn to_json(&self) -> Value {
        let mut clause = Map::new();
        clause.insert(
            self.field.clone(),
            json!({ "order": self.order, "missing": "_last" }),
        );
        Value::Object(clause)
    }
}

/// Aggregation request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationRequest {
    Terms(TermsAggregation),
    DateHistogram(DateHistogramAggregation),
    Range(RangeAggregation),
    Stats(StatsAggregation),
}

impl AggregationRequest {
    pub fn field(&self) -> &str {
        match self {
            AggregationRequest::Terms(t) => &t.field,
            AggregationRequest::DateHistogram(d) => &d.field,
            AggregationRequest::Range(r) => &r.field,
            AggregationRequest::Stats(s) => &s.field,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TermsAggregation {
    pub field: String,
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DateHistogramAggregation {
    pub field: String,
    pub calendar_interval: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default = "default_min_doc_count")]
    pub min_doc_count: u64,
}

fn default_min_doc_count() -> u64 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeAggregation {
    pub field: String,
    pub ranges: Vec<RangeBucket>,
}

/// Count, min, max, avg and sum of a numeric field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsAggregation {
    pub field: String,
}

/// One bucket of a range aggregation. `from` is inclusive, `to` exclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeBucket {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<f64>,
}

impl RangeBucket {
    pub fn new(from: Option<f64>, to: Option<f64>) -> Self {
        Self {
            key: None,
            from,
            to,
        }
    }

    pub fn keyed(key: impl Into<String>, from: Option<f64>, to: Option<f64>) -> Self {
        Self {
            key: Some(key.into()),
            from,
            to,
        }
    }

    /// The bucket key the backend reports: the explicit key, else `from-to`
    /// with `*` for an open end.
    pub fn effective_key(&self) -> String {
        if let Some(key) = &self.key {
            return key.clone();
        }
        let bound = |b: Option<f64>| b.map_or_else(|| "*".to_string(), |v| format!("{:?}", v));
        format!("{}-{}", bound(self.from), bound(self.to))
    }

    pub fn contains(&self, value: f64) -> bool {
        self.from.map_or(true, |from| value >= from) && self.to.map_or(true, |to| value < to)
    }
}

/// One search call: free text, compiled filter, sort, paging and aggregations
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub index: String,
    pub query_text: Option<String>,
    pub default_operator: DefaultOperator,
    pub simple_query: bool,
    pub filter: Option<DslQuery>,
    pub sort: Vec<SortClause>,
    pub from: usize,
    pub size: usize,
    pub aggregations: BTreeMap<String, AggregationRequest>,
    /// Fields to return highlighted fragments for
    pub highlight: Vec<String>,
}

impl SearchRequest {
    pub fn new(index: impl Into<String>) -> Self {
        Self {
            index: index.into(),
            query_text: None,
            default_operator: DefaultOperator::default(),
            simple_query: false,
            filter: None,
            sort: Vec::new(),
            from: 0,
            size: 10,
            aggregations: BTreeMap::new(),
            highlight: Vec::new(),
        }
    }

    /// Text query ANDed with the filter.
    ///
    /// Blank text matches everything; other text goes to the backend as given.
    pub fn compose_query(&self) -> DslQuery {
        let text = self
            .query_text
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .map(|t| {
                let q = QueryStringQuery {
                    query: t.to_string(),
                    default_operator: self.default_operator.as_str().to_string(),
                };
                if self.simple_query {
                    DslQuery::SimpleQueryString(q)
                } else {
                    DslQuery::QueryString(q)
                }
            });

        match (text, &self.filter) {
            (None, None) => DslQuery::match_all(),
            (Some(text), None) => text,
            (None, Some(filter)) => DslQuery::filter_all(vec![filter.clone()]),
            (Some(text), Some(filter)) => DslQuery::Bool(BoolQuery {
                must: vec![text],
                filter: vec![filter.clone()],
                ..Default::default()
            }),
        }
    }

    /// Request body for `POST /{index}/_search`
    pub fn to_body(&self) -> Value {
        let mut body = Map::new();
        body.insert("query".to_string(), json!(self.compose_query()));
        body.insert("from".to_string(), json!(self.from));
        body.insert("size".to_string(), json!(self.size));
        body.insert("track_total_hits".to_string(), Value::Bool(true));
        if !self.sort.is_empty() {
            let sort: Vec<Value> = self.sort.iter().map(SortClause::to_json).collect();
            body.insert("sort".to_string(), Value::Array(sort));
            // Scores are dropped under an explicit sort otherwise
            body.insert("track_scores".to_string(), Value::Bool(true));
        }
        if !self.highlight.is_empty() {
            let fields: Map<String, Value> = self
                .highlight
                .iter()
                .map(|f| (f.clone(), json!({ "number_of_fragments": 0 })))
                .collect();
            body.insert("highlight".to_string(), json!({ "fields": fields }));
        }
        if !self.aggregations.is_empty() {
            body.insert("aggs".to_string(), json!(self.aggregations));
        }
        Value::Object(body)
    }
}

/// One item of a bulk write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BulkOperation {
    Upsert {
        id: String,
        index: String,
        payload: Value,
    },
    Delete {
        id: String,
        index: String,
    },
}

impl BulkOperation {
    pub fn id(&self) -> &str {
        match self {
            BulkOperation::Upsert { id, .. } | BulkOperation::Delete { id, .. } => id,
        }
    }

    pub fn index(&self) -> &str {
        match self {
            BulkOperation::Upsert { index, .. } | BulkOperation::Delete { index, .. } => index,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_wire_shape() {
        let query = DslQuery::Bool(BoolQuery {
            filter: vec![
                DslQuery::term("genre.raw", json!("scifi")),
                DslQuery::range(
                    "year",
                    RangeParams {
                        gte: Some(json!(2010)),
                        lt: Some(json!(2015)),
                        ..Default::default()
                    },
                ),
            ],
            ..Default::default()
        });
        assert_eq!(
            serde_json::to_value(&query).unwrap(),
            json!({"bool": {"filter": [
                {"term": {"genre.raw": "scifi"}},
                {"range": {"year": {"gte": 2010, "lt": 2015}}}
            ]}})
        );
    }

    #[test]
    fn test_compose_query() {
        let mut request = SearchRequest::new("seeker");
        assert_eq!(request.compose_query(), DslQuery::match_all());

        request.query_text = Some("   ".to_string());
        assert_eq!(request.compose_query(), DslQuery::match_all());

        request.query_text = Some("  dune ".to_string());
        request.default_operator = DefaultOperator::Or;
        assert_eq!(
            serde_json::to_value(request.compose_query()).unwrap(),
            json!({"query_string": {"query": "  dune ", "default_operator": "OR"}})
        );

        request.query_text = Some("dune".to_string());
        request.filter = Some(DslQuery::term("year", json!(1965)));
        let body = request.to_body();
        assert_eq!(body["query"]["bool"]["must"][0]["query_string"]["query"], "dune");
        assert_eq!(body["query"]["bool"]["filter"][0]["term"]["year"], 1965);
        assert!(body.get("sort").is_none());
        assert!(body.get("track_scores").is_none());
        assert!(body.get("aggs").is_none());
        assert!(body.get("highlight").is_none());
    }

    #[test]
    fn test_body_sort_and_aggs() {
        let mut request = SearchRequest::new("seeker");
        request.sort.push(SortClause {
            field: "year".to_string(),
            order: SortOrder::Desc,
        });
        request.aggregations.insert(
            "genre".to_string(),
            AggregationRequest::Terms(TermsAggregation {
                field: "genre.raw".to_string(),
                size: 10,
            }),
        );
        request.aggregations.insert(
            "pages".to_string(),
            AggregationRequest::Stats(StatsAggregation {
                field: "pages".to_string(),
            }),
        );
        let body = request.to_body();
        assert_eq!(body["sort"][0]["year"]["order"], "desc");
        assert_eq!(body["sort"][0]["year"]["missing"], "_last");
        assert_eq!(body["track_scores"], true);
        assert_eq!(body["aggs"]["genre"]["terms"]["field"], "genre.raw");
        assert_eq!(body["aggs"]["pages"], json!({"stats": {"field": "pages"}}));
    }

    #[test]
    fn test_body_highlight() {
        let mut request = SearchRequest::new("seeker");
        request.highlight = vec!["title".to_string(), "summary".to_string()];
        assert_eq!(
            request.to_body()["highlight"],
            json!({"fields": {
                "title": {"number_of_fragments": 0},
                "summary": {"number_of_fragments": 0}
            }})
        );
    }

    #[test]
    fn test_range_bucket_keys() {
        assert_eq!(RangeBucket::new(None, Some(10.0)).effective_key(), "*-10.0");
        assert_eq!(RangeBucket::new(Some(2.5), None).effective_key(), "2.5-*");
        assert_eq!(RangeBucket::keyed("cheap", None, Some(10.0)).effective_key(), "cheap");
        assert!(RangeBucket::new(Some(1.0), Some(2.0)).contains(1.0));
        assert!(!RangeBucket::new(Some(1.0), Some(2.0)).contains(2.0));
    }

    #[test]
    fn test_bulk_operation_tagging() {
        let op = BulkOperation::Delete {
            id: "7".to_string(),
            index: "seeker".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&op).unwrap(),
            json!({"op": "delete", "id": "7", "index": "seeker"})
        );
    }
}
