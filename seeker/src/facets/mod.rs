//! Facets: aggregations requested alongside a query
//!
//! A [`FacetSpec`] compiles to one named backend aggregation and parses
//! that aggregation's result back into a flat list of buckets, whatever
//! shape the backend used (list or keyed buckets, or the aggregation
//! wrapped one level down in a global/filter/nested aggregation).
//!
//! Facets are not multi-select: every facet of a query is computed under
//! the full active filter, including the filter on its own field.

mod interval;

pub use interval::{parse_date, DateInterval};

use crate::dsl::{
    AggregationRequest, DateHistogramAggregation, RangeAggregation, RangeBucket, StatsAggregation,
    TermsAggregation,
};
use crate::error::{Error, Result};
use crate::filter::{MaxOp, F};
use crate::schema::{DocumentDescriptor, FieldKind};
use serde::Serialize;
use serde_json::Value;
use std::cmp::Ordering;

/// How several selected terms combine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FilterOperator {
    /// A document matches if it has any selected value
    #[default]
    Or,
    /// A document matches only if it has every selected value
    And,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FacetKind {
    Terms { size: usize },
    DateHistogram { interval: DateInterval },
    Range { ranges: Vec<RangeBucket> },
    /// Summary statistics of a numeric field; no buckets
    Stats,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FacetSpec {
    pub field: String,
    /// Aggregation name in the request and response
    pub name: String,
    /// Display string
    pub label: String,
    pub kind: FacetKind,
    pub filter_operator: FilterOperator,
}

/// One value of a facet with its document count
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FacetBucket {
    pub key: String,
    pub count: u64,
}

impl FacetBucket {
    pub fn new(key: impl Into<String>, count: u64) -> Self {
        Self {
            key: key.into(),
            count,
        }
    }
}

/// Result of a stats facet. `min`, `max` and `avg` are absent when no
/// document had a value.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FacetStats {
    pub count: u64,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub avg: Option<f64>,
    pub sum: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FacetResult {
    pub name: String,
    pub label: String,
    pub field: String,
    pub buckets: Vec<FacetBucket>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<FacetStats>,
}

const DEFAULT_TERMS_SIZE: usize = 10;

/// Depth to look for a wrapped aggregation (global → nested → terms)
const MAX_WRAPPER_DEPTH: usize = 3;

/// `author.name.raw` → `author_name`
pub fn facet_name(field: &str) -> String {
    field
        .strip_suffix(".raw")
        .unwrap_or(field)
        .replace('.', "_")
}

impl FacetSpec {
    fn new(field: impl Into<String>, kind: FacetKind) -> Self {
        let field = field.into();
        Self {
            name: facet_name(&field),
            label: field.clone(),
            field,
            kind,
            filter_operator: FilterOperator::default(),
        }
    }

    pub fn terms(field: impl Into<String>) -> Self {
        Self::new(
            field,
            FacetKind::Terms {
                size: DEFAULT_TERMS_SIZE,
            },
        )
    }

    pub fn date_histogram(field: impl Into<String>, interval: DateInterval) -> Self {
        Self::new(field, FacetKind::DateHistogram { interval })
    }

    pub fn range(field: impl Into<String>, ranges: Vec<RangeBucket>) -> Self {
        Self::new(field, FacetKind::Range { ranges })
    }

    pub fn stats(field: impl Into<String>) -> Self {
        Self::new(field, FacetKind::Stats)
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Number of terms buckets to request. No effect on other kinds.
    pub fn size(mut self, size: usize) -> Self {
        if let FacetKind::Terms { size: s } = &mut self.kind {
            *s = size;
        }
        self
    }

    pub fn filter_operator(mut self, op: FilterOperator) -> Self {
        self.filter_operator = op;
        self
    }

    /// Compile to a named aggregation, validating the field first.
    pub fn compile(&self, descriptor: &DocumentDescriptor) -> Result<(String, AggregationRequest)> {
        let invalid = |reason: &str| Error::InvalidFacetField {
            field: self.field.clone(),
            reason: reason.to_string(),
        };
        let resolved = descriptor
            .resolve_field(&self.field)
            .ok_or_else(|| invalid("not declared"))?;
        if !resolved.schema.indexed {
            return Err(invalid("not indexed"));
        }
        if !resolved.schema.facetable {
            return Err(invalid("not facetable"));
        }

        let request = match &self.kind {
            FacetKind::Terms { size } => {
                if *size == 0 {
                    return Err(invalid("terms size must be positive"));
                }
                AggregationRequest::Terms(TermsAggregation {
                    field: resolved.exact_path,
                    size: *size,
                })
            }
            FacetKind::DateHistogram { interval } => {
                if resolved.schema.kind != FieldKind::Date {
                    return Err(invalid("date histogram needs a date field"));
                }
                AggregationRequest::DateHistogram(DateHistogramAggregation {
                    field: resolved.exact_path,
                    calendar_interval: interval.as_str().to_string(),
                    format: Some(interval.backend_format().to_string()),
                    min_doc_count: 1,
                })
            }
            FacetKind::Range { ranges } => {
                if !matches!(resolved.schema.kind, FieldKind::Integer | FieldKind::Number) {
                    return Err(invalid("range buckets need a numeric field"));
                }
                if ranges.is_empty() {
                    return Err(invalid("no ranges given"));
                }
                AggregationRequest::Range(RangeAggregation {
                    field: resolved.exact_path,
                    ranges: ranges.clone(),
                })
            }
            FacetKind::Stats => {
                if !matches!(resolved.schema.kind, FieldKind::Integer | FieldKind::Number) {
                    return Err(invalid("stats need a numeric field"));
                }
                AggregationRequest::Stats(StatsAggregation {
                    field: resolved.exact_path,
                })
            }
        };
        Ok((self.name.clone(), request))
    }

    /// Parse this facet out of a response's `aggregations` object.
    ///
    /// A missing or unreadable aggregation yields no buckets, and a stats
    /// facet reads as zero documents.
    pub fn parse(&self, aggregations: &Value) -> FacetResult {
        let aggregation = aggregations.get(&self.name);
        if matches!(self.kind, FacetKind::Stats) {
            let stats = aggregation
                .and_then(|agg| find_marked(agg, &self.name, "count", MAX_WRAPPER_DEPTH))
                .map(read_stats)
                .unwrap_or_default();
            return self.result(Vec::new(), Some(stats));
        }

        let mut raw = aggregation
            .and_then(|agg| find_marked(agg, &self.name, "buckets", MAX_WRAPPER_DEPTH))
            .and_then(|agg| agg.get("buckets"))
            .map(read_buckets)
            .unwrap_or_default();

        match &self.kind {
            FacetKind::Terms { .. } => {
                raw.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.label.cmp(&b.label)))
            }
            FacetKind::DateHistogram { .. } => raw.sort_by(|a, b| compare_keys(&a.key, &b.key)),
            FacetKind::Range { ranges } => {
                let position = |label: &str| {
                    ranges
                        .iter()
                        .position(|r| r.effective_key() == label)
                        .unwrap_or(usize::MAX)
                };
                raw.sort_by_key(|b| position(&b.label));
            }
            FacetKind::Stats => {}
        }

        let buckets = raw
            .into_iter()
            .map(|b| FacetBucket::new(b.label, b.count))
            .collect();
        self.result(buckets, None)
    }

    fn result(&self, buckets: Vec<FacetBucket>, stats: Option<FacetStats>) -> FacetResult {
        FacetResult {
            name: self.name.clone(),
            label: self.label.clone(),
            field: self.field.clone(),
            buckets,
            stats,
        }
    }

    /// Filter selecting documents in the given facet values.
    ///
    /// Returns `None` when no value maps to a filter.
    pub fn filter_for(&self, values: &[String]) -> Option<F> {
        match &self.kind {
            FacetKind::Terms { .. } => match values {
                [] => None,
                [single] => Some(F::term(self.field.clone(), single.clone())),
                many => match self.filter_operator {
                    FilterOperator::Or => Some(F::terms(self.field.clone(), many.iter().cloned())),
                    FilterOperator::And => Some(F::And(
                        many.iter()
                            .map(|v| F::term(self.field.clone(), v.clone()))
                            .collect(),
                    )),
                },
            },
            FacetKind::DateHistogram { interval } => {
                let ranges: Vec<F> = values
                    .iter()
                    .filter_map(|v| interval.bucket_bounds(v))
                    .map(|(start, end)| {
                        F::range(
                            self.field.clone(),
                            Some(Value::String(start.format("%Y-%m-%dT%H:%M:%S").to_string())),
                            Some(Value::String(end.format("%Y-%m-%dT%H:%M:%S").to_string())),
                        )
                        .with_max_op(MaxOp::Lt)
                    })
                    .collect();
                any_of(ranges)
            }
            FacetKind::Range { ranges } => {
                let selected: Vec<F> = ranges
                    .iter()
                    .filter(|r| values.iter().any(|v| *v == r.effective_key()))
                    .filter(|r| r.from.is_some() || r.to.is_some())
                    .map(|r| {
                        F::range(
                            self.field.clone(),
                            r.from.map(Value::from),
                            r.to.map(Value::from),
                        )
                        .with_max_op(MaxOp::Lt)
                    })
                    .collect();
                any_of(selected)
            }
            FacetKind::Stats => None,
        }
    }
}

fn any_of(mut filters: Vec<F>) -> Option<F> {
    match filters.len() {
        0 => None,
        1 => filters.pop(),
        _ => Some(F::Or(filters)),
    }
}

struct RawBucket {
    key: Value,
    label: String,
    count: u64,
}

/// The aggregation object holding `marker`, looking through wrapper
/// aggregations
fn find_marked<'a>(agg: &'a Value, name: &str, marker: &str, depth: usize) -> Option<&'a Value> {
    if agg.get(marker).is_some() {
        return Some(agg);
    }
    if depth == 0 {
        return None;
    }
    let inner = agg.get(name).or_else(|| {
        // A wrapper holding a single differently-named aggregation
        let obj = agg.as_object()?;
        let mut nested = obj.values().filter(|v| v.is_object());
        match (nested.next(), nested.next()) {
            (Some(only), None) => Some(only),
            _ => None,
        }
    })?;
    find_marked(inner, name, marker, depth - 1)
}

fn read_stats(agg: &Value) -> FacetStats {
    let number = |key: &str| agg.get(key).and_then(Value::as_f64);
    FacetStats {
        count: agg.get("count").and_then(Value::as_u64).unwrap_or(0),
        min: number("min"),
        max: number("max"),
        avg: number("avg"),
        sum: number("sum").unwrap_or(0.0),
    }
}

fn read_buckets(buckets: &Value) -> Vec<RawBucket> {
    match buckets {
        Value::Array(items) => items
            .iter()
            .filter_map(|b| {
                let key = b.get("key")?.clone();
                let label = b
                    .get("key_as_string")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| value_label(&key));
                Some(RawBucket {
                    key,
                    label,
                    count: b.get("doc_count").and_then(Value::as_u64).unwrap_or(0),
                })
            })
            .collect(),
        Value::Object(map) => map
            .iter()
            .map(|(key, b)| RawBucket {
                key: Value::String(key.clone()),
                label: key.clone(),
                count: b.get("doc_count").and_then(Value::as_u64).unwrap_or(0),
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn value_label(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Numbers compare numerically, everything else by label
fn compare_keys(a: &Value, b: &Value) -> Ordering {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        _ => value_label(a).cmp(&value_label(b)),
    }
}
