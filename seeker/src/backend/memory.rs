//! In-process backend
//!
//! Keeps documents in memory and evaluates the compiled DSL and
//! aggregations itself, answering in the same JSON shapes a search
//! engine would. Every call is counted per operation, and failures can
//! be queued per operation, which makes it the test double for the
//! pipeline and the query executor.
//!
//! Free text is matched word by word against every string in the
//! document; it is not a query-string parser. A hit scores one point per
//! occurrence of a query word, or 1.0 without free text.

use super::r#trait::{BulkItemFailure, BulkOutcome, IndexBackend, SearchHit, SearchResponse};
use crate::dsl::{AggregationRequest, BulkOperation, DslQuery, RangeParams, SearchRequest, SortOrder};
use crate::error::BackendError;
use crate::facets::{parse_date, DateInterval};
use crate::schema::TYPE_FIELD;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Map, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::Duration;

/// Backend operations, for call counting and failure injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    EnsureIndex,
    DropIndex,
    Bulk,
    DocumentIds,
    Search,
    Refresh,
}

#[derive(Debug, Default)]
struct MemoryIndex {
    mapping: Map<String, Value>,
    docs: BTreeMap<String, Value>,
}

#[derive(Default)]
pub struct MemoryBackend {
    indices: RwLock<HashMap<String, MemoryIndex>>,
    calls: Mutex<HashMap<Operation, usize>>,
    /// Per call of an operation: `None` lets it through
    faults: Mutex<HashMap<Operation, VecDeque<Option<BackendError>>>>,
    rejected_ids: Mutex<HashSet<String>>,
    bulk_delay: Mutex<Option<Duration>>,
    bulk_log: Mutex<Vec<Vec<String>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` calls of `op` with `error`
    pub fn inject_failures(&self, op: Operation, error: BackendError, times: usize) {
        self.inject_failures_after(op, 0, error, times);
    }

    /// Let the next `passes` calls of `op` through, then fail `times`
    pub fn inject_failures_after(
        &self,
        op: Operation,
        passes: usize,
        error: BackendError,
        times: usize,
    ) {
        let mut faults = self.faults.lock();
        let queue = faults.entry(op).or_default();
        queue.extend(std::iter::repeat(None).take(passes));
        queue.extend(std::iter::repeat(Some(error)).take(times));
    }

    /// Refuse upserts of these ids as per-item failures
    pub fn reject_ids<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rejected_ids.lock().extend(ids.into_iter().map(Into::into));
    }

    /// Delay every bulk call
    pub fn set_bulk_delay(&self, delay: Option<Duration>) {
        *self.bulk_delay.lock() = delay;
    }

    pub fn calls(&self, op: Operation) -> usize {
        self.calls.lock().get(&op).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }

    /// Document ids of every successful bulk call, in call order
    pub fn bulk_log(&self) -> Vec<Vec<String>> {
        self.bulk_log.lock().clone()
    }

    pub fn index_exists(&self, index: &str) -> bool {
        self.indices.read().contains_key(index)
    }

    pub fn mapping(&self, index: &str) -> Option<Value> {
        self.indices
            .read()
            .get(index)
            .map(|i| json!({ "properties": i.mapping }))
    }

    pub fn document(&self, index: &str, id: &str) -> Option<Value> {
        self.indices.read().get(index)?.docs.get(id).cloned()
    }

    pub fn documents(&self, index: &str) -> BTreeMap<String, Value> {
        self.indices
            .read()
            .get(index)
            .map(|i| i.docs.clone())
            .unwrap_or_default()
    }

    pub fn doc_count(&self, index: &str) -> usize {
        self.indices.read().get(index).map_or(0, |i| i.docs.len())
    }

    /// Remove a document behind the pipeline's back
    pub fn remove_document(&self, index: &str, id: &str) -> Option<Value> {
        self.indices.write().get_mut(index)?.docs.remove(id)
    }

    fn begin(&self, op: Operation) -> Result<(), BackendError> {
        *self.calls.lock().entry(op).or_insert(0) += 1;
        match self.faults.lock().get_mut(&op).and_then(VecDeque::pop_front) {
            Some(Some(error)) => Err(error),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl IndexBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn ensure_index(&self, index: &str, mapping: &Value) -> Result<(), BackendError> {
        self.begin(Operation::EnsureIndex)?;
        let mut indices = self.indices.write();
        let entry = indices.entry(index.to_string()).or_default();
        if let Some(properties) = mapping.get("properties").and_then(Value::as_object) {
            for (name, field) in properties {
                entry.mapping.insert(name.clone(), field.clone());
            }
        }
        Ok(())
    }

    async fn drop_index(&self, index: &str) -> Result<(), BackendError> {
        self.begin(Operation::DropIndex)?;
        self.indices.write().remove(index);
        Ok(())
    }

    async fn bulk(&self, operations: &[BulkOperation]) -> Result<BulkOutcome, BackendError> {
        self.begin(Operation::Bulk)?;
        let delay = *self.bulk_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let rejected = self.rejected_ids.lock().clone();
        let mut outcome = BulkOutcome::default();
        let mut indices = self.indices.write();
        for op in operations {
            match op {
                BulkOperation::Upsert { id, index, payload } => {
                    if rejected.contains(id) {
                        outcome.failures.push(BulkItemFailure {
                            id: id.clone(),
                            status: 400,
                            reason: "mapper_parsing_exception".to_string(),
                        });
                        continue;
                    }
                    indices
                        .entry(index.clone())
                        .or_default()
                        .docs
                        .insert(id.clone(), payload.clone());
                }
                BulkOperation::Delete { id, index } => {
                    if let Some(i) = indices.get_mut(index) {
                        i.docs.remove(id);
                    }
                }
            }
        }
        drop(indices);

        self.bulk_log
            .lock()
            .push(operations.iter().map(|op| op.id().to_string()).collect());
        Ok(outcome)
    }

    async fn document_ids(
        &self,
        index: &str,
        doc_type: &str,
    ) -> Result<HashSet<String>, BackendError> {
        self.begin(Operation::DocumentIds)?;
        let indices = self.indices.read();
        Ok(indices
            .get(index)
            .map(|i| {
                i.docs
                    .iter()
                    .filter(|(_, doc)| doc.get(TYPE_FIELD).and_then(Value::as_str) == Some(doc_type))
                    .map(|(id, _)| id.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn search(&self, request: &SearchRequest) -> Result<SearchResponse, BackendError> {
        self.begin(Operation::Search)?;
        let indices = self.indices.read();
        let index = indices.get(&request.index).ok_or_else(|| BackendError::Rejected {
            status: 404,
            reason: format!("index_not_found_exception: {}", request.index),
        })?;

        let query = request.compose_query();
        let terms = request.query_text.as_deref().map(query_terms).unwrap_or_default();
        let mut matched: Vec<(&String, &Value, f64)> = index
            .docs
            .iter()
            .filter(|(id, doc)| query_matches(&query, id, doc))
            .map(|(id, doc)| (id, doc, score(&terms, doc)))
            .collect();

        matched.sort_by(|(id_a, a, score_a), (id_b, b, score_b)| {
            if request.sort.is_empty() {
                let ordering = score_b.partial_cmp(score_a).unwrap_or(Ordering::Equal);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            for clause in &request.sort {
                let ordering = compare_for_sort(
                    first_value(a, &clause.field),
                    first_value(b, &clause.field),
                    clause.order,
                );
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            compare_ids(id_a, id_b)
        });

        let mut aggregations = Map::new();
        if !request.aggregations.is_empty() {
            let docs: Vec<&Value> = matched.iter().map(|(_, doc, _)| *doc).collect();
            for (name, agg) in &request.aggregations {
                aggregations.insert(name.clone(), aggregate(agg, &docs));
            }
        }

        let total = matched.len() as u64;
        let max_score = matched
            .iter()
            .map(|(_, _, score)| *score)
            .reduce(f64::max);
        let hits = matched
            .into_iter()
            .skip(request.from)
            .take(request.size)
            .map(|(id, doc, score)| {
                let mut hit = SearchHit::new(id.clone(), Some(score), doc.clone());
                for field in &request.highlight {
                    if let Some(fragment) = values_at(doc, field)
                        .into_iter()
                        .filter_map(Value::as_str)
                        .find_map(|text| highlight_text(text, &terms))
                    {
                        hit.highlight.insert(field.clone(), fragment);
                    }
                }
                hit
            })
            .collect();

        Ok(SearchResponse {
            total,
            max_score,
            hits,
            aggregations: Value::Object(aggregations),
        })
    }

    async fn refresh(&self, _index: &str) -> Result<(), BackendError> {
        self.begin(Operation::Refresh)
    }
}

/// Whether a compiled query matches one document
pub fn query_matches(query: &DslQuery, id: &str, doc: &Value) -> bool {
    match query {
        DslQuery::MatchAll(_) => true,
        DslQuery::Term(fields) => fields.iter().all(|(field, target)| {
            values_at(doc, field).into_iter().any(|v| value_eq(v, target))
        }),
        DslQuery::Terms(fields) => fields.iter().all(|(field, targets)| {
            values_at(doc, field)
                .into_iter()
                .any(|v| targets.iter().any(|t| value_eq(v, t)))
        }),
        DslQuery::Range(fields) => fields.iter().all(|(field, params)| {
            values_at(doc, field)
                .into_iter()
                .any(|v| in_range(v, params))
        }),
        DslQuery::Bool(b) => {
            let required = b
                .must
                .iter()
                .chain(b.filter.iter())
                .all(|q| query_matches(q, id, doc));
            let excluded = b.must_not.iter().any(|q| query_matches(q, id, doc));
            let should_hits = b.should.iter().filter(|q| query_matches(q, id, doc)).count();
            let should_ok = match b.minimum_should_match {
                Some(min) => should_hits >= min as usize,
                None if b.must.is_empty() && b.filter.is_empty() && !b.should.is_empty() => {
                    should_hits >= 1
                }
                None => true,
            };
            required && !excluded && should_ok
        }
        DslQuery::Ids(ids) => ids.values.iter().any(|v| v == id),
        DslQuery::QueryString(q) | DslQuery::SimpleQueryString(q) => {
            text_matches(&q.query, &q.default_operator, doc)
        }
    }
}

/// Leaf values at a dotted path, flattening arrays. `x.raw` falls back
/// to `x`, since the raw sub-field is a copy of the source value.
fn values_at<'a>(doc: &'a Value, path: &str) -> Vec<&'a Value> {
    let mut out = Vec::new();
    let segments: Vec<&str> = path.split('.').collect();
    collect_values(doc, &segments, &mut out);
    if out.is_empty() {
        if let Some(base) = path.strip_suffix(".raw") {
            let segments: Vec<&str> = base.split('.').collect();
            collect_values(doc, &segments, &mut out);
        }
    }
    out
}

fn collect_values<'a>(value: &'a Value, segments: &[&str], out: &mut Vec<&'a Value>) {
    match value {
        Value::Array(items) => {
            for item in items {
                collect_values(item, segments, out);
            }
        }
        Value::Null => {}
        _ if segments.is_empty() => out.push(value),
        Value::Object(map) => {
            if let Some(next) = map.get(segments[0]) {
                collect_values(next, &segments[1..], out);
            }
        }
        _ => {}
    }
}

fn first_value<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    values_at(doc, path).into_iter().next()
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn label(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn value_eq(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => x == y,
        _ => label(a) == label(b),
    }
}

/// Numbers numerically, dates chronologically, other strings lexically
fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    if let (Value::Number(_), _) | (_, Value::Number(_)) = (a, b) {
        if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
            return x.partial_cmp(&y);
        }
    }
    match (a, b) {
        (Value::String(x), Value::String(y)) => match (parse_date(a), parse_date(b)) {
            (Some(dx), Some(dy)) => Some(dx.cmp(&dy)),
            _ => Some(x.cmp(y)),
        },
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn in_range(value: &Value, params: &RangeParams) -> bool {
    let check = |bound: &Option<Value>, accept: fn(Ordering) -> bool| match bound {
        Some(bound) => compare_values(value, bound).map_or(false, accept),
        None => true,
    };
    check(&params.gt, |o| o == Ordering::Greater)
        && check(&params.gte, |o| o != Ordering::Less)
        && check(&params.lt, |o| o == Ordering::Less)
        && check(&params.lte, |o| o != Ordering::Greater)
}

fn compare_for_sort(a: Option<&Value>, b: Option<&Value>, order: SortOrder) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        // Missing values last in either direction
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => {
            let ordering = compare_values(a, b).unwrap_or(Ordering::Equal);
            match order {
                SortOrder::Asc => ordering,
                SortOrder::Desc => ordering.reverse(),
            }
        }
    }
}

fn compare_ids(a: &str, b: &str) -> Ordering {
    match (a.parse::<i64>(), b.parse::<i64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}

/// Lowercased query words, without the boolean operators
fn query_terms(query: &str) -> Vec<String> {
    query
        .split_whitespace()
        .filter(|t| !matches!(*t, "AND" | "OR"))
        .map(|t| t.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Alphanumeric runs of `text` with their byte offsets
fn words(text: &str) -> Vec<(usize, &str)> {
    let mut out = Vec::new();
    let mut start = None;
    for (i, c) in text.char_indices() {
        match (c.is_alphanumeric(), start) {
            (true, None) => start = Some(i),
            (false, Some(s)) => {
                out.push((s, &text[s..i]));
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        out.push((s, &text[s..]));
    }
    out
}

fn score(terms: &[String], doc: &Value) -> f64 {
    if terms.is_empty() {
        return 1.0;
    }
    let mut occurrences = 0usize;
    count_occurrences(doc, terms, &mut occurrences);
    occurrences as f64
}

fn count_occurrences(value: &Value, terms: &[String], count: &mut usize) {
    match value {
        Value::String(s) => {
            *count += words(s)
                .into_iter()
                .filter(|(_, w)| terms.contains(&w.to_lowercase()))
                .count();
        }
        Value::Array(items) => items.iter().for_each(|v| count_occurrences(v, terms, count)),
        Value::Object(map) => map.values().for_each(|v| count_occurrences(v, terms, count)),
        _ => {}
    }
}

/// `text` with every query word wrapped in `<em>`, or `None` without a match
fn highlight_text(text: &str, terms: &[String]) -> Option<String> {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    let mut hit = false;
    for (start, word) in words(text) {
        out.push_str(&text[last..start]);
        if terms.contains(&word.to_lowercase()) {
            out.push_str("<em>");
            out.push_str(word);
            out.push_str("</em>");
            hit = true;
        } else {
            out.push_str(word);
        }
        last = start + word.len();
    }
    out.push_str(&text[last..]);
    hit.then_some(out)
}

fn text_matches(query: &str, default_operator: &str, doc: &Value) -> bool {
    let terms = query_terms(query);
    if terms.is_empty() {
        return true;
    }

    let mut words = HashSet::new();
    collect_words(doc, &mut words);
    if default_operator.eq_ignore_ascii_case("OR") {
        terms.iter().any(|t| words.contains(t))
    } else {
        terms.iter().all(|t| words.contains(t))
    }
}

fn collect_words(value: &Value, out: &mut HashSet<String>) {
    match value {
        Value::String(s) => {
            for (_, word) in words(s) {
                out.insert(word.to_lowercase());
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_words(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_words(v, out)),
        _ => {}
    }
}

fn aggregate(agg: &AggregationRequest, docs: &[&Value]) -> Value {
    match agg {
        AggregationRequest::Terms(terms) => {
            let mut counts: HashMap<String, (Value, u64)> = HashMap::new();
            for doc in docs {
                let mut seen = HashSet::new();
                for value in values_at(doc, &terms.field) {
                    let key = label(value);
                    if seen.insert(key.clone()) {
                        counts.entry(key).or_insert_with(|| (value.clone(), 0)).1 += 1;
                    }
                }
            }
            let mut buckets: Vec<(String, Value, u64)> =
                counts.into_iter().map(|(k, (v, c))| (k, v, c)).collect();
            buckets.sort_by(|a, b| b.2.cmp(&a.2).then_with(|| a.0.cmp(&b.0)));
            buckets.truncate(terms.size);
            let buckets: Vec<Value> = buckets
                .into_iter()
                .map(|(_, key, count)| json!({"key": key, "doc_count": count}))
                .collect();
            json!({ "buckets": buckets })
        }
        AggregationRequest::DateHistogram(histogram) => {
            let interval =
                DateInterval::parse_interval(&histogram.calendar_interval).unwrap_or(DateInterval::Day);
            let mut counts: BTreeMap<i64, (String, u64)> = BTreeMap::new();
            for doc in docs {
                let mut seen = HashSet::new();
                for dt in values_at(doc, &histogram.field).into_iter().filter_map(parse_date) {
                    let start = interval.floor(dt).timestamp_millis();
                    if seen.insert(start) {
                        counts
                            .entry(start)
                            .or_insert_with(|| (interval.label(dt), 0))
                            .1 += 1;
                    }
                }
            }
            let buckets: Vec<Value> = counts
                .into_iter()
                .filter(|(_, (_, count))| *count >= histogram.min_doc_count)
                .map(|(key, (key_as_string, count))| {
                    json!({"key": key, "key_as_string": key_as_string, "doc_count": count})
                })
                .collect();
            json!({ "buckets": buckets })
        }
        AggregationRequest::Range(range) => {
            let buckets: Vec<Value> = range
                .ranges
                .iter()
                .map(|bucket| {
                    let count = docs
                        .iter()
                        .filter(|doc| {
                            values_at(doc, &range.field)
                                .into_iter()
                                .filter_map(as_number)
                                .any(|v| bucket.contains(v))
                        })
                        .count();
                    let mut out = json!({"key": bucket.effective_key(), "doc_count": count});
                    if let Some(from) = bucket.from {
                        out["from"] = json!(from);
                    }
                    if let Some(to) = bucket.to {
                        out["to"] = json!(to);
                    }
                    out
                })
                .collect();
            json!({ "buckets": buckets })
        }
        AggregationRequest::Stats(stats) => {
            let values: Vec<f64> = docs
                .iter()
                .flat_map(|doc| values_at(doc, &stats.field))
                .filter_map(as_number)
                .collect();
            if values.is_empty() {
                return json!({"count": 0, "min": null, "max": null, "avg": null, "sum": 0.0});
            }
            let sum: f64 = values.iter().sum();
            let min = values.iter().copied().fold(f64::INFINITY, f64::min);
            let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            json!({
                "count": values.len(),
                "min": min,
                "max": max,
                "avg": sum / values.len() as f64,
                "sum": sum
            })
        }
    }
}
