//! Query execution against one descriptor
//!
//! Everything in a [`QueryRequest`] (filter, facets, facet selections and
//! sort) is compiled and validated before the backend is called, so an
//! invalid request never costs a round trip.

use crate::backend::{IndexBackend, SearchHit};
use crate::config::{DefaultOperator, RetryConfig, SeekerConfig};
use crate::dsl::{DslQuery, SearchRequest, SortClause, SortOrder};
use crate::error::{Error, Result};
use crate::facets::{FacetResult, FacetSpec};
use crate::filter::F;
use crate::metrics::QueryTimer;
use crate::retry::with_retry;
use crate::schema::{DocumentDescriptor, FieldKind, TYPE_FIELD};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// A window into the result list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 10,
        }
    }
}

impl Page {
    pub fn new(offset: usize, limit: usize) -> Self {
        Self { offset, limit }
    }

    /// 1-based page number; 0 is treated as the first page
    pub fn number(n: usize, per_page: usize) -> Self {
        Self {
            offset: n.saturating_sub(1).saturating_mul(per_page),
            limit: per_page,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueryRequest {
    pub text: Option<String>,
    pub filter: Option<F>,
    pub facets: Vec<FacetSpec>,
    /// Selected values per facet name, ANDed with `filter`
    pub selections: BTreeMap<String, Vec<String>>,
    /// `field`, `field:asc`, `field:desc` or `-field`
    pub sort: Vec<String>,
    pub page: Page,
    /// Text fields to return highlighted fragments for
    pub highlight: Vec<String>,
}

impl QueryRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn filter(mut self, filter: F) -> Self {
        self.filter = Some(match self.filter.take() {
            Some(existing) => existing & filter,
            None => filter,
        });
        self
    }

    pub fn facet(mut self, facet: FacetSpec) -> Self {
        self.facets.push(facet);
        self
    }

    /// Restrict results to documents matching the selected facet values
    pub fn select<I, S>(mut self, facet_name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.selections
            .entry(facet_name.into())
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    pub fn sort(mut self, sort: impl Into<String>) -> Self {
        self.sort.push(sort.into());
        self
    }

    pub fn page(mut self, page: Page) -> Self {
        self.page = page;
        self
    }

    pub fn highlight<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.highlight.extend(fields.into_iter().map(Into::into));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    pub total: u64,
    /// Best score among all matches; see [`SearchHit::percentile`]
    pub max_score: Option<f64>,
    pub hits: Vec<SearchHit>,
    pub facets: Vec<FacetResult>,
}

pub struct QueryExecutor {
    backend: Arc<dyn IndexBackend>,
    retry: RetryConfig,
    timeout: Duration,
    default_operator: DefaultOperator,
    simple_query: bool,
}

impl QueryExecutor {
    pub fn new(backend: Arc<dyn IndexBackend>, config: &SeekerConfig) -> Self {
        Self {
            backend,
            retry: config.retry.clone(),
            timeout: config.request_timeout(),
            default_operator: config.default_operator,
            simple_query: config.use_simple_query,
        }
    }

    pub async fn query(
        &self,
        descriptor: &DocumentDescriptor,
        request: &QueryRequest,
    ) -> Result<QueryResult> {
        let search = self.build_search(descriptor, request)?;
        let response = self.execute(&search).await?;

        let facets = request
            .facets
            .iter()
            .map(|facet| facet.parse(&response.aggregations))
            .collect();
        Ok(QueryResult {
            total: response.total,
            max_score: response.max_score,
            hits: response.hits,
            facets,
        })
    }

    /// Number of documents matching `text` and `filter`
    pub async fn count(
        &self,
        descriptor: &DocumentDescriptor,
        text: Option<&str>,
        filter: Option<&F>,
    ) -> Result<u64> {
        let mut search = self.base_search(descriptor, text);
        search.filter = Some(restrict_to_type(descriptor, compile_filter(descriptor, filter)?));
        search.size = 0;
        Ok(self.execute(&search).await?.total)
    }

    /// Compile and validate a request without sending it
    pub fn build_search(
        &self,
        descriptor: &DocumentDescriptor,
        request: &QueryRequest,
    ) -> Result<SearchRequest> {
        let mut filter = request.filter.clone();
        for (name, values) in &request.selections {
            let facet = request
                .facets
                .iter()
                .find(|f| &f.name == name)
                .ok_or_else(|| Error::InvalidFacetField {
                    field: name.clone(),
                    reason: "selection for a facet that is not requested".to_string(),
                })?;
            if let Some(selected) = facet.filter_for(values) {
                filter = Some(match filter {
                    Some(f) => f & selected,
                    None => selected,
                });
            }
        }

        let compiled = compile_filter(descriptor, filter.as_ref())?;
        let mut aggregations = BTreeMap::new();
        for facet in &request.facets {
            let (name, aggregation) = facet.compile(descriptor)?;
            aggregations.insert(name, aggregation);
        }
        let sort = request
            .sort
            .iter()
            .map(|s| parse_sort(descriptor, s))
            .collect::<Result<Vec<_>>>()?;
        let highlight = request
            .highlight
            .iter()
            .map(|f| check_highlight(descriptor, f))
            .collect::<Result<Vec<_>>>()?;

        let mut search = self.base_search(descriptor, request.text.as_deref());
        search.filter = Some(restrict_to_type(descriptor, compiled));
        search.sort = sort;
        search.from = request.page.offset;
        search.size = request.page.limit;
        search.aggregations = aggregations;
        search.highlight = highlight;
        Ok(search)
    }

    fn base_search(&self, descriptor: &DocumentDescriptor, text: Option<&str>) -> SearchRequest {
        let mut search = SearchRequest::new(descriptor.index_name());
        search.query_text = text.map(str::to_string);
        search.default_operator = self.default_operator;
        search.simple_query = self.simple_query;
        search
    }

    async fn execute(&self, search: &SearchRequest) -> Result<crate::backend::SearchResponse> {
        let timer = QueryTimer::new(&search.index);
        debug!(index = %search.index, from = search.from, size = search.size, "Executing search");
        match with_retry("search", &self.retry, self.timeout, || self.backend.search(search)).await {
            Ok(response) => {
                timer.success();
                Ok(response)
            }
            Err(e) => {
                warn!(index = %search.index, error = %e, "Search failed");
                timer.error(error_type(&e));
                Err(e.into())
            }
        }
    }
}

fn compile_filter(descriptor: &DocumentDescriptor, filter: Option<&F>) -> Result<Option<DslQuery>> {
    filter.map(|f| f.compile(descriptor)).transpose()
}

fn restrict_to_type(descriptor: &DocumentDescriptor, filter: Option<DslQuery>) -> DslQuery {
    let type_term = DslQuery::term(TYPE_FIELD, Value::String(descriptor.doc_type().to_string()));
    match filter {
        Some(filter) => DslQuery::filter_all(vec![type_term, filter]),
        None => type_term,
    }
}

fn error_type(e: &crate::error::BackendError) -> &'static str {
    use crate::error::BackendError;
    match e {
        BackendError::Transport(_) => "transport",
        BackendError::Timeout(_) => "timeout",
        BackendError::Rejected { .. } => "rejected",
        BackendError::Protocol(_) => "protocol",
    }
}

/// Highlighting works on analyzed text, so the field must be an indexed
/// text field addressed by its own name
fn check_highlight(descriptor: &DocumentDescriptor, field: &str) -> Result<String> {
    let invalid = |reason: &str| Error::InvalidHighlightField {
        field: field.to_string(),
        reason: reason.to_string(),
    };
    let resolved = descriptor
        .resolve_field(field)
        .ok_or_else(|| invalid("not declared"))?;
    if !resolved.schema.indexed {
        return Err(invalid("not indexed"));
    }
    if !resolved.schema.kind.is_text() || field.ends_with(".raw") {
        return Err(invalid("only analyzed text can be highlighted"));
    }
    Ok(field.to_string())
}

/// Parse `field`, `field:asc`, `field:desc` or `-field`.
///
/// The field must be declared, indexed and hold a single comparable value;
/// raw-string fields sort on their untokenized copy.
pub fn parse_sort(descriptor: &DocumentDescriptor, sort: &str) -> Result<SortClause> {
    let invalid = |reason: &str| Error::InvalidSortField {
        sort: sort.to_string(),
        reason: reason.to_string(),
    };

    let (field, order) = match sort.split_once(':') {
        Some((field, "asc")) => (field, SortOrder::Asc),
        Some((field, "desc")) => (field, SortOrder::Desc),
        Some((_, direction)) => {
            return Err(invalid(&format!(
                "unknown direction '{}', expected 'asc' or 'desc'",
                direction
            )))
        }
        None => match sort.strip_prefix('-') {
            Some(field) => (field, SortOrder::Desc),
            None => (sort, SortOrder::Asc),
        },
    };
    if field.is_empty() {
        return Err(invalid("empty field"));
    }

    let resolved = descriptor
        .resolve_field(field)
        .ok_or_else(|| invalid("not declared"))?;
    if !resolved.schema.indexed {
        return Err(invalid("not indexed"));
    }
    match resolved.schema.kind {
        FieldKind::Object(_) => return Err(invalid("object fields cannot be sorted")),
        FieldKind::String if !resolved.schema.facetable => {
            return Err(invalid("analyzed text cannot be sorted"))
        }
        _ => {}
    }
    Ok(SortClause {
        field: resolved.exact_path,
        order,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldSchema, MemorySource};

    fn descriptor() -> DocumentDescriptor {
        DocumentDescriptor::builder(Arc::new(MemorySource::new("Book", vec![])))
            .field(FieldSchema::raw_string("title"))
            .field(FieldSchema::integer("year"))
            .field(FieldSchema::string("notes").not_indexed())
            .build()
            .unwrap()
    }

    #[test]
    fn test_page_number() {
        assert_eq!(Page::number(1, 20), Page::new(0, 20));
        assert_eq!(Page::number(3, 20), Page::new(40, 20));
        assert_eq!(Page::number(0, 20), Page::new(0, 20));
        assert_eq!(Page::number(usize::MAX, 20), Page::new(usize::MAX, 20));
    }

    #[test]
    fn test_parse_sort() {
        let d = descriptor();
        let clause = parse_sort(&d, "title").unwrap();
        assert_eq!(clause.field, "title.raw");
        assert_eq!(clause.order, SortOrder::Asc);

        assert_eq!(parse_sort(&d, "year:desc").unwrap().order, SortOrder::Desc);
        assert_eq!(parse_sort(&d, "-year").unwrap().order, SortOrder::Desc);
    }

    #[test]
    fn test_invalid_sorts() {
        let d = descriptor();
        for sort in ["year:sideways", "missing", "notes", ":asc"] {
            assert!(
                matches!(parse_sort(&d, sort), Err(Error::InvalidSortField { .. })),
                "{} should be rejected",
                sort
            );
        }
    }

    #[test]
    fn test_highlight_fields_are_validated() {
        let backend = Arc::new(crate::backend::MemoryBackend::new());
        let executor = QueryExecutor::new(backend, &SeekerConfig::default());
        let d = descriptor();

        let search = executor
            .build_search(&d, &QueryRequest::new().highlight(["title"]))
            .unwrap();
        assert_eq!(search.highlight, vec!["title"]);

        for field in ["year", "notes", "missing", "title.raw"] {
            assert!(
                matches!(
                    executor.build_search(&d, &QueryRequest::new().highlight([field])),
                    Err(Error::InvalidHighlightField { .. })
                ),
                "{} should be rejected",
                field
            );
        }
    }

    #[test]
    fn test_build_search_restricts_to_doc_type() {
        let backend = Arc::new(crate::backend::MemoryBackend::new());
        let executor = QueryExecutor::new(backend, &SeekerConfig::default());
        let request = QueryRequest::new().text("dune").filter(F::gte("year", 1960));

        let search = executor.build_search(&descriptor(), &request).unwrap();
        let body = search.to_body();
        let filters = &body["query"]["bool"]["filter"][0]["bool"]["filter"];
        assert_eq!(filters[0]["term"][TYPE_FIELD], "book");
        assert_eq!(filters[1]["range"]["year"]["gte"], 1960);
        assert_eq!(body["query"]["bool"]["must"][0]["query_string"]["query"], "dune");
    }
}
