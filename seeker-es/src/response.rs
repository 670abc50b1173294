//! Search and scroll response parsing

use seeker::backend::{SearchHit, SearchResponse};
use seeker::BackendError;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// `hits.total` is a number before Elasticsearch 7 and an object after
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TotalHits {
    Count(u64),
    Object { value: u64 },
}

#[derive(Debug, Deserialize)]
struct Hit {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_score", default)]
    score: Option<f64>,
    #[serde(rename = "_source", default)]
    source: Option<Value>,
    /// Fragments per field; the first one is kept
    #[serde(default)]
    highlight: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct Hits {
    #[serde(default)]
    total: Option<TotalHits>,
    #[serde(default)]
    max_score: Option<f64>,
    #[serde(default)]
    hits: Vec<Hit>,
}

#[derive(Debug, Deserialize)]
struct EsSearchResponse {
    #[serde(rename = "_scroll_id", default)]
    scroll_id: Option<String>,
    hits: Hits,
    #[serde(default)]
    aggregations: Option<Value>,
}

fn decode(body: Value) -> Result<EsSearchResponse, BackendError> {
    serde_json::from_value(body)
        .map_err(|e| BackendError::Protocol(format!("Malformed search response: {}", e)))
}

pub fn parse_search(body: Value) -> Result<SearchResponse, BackendError> {
    let response = decode(body)?;
    let total = match response.hits.total {
        Some(TotalHits::Count(n)) | Some(TotalHits::Object { value: n }) => n,
        None => response.hits.hits.len() as u64,
    };
    Ok(SearchResponse {
        total,
        max_score: response.hits.max_score,
        hits: response
            .hits
            .hits
            .into_iter()
            .map(|h| {
                let mut hit = SearchHit::new(h.id, h.score, h.source.unwrap_or(Value::Null));
                hit.highlight = h
                    .highlight
                    .into_iter()
                    .filter_map(|(field, fragments)| {
                        fragments.into_iter().next().map(|first| (field, first))
                    })
                    .collect();
                hit
            })
            .collect(),
        aggregations: response
            .aggregations
            .unwrap_or_else(|| Value::Object(Default::default())),
    })
}

/// One page of a scroll: its ids and the id of the next page
pub struct ScrollPage {
    pub scroll_id: Option<String>,
    pub ids: Vec<String>,
}

pub fn parse_scroll(body: Value) -> Result<ScrollPage, BackendError> {
    let response = decode(body)?;
    Ok(ScrollPage {
        scroll_id: response.scroll_id,
        ids: response.hits.hits.into_iter().map(|h| h.id).collect(),
    })
}

/// Human readable reason out of an error response body
pub fn error_body_reason(body: &str) -> String {
    match serde_json::from_str::<Value>(body) {
        Ok(json) => match json.get("error") {
            Some(error) => crate::bulk::error_reason(error),
            None => truncate(body),
        },
        Err(_) => truncate(body),
    }
}

fn truncate(body: &str) -> String {
    const MAX: usize = 500;
    match body.char_indices().nth(MAX) {
        Some((cut, _)) => format!("{}...", &body[..cut]),
        None => body.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_total_as_object() {
        let body = json!({
            "took": 2,
            "hits": {
                "total": {"value": 42, "relation": "eq"},
                "max_score": 2.5,
                "hits": [{
                    "_index": "books",
                    "_id": "7",
                    "_score": 1.25,
                    "_source": {"title": "Dune"},
                    "highlight": {"title": ["<em>Dune</em>", "second fragment"], "summary": []}
                }]
            },
            "aggregations": {"genre": {"buckets": [{"key": "scifi", "doc_count": 42}]}}
        });

        let response = parse_search(body).unwrap();

        assert_eq!(response.total, 42);
        assert_eq!(response.hits[0].id, "7");
        assert_eq!(response.hits[0].source["title"], "Dune");
        assert_eq!(response.max_score, Some(2.5));
        assert_eq!(response.hits[0].percentile(response.max_score), 50.0);
        assert_eq!(response.hits[0].highlighted("title"), Some("<em>Dune</em>"));
        assert!(!response.hits[0].highlight.contains_key("summary"));
        assert_eq!(response.aggregations["genre"]["buckets"][0]["doc_count"], 42);
    }

    #[test]
    fn test_total_as_number() {
        let body = json!({"hits": {"total": 3, "max_score": null, "hits": []}});
        let response = parse_search(body).unwrap();
        assert_eq!(response.total, 3);
        assert_eq!(response.max_score, None);
        assert!(response.aggregations.as_object().unwrap().is_empty());
    }

    #[test]
    fn test_scroll_page() {
        let body = json!({
            "_scroll_id": "abc",
            "hits": {"total": {"value": 2}, "hits": [{"_id": "1"}, {"_id": "2"}]}
        });
        let page = parse_scroll(body).unwrap();
        assert_eq!(page.scroll_id.as_deref(), Some("abc"));
        assert_eq!(page.ids, vec!["1", "2"]);
    }

    #[test]
    fn test_missing_hits_is_protocol_error() {
        assert!(matches!(
            parse_search(json!({"acknowledged": true})),
            Err(BackendError::Protocol(_))
        ));
    }

    #[test]
    fn test_error_body_reason() {
        let body = r#"{"error":{"type":"index_not_found_exception","reason":"no such index [x]"},"status":404}"#;
        assert_eq!(error_body_reason(body), "index_not_found_exception: no such index [x]");
        assert_eq!(error_body_reason("Bad Gateway"), "Bad Gateway");
    }
}
