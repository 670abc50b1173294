//! HTTP client for the Elasticsearch REST API

use crate::bulk;
use crate::response::{error_body_reason, parse_scroll, parse_search};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Method};
use seeker::backend::{BulkOutcome, IndexBackend, SearchResponse};
use seeker::dsl::{BulkOperation, SearchRequest};
use seeker::schema::TYPE_FIELD;
use seeker::{BackendError, Error, SeekerConfig};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

const SCROLL_KEEPALIVE: &str = "1m";

enum Body {
    Empty,
    Json(Value),
    NdJson(String),
}

/// Elasticsearch backend with fail-over across the configured hosts.
///
/// A host that cannot be reached is skipped for the rest of the call and
/// the next host that answers becomes the preferred one.
pub struct EsBackend {
    client: Client,
    hosts: Vec<Url>,
    current: AtomicUsize,
    timeout: Duration,
    scroll_size: usize,
}

impl EsBackend {
    pub fn from_config(config: &SeekerConfig) -> seeker::Result<Self> {
        let hosts = config
            .require_hosts()?
            .iter()
            .map(|h| parse_host(h))
            .collect::<seeker::Result<Vec<_>>>()?;
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| Error::Config(format!("Cannot build HTTP client: {}", e)))?;

        info!(hosts = hosts.len(), "Elasticsearch backend configured");
        Ok(Self {
            client,
            hosts,
            current: AtomicUsize::new(0),
            timeout: config.request_timeout(),
            scroll_size: config.batch_size,
        })
    }

    pub fn hosts(&self) -> &[Url] {
        &self.hosts
    }

    /// The host tried first on the next call
    pub fn preferred_host(&self) -> &Url {
        &self.hosts[self.current.load(Ordering::Relaxed) % self.hosts.len()]
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: &Body,
    ) -> Result<(u16, String), BackendError> {
        let start = self.current.load(Ordering::Relaxed);
        let mut last_error = None;

        for offset in 0..self.hosts.len() {
            let i = (start + offset) % self.hosts.len();
            let host = &self.hosts[i];
            let url = host
                .join(path)
                .map_err(|e| BackendError::Protocol(format!("Bad request path '{}': {}", path, e)))?;

            let request = self.client.request(method.clone(), url);
            let request = match body {
                Body::Empty => request,
                Body::Json(value) => request.json(value),
                Body::NdJson(text) => request
                    .header(CONTENT_TYPE, "application/x-ndjson")
                    .body(text.clone()),
            };

            match request.send().await {
                Ok(response) => {
                    if i != start {
                        info!(host = %host, "Switched to host");
                        self.current.store(i, Ordering::Relaxed);
                    }
                    let status = response.status().as_u16();
                    let text = response
                        .text()
                        .await
                        .map_err(|e| self.transport_error(&e))?;
                    debug!(method = %method, path, status, "Elasticsearch request");
                    return Ok((status, text));
                }
                Err(e) => {
                    warn!(host = %host, error = %e, "Host failed, trying next");
                    last_error = Some(self.transport_error(&e));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| BackendError::Transport("no hosts".to_string())))
    }

    /// Send and require a 2xx answer
    async fn send_ok(&self, method: Method, path: &str, body: &Body) -> Result<String, BackendError> {
        let (status, text) = self.send(method, path, body).await?;
        check_status(status, &text)?;
        Ok(text)
    }

    fn transport_error(&self, e: &reqwest::Error) -> BackendError {
        if e.is_timeout() {
            BackendError::Timeout(self.timeout.as_millis() as u64)
        } else {
            BackendError::Transport(e.to_string())
        }
    }

    async fn put_mapping(&self, index: &str, mapping: &Value) -> Result<(), BackendError> {
        self.send_ok(
            Method::PUT,
            &format!("{}/_mapping", index),
            &Body::Json(mapping.clone()),
        )
        .await?;
        debug!(index, "Updated mapping");
        Ok(())
    }

    async fn clear_scroll(&self, scroll_id: String) {
        let body = Body::Json(json!({ "scroll_id": [scroll_id] }));
        if let Err(e) = self.send_ok(Method::DELETE, "_search/scroll", &body).await {
            debug!(error = %e, "Could not clear scroll");
        }
    }
}

#[async_trait]
impl IndexBackend for EsBackend {
    fn name(&self) -> &str {
        "elasticsearch"
    }

    async fn ensure_index(&self, index: &str, mapping: &Value) -> Result<(), BackendError> {
        let (status, text) = self.send(Method::HEAD, index, &Body::Empty).await?;
        match status {
            200 => self.put_mapping(index, mapping).await,
            404 => {
                let body = Body::Json(json!({ "mappings": mapping }));
                let (status, text) = self.send(Method::PUT, index, &body).await?;
                if status == 400 && text.contains("resource_already_exists_exception") {
                    // Created concurrently
                    return self.put_mapping(index, mapping).await;
                }
                check_status(status, &text)?;
                info!(index, "Created index");
                Ok(())
            }
            other => Err(rejected(other, &text)),
        }
    }

    async fn drop_index(&self, index: &str) -> Result<(), BackendError> {
        let (status, text) = self.send(Method::DELETE, index, &Body::Empty).await?;
        if status == 404 {
            return Ok(());
        }
        check_status(status, &text)?;
        info!(index, "Dropped index");
        Ok(())
    }

    async fn bulk(&self, operations: &[BulkOperation]) -> Result<BulkOutcome, BackendError> {
        if operations.is_empty() {
            return Ok(BulkOutcome::default());
        }
        let body = Body::NdJson(bulk::encode(operations)?);
        let text = self.send_ok(Method::POST, "_bulk", &body).await?;
        bulk::parse_response(&parse_json(&text)?)
    }

    async fn document_ids(
        &self,
        index: &str,
        doc_type: &str,
    ) -> Result<HashSet<String>, BackendError> {
        let mut term = Map::new();
        term.insert(TYPE_FIELD.to_string(), Value::String(doc_type.to_string()));
        let body = Body::Json(json!({
            "size": self.scroll_size,
            "_source": false,
            "query": { "term": term },
            "sort": ["_doc"],
        }));
        let path = format!("{}/_search?scroll={}", index, SCROLL_KEEPALIVE);
        let (status, text) = self.send(Method::POST, &path, &body).await?;
        if status == 404 {
            return Ok(HashSet::new());
        }
        check_status(status, &text)?;

        let mut ids = HashSet::new();
        let mut page = parse_scroll(parse_json(&text)?)?;
        let mut scroll_id = page.scroll_id.take();
        while !page.ids.is_empty() {
            ids.extend(page.ids.drain(..));
            let Some(id) = scroll_id.clone() else {
                break;
            };
            let body = Body::Json(json!({ "scroll": SCROLL_KEEPALIVE, "scroll_id": id }));
            let text = self.send_ok(Method::POST, "_search/scroll", &body).await?;
            page = parse_scroll(parse_json(&text)?)?;
            if let Some(next) = page.scroll_id.take() {
                scroll_id = Some(next);
            }
        }

        if let Some(id) = scroll_id {
            self.clear_scroll(id).await;
        }
        debug!(index, doc_type, count = ids.len(), "Listed document ids");
        Ok(ids)
    }

    async fn search(&self, request: &SearchRequest) -> Result<SearchResponse, BackendError> {
        let path = format!("{}/_search", request.index);
        let text = self
            .send_ok(Method::POST, &path, &Body::Json(request.to_body()))
            .await?;
        parse_search(parse_json(&text)?)
    }

    async fn refresh(&self, index: &str) -> Result<(), BackendError> {
        self.send_ok(Method::POST, &format!("{}/_refresh", index), &Body::Empty)
            .await?;
        Ok(())
    }
}

/// Host URL with a trailing slash so request paths join below it
fn parse_host(host: &str) -> seeker::Result<Url> {
    let mut url =
        Url::parse(host).map_err(|e| Error::Config(format!("Invalid index host '{}': {}", host, e)))?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

/// 429 and 5xx are retryable rejections; other non-2xx are final
fn check_status(status: u16, body: &str) -> Result<(), BackendError> {
    if (200..300).contains(&status) {
        Ok(())
    } else {
        Err(rejected(status, body))
    }
}

fn rejected(status: u16, body: &str) -> BackendError {
    BackendError::Rejected {
        status,
        reason: error_body_reason(body),
    }
}

fn parse_json(text: &str) -> Result<Value, BackendError> {
    serde_json::from_str(text)
        .map_err(|e| BackendError::Protocol(format!("Response is not JSON: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    fn config(hosts: &[&str]) -> SeekerConfig {
        SeekerConfig {
            index_hosts: hosts.iter().map(|h| h.to_string()).collect(),
            request_timeout_ms: 2000,
            ..SeekerConfig::default()
        }
    }

    /// A request as the mock server saw it
    #[derive(Debug)]
    struct Recorded {
        /// `METHOD /path?query`
        line: String,
        body: String,
    }

    /// Answers every connection with `status` and `body`
    async fn serve(status: u16, body: &'static str) -> String {
        serve_script(vec![(status, body)]).await.0
    }

    /// Answers connections with `responses` in order, repeating the last
    /// one, and reports every request it reads
    async fn serve_script(
        responses: Vec<(u16, &'static str)>,
    ) -> (String, mpsc::UnboundedReceiver<Recorded>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut next = 0;
            while let Ok((mut socket, _)) = listener.accept().await {
                let Some(request) = read_request(&mut socket).await else {
                    continue;
                };
                let _ = tx.send(request);
                let (status, body) = responses[next.min(responses.len() - 1)];
                next += 1;
                let response = format!(
                    "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        (format!("http://{}", addr), rx)
    }

    fn received(rx: &mut mpsc::UnboundedReceiver<Recorded>) -> Vec<Recorded> {
        let mut requests = Vec::new();
        while let Ok(request) = rx.try_recv() {
            requests.push(request);
        }
        requests
    }

    async fn read_request(socket: &mut tokio::net::TcpStream) -> Option<Recorded> {
        let mut data = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = socket.read(&mut buf).await.unwrap_or(0);
            if n == 0 {
                return None;
            }
            data.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&data);
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .find_map(|l| {
                        let (name, value) = l.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if data.len() >= end + 4 + length {
                    let line = text
                        .lines()
                        .next()
                        .and_then(|l| l.rsplit_once(' '))
                        .map(|(line, _version)| line.to_string())
                        .unwrap_or_default();
                    return Some(Recorded {
                        line,
                        body: text[end + 4..].to_string(),
                    });
                }
            }
        }
    }

    #[test]
    fn test_requires_hosts() {
        assert!(matches!(
            EsBackend::from_config(&SeekerConfig::default()),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_host_paths_end_with_slash() {
        let backend = EsBackend::from_config(&config(&["http://es:9200", "https://proxy/es"])).unwrap();
        assert_eq!(backend.hosts()[0].join("books/_search").unwrap().as_str(), "http://es:9200/books/_search");
        assert_eq!(backend.hosts()[1].join("_bulk").unwrap().as_str(), "https://proxy/es/_bulk");
    }

    #[test]
    fn test_status_mapping() {
        assert!(check_status(201, "").is_ok());
        let overloaded = check_status(429, "{}").unwrap_err();
        assert!(overloaded.is_retryable());
        let unavailable = check_status(503, "Service Unavailable").unwrap_err();
        assert!(unavailable.is_retryable());
        let bad = check_status(400, r#"{"error":{"type":"parsing_exception","reason":"bad"}}"#).unwrap_err();
        assert!(!bad.is_retryable());
        assert_eq!(
            bad,
            BackendError::Rejected {
                status: 400,
                reason: "parsing_exception: bad".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_fails_over_to_next_host() {
        let live = serve(200, r#"{"hits":{"total":{"value":1},"hits":[{"_id":"1","_source":{}}]}}"#).await;
        let backend = EsBackend::from_config(&config(&["http://127.0.0.1:1", &live])).unwrap();

        let response = backend.search(&SearchRequest::new("books")).await.unwrap();

        assert_eq!(response.total, 1);
        assert_eq!(backend.preferred_host().as_str(), format!("{}/", live));
    }

    #[tokio::test]
    async fn test_all_hosts_down_is_retryable() {
        let backend = EsBackend::from_config(&config(&["http://127.0.0.1:1"])).unwrap();
        let err = backend.refresh("books").await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_missing_index_lists_no_ids() {
        let host = serve(404, r#"{"error":{"type":"index_not_found_exception","reason":"no such index"}}"#).await;
        let backend = EsBackend::from_config(&config(&[&host])).unwrap();

        assert!(backend.document_ids("books", "book").await.unwrap().is_empty());
        backend.drop_index("books").await.unwrap();
    }

    #[tokio::test]
    async fn test_bulk_item_failures() {
        let host = serve(
            200,
            r#"{"errors":true,"items":[{"index":{"_id":"1","status":400,"error":{"type":"mapper_parsing_exception","reason":"bad year"}}}]}"#,
        )
        .await;
        let backend = EsBackend::from_config(&config(&[&host])).unwrap();
        let ops = [BulkOperation::Upsert {
            id: "1".into(),
            index: "books".into(),
            payload: json!({"year": "soon"}),
        }];

        let outcome = backend.bulk(&ops).await.unwrap();

        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].reason, "mapper_parsing_exception: bad year");
    }

    #[tokio::test]
    async fn test_ensure_index_creates_missing() {
        let (host, mut rx) = serve_script(vec![(404, ""), (200, r#"{"acknowledged":true}"#)]).await;
        let backend = EsBackend::from_config(&config(&[&host])).unwrap();
        let mapping = json!({"properties": {"title": {"type": "text"}}});

        backend.ensure_index("books", &mapping).await.unwrap();

        let requests = received(&mut rx);
        let lines: Vec<_> = requests.iter().map(|r| r.line.as_str()).collect();
        assert_eq!(lines, vec!["HEAD /books", "PUT /books"]);
        let body: Value = serde_json::from_str(&requests[1].body).unwrap();
        assert_eq!(body, json!({ "mappings": mapping }));
    }

    #[tokio::test]
    async fn test_ensure_index_updates_existing_mapping() {
        let (host, mut rx) = serve_script(vec![(200, ""), (200, r#"{"acknowledged":true}"#)]).await;
        let backend = EsBackend::from_config(&config(&[&host])).unwrap();
        let mapping = json!({"properties": {"year": {"type": "integer"}}});

        backend.ensure_index("books", &mapping).await.unwrap();

        let requests = received(&mut rx);
        let lines: Vec<_> = requests.iter().map(|r| r.line.as_str()).collect();
        assert_eq!(lines, vec!["HEAD /books", "PUT /books/_mapping"]);
        let body: Value = serde_json::from_str(&requests[1].body).unwrap();
        assert_eq!(body, mapping);
    }

    #[tokio::test]
    async fn test_document_ids_scrolls_all_pages() {
        let (host, mut rx) = serve_script(vec![
            (200, r#"{"_scroll_id":"s1","hits":{"hits":[{"_id":"1"},{"_id":"2"}]}}"#),
            (200, r#"{"_scroll_id":"s2","hits":{"hits":[{"_id":"3"}]}}"#),
            (200, r#"{"_scroll_id":"s2","hits":{"hits":[]}}"#),
            (200, r#"{"succeeded":true,"num_freed":1}"#),
        ])
        .await;
        let backend = EsBackend::from_config(&config(&[&host])).unwrap();

        let ids = backend.document_ids("books", "book").await.unwrap();

        assert_eq!(ids, HashSet::from(["1".to_string(), "2".to_string(), "3".to_string()]));
        let requests = received(&mut rx);
        let lines: Vec<_> = requests.iter().map(|r| r.line.as_str()).collect();
        assert_eq!(
            lines,
            vec![
                "POST /books/_search?scroll=1m",
                "POST /_search/scroll",
                "POST /_search/scroll",
                "DELETE /_search/scroll",
            ]
        );
        let first: Value = serde_json::from_str(&requests[0].body).unwrap();
        assert_eq!(first["query"]["term"][TYPE_FIELD], "book");
        let second: Value = serde_json::from_str(&requests[1].body).unwrap();
        assert_eq!(second["scroll_id"], "s1");
        let third: Value = serde_json::from_str(&requests[2].body).unwrap();
        assert_eq!(third["scroll_id"], "s2");
        let cleared: Value = serde_json::from_str(&requests[3].body).unwrap();
        assert_eq!(cleared["scroll_id"], json!(["s2"]));
    }
}
