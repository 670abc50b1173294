//! `_bulk` request encoding and response parsing

use seeker::backend::{BulkItemFailure, BulkOutcome};
use seeker::dsl::BulkOperation;
use seeker::BackendError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

#[derive(Serialize)]
struct ActionMeta<'a> {
    #[serde(rename = "_index")]
    index: &'a str,
    #[serde(rename = "_id")]
    id: &'a str,
}

/// Encode operations as an NDJSON `_bulk` body (trailing newline included)
pub fn encode(operations: &[BulkOperation]) -> Result<String, BackendError> {
    let mut body = String::new();
    for op in operations {
        let (action, meta) = match op {
            BulkOperation::Upsert { id, index, .. } => ("index", ActionMeta { index, id }),
            BulkOperation::Delete { id, index } => ("delete", ActionMeta { index, id }),
        };
        let line = HashMap::from([(action, meta)]);
        push_line(&mut body, &line)?;
        if let BulkOperation::Upsert { payload, .. } = op {
            push_line(&mut body, payload)?;
        }
    }
    Ok(body)
}

fn push_line<T: Serialize>(body: &mut String, value: &T) -> Result<(), BackendError> {
    let line = serde_json::to_string(value)
        .map_err(|e| BackendError::Protocol(format!("Cannot encode bulk line: {}", e)))?;
    body.push_str(&line);
    body.push('\n');
    Ok(())
}

#[derive(Deserialize)]
struct BulkResponse {
    #[serde(default)]
    errors: bool,
    #[serde(default)]
    items: Vec<HashMap<String, BulkItem>>,
}

#[derive(Deserialize)]
struct BulkItem {
    #[serde(rename = "_id", default)]
    id: Option<String>,
    status: u16,
    #[serde(default)]
    error: Option<Value>,
}

/// Per-item failures of a `_bulk` response.
///
/// Deleting a document that does not exist (404) is not a failure.
pub fn parse_response(body: &Value) -> Result<BulkOutcome, BackendError> {
    let response: BulkResponse = serde_json::from_value(body.clone())
        .map_err(|e| BackendError::Protocol(format!("Malformed bulk response: {}", e)))?;

    let mut outcome = BulkOutcome::default();
    if !response.errors {
        return Ok(outcome);
    }
    for item in response.items {
        for (action, result) in item {
            if result.status < 300 || (action == "delete" && result.status == 404) {
                continue;
            }
            outcome.failures.push(BulkItemFailure {
                id: result.id.unwrap_or_default(),
                status: result.status,
                reason: result
                    .error
                    .as_ref()
                    .map(error_reason)
                    .unwrap_or_else(|| format!("{} failed", action)),
            });
        }
    }
    Ok(outcome)
}

/// `type: reason` out of an Elasticsearch error object
pub fn error_reason(error: &Value) -> String {
    let kind = error.get("type").and_then(Value::as_str);
    let reason = error.get("reason").and_then(Value::as_str);
    match (kind, reason) {
        (Some(kind), Some(reason)) => format!("{}: {}", kind, reason),
        (Some(text), None) | (None, Some(text)) => text.to_string(),
        (None, None) => error
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string()),
    }
}
