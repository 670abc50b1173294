//! Bounded retry of backend calls with exponential backoff

use crate::config::RetryConfig;
use crate::error::BackendError;
use crate::metrics;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Run a backend call, each attempt under `timeout`.
///
/// Only retryable failures are repeated, at most `max_retries` times; the
/// last error is returned once retries are exhausted.
pub async fn with_retry<F, Fut, T>(
    operation: &str,
    retry: &RetryConfig,
    timeout: Duration,
    mut call: F,
) -> Result<T, BackendError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BackendError>>,
{
    let mut attempt = 0;

    loop {
        let result = match tokio::time::timeout(timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout(timeout.as_millis() as u64)),
        };

        match result {
            Ok(value) => {
                if attempt > 0 {
                    debug!(operation, retries = attempt, "Backend call succeeded after retries");
                }
                return Ok(value);
            }
            Err(e) if e.is_retryable() && attempt < retry.max_retries => {
                attempt += 1;
                let delay = retry.backoff(attempt);
                warn!(
                    operation,
                    attempt,
                    max_retries = retry.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Backend call failed, retrying"
                );
                metrics::record_retry(operation);
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
