//! Upstream Client: timeout + one-shot retry + circuit breaker in front of
//! the CF-X Router's LLM multiplexer.
//!
//! Grounded on the teacher's `handlers/mod.rs::send_to_anthropic` gate→call→
//! classify→retry→record shape, generalized to a plain OpenAI-compatible
//! POST and re-pointed at the exact retry policy from
//! `cfx/litellm_client.py::LiteLLMClient.chat_completions` (max 1 retry,
//! 500ms pause, retryable only on 502/503/504 or timeout/connect-error).

pub mod circuit_breaker;

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde_json::Value;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerOpenError, CircuitState};

// spec.md §5: connect timeout ~10s (set on the shared reqwest::Client in
// state.rs), read/write timeout ~120s per call.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("circuit breaker open")]
    CircuitOpen,
    #[error("upstream request timed out")]
    Timeout,
    #[error("upstream connection failed: {0}")]
    Connect(String),
    #[error("upstream returned {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("upstream response was not valid JSON: {0}")]
    InvalidJson(String),
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 502 | 503 | 504)
}

pub struct UpstreamClient {
    http: Client,
    base_url: String,
    breaker: CircuitBreaker,
}

impl UpstreamClient {
    pub fn new(http: Client, base_url: String) -> Self {
        Self { http, base_url, breaker: CircuitBreaker::new() }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Non-streaming JSON round-trip to `POST {base_url}/chat/completions`.
    pub async fn send_json(&self, body: &Value, bearer: &str) -> Result<Value, UpstreamError> {
        let response = self.send_with_retry(body, bearer, false).await?;
        let bytes = response.bytes().await.map_err(|e| UpstreamError::InvalidJson(e.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| UpstreamError::InvalidJson(e.to_string()))
    }

    /// Streaming round-trip; returns the raw byte stream of the upstream's
    /// SSE response body for the caller to relay line-by-line.
    pub async fn send_stream(
        &self,
        body: &Value,
        bearer: &str,
    ) -> Result<impl futures_util::Stream<Item = reqwest::Result<bytes::Bytes>>, UpstreamError> {
        let response = self.send_with_retry(body, bearer, true).await?;
        Ok(response.bytes_stream())
    }

    async fn send_with_retry(
        &self,
        body: &Value,
        bearer: &str,
        streaming: bool,
    ) -> Result<reqwest::Response, UpstreamError> {
        self.breaker.can_proceed().await.map_err(|CircuitBreakerOpenError| UpstreamError::CircuitOpen)?;

        match self.attempt(body, bearer, streaming).await {
            Ok(response) => {
                self.breaker.record_success().await;
                Ok(response)
            }
            Err(err) if Self::is_retryable(&err) => {
                tracing::warn!(error = %err, "upstream attempt failed, retrying once after 500ms");
                tokio::time::sleep(RETRY_DELAY).await;
                match self.attempt(body, bearer, streaming).await {
                    Ok(response) => {
                        self.breaker.record_success().await;
                        Ok(response)
                    }
                    Err(err2) => {
                        self.breaker.record_failure().await;
                        Err(err2)
                    }
                }
            }
            Err(err) => {
                self.breaker.record_failure().await;
                Err(err)
            }
        }
    }

    fn is_retryable(err: &UpstreamError) -> bool {
        match err {
            UpstreamError::Timeout | UpstreamError::Connect(_) => true,
            UpstreamError::Status { status, .. } => is_retryable_status(*status),
            _ => false,
        }
    }

    async fn attempt(&self, body: &Value, bearer: &str, streaming: bool) -> Result<reqwest::Response, UpstreamError> {
        let mut payload = body.clone();
        if let Some(obj) = payload.as_object_mut() {
            obj.insert("stream".to_string(), Value::Bool(streaming));
        }

        let result = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(bearer)
            .timeout(REQUEST_TIMEOUT)
            .json(&payload)
            .send()
            .await;

        let response = match result {
            Ok(r) => r,
            Err(e) if e.is_timeout() => return Err(UpstreamError::Timeout),
            Err(e) if e.is_connect() => return Err(UpstreamError::Connect(e.to_string())),
            Err(e) => return Err(UpstreamError::Connect(e.to_string())),
        };

        if !response.status().is_success() {
            let status = response.status();
            let body_text = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Status { status, body: body_text });
        }

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_statuses_are_exactly_502_503_504() {
        assert!(is_retryable_status(StatusCode::BAD_GATEWAY));
        assert!(is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_retryable_status(StatusCode::GATEWAY_TIMEOUT));
        assert!(!is_retryable_status(StatusCode::BAD_REQUEST));
        assert!(!is_retryable_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(!is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
    }

    #[test]
    fn timeout_and_connect_errors_are_retryable() {
        assert!(UpstreamClient::is_retryable(&UpstreamError::Timeout));
        assert!(UpstreamClient::is_retryable(&UpstreamError::Connect("x".into())));
        assert!(!UpstreamClient::is_retryable(&UpstreamError::InvalidJson("x".into())));
    }
}
