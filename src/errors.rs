//! Gateway-wide error type and its HTTP mapping — the Rust encoding of
//! SPEC_FULL.md §7's error handling table.

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::openai_compat::error_envelope;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("{0}")]
    AuthRejected(String),

    #[error("{0}")]
    AuthBackendUnavailable(String),

    #[error("daily request quota exceeded")]
    QuotaExceeded { limit: i64, remaining: i64, reset_epoch: i64 },

    #[error("streaming concurrency limit exceeded")]
    ConcurrencyExceeded { cap: u32 },

    #[error("invalid stage: {0}")]
    InvalidStage(String),

    #[error("upstream is temporarily unavailable")]
    UpstreamUnavailable,

    #[error("upstream request timed out")]
    UpstreamTimeout,

    #[error("upstream returned an error: {status}")]
    UpstreamStatus { status: StatusCode },
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        match self {
            GatewayError::InvalidRequest(msg) => {
                (StatusCode::BAD_REQUEST, Json(error_envelope("invalid_request_error", &msg, None))).into_response()
            }
            GatewayError::AuthRejected(msg) => (
                StatusCode::UNAUTHORIZED,
                Json(error_envelope("authentication_error", &msg, Some("invalid_api_key"))),
            )
                .into_response(),
            // Per spec.md §4.4/§7 the auth backend outage is still a 401 (the
            // client still can't be authenticated) but carries a distinct
            // `code` so operators can tell a lookup outage from a bad key.
            GatewayError::AuthBackendUnavailable(msg) => (
                StatusCode::UNAUTHORIZED,
                Json(error_envelope("authentication_error", &msg, Some("service_unavailable"))),
            )
                .into_response(),
            GatewayError::QuotaExceeded { limit, remaining, reset_epoch } => {
                let mut response = (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(error_envelope("rate_limit_error", "Daily request quota exceeded", None)),
                )
                    .into_response();
                let headers = response.headers_mut();
                insert_header(headers, "x-ratelimit-limit", limit);
                insert_header(headers, "x-ratelimit-remaining", remaining);
                insert_header(headers, "x-ratelimit-reset", reset_epoch);
                insert_header(headers, "retry-after", reset_epoch);
                response
            }
            GatewayError::ConcurrencyExceeded { cap } => {
                let mut response = (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(error_envelope("rate_limit_error", "Streaming concurrency limit exceeded", None)),
                )
                    .into_response();
                // spec.md §4.10 step 5: the streaming-specific 429 carries the
                // slot cap as X-RateLimit-Limit/Remaining; remaining is always
                // 0 here since the caller only reaches this branch when every
                // slot is already taken.
                insert_header(response.headers_mut(), "x-ratelimit-limit", cap as i64);
                insert_header(response.headers_mut(), "x-ratelimit-remaining", 0);
                response
            }
            GatewayError::InvalidStage(msg) => {
                (StatusCode::BAD_REQUEST, Json(error_envelope("invalid_request_error", &msg, None))).into_response()
            }
            GatewayError::UpstreamUnavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(error_envelope("service_unavailable_error", "Upstream service is temporarily unavailable", None)),
            )
                .into_response(),
            // spec.md §6 groups timeouts and connect errors with the circuit
            // breaker under 503 service_unavailable_error, distinct from the
            // 502 upstream_error reserved for a non-retryable non-2xx.
            GatewayError::UpstreamTimeout => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(error_envelope("service_unavailable_error", "Upstream request timed out", None)),
            )
                .into_response(),
            // A non-retryable non-2xx from the upstream is never relayed with
            // its own status code — per spec.md §6/§7 and `main.py`'s
            // `httpx.HTTPStatusError` handler, a 503 from the upstream maps
            // to our own 503 service_unavailable_error, and every other
            // status collapses to 502 upstream_error so the client can't
            // mistake an upstream fault for its own request being rejected.
            GatewayError::UpstreamStatus { status } if status == StatusCode::SERVICE_UNAVAILABLE => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(error_envelope("service_unavailable_error", "Upstream service unavailable", None)),
            )
                .into_response(),
            GatewayError::UpstreamStatus { status } => (
                StatusCode::BAD_GATEWAY,
                Json(error_envelope("upstream_error", &format!("Upstream error: {status}"), None)),
            )
                .into_response(),
        }
    }
}

fn insert_header(headers: &mut axum::http::HeaderMap, name: &'static str, value: i64) {
    if let Ok(v) = HeaderValue::from_str(&value.to_string()) {
        headers.insert(name, v);
    }
}
