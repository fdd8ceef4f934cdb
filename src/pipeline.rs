//! The orchestrating `/v1/chat/completions` handler.
//!
//! Implements SPEC_FULL.md §4.10's ordered flow: Auth → Quota → (start the
//! latency timer) → Concurrency (streaming only) → Config rewrite → Upstream
//! → Background log. The timer is created immediately after the quota
//! decision succeeds and is available on every terminal branch below,
//! including the streaming error paths — this is the fix for the Open
//! Question #1 bug in the original implementation (a `start_time` referenced
//! in outer exception handlers that was never assigned on that path).

use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use futures_util::StreamExt;
use serde_json::Value;
use uuid::Uuid;

use crate::auth::{self, AuthDecision};
use crate::errors::GatewayError;
use crate::logging_queue::{calculate_cost, extract_token_usage};
use crate::openai_compat;
use crate::quota;
use crate::state::AppState;
use crate::store::{Plan, RequestLogRecord};

struct RequestTimer {
    start: Instant,
}

impl RequestTimer {
    fn start() -> Self {
        Self { start: Instant::now() }
    }

    fn elapsed_ms(&self) -> i64 {
        self.start.elapsed().as_millis() as i64
    }
}

fn resolve_stage(headers: &HeaderMap) -> String {
    headers
        .get("x-cfx-stage")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        // `x_cfx_stage or config.get_default_stage()` in main.py treats an
        // absent *or* empty header as falsy and falls back to the default.
        .unwrap_or_else(|| crate::config::Config::default_stage().to_string())
}

#[utoipa::path(
    post,
    path = "/v1/chat/completions",
    request_body = serde_json::Value,
    responses(
        (status = 200, description = "Chat completion (JSON or SSE stream)"),
        (status = 401, description = "Invalid or missing API key"),
        (status = 429, description = "Daily quota or streaming concurrency limit exceeded"),
        (status = 503, description = "Upstream or auth backend unavailable"),
    )
)]
pub async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    raw_body: Bytes,
) -> Result<Response, GatewayError> {
    // Parsed by hand rather than via the `Json<Value>` extractor: axum's
    // `JsonRejection` answers malformed bodies with a plain-text 400, not
    // the `{"error": {...}}` envelope spec.md §4.10 step 3 / §6 require
    // (mirroring `main.py`'s explicit `json.JSONDecodeError` handling).
    let body: Value = serde_json::from_slice(&raw_body)
        .map_err(|e| GatewayError::InvalidRequest(format!("Invalid JSON: {e}")))?;

    let request_id = Uuid::new_v4();
    let session_id = headers.get("x-cfx-session-id").and_then(|v| v.to_str().ok()).map(str::to_string);

    // ── 1. Auth ──────────────────────────────────────────────────────────
    let auth_header = headers.get("authorization").and_then(|v| v.to_str().ok());
    let decision = auth::authenticate(state.store.as_ref(), auth_header, &state.settings.hash_salt, &state.settings.key_hash_pepper).await;

    let (user_id, api_key_id) = match decision {
        AuthDecision::Authenticated { user_id, api_key_id } => (user_id, api_key_id),
        AuthDecision::Rejected(msg) => return Err(GatewayError::AuthRejected(msg)),
        AuthDecision::BackendUnavailable(msg) => return Err(GatewayError::AuthBackendUnavailable(msg)),
    };

    // ── 2. Quota ─────────────────────────────────────────────────────────
    let limits = state.store.get_user_limits(user_id).await.ok().flatten();
    let plan = limits.as_ref().and_then(|l| Plan::from_str_opt(l.plan.as_deref()));
    let override_limit = limits.as_ref().and_then(|l| l.daily_request_limit);
    let concurrency_cap_override = limits.as_ref().and_then(|l| l.streaming_concurrency_cap).map(|c| c as u32);

    let quota_decision = quota::check(state.store.as_ref(), user_id, plan, override_limit).await;
    if !quota_decision.allowed {
        return Err(GatewayError::QuotaExceeded {
            limit: quota_decision.limit,
            remaining: quota_decision.remaining,
            reset_epoch: quota_decision.reset_epoch,
        });
    }

    // ── Open Question #1: the latency timer starts here, right after the
    // quota decision succeeds, and is in scope for every branch below. ──
    let timer = RequestTimer::start();

    // ── 3. Stage resolution + config rewrite ────────────────────────────
    let stage = resolve_stage(&headers);
    if !state.config.is_stage_valid(&stage) {
        return Err(GatewayError::InvalidStage(format!("unknown or disabled stage: {stage}")));
    }
    let model = state.config.get_model_for_stage(&stage).expect("validated stage always resolves").to_string();

    // ── 4. Request validation ────────────────────────────────────────────
    if let Err(msg) = openai_compat::validate_request(&body) {
        return Err(GatewayError::InvalidRequest(msg));
    }

    let is_streaming = body.get("stream").and_then(|v| v.as_bool()).unwrap_or(false);
    let rewritten = openai_compat::rewrite_model(&body, &model);
    let bearer = std::env::var("CFX_UPSTREAM_API_KEY").unwrap_or_default();

    if is_streaming {
        handle_streaming(state, user_id, api_key_id, plan, concurrency_cap_override, request_id, session_id, stage, model, rewritten, bearer, timer, quota_decision).await
    } else {
        handle_non_streaming(state, user_id, api_key_id, request_id, session_id, stage, model, rewritten, bearer, timer, quota_decision).await
    }
}

/// Attach the success-path response headers mandated by spec.md §4.10 step 8:
/// request id, resolved stage/model, and the rate-limit triad carried over
/// from the quota decision made earlier in the pipeline.
fn apply_response_headers(
    response: &mut Response,
    request_id: Uuid,
    stage: &str,
    model: &str,
    quota_decision: &quota::QuotaDecision,
) {
    let headers = response.headers_mut();
    if let Ok(v) = axum::http::HeaderValue::from_str(&request_id.to_string()) {
        headers.insert("x-cfx-request-id", v);
    }
    if let Ok(v) = axum::http::HeaderValue::from_str(stage) {
        headers.insert("x-cfx-stage", v);
    }
    if let Ok(v) = axum::http::HeaderValue::from_str(model) {
        headers.insert("x-cfx-model-used", v);
    }
    if let Ok(v) = axum::http::HeaderValue::from_str(&quota_decision.limit.to_string()) {
        headers.insert("x-ratelimit-limit", v);
    }
    if let Ok(v) = axum::http::HeaderValue::from_str(&quota_decision.remaining.to_string()) {
        headers.insert("x-ratelimit-remaining", v);
    }
    if let Ok(v) = axum::http::HeaderValue::from_str(&quota_decision.reset_epoch.to_string()) {
        headers.insert("x-ratelimit-reset", v);
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_non_streaming(
    state: AppState,
    user_id: Uuid,
    api_key_id: Uuid,
    request_id: Uuid,
    session_id: Option<String>,
    stage: String,
    model: String,
    body: Value,
    bearer: String,
    timer: RequestTimer,
    quota_decision: quota::QuotaDecision,
) -> Result<Response, GatewayError> {
    match state.upstream.send_json(&body, &bearer).await {
        Ok(response_body) => {
            let (prompt_tokens, completion_tokens, total_tokens) = extract_token_usage(&response_body);
            let cost = match (prompt_tokens, completion_tokens) {
                (Some(p), Some(c)) => calculate_cost(&model, p, c),
                _ => None,
            };
            log_request(&state, request_id, Some(user_id), Some(api_key_id), session_id, &stage, &model, 200, timer.elapsed_ms(), prompt_tokens, completion_tokens, total_tokens, cost, None);
            let mut response = (StatusCode::OK, Json(response_body)).into_response();
            apply_response_headers(&mut response, request_id, &stage, &model, &quota_decision);
            Ok(response)
        }
        Err(err) => {
            let gw_err = upstream_error_to_gateway(err);
            let status = gateway_error_status(&gw_err);
            log_request(&state, request_id, Some(user_id), Some(api_key_id), session_id, &stage, &model, status, timer.elapsed_ms(), None, None, None, None, Some(gw_err.to_string()));
            Err(gw_err)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_streaming(
    state: AppState,
    user_id: Uuid,
    api_key_id: Uuid,
    plan: Option<Plan>,
    concurrency_cap_override: Option<u32>,
    request_id: Uuid,
    session_id: Option<String>,
    stage: String,
    model: String,
    body: Value,
    bearer: String,
    timer: RequestTimer,
    quota_decision: quota::QuotaDecision,
) -> Result<Response, GatewayError> {
    // Direct override beats plan beats process default, mirroring Quota's
    // resolve_limit precedence (spec.md §3 User record invariant).
    let cap = concurrency_cap_override.or_else(|| plan.map(Plan::streaming_concurrency_cap)).unwrap_or_else(|| {
        std::env::var("STREAMING_CONCURRENCY_CAP").ok().and_then(|v| v.parse().ok()).unwrap_or(2)
    });

    let Some(guard) = state.concurrency.try_acquire(user_id, cap).await else {
        let elapsed = timer.elapsed_ms();
        log_request(&state, request_id, Some(user_id), Some(api_key_id), session_id, &stage, &model, 429, elapsed, None, None, None, None, Some("streaming concurrency limit exceeded".to_string()));
        return Err(GatewayError::ConcurrencyExceeded { cap });
    };

    let upstream_result = state.upstream.send_stream(&body, &bearer).await;

    let mut upstream_stream = match upstream_result {
        Ok(s) => s,
        Err(err) => {
            drop(guard);
            let gw_err = upstream_error_to_gateway(err);
            let status = gateway_error_status(&gw_err);
            log_request(&state, request_id, Some(user_id), Some(api_key_id), session_id, &stage, &model, status, timer.elapsed_ms(), None, None, None, None, Some(gw_err.to_string()));
            return Err(gw_err);
        }
    };

    let log_state = state.clone();
    let log_model = model.clone();
    let log_stage = stage.clone();
    let input_chars = crate::logging_queue::total_input_chars(&body);

    let byte_stream = async_stream::stream! {
        // The guard lives for the whole generator; dropping it at the end of
        // this block (success, error, or early client disconnect) always
        // releases the concurrency slot.
        let _guard = guard;
        let mut sse_buffer = String::new();
        let mut prompt_tokens = None;
        let mut completion_tokens = None;
        let mut total_tokens = None;
        let mut accumulated_content = String::new();
        let mut status_code: u16 = 200;
        let mut error_message: Option<String> = None;

        while let Some(chunk) = upstream_stream.next().await {
            match chunk {
                Ok(bytes) => {
                    sse_buffer.push_str(&String::from_utf8_lossy(&bytes));
                    while let Some(pos) = sse_buffer.find('\n') {
                        let line: String = sse_buffer.drain(..=pos).collect();
                        let line = line.trim_end();
                        match openai_compat::parse_sse_line(line) {
                            Some(Ok(Some(event))) => {
                                let (p, c, t) = extract_token_usage(&event);
                                prompt_tokens = p.or(prompt_tokens);
                                completion_tokens = c.or(completion_tokens);
                                total_tokens = t.or(total_tokens);
                                if let Some(content) = crate::logging_queue::extract_streaming_content(&event) {
                                    accumulated_content.push_str(content);
                                }
                                yield Ok::<_, std::io::Error>(bytes::Bytes::from(openai_compat::format_sse_event(&event)));
                            }
                            Some(Ok(None)) => {
                                yield Ok(bytes::Bytes::from_static(openai_compat::format_sse_done().as_bytes()));
                            }
                            _ => {}
                        }
                    }
                }
                Err(err) => {
                    status_code = 502;
                    error_message = Some(err.to_string());
                    break;
                }
            }
        }

        // spec.md §4.10: if the stream finished without a usage block, fall
        // back to the 4-chars-per-token estimator — never used for quota
        // decisions, only to avoid a null cost column.
        if completion_tokens.is_none() && !accumulated_content.is_empty() {
            completion_tokens = Some(crate::logging_queue::estimate_tokens_from_chars(accumulated_content.len()));
        }
        if prompt_tokens.is_none() && input_chars > 0 {
            prompt_tokens = Some(crate::logging_queue::estimate_tokens_from_chars(input_chars));
        }
        if total_tokens.is_none() {
            total_tokens = match (prompt_tokens, completion_tokens) {
                (Some(p), Some(c)) => Some(p + c),
                _ => None,
            };
        }

        let cost = match (prompt_tokens, completion_tokens) {
            (Some(p), Some(c)) => calculate_cost(&log_model, p, c),
            _ => None,
        };
        log_request(&log_state, request_id, Some(user_id), Some(api_key_id), session_id, &log_stage, &log_model, status_code, timer.elapsed_ms(), prompt_tokens, completion_tokens, total_tokens, cost, error_message);
    };

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .body(Body::from_stream(byte_stream))
        .expect("static response builder never fails");
    apply_response_headers(&mut response, request_id, &stage, &model, &quota_decision);
    Ok(response)
}

fn upstream_error_to_gateway(err: crate::upstream::UpstreamError) -> GatewayError {
    use crate::upstream::UpstreamError;
    match err {
        UpstreamError::CircuitOpen => GatewayError::UpstreamUnavailable,
        UpstreamError::Timeout => GatewayError::UpstreamTimeout,
        UpstreamError::Connect(_) => GatewayError::UpstreamUnavailable,
        UpstreamError::Status { status, .. } => GatewayError::UpstreamStatus { status },
        UpstreamError::InvalidJson(_) => GatewayError::UpstreamStatus { status: StatusCode::BAD_GATEWAY },
    }
}

fn gateway_error_status(err: &GatewayError) -> u16 {
    match err {
        GatewayError::InvalidRequest(_) | GatewayError::InvalidStage(_) => 400,
        GatewayError::AuthRejected(_) => 401,
        GatewayError::AuthBackendUnavailable(_) => 401,
        GatewayError::QuotaExceeded { .. } | GatewayError::ConcurrencyExceeded { .. } => 429,
        GatewayError::UpstreamUnavailable => 503,
        GatewayError::UpstreamTimeout => 503,
        // Mirrors the IntoResponse mapping in errors.rs: a 503 from the
        // upstream surfaces as our own 503, everything else as 502.
        GatewayError::UpstreamStatus { status } if *status == StatusCode::SERVICE_UNAVAILABLE => 503,
        GatewayError::UpstreamStatus { .. } => 502,
    }
}

#[allow(clippy::too_many_arguments)]
fn log_request(
    state: &AppState,
    request_id: Uuid,
    user_id: Option<Uuid>,
    api_key_id: Option<Uuid>,
    session_id: Option<String>,
    stage: &str,
    model: &str,
    status_code: u16,
    latency_ms: i64,
    prompt_tokens: Option<i64>,
    completion_tokens: Option<i64>,
    total_tokens: Option<i64>,
    cost_usd: Option<f64>,
    error: Option<String>,
) {
    state.log_queue.enqueue(RequestLogRecord {
        request_id,
        user_id,
        api_key_id,
        session_id,
        stage: Some(stage.to_string()),
        model: Some(model.to_string()),
        status_code,
        latency_ms,
        prompt_tokens,
        completion_tokens,
        total_tokens,
        cost_usd,
        error,
        created_at: Utc::now(),
    });
}
