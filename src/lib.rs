pub mod auth;
pub mod concurrency;
pub mod config;
pub mod errors;
pub mod health;
pub mod logging_queue;
pub mod metrics;
pub mod openai_compat;
pub mod pipeline;
pub mod quota;
pub mod security;
pub mod state;
pub mod store;
pub mod upstream;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use state::AppState;

/// Request correlation ID middleware — carried from the teacher's
/// `request_id_middleware` unchanged: stamps/propagates `X-Request-Id`,
/// records it onto the current tracing span.
async fn request_id_middleware(
    req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    tracing::Span::current().record("request_id", &request_id.as_str());

    let mut response = next.run(req).await;

    if let Ok(header_value) = axum::http::HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", header_value);
    }

    response
}

#[derive(OpenApi)]
#[openapi(
    info(title = "CF-X Router", version = "0.1.0", description = "Authoritative API gateway in front of the CF-X LLM multiplexer"),
    paths(health::health_check, metrics::metrics_handler, pipeline::chat_completions),
)]
struct ApiDoc;

/// Build the full router: public health endpoint, the protected
/// chat-completions pipeline, Swagger UI, and the per-route rate-limit
/// tiers the teacher's `create_router` establishes (an outer, IP-based
/// defense-in-depth layer — distinct from the gateway's own per-user Quota
/// and Concurrency components).
pub fn create_router(state: AppState) -> Router {
    let chat_governor = GovernorConfigBuilder::default()
        .per_second(3)
        .burst_size(20)
        .finish()
        .expect("static governor config is always valid");

    let public_routes = Router::new()
        .route("/health", get(health::health_check))
        .route("/metrics", get(metrics::metrics_handler));

    let chat_routes = Router::new()
        .route("/v1/chat/completions", post(pipeline::chat_completions))
        .layer(GovernorLayer::new(chat_governor));

    Router::new()
        .merge(public_routes)
        .merge(chat_routes)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(DefaultBodyLimit::max(10 * 1024 * 1024))
        .layer(axum::middleware::from_fn(request_id_middleware))
        .with_state(state)
}
