//! Public, unauthenticated health endpoint.

use axum::Json;
use serde_json::{json, Value};

/// `GET /health` — always 200 once the process is up; this gateway has no
/// separate readiness gate since its dependencies (store, upstream) are
/// each individually fail-open/fail-closed per request rather than at
/// startup.
#[utoipa::path(get, path = "/health", responses((status = 200, description = "Service is up")))]
pub async fn health_check() -> Json<Value> {
    Json(json!({ "status": "ok", "service": "cfx-router" }))
}
