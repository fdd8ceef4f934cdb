//! Prometheus-text `/metrics` endpoint.
//!
//! Not named by spec.md, but SPEC_FULL.md's ambient-stack expansion calls
//! for it: §4.5/§4.9's "operators are alerted through logs" needs something
//! to alert *from*. Grounded in the teacher's `metrics_handler` (same
//! plain-`String`-response, hand-formatted Prometheus text shape), re-pointed
//! at the gateway's own gauges instead of CPU/memory.

use axum::extract::State;

use crate::state::AppState;
use crate::upstream::CircuitState;

fn breaker_state_code(state: CircuitState) -> u8 {
    match state {
        CircuitState::Closed => 0,
        CircuitState::HalfOpen => 1,
        CircuitState::Open => 2,
    }
}

#[utoipa::path(get, path = "/metrics", responses((status = 200, description = "Prometheus text exposition")))]
pub async fn metrics_handler(State(state): State<AppState>) -> String {
    let uptime = state.start_time.elapsed().as_secs();
    let queue_depth = state.log_queue.depth();
    let active_streams = state.concurrency.total_active_streams().await;
    let breaker_state = breaker_state_code(state.upstream.breaker().state().await);

    format!(
        "# HELP cfx_router_uptime_seconds Gateway process uptime in seconds\n\
         # TYPE cfx_router_uptime_seconds counter\n\
         cfx_router_uptime_seconds {uptime}\n\
         # HELP cfx_router_log_queue_depth Records queued in the background log queue\n\
         # TYPE cfx_router_log_queue_depth gauge\n\
         cfx_router_log_queue_depth {queue_depth}\n\
         # HELP cfx_router_active_streams Active streaming requests across all users\n\
         # TYPE cfx_router_active_streams gauge\n\
         cfx_router_active_streams {active_streams}\n\
         # HELP cfx_router_circuit_breaker_state Upstream circuit breaker state (0=closed,1=half_open,2=open)\n\
         # TYPE cfx_router_circuit_breaker_state gauge\n\
         cfx_router_circuit_breaker_state {breaker_state}\n"
    )
}
