//! Quota component: atomic per-user daily request counting.
//!
//! Fails open on any store error — an outage in the counter store should
//! degrade to "allow the request" rather than take the whole gateway down,
//! mirroring `cfx/rate_limit.py`'s exact policy.

use chrono::Utc;
use uuid::Uuid;

use crate::store::{Plan, StoreAdapter, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaDecision {
    pub allowed: bool,
    pub remaining: i64,
    /// Unix epoch seconds at which the daily counter resets (next UTC midnight).
    pub reset_epoch: i64,
    pub limit: i64,
}

fn default_daily_limit() -> i64 {
    std::env::var("DAILY_REQUEST_LIMIT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(1000)
}

fn resolve_limit(plan: Option<Plan>, override_limit: Option<i64>) -> i64 {
    // Direct override always wins over plan, per cfx/rate_limit.py.
    if let Some(limit) = override_limit {
        return limit;
    }
    plan.map(Plan::daily_limit).unwrap_or_else(default_daily_limit)
}

fn next_midnight_utc_epoch() -> i64 {
    let now = Utc::now();
    let tomorrow = now.date_naive().succ_opt().unwrap_or(now.date_naive());
    tomorrow.and_hms_opt(0, 0, 0).unwrap().and_utc().timestamp()
}

pub async fn check(
    store: &dyn StoreAdapter,
    user_id: Uuid,
    plan: Option<Plan>,
    override_limit: Option<i64>,
) -> QuotaDecision {
    let limit = resolve_limit(plan, override_limit);
    let reset_epoch = next_midnight_utc_epoch();
    let today = Utc::now().date_naive();

    match store.increment_usage_counter(user_id, today).await {
        Ok(count) => QuotaDecision { allowed: count <= limit, remaining: (limit - count).max(0), reset_epoch, limit },
        Err(StoreError::NotConfigured) | Err(StoreError::Query(_)) => {
            tracing::warn!(user_id = %user_id, "quota store unavailable, failing open");
            QuotaDecision { allowed: true, remaining: limit.saturating_sub(1), reset_epoch, limit }
        }
    }
}
