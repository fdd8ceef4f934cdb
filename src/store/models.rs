//! Row types persisted/queried through the Store Adapter.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum KeyStatus {
    Active,
    Revoked,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ApiKeyRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub key_hash: String,
    pub status: String,
}

impl ApiKeyRecord {
    pub fn is_active(&self) -> bool {
        self.status == "active"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Starter,
    Pro,
    Agency,
}

impl Plan {
    pub fn from_str_opt(s: Option<&str>) -> Option<Plan> {
        match s {
            Some("starter") => Some(Plan::Starter),
            Some("pro") => Some(Plan::Pro),
            Some("agency") => Some(Plan::Agency),
            _ => None,
        }
    }

    /// Daily request limit for this plan. See SPEC_FULL.md / DESIGN.md Quota.
    pub fn daily_limit(self) -> i64 {
        match self {
            Plan::Starter => 1000,
            Plan::Pro => 4000,
            Plan::Agency => 15000,
        }
    }

    /// Max concurrent streaming requests for this plan.
    pub fn streaming_concurrency_cap(self) -> u32 {
        match self {
            Plan::Starter => 1,
            Plan::Pro => 2,
            Plan::Agency => 5,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserLimitsRow {
    pub user_id: Uuid,
    pub plan: Option<String>,
    pub daily_request_limit: Option<i64>,
    pub streaming_concurrency_cap: Option<i32>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UsageCounterRow {
    pub user_id: Uuid,
    pub day_utc: NaiveDate,
    pub request_count: i64,
    pub updated_at: DateTime<Utc>,
}

/// Append-only usage/audit record. Written by the Background Log Queue,
/// never on the request's hot path.
#[derive(Debug, Clone, Serialize)]
pub struct RequestLogRecord {
    pub request_id: Uuid,
    pub user_id: Option<Uuid>,
    pub api_key_id: Option<Uuid>,
    pub session_id: Option<String>,
    pub stage: Option<String>,
    pub model: Option<String>,
    pub status_code: u16,
    pub latency_ms: i64,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
    pub cost_usd: Option<f64>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}
