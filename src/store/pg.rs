//! Postgres-backed `StoreAdapter`, grounded in the teacher's
//! `sqlx::query_as::<_, Row>` / `#[derive(sqlx::FromRow)]` style
//! (`state.rs`, `service_tokens.rs`).

use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::PgPool;
use uuid::Uuid;

use super::{ApiKeyRecord, RequestLogRecord, StoreAdapter, StoreError, UserLimitsRow};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StoreAdapter for PgStore {
    async fn find_active_key(&self, key_hash: &str) -> Result<Option<ApiKeyRecord>, StoreError> {
        sqlx::query_as::<_, ApiKeyRecord>(
            "SELECT id, user_id, key_hash, status FROM api_keys WHERE key_hash = $1 AND status = 'active' LIMIT 1",
        )
        .bind(key_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))
    }

    async fn get_user_limits(&self, user_id: Uuid) -> Result<Option<UserLimitsRow>, StoreError> {
        sqlx::query_as::<_, UserLimitsRow>(
            "SELECT user_id, plan, daily_request_limit, streaming_concurrency_cap FROM users WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))
    }

    async fn increment_usage_counter(&self, user_id: Uuid, day_utc: NaiveDate) -> Result<i64, StoreError> {
        // Upsert-then-increment, matching cfx/rate_limit.py's atomic path:
        // a single statement so two concurrent requests for the same user
        // never race on read-then-write.
        sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO usage_counters (user_id, day_utc, request_count, updated_at)
            VALUES ($1, $2, 1, now())
            ON CONFLICT (user_id, day_utc)
            DO UPDATE SET request_count = usage_counters.request_count + 1, updated_at = now()
            RETURNING request_count
            "#,
        )
        .bind(user_id)
        .bind(day_utc)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))
    }

    async fn insert_request_log(&self, record: &RequestLogRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO request_logs
                (request_id, user_id, api_key_id, session_id, stage, model, status_code, latency_ms,
                 prompt_tokens, completion_tokens, total_tokens, cost_usd, error, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(record.request_id)
        .bind(record.user_id)
        .bind(record.api_key_id)
        .bind(&record.session_id)
        .bind(&record.stage)
        .bind(&record.model)
        .bind(record.status_code as i32)
        .bind(record.latency_ms)
        .bind(record.prompt_tokens)
        .bind(record.completion_tokens)
        .bind(record.total_tokens)
        .bind(record.cost_usd)
        .bind(&record.error)
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(())
    }
}
