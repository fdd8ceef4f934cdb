//! Store Adapter — the only component that talks SQL.
//!
//! `StoreAdapter` is a trait so that Auth/Quota can be exercised against
//! `FakeStore` in tests without a live Postgres instance (the teacher's own
//! `AppState::new_test` uses `PgPool::connect_lazy` for the same reason, but
//! that only gets you a pool that *builds*, not one that answers queries).

pub mod models;
pub mod pg;

/// In-memory test double. Not cfg-gated so integration tests in `tests/`
/// (compiled as a separate crate) can use it too — `#[doc(hidden)]`
/// discourages reaching for it outside tests.
#[doc(hidden)]
pub mod fake;

use async_trait::async_trait;
use uuid::Uuid;

pub use models::*;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store not configured")]
    NotConfigured,
    #[error("store query failed: {0}")]
    Query(String),
}

#[async_trait]
pub trait StoreAdapter: Send + Sync {
    /// Look up an active API key by its hash. `Ok(None)` means "not found",
    /// distinct from `Err` (backend unavailable) — see `auth::authenticate`.
    async fn find_active_key(&self, key_hash: &str) -> Result<Option<ApiKeyRecord>, StoreError>;

    async fn get_user_limits(&self, user_id: Uuid) -> Result<Option<UserLimitsRow>, StoreError>;

    /// Atomically increment today's counter for `user_id` and return the new
    /// count. Implementations must create the row if absent.
    async fn increment_usage_counter(&self, user_id: Uuid, day_utc: chrono::NaiveDate) -> Result<i64, StoreError>;

    async fn insert_request_log(&self, record: &RequestLogRecord) -> Result<(), StoreError>;
}
