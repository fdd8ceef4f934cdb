//! In-memory `StoreAdapter` used only by unit/integration tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::NaiveDate;
use uuid::Uuid;

use super::{ApiKeyRecord, RequestLogRecord, StoreAdapter, StoreError, UserLimitsRow};

#[derive(Default)]
pub struct FakeStore {
    pub keys: Mutex<HashMap<String, ApiKeyRecord>>,
    pub limits: Mutex<HashMap<Uuid, UserLimitsRow>>,
    pub counters: Mutex<HashMap<(Uuid, NaiveDate), i64>>,
    pub logs: Mutex<Vec<RequestLogRecord>>,
    /// When set, every call returns this error instead of touching the maps —
    /// used to exercise fail-open/fail-closed behavior.
    pub fail: Mutex<bool>,
}

impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(self, record: ApiKeyRecord) -> Self {
        self.keys.lock().unwrap().insert(record.key_hash.clone(), record);
        self
    }

    pub fn with_limits(self, row: UserLimitsRow) -> Self {
        self.limits.lock().unwrap().insert(row.user_id, row);
        self
    }

    pub fn set_failing(&self, failing: bool) {
        *self.fail.lock().unwrap() = failing;
    }
}

#[async_trait]
impl StoreAdapter for FakeStore {
    async fn find_active_key(&self, key_hash: &str) -> Result<Option<ApiKeyRecord>, StoreError> {
        if *self.fail.lock().unwrap() {
            return Err(StoreError::Query("simulated outage".into()));
        }
        Ok(self
            .keys
            .lock()
            .unwrap()
            .get(key_hash)
            .filter(|k| k.is_active())
            .cloned())
    }

    async fn get_user_limits(&self, user_id: Uuid) -> Result<Option<UserLimitsRow>, StoreError> {
        if *self.fail.lock().unwrap() {
            return Err(StoreError::Query("simulated outage".into()));
        }
        Ok(self.limits.lock().unwrap().get(&user_id).cloned())
    }

    async fn increment_usage_counter(&self, user_id: Uuid, day_utc: NaiveDate) -> Result<i64, StoreError> {
        if *self.fail.lock().unwrap() {
            return Err(StoreError::Query("simulated outage".into()));
        }
        let mut counters = self.counters.lock().unwrap();
        let count = counters.entry((user_id, day_utc)).or_insert(0);
        *count += 1;
        Ok(*count)
    }

    async fn insert_request_log(&self, record: &RequestLogRecord) -> Result<(), StoreError> {
        if *self.fail.lock().unwrap() {
            return Err(StoreError::Query("simulated outage".into()));
        }
        self.logs.lock().unwrap().push(record.clone());
        Ok(())
    }
}
