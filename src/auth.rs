//! Auth component: header → key → hash → record → `AuthDecision`.

use uuid::Uuid;

use crate::security;
use crate::store::{StoreAdapter, StoreError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    Authenticated { user_id: Uuid, api_key_id: Uuid },
    /// The key is missing, malformed, not found, or revoked — the client's
    /// fault, maps to 401.
    Rejected(String),
    /// The store could not be reached — ours, maps to 503. Distinguished
    /// from `Rejected` per `cfx/auth.py`'s ValueError-vs-Exception split.
    BackendUnavailable(String),
}

pub async fn authenticate(
    store: &dyn StoreAdapter,
    authorization_header: Option<&str>,
    salt: &str,
    pepper: &str,
) -> AuthDecision {
    let Some(raw_key) = security::extract_bearer_token(authorization_header) else {
        return AuthDecision::Rejected("Missing or invalid Authorization header".to_string());
    };

    let key_hash = security::hash_api_key(&raw_key, salt, pepper);

    match store.find_active_key(&key_hash).await {
        Ok(Some(record)) => AuthDecision::Authenticated { user_id: record.user_id, api_key_id: record.id },
        Ok(None) => AuthDecision::Rejected("Invalid API key".to_string()),
        Err(StoreError::NotConfigured) => {
            AuthDecision::BackendUnavailable("Authentication service unavailable".to_string())
        }
        Err(StoreError::Query(err)) => {
            tracing::error!(error = %err, "authentication store query failed");
            AuthDecision::BackendUnavailable("Authentication service error".to_string())
        }
    }
}
