//! Keyed-hash construction and bearer-token extraction.
//!
//! API keys are never stored in the clear. Every key is hashed with
//! HMAC-SHA256 keyed by `KEY_HASH_PEPPER`, salted with `HASH_SALT`, before it
//! ever touches a comparison or the database.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Hash an API key for storage/lookup: `HMAC-SHA256(pepper, "salt:key:pepper")`.
///
/// Salt and pepper both enter the message so that two gateways sharing a
/// pepper but using different salts never produce colliding hashes.
pub fn hash_api_key(raw_key: &str, salt: &str, pepper: &str) -> String {
    let message = format!("{salt}:{raw_key}:{pepper}");
    let mut mac = HmacSha256::new_from_slice(pepper.as_bytes()).expect("HMAC accepts any key length");
    mac.update(message.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a raw key against a stored digest in constant time.
pub fn verify(raw_key: &str, salt: &str, pepper: &str, stored_hash: &str) -> bool {
    let computed = hash_api_key(raw_key, salt, pepper);
    // Hex digests are fixed-length (64 chars for SHA-256); mismatched length
    // alone would otherwise short-circuit the comparison non-constantly.
    if computed.len() != stored_hash.len() {
        return false;
    }
    computed.as_bytes().ct_eq(stored_hash.as_bytes()).into()
}

/// Extract the raw token from an `Authorization: Bearer <token>` header value.
///
/// Returns `None` for a missing header, a non-`Bearer` scheme, or a token
/// that is empty after trimming whitespace.
pub fn extract_bearer_token(header_value: Option<&str>) -> Option<String> {
    let value = header_value?;
    let rest = value.strip_prefix("Bearer ")?;
    let token = rest.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// Fail fast at startup if the salt/pepper pair can't produce a meaningful hash.
pub fn validate_hash_config(salt: &str, pepper: &str) -> Result<(), String> {
    if salt.is_empty() || pepper.is_empty() {
        return Err("HASH_SALT and KEY_HASH_PEPPER must both be set".to_string());
    }
    if salt == pepper {
        return Err("HASH_SALT and KEY_HASH_PEPPER must not be equal".to_string());
    }
    Ok(())
}
