//! Local token checks.
//!
//! Everything here is pure: no I/O, no clock reads. Callers pass `now`.

use crate::{AuthError, AuthResult};
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use credential_storage::PrimaryToken;

/// Three `.`-separated, non-empty segments.
pub fn is_jwt_shaped(token: &str) -> bool {
    let segments: Vec<&str> = token.split('.').collect();
    segments.len() == 3 && segments.iter().all(|s| !s.trim().is_empty())
}

/// Expired once `now` reaches the expiry instant.
pub fn is_expired_at(token: &PrimaryToken, now: DateTime<Utc>) -> bool {
    token.is_expired_at(now)
}

/// The `exp` claim of a JWT, if the payload decodes and carries one.
pub fn decode_jwt_expiry(token: &str) -> Option<DateTime<Utc>> {
    let mut parts = token.split('.');
    let _header = parts.next()?;
    let payload_b64 = parts.next()?;
    let payload_bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload_b64.trim_end_matches('='))
        .ok()?;
    let payload: serde_json::Value = serde_json::from_slice(&payload_bytes).ok()?;
    let exp = payload.get("exp")?.as_i64()?;
    Utc.timestamp_opt(exp, 0).single()
}

/// Shape check, then expiry check. Neither touches the network.
pub fn check_primary(token: &PrimaryToken, now: DateTime<Utc>) -> AuthResult<()> {
    if !is_jwt_shaped(&token.access_token) {
        return Err(AuthError::MalformedToken);
    }
    if is_expired_at(token, now) {
        return Err(AuthError::ExpiredToken);
    }
    Ok(())
}
