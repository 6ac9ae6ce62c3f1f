//! Credential and identity types persisted by the store.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Token issued by the external OAuth provider.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryToken {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl PrimaryToken {
    /// Expired once `now` reaches `expires_at`; the boundary instant counts as expired.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Whether the token expires within `margin` of `now`.
    pub fn expires_within(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        now + margin >= self.expires_at
    }
}

impl fmt::Debug for PrimaryToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrimaryToken")
            .field("access_token", &"<redacted>")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Service-scoped token pair issued by the backend in exchange for a primary token.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecondaryToken {
    pub access_token: String,
    pub refresh_token: String,
    pub issued_at: DateTime<Utc>,
}

impl SecondaryToken {
    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.issued_at)
    }
}

impl fmt::Debug for SecondaryToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecondaryToken")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .finish()
    }
}

/// Authenticated user, as reported by either provider.
///
/// Accepts both snake_case and the backend's camelCase field names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    #[serde(alias = "userId", alias = "id", alias = "_id", alias = "sub")]
    pub user_id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default, alias = "firstName", alias = "given_name")]
    pub first_name: String,
    #[serde(default, alias = "lastName", alias = "family_name")]
    pub last_name: String,
}

impl UserIdentity {
    pub fn display_name(&self) -> String {
        let full = format!("{} {}", self.first_name, self.last_name);
        let trimmed = full.trim();
        if trimmed.is_empty() {
            self.email.clone()
        } else {
            trimmed.to_string()
        }
    }
}

/// Outcome of the last backend validation, memoized to avoid repeat round trips.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthStatusRecord {
    pub authenticated: bool,
    #[serde(default)]
    pub user_id: Option<String>,
}
