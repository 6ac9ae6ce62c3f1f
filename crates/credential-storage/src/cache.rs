//! Timestamped cache entries with a fixed time-to-live.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A cached payload and the time it was stored.
///
/// An entry whose age has reached its TTL is absent. It is never served as
/// stale-but-usable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub payload: T,
    pub timestamp: DateTime<Utc>,
}

impl<T> CacheEntry<T> {
    pub fn new(payload: T, timestamp: DateTime<Utc>) -> Self {
        Self { payload, timestamp }
    }

    /// Whether the entry is still within `ttl` at `now`.
    ///
    /// Entries stamped in the future (clock moved backwards) count as expired.
    pub fn is_fresh(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        let age = now.signed_duration_since(self.timestamp);
        age >= Duration::zero() && age < ttl
    }

    /// The payload, if the entry is fresh.
    pub fn into_fresh(self, now: DateTime<Utc>, ttl: Duration) -> Option<T> {
        if self.is_fresh(now, ttl) {
            Some(self.payload)
        } else {
            None
        }
    }
}
