//! High-level API for the auth core's persisted state.

use crate::{
    AuthStatusRecord, CacheEntry, CredentialBackend, PrimaryToken, SecondaryToken, StorageError,
    StorageKeys, StorageResult, UserIdentity, WriteBatch,
};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

/// Tokens to overwrite. `None` leaves that class untouched.
#[derive(Debug, Clone, Default)]
pub struct TokenUpdate {
    pub primary: Option<PrimaryToken>,
    pub secondary: Option<SecondaryToken>,
}

impl TokenUpdate {
    pub fn primary(token: PrimaryToken) -> Self {
        Self {
            primary: Some(token),
            secondary: None,
        }
    }

    pub fn secondary(token: SecondaryToken) -> Self {
        Self {
            primary: None,
            secondary: Some(token),
        }
    }

    pub fn both(primary: PrimaryToken, secondary: SecondaryToken) -> Self {
        Self {
            primary: Some(primary),
            secondary: Some(secondary),
        }
    }
}

/// Typed storage for tokens, identity, auth status and organization selection.
///
/// Writes are whole-value overwrites. Reads never fail: missing or malformed
/// values come back as `None` and are logged.
pub struct CredentialStore {
    backend: Box<dyn CredentialBackend>,
}

impl CredentialStore {
    pub fn new(backend: Box<dyn CredentialBackend>) -> Self {
        Self { backend }
    }

    // ==========================================
    // Tokens
    // ==========================================

    pub fn set_tokens(&self, update: &TokenUpdate) -> StorageResult<()> {
        self.backend.apply(Self::token_batch(WriteBatch::new(), update))
    }

    /// Store tokens and identity in one write.
    pub fn set_session(&self, update: &TokenUpdate, user: &UserIdentity) -> StorageResult<()> {
        let batch = Self::token_batch(WriteBatch::new(), update)
            .set(StorageKeys::USER_PROFILE, to_json(user)?);
        self.backend.apply(batch)
    }

    fn token_batch(mut batch: WriteBatch, update: &TokenUpdate) -> WriteBatch {
        if let Some(primary) = &update.primary {
            batch = batch
                .set(StorageKeys::PRIMARY_ACCESS_TOKEN, primary.access_token.as_str())
                .set(StorageKeys::PRIMARY_EXPIRES_AT, primary.expires_at.to_rfc3339());
            batch = match &primary.refresh_token {
                Some(refresh) => batch.set(StorageKeys::PRIMARY_REFRESH_TOKEN, refresh.as_str()),
                None => batch.delete(StorageKeys::PRIMARY_REFRESH_TOKEN),
            };
        }
        if let Some(secondary) = &update.secondary {
            batch = batch
                .set(StorageKeys::SECONDARY_ACCESS_TOKEN, secondary.access_token.as_str())
                .set(StorageKeys::SECONDARY_REFRESH_TOKEN, secondary.refresh_token.as_str())
                .set(StorageKeys::SECONDARY_ISSUED_AT, secondary.issued_at.to_rfc3339());
        }
        batch
    }

    pub fn get_primary(&self) -> Option<PrimaryToken> {
        let access_token = self.read(StorageKeys::PRIMARY_ACCESS_TOKEN)?;
        let expires_at = self.read_timestamp(StorageKeys::PRIMARY_EXPIRES_AT)?;
        Some(PrimaryToken {
            access_token,
            refresh_token: self.read(StorageKeys::PRIMARY_REFRESH_TOKEN),
            expires_at,
        })
    }

    pub fn get_secondary(&self) -> Option<SecondaryToken> {
        let access_token = self.read(StorageKeys::SECONDARY_ACCESS_TOKEN)?;
        let refresh_token = self.read(StorageKeys::SECONDARY_REFRESH_TOKEN)?;
        let issued_at = self.read_timestamp(StorageKeys::SECONDARY_ISSUED_AT)?;
        Some(SecondaryToken {
            access_token,
            refresh_token,
            issued_at,
        })
    }

    // ==========================================
    // Identity & auth status
    // ==========================================

    pub fn set_user(&self, user: &UserIdentity) -> StorageResult<()> {
        self.backend.set(StorageKeys::USER_PROFILE, &to_json(user)?)
    }

    pub fn get_user(&self) -> Option<UserIdentity> {
        self.read_json(StorageKeys::USER_PROFILE)
    }

    pub fn set_auth_status(&self, status: &CacheEntry<AuthStatusRecord>) -> StorageResult<()> {
        self.backend.set(StorageKeys::AUTH_STATUS, &to_json(status)?)
    }

    pub fn get_auth_status(&self) -> Option<CacheEntry<AuthStatusRecord>> {
        self.read_json(StorageKeys::AUTH_STATUS)
    }

    // ==========================================
    // Organizations
    // ==========================================

    pub fn set_organization_cache<T: Serialize>(&self, entry: &CacheEntry<T>) -> StorageResult<()> {
        self.backend
            .set(StorageKeys::ORGANIZATION_CACHE, &to_json(entry)?)
    }

    pub fn get_organization_cache<T: DeserializeOwned>(&self) -> Option<CacheEntry<T>> {
        self.read_json(StorageKeys::ORGANIZATION_CACHE)
    }

    pub fn invalidate_organization_cache(&self) -> StorageResult<()> {
        self.backend.delete(StorageKeys::ORGANIZATION_CACHE)?;
        Ok(())
    }

    pub fn set_current_organization_id(&self, organization_id: &str) -> StorageResult<()> {
        self.backend
            .set(StorageKeys::CURRENT_ORGANIZATION_ID, organization_id)
    }

    pub fn get_current_organization_id(&self) -> Option<String> {
        self.read(StorageKeys::CURRENT_ORGANIZATION_ID)
    }

    pub fn clear_current_organization_id(&self) -> StorageResult<()> {
        self.backend.delete(StorageKeys::CURRENT_ORGANIZATION_ID)?;
        Ok(())
    }

    // ==========================================
    // Clear All
    // ==========================================

    /// Remove every key in the auth namespace in one write.
    pub fn clear_all(&self) -> StorageResult<()> {
        let mut keys: Vec<String> = StorageKeys::ALL.iter().map(|k| k.to_string()).collect();

        match self.backend.keys_with_prefix(StorageKeys::NAMESPACE) {
            Ok(extra) => keys.extend(extra.into_iter().filter(|k| !StorageKeys::ALL.contains(&k.as_str()))),
            Err(e) => warn!(error = %e, "Could not list stored keys, clearing known keys only"),
        }

        let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        self.backend.delete_many(&refs)?;
        debug!(count = refs.len(), "Credential store cleared");
        Ok(())
    }

    // ==========================================
    // Tolerant reads
    // ==========================================

    fn read(&self, key: &str) -> Option<String> {
        match self.backend.get(key) {
            Ok(value) => value,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to read stored value");
                None
            }
        }
    }

    fn read_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.read(key)?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key = %key, error = %e, "Ignoring malformed stored value");
                None
            }
        }
    }

    fn read_timestamp(&self, key: &str) -> Option<DateTime<Utc>> {
        let raw = self.read(key)?;
        match DateTime::parse_from_rfc3339(&raw) {
            Ok(ts) => Some(ts.with_timezone(&Utc)),
            Err(e) => {
                warn!(key = %key, error = %e, "Ignoring malformed stored timestamp");
                None
            }
        }
    }
}

fn to_json<T: Serialize>(value: &T) -> StorageResult<String> {
    serde_json::to_string(value).map_err(|e| StorageError::Encoding(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FileBackend, MemoryBackend};
    use chrono::{Duration, SubsecRound};
    use tempfile::tempdir;

    fn memory_store() -> CredentialStore {
        CredentialStore::new(Box::new(MemoryBackend::new()))
    }

    fn primary() -> PrimaryToken {
        PrimaryToken {
            access_token: "header.payload.signature".to_string(),
            refresh_token: Some("primary-refresh".to_string()),
            expires_at: (Utc::now() + Duration::hours(1)).trunc_subsecs(0),
        }
    }

    fn secondary() -> SecondaryToken {
        SecondaryToken {
            access_token: "secondary-access".to_string(),
            refresh_token: "secondary-refresh".to_string(),
            issued_at: Utc::now().trunc_subsecs(0),
        }
    }

    fn user() -> UserIdentity {
        UserIdentity {
            user_id: "user-123".to_string(),
            email: "ada@example.com".to_string(),
            first_name: "Ada".to_string(),
            last_name: "Lovelace".to_string(),
        }
    }

    #[test]
    fn test_tokens_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("credentials.json");

        let expected = TokenUpdate::both(primary(), secondary());
        crate::create_file_store(&path)
            .set_tokens(&expected)
            .unwrap();

        // Simulated reload: nothing carried over but the file.
        let reopened = CredentialStore::new(Box::new(FileBackend::new(&path)));
        assert_eq!(reopened.get_primary(), expected.primary);
        assert_eq!(reopened.get_secondary(), expected.secondary);
    }

    #[test]
    fn test_set_session_writes_tokens_and_user() {
        let store = memory_store();
        store
            .set_session(&TokenUpdate::both(primary(), secondary()), &user())
            .unwrap();

        assert!(store.get_primary().is_some());
        assert!(store.get_secondary().is_some());
        assert_eq!(store.get_user(), Some(user()));
    }

    #[test]
    fn test_primary_without_refresh_token_removes_old_one() {
        let store = memory_store();
        store.set_tokens(&TokenUpdate::primary(primary())).unwrap();

        let mut replacement = primary();
        replacement.refresh_token = None;
        store.set_tokens(&TokenUpdate::primary(replacement)).unwrap();

        assert_eq!(store.get_primary().unwrap().refresh_token, None);
    }

    #[test]
    fn test_secondary_update_leaves_primary_untouched() {
        let store = memory_store();
        let original = primary();
        store
            .set_tokens(&TokenUpdate::both(original.clone(), secondary()))
            .unwrap();

        let mut rotated = secondary();
        rotated.access_token = "rotated".to_string();
        store.set_tokens(&TokenUpdate::secondary(rotated)).unwrap();

        assert_eq!(store.get_primary(), Some(original));
        assert_eq!(store.get_secondary().unwrap().access_token, "rotated");
    }

    #[test]
    fn test_clear_all_leaves_no_residue() {
        let backend = MemoryBackend::new();
        backend.set("djombi.auth.legacy_flag", "1").unwrap();
        backend.set("unrelated.key", "keep").unwrap();
        let store = CredentialStore::new(Box::new(backend));

        store
            .set_session(&TokenUpdate::both(primary(), secondary()), &user())
            .unwrap();
        store
            .set_auth_status(&CacheEntry::new(
                AuthStatusRecord {
                    authenticated: true,
                    user_id: Some("user-123".to_string()),
                },
                Utc::now(),
            ))
            .unwrap();
        store
            .set_organization_cache(&CacheEntry::new(vec!["org-1".to_string()], Utc::now()))
            .unwrap();
        store.set_current_organization_id("org-1").unwrap();

        store.clear_all().unwrap();

        assert!(store.get_primary().is_none());
        assert!(store.get_secondary().is_none());
        assert!(store.get_user().is_none());
        assert!(store.get_auth_status().is_none());
        assert!(store.get_organization_cache::<Vec<String>>().is_none());
        assert!(store.get_current_organization_id().is_none());
        assert!(store
            .backend
            .keys_with_prefix(StorageKeys::NAMESPACE)
            .unwrap()
            .is_empty());
        assert_eq!(
            store.backend.get("unrelated.key").unwrap(),
            Some("keep".to_string())
        );
    }

    #[test]
    fn test_malformed_values_read_as_none() {
        let backend = MemoryBackend::new();
        backend.set(StorageKeys::USER_PROFILE, "{broken").unwrap();
        backend
            .set(StorageKeys::PRIMARY_ACCESS_TOKEN, "a.b.c")
            .unwrap();
        backend
            .set(StorageKeys::PRIMARY_EXPIRES_AT, "yesterday")
            .unwrap();
        backend.set(StorageKeys::AUTH_STATUS, "[]").unwrap();
        let store = CredentialStore::new(Box::new(backend));

        assert!(store.get_user().is_none());
        assert!(store.get_primary().is_none());
        assert!(store.get_auth_status().is_none());
    }

    #[test]
    fn test_unreadable_file_reads_as_none() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        std::fs::write(&path, "garbage").unwrap();

        let store = crate::create_file_store(&path);
        assert!(store.get_primary().is_none());
        assert!(store.get_current_organization_id().is_none());
    }

    #[test]
    fn test_organization_cache_invalidate() {
        let store = memory_store();
        store
            .set_organization_cache(&CacheEntry::new(vec![1u32, 2, 3], Utc::now()))
            .unwrap();
        assert_eq!(
            store.get_organization_cache::<Vec<u32>>().unwrap().payload,
            vec![1, 2, 3]
        );

        store.invalidate_organization_cache().unwrap();
        assert!(store.get_organization_cache::<Vec<u32>>().is_none());
    }
}
