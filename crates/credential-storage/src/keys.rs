//! Storage key constants.
//!
//! Every key owned by the auth core lives under [`StorageKeys::NAMESPACE`] so
//! the whole group can be removed in one pass.

/// Storage keys used by the auth core
pub struct StorageKeys;

impl StorageKeys {
    /// Prefix shared by every key below
    pub const NAMESPACE: &'static str = "djombi.auth.";

    pub const PRIMARY_ACCESS_TOKEN: &'static str = "djombi.auth.primary_access_token";
    pub const PRIMARY_REFRESH_TOKEN: &'static str = "djombi.auth.primary_refresh_token";
    /// RFC 3339 expiry of the primary access token
    pub const PRIMARY_EXPIRES_AT: &'static str = "djombi.auth.primary_expires_at";

    pub const SECONDARY_ACCESS_TOKEN: &'static str = "djombi.auth.secondary_access_token";
    pub const SECONDARY_REFRESH_TOKEN: &'static str = "djombi.auth.secondary_refresh_token";
    /// RFC 3339 issue time of the secondary token pair
    pub const SECONDARY_ISSUED_AT: &'static str = "djombi.auth.secondary_issued_at";

    /// User identity (JSON)
    pub const USER_PROFILE: &'static str = "djombi.auth.user_profile";

    /// Memoized validation status (JSON cache entry)
    pub const AUTH_STATUS: &'static str = "djombi.auth.auth_status";

    /// Organization membership list (JSON cache entry)
    pub const ORGANIZATION_CACHE: &'static str = "djombi.auth.organization_cache";

    pub const CURRENT_ORGANIZATION_ID: &'static str = "djombi.auth.current_organization_id";

    /// All keys, in the order they are cleared.
    pub const ALL: [&'static str; 10] = [
        Self::PRIMARY_ACCESS_TOKEN,
        Self::PRIMARY_REFRESH_TOKEN,
        Self::PRIMARY_EXPIRES_AT,
        Self::SECONDARY_ACCESS_TOKEN,
        Self::SECONDARY_REFRESH_TOKEN,
        Self::SECONDARY_ISSUED_AT,
        Self::USER_PROFILE,
        Self::AUTH_STATUS,
        Self::ORGANIZATION_CACHE,
        Self::CURRENT_ORGANIZATION_ID,
    ];
}
