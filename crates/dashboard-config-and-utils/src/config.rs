//! Configuration management for the auth core.
//!
//! Configuration is read once at process start and then cloned into each
//! component. Nothing mutates it afterwards.

use crate::{CoreError, CoreResult, Paths};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

/// Default backend URL (can be overridden at compile time via DJOMBI_BACKEND_URL env var).
pub const DEFAULT_BACKEND_URL: &str = match option_env!("DJOMBI_BACKEND_URL") {
    Some(url) => url,
    None => "https://api.djombi.tech/api",
};

/// Default OAuth client id (can be overridden at compile time via DJOMBI_OAUTH_CLIENT_ID env var).
pub const DEFAULT_OAUTH_CLIENT_ID: &str = match option_env!("DJOMBI_OAUTH_CLIENT_ID") {
    Some(id) => id,
    None => "djombi-dashboard",
};

pub const DEFAULT_AUTHORIZATION_ENDPOINT: &str = "https://accounts.google.com/o/oauth2/v2/auth";
pub const DEFAULT_TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";
pub const DEFAULT_USERINFO_ENDPOINT: &str = "https://openidconnect.googleapis.com/v1/userinfo";
pub const DEFAULT_REDIRECT_URI: &str = "http://localhost:9876/callback";

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Organization list cache lifetime.
pub const DEFAULT_ORGANIZATION_CACHE_TTL_SECS: u64 = 300;

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_refresh_check_interval_secs() -> u64 {
    60
}

fn default_secondary_refresh_threshold_secs() -> u64 {
    50 * 60
}

fn default_primary_refresh_margin_secs() -> u64 {
    5 * 60
}

fn default_organization_cache_ttl_secs() -> u64 {
    DEFAULT_ORGANIZATION_CACHE_TTL_SECS
}

fn default_auth_status_ttl_secs() -> u64 {
    5 * 60
}

fn default_callback_timeout_secs() -> u64 {
    120
}

fn default_backend_url() -> String {
    DEFAULT_BACKEND_URL.to_string()
}

/// External OAuth provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthProviderConfig {
    pub client_id: String,
    /// Confidential clients send this on code exchange; public clients rely on PKCE alone.
    #[serde(default)]
    pub client_secret: Option<String>,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub userinfo_endpoint: String,
    pub redirect_uri: String,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
}

fn default_scopes() -> Vec<String> {
    vec!["openid".into(), "email".into(), "profile".into()]
}

impl Default for OAuthProviderConfig {
    fn default() -> Self {
        Self {
            client_id: DEFAULT_OAUTH_CLIENT_ID.to_string(),
            client_secret: None,
            authorization_endpoint: DEFAULT_AUTHORIZATION_ENDPOINT.to_string(),
            token_endpoint: DEFAULT_TOKEN_ENDPOINT.to_string(),
            userinfo_endpoint: DEFAULT_USERINFO_ENDPOINT.to_string(),
            redirect_uri: DEFAULT_REDIRECT_URI.to_string(),
            scopes: default_scopes(),
        }
    }
}

impl OAuthProviderConfig {
    /// Port the loopback callback server must bind, taken from the redirect URI.
    pub fn redirect_port(&self) -> CoreResult<u16> {
        let url = Url::parse(&self.redirect_uri)?;
        url.port_or_known_default()
            .ok_or_else(|| CoreError::Config(format!("redirect_uri has no port: {}", self.redirect_uri)))
    }

    /// Path component of the redirect URI (e.g. `/callback`).
    pub fn redirect_path(&self) -> CoreResult<String> {
        Ok(Url::parse(&self.redirect_uri)?.path().to_string())
    }
}

/// Main auth-core configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
    /// Base URL of the Djombi backend (validation, exchange, organizations).
    #[serde(default = "default_backend_url")]
    pub backend_url: String,
    #[serde(default)]
    pub oauth: OAuthProviderConfig,
    /// Upper bound on any single backend or provider request.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// How often the background task inspects token freshness.
    #[serde(default = "default_refresh_check_interval_secs")]
    pub refresh_check_interval_secs: u64,
    /// Secondary tokens older than this are refreshed.
    #[serde(default = "default_secondary_refresh_threshold_secs")]
    pub secondary_refresh_threshold_secs: u64,
    /// Primary tokens this close to expiry are refreshed by the background task.
    #[serde(default = "default_primary_refresh_margin_secs")]
    pub primary_refresh_margin_secs: u64,
    #[serde(default = "default_organization_cache_ttl_secs")]
    pub organization_cache_ttl_secs: u64,
    /// Lifetime of the memoized backend validation result.
    #[serde(default = "default_auth_status_ttl_secs")]
    pub auth_status_ttl_secs: u64,
    /// How long to wait for the browser to hit the OAuth redirect.
    #[serde(default = "default_callback_timeout_secs")]
    pub callback_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            oauth: OAuthProviderConfig::default(),
            request_timeout_secs: default_request_timeout_secs(),
            refresh_check_interval_secs: default_refresh_check_interval_secs(),
            secondary_refresh_threshold_secs: default_secondary_refresh_threshold_secs(),
            primary_refresh_margin_secs: default_primary_refresh_margin_secs(),
            organization_cache_ttl_secs: default_organization_cache_ttl_secs(),
            auth_status_ttl_secs: default_auth_status_ttl_secs(),
            callback_timeout_secs: default_callback_timeout_secs(),
        }
    }
}

impl Config {
    /// Create a new Config with default values, then override from environment.
    pub fn new() -> Self {
        let mut config = Self::default();
        config.load_from_env();
        config
    }

    /// Load configuration from the base directory, falling back to defaults.
    pub fn load(paths: &Paths) -> CoreResult<Self> {
        let config_path = paths.config_file();

        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            Self::default()
        };

        config.load_from_env();
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a file.
    pub fn save(&self, paths: &Paths) -> CoreResult<()> {
        paths.ensure_dirs()?;
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(paths.config_file(), content)?;
        Ok(())
    }

    /// Override selected fields from environment variables.
    fn load_from_env(&mut self) {
        if let Some(level) = non_empty_env("DJOMBI_LOG_LEVEL") {
            self.log_level = level;
        }
        if let Some(url) = non_empty_env("DJOMBI_BACKEND_URL") {
            self.backend_url = url;
        }
        if let Some(client_id) = non_empty_env("DJOMBI_OAUTH_CLIENT_ID") {
            self.oauth.client_id = client_id;
        }
        if let Some(secret) = non_empty_env("DJOMBI_OAUTH_CLIENT_SECRET") {
            self.oauth.client_secret = Some(secret);
        }
    }

    /// Check that every endpoint parses before any component is built.
    pub fn validate(&self) -> CoreResult<()> {
        Url::parse(&self.backend_url)?;
        Url::parse(&self.oauth.authorization_endpoint)?;
        Url::parse(&self.oauth.token_endpoint)?;
        Url::parse(&self.oauth.userinfo_endpoint)?;
        self.oauth.redirect_port()?;
        if self.oauth.client_id.trim().is_empty() {
            return Err(CoreError::Config("oauth.client_id is empty".to_string()));
        }
        Ok(())
    }

    /// Backend base URL without a trailing slash.
    pub fn backend_base(&self) -> &str {
        self.backend_url.trim_end_matches('/')
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn refresh_check_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_check_interval_secs)
    }

    pub fn callback_timeout(&self) -> Duration {
        Duration::from_secs(self.callback_timeout_secs)
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|value| !value.is_empty())
}
