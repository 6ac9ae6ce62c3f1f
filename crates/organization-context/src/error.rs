//! Organization error types.

use auth_engine::AuthError;
use credential_storage::StorageError;
use thiserror::Error;

/// Organization error type.
#[derive(Error, Debug)]
pub enum OrganizationError {
    /// No response from the backend
    #[error("Network error: {0}")]
    Network(String),

    /// Backend answered with a non-success status
    #[error("Request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Organization switch failed: {0}")]
    SwitchFailed(String),

    /// The id is not among the loaded memberships
    #[error("Organization not found: {0}")]
    NotFound(String),

    /// No usable session, or the session could not be refreshed
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl OrganizationError {
    pub(crate) fn from_transport(err: reqwest::Error) -> Self {
        OrganizationError::Network(err.to_string())
    }
}

/// Result type alias using OrganizationError.
pub type OrganizationResult<T> = Result<T, OrganizationError>;
