//! Authentication error types.

use thiserror::Error;

/// Authentication error type.
#[derive(Error, Debug)]
pub enum AuthError {
    /// Token is not a three-segment JWT
    #[error("Malformed token")]
    MalformedToken,

    /// Token expiry has been reached
    #[error("Token expired")]
    ExpiredToken,

    /// Backend refused the token or answered with an error
    #[error("Token validation failed: {0}")]
    Validation(String),

    /// Backend refused to issue a secondary token
    #[error("Token exchange failed: {0}")]
    ExchangeFailed(String),

    /// Request never produced a response (connection refused, DNS, reset)
    #[error("Network error: {0}")]
    Network(String),

    /// Backend answered but could not serve the request right now (5xx, 408, 429)
    #[error("Server error ({status}): {message}")]
    ServerError { status: u16, message: String },

    /// OAuth provider or callback error
    #[error("OAuth error: {0}")]
    OAuth(String),

    /// No session in the store
    #[error("Not logged in")]
    NotLoggedIn,

    /// Invalid state transition in the session FSM
    #[error("Invalid auth state transition: {0}")]
    InvalidStateTransition(String),

    /// Timeout error
    #[error("Operation timed out")]
    Timeout,

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(#[from] credential_storage::StorageError),

    /// HTTP request error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// URL parse error
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl AuthError {
    /// Returns true if this error is transient and the operation can be retried.
    ///
    /// Semantic rejections (bad token, refused exchange) are never transient.
    pub fn is_transient(&self) -> bool {
        match self {
            AuthError::Network(_) => true,
            AuthError::Timeout => true,
            AuthError::ServerError { .. } => true,
            AuthError::Http(e) => {
                if e.is_connect() || e.is_timeout() {
                    return true;
                }
                if let Some(status) = e.status() {
                    return status.is_server_error();
                }
                false
            }
            _ => false,
        }
    }

    /// Build the error for a non-success answer, keeping retryable statuses
    /// apart from `rejection`.
    pub fn from_status(
        status: reqwest::StatusCode,
        message: String,
        rejection: impl FnOnce(String) -> AuthError,
    ) -> Self {
        if is_retryable_status(status) {
            AuthError::ServerError {
                status: status.as_u16(),
                message,
            }
        } else {
            rejection(message)
        }
    }

    /// Report a retryable answer from the exchange endpoint as a refused exchange.
    ///
    /// Used where the exchange has no stored session to fall back on.
    pub fn into_exchange_failure(self) -> Self {
        match self {
            AuthError::ServerError { message, .. } => AuthError::ExchangeFailed(message),
            other => other,
        }
    }

    /// Map a reqwest send failure onto the transport variants.
    pub fn from_transport(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AuthError::Timeout
        } else if err.is_connect() || err.is_request() {
            AuthError::Network(err.to_string())
        } else {
            AuthError::Http(err)
        }
    }
}

/// Statuses that say "try again later" rather than "no".
pub fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    status.is_server_error()
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status == reqwest::StatusCode::TOO_MANY_REQUESTS
}

/// Result type alias using AuthError.
pub type AuthResult<T> = Result<T, AuthError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_transient_network() {
        assert!(AuthError::Network("connection refused".to_string()).is_transient());
    }

    #[test]
    fn test_is_transient_timeout() {
        assert!(AuthError::Timeout.is_transient());
    }

    #[test]
    fn test_is_not_transient_malformed() {
        assert!(!AuthError::MalformedToken.is_transient());
        assert!(!AuthError::ExpiredToken.is_transient());
    }

    #[test]
    fn test_is_not_transient_rejections() {
        assert!(!AuthError::Validation("revoked".to_string()).is_transient());
        assert!(!AuthError::ExchangeFailed("nope".to_string()).is_transient());
        assert!(!AuthError::OAuth("invalid_grant".to_string()).is_transient());
    }

    #[test]
    fn test_from_status_separates_retryable_answers() {
        use reqwest::StatusCode;

        for status in [
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::BAD_GATEWAY,
            StatusCode::REQUEST_TIMEOUT,
            StatusCode::TOO_MANY_REQUESTS,
        ] {
            let err = AuthError::from_status(status, "later".to_string(), AuthError::ExchangeFailed);
            assert!(err.is_transient(), "{} should be transient", status);
        }

        for status in [StatusCode::BAD_REQUEST, StatusCode::UNAUTHORIZED, StatusCode::FORBIDDEN] {
            let err = AuthError::from_status(status, "no".to_string(), AuthError::ExchangeFailed);
            assert!(matches!(err, AuthError::ExchangeFailed(_)));
            assert!(!err.is_transient());
        }
    }

    #[test]
    fn test_into_exchange_failure_keeps_backend_message() {
        let err = AuthError::ServerError {
            status: 500,
            message: "exchange down".to_string(),
        };
        match err.into_exchange_failure() {
            AuthError::ExchangeFailed(message) => assert_eq!(message, "exchange down"),
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(matches!(
            AuthError::Timeout.into_exchange_failure(),
            AuthError::Timeout
        ));
    }

    #[test]
    fn test_is_not_transient_not_logged_in() {
        assert!(!AuthError::NotLoggedIn.is_transient());
    }
}
