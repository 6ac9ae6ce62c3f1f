//! Token handling for the Djombi auth core.
//!
//! This crate provides:
//! - local token checks (JWT shape, expiry, `exp` claim decoding)
//! - the backend client that validates tokens and exchanges a primary token
//!   for a secondary one
//! - the OAuth authorization-code flow with a loopback callback server

mod error;
mod exchange;
mod oauth;
pub mod validator;

pub use error::{is_retryable_status, AuthError, AuthResult};
pub use exchange::{
    backend_message, summarize_response_body, ExchangeClient, ExchangeOutcome, ValidationFailure,
    ValidationOutcome,
};
pub use oauth::{
    AuthorizationRequest, CallbackParams, FlowEvent, LifecyclePhase, OAuthCallbackServer,
    OAuthFlowController,
};

use std::fmt;
use std::str::FromStr;

/// Which provider's token a caller needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenClass {
    /// Issued by the external OAuth provider.
    Primary,
    /// Issued by the Djombi backend.
    Secondary,
}

impl TokenClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenClass::Primary => "primary",
            TokenClass::Secondary => "secondary",
        }
    }
}

impl fmt::Display for TokenClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TokenClass {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "primary" => Ok(TokenClass::Primary),
            "secondary" => Ok(TokenClass::Secondary),
            other => Err(AuthError::Config(format!("unknown token class: {}", other))),
        }
    }
}
