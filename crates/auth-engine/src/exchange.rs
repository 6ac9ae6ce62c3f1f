//! Backend REST client for validating tokens and issuing secondary tokens.

use crate::error::is_retryable_status;
use crate::validator;
use crate::{AuthError, AuthResult, TokenClass};
use credential_storage::{CredentialStore, PrimaryToken, SecondaryToken, TokenUpdate, UserIdentity};
use dashboard_config_and_utils::{Clock, Config};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Length and digest of a response body, safe to log in place of the body.
pub fn summarize_response_body(body: &str) -> String {
    let mut hasher = DefaultHasher::new();
    body.hash(&mut hasher);
    format!("len={},digest={:016x}", body.len(), hasher.finish())
}

/// Pull `message` out of an error body, falling back to the status reason.
pub fn backend_message(status: StatusCode, body: &str) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        message: Option<String>,
    }

    serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|b| b.message)
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string()
        })
}

/// Why the backend did not accept a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationFailure {
    /// 401: the token should be refreshed.
    Unauthorized { message: String },
    /// Any other non-success answer.
    Rejected { status: u16, message: String },
    /// No answer at all.
    Transport(String),
}

impl ValidationFailure {
    pub fn into_error(self) -> AuthError {
        match self {
            ValidationFailure::Unauthorized { message } => AuthError::Validation(message),
            ValidationFailure::Rejected { status, message } => {
                match StatusCode::from_u16(status) {
                    Ok(code) if is_retryable_status(code) => AuthError::ServerError { status, message },
                    _ => AuthError::Validation(format!("{} ({})", message, status)),
                }
            }
            ValidationFailure::Transport(message) => AuthError::Network(message),
        }
    }
}

/// Result of `POST /auth/validate`.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub user: Option<UserIdentity>,
    pub organization: Option<serde_json::Value>,
    pub needs_refresh: bool,
    pub failure: Option<ValidationFailure>,
}

impl ValidationOutcome {
    pub fn accepted(user: Option<UserIdentity>, organization: Option<serde_json::Value>) -> Self {
        Self {
            valid: true,
            user,
            organization,
            needs_refresh: false,
            failure: None,
        }
    }

    pub fn failed(failure: ValidationFailure) -> Self {
        let needs_refresh = matches!(failure, ValidationFailure::Unauthorized { .. });
        Self {
            valid: false,
            user: None,
            organization: None,
            needs_refresh,
            failure: Some(failure),
        }
    }

    /// Whether the failure was a transport error rather than a rejection.
    pub fn is_transport_failure(&self) -> bool {
        matches!(self.failure, Some(ValidationFailure::Transport(_)))
    }
}

/// Tokens and identity produced by a successful exchange.
#[derive(Debug, Clone)]
pub struct ExchangeOutcome {
    pub secondary: SecondaryToken,
    pub user: UserIdentity,
}

#[derive(Debug, Serialize)]
struct ValidateRequest {
    token_type: &'static str,
}

#[derive(Debug, Deserialize)]
struct ValidateResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    user: Option<serde_json::Value>,
    #[serde(default)]
    organization: Option<serde_json::Value>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Serialize)]
struct InitializeRequest<'a> {
    user: &'a UserIdentity,
}

#[derive(Debug, Deserialize)]
struct TokenPairResponse {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    user: Option<serde_json::Value>,
}

/// Parse a user object, tolerating shapes that don't carry an id.
fn parse_user(value: Option<serde_json::Value>) -> Option<UserIdentity> {
    let value = value.filter(|v| !v.is_null())?;
    match serde_json::from_value(value) {
        Ok(user) => Some(user),
        Err(e) => {
            warn!(error = %e, "Ignoring unrecognized user payload");
            None
        }
    }
}

/// Client for the Djombi backend auth endpoints.
#[derive(Clone)]
pub struct ExchangeClient {
    http_client: reqwest::Client,
    base_url: String,
    store: Arc<CredentialStore>,
    clock: Arc<dyn Clock>,
}

impl ExchangeClient {
    pub fn new(config: &Config, store: Arc<CredentialStore>, clock: Arc<dyn Clock>) -> AuthResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            http_client,
            base_url: config.backend_base().to_string(),
            store,
            clock,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Ask the backend whether `token` is still accepted.
    ///
    /// Never returns an error: transport problems come back as
    /// [`ValidationFailure::Transport`] so callers can tell them apart from a
    /// rejection.
    pub async fn validate(&self, token: &str, class: TokenClass) -> ValidationOutcome {
        let response = match self
            .http_client
            .post(self.endpoint("/auth/validate"))
            .bearer_auth(token)
            .json(&ValidateRequest {
                token_type: class.as_str(),
            })
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(token_class = %class, error = %e, "Token validation request failed");
                return ValidationOutcome::failed(ValidationFailure::Transport(e.to_string()));
            }
        };

        let status = response.status();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                return ValidationOutcome::failed(ValidationFailure::Transport(e.to_string()));
            }
        };

        if status == StatusCode::UNAUTHORIZED {
            debug!(token_class = %class, "Backend rejected token with 401");
            return ValidationOutcome::failed(ValidationFailure::Unauthorized {
                message: backend_message(status, &body),
            });
        }

        if !status.is_success() {
            let body_summary = summarize_response_body(&body);
            error!(token_class = %class, status = %status, body_summary = %body_summary, "Token validation failed");
            return ValidationOutcome::failed(ValidationFailure::Rejected {
                status: status.as_u16(),
                message: backend_message(status, &body),
            });
        }

        let parsed: ValidateResponse = match serde_json::from_str(&body) {
            Ok(parsed) => parsed,
            Err(e) => {
                return ValidationOutcome::failed(ValidationFailure::Rejected {
                    status: status.as_u16(),
                    message: format!("invalid validation response: {}", e),
                });
            }
        };

        if !parsed.success {
            return ValidationOutcome::failed(ValidationFailure::Rejected {
                status: status.as_u16(),
                message: parsed
                    .message
                    .unwrap_or_else(|| "token not accepted".to_string()),
            });
        }

        ValidationOutcome::accepted(parse_user(parsed.user), parsed.organization)
    }

    /// Trade a primary token for a secondary token pair.
    ///
    /// Local shape and expiry checks run first and short-circuit without a
    /// request. On success, both tokens and the identity are persisted in one
    /// store write.
    pub async fn initialize_secondary(&self, primary: &PrimaryToken) -> AuthResult<ExchangeOutcome> {
        let outcome = self
            .exchange(primary)
            .await
            .map_err(AuthError::into_exchange_failure)?;
        self.store.set_session(
            &TokenUpdate::both(primary.clone(), outcome.secondary.clone()),
            &outcome.user,
        )?;
        info!(user_id = %outcome.user.user_id, "Secondary token issued");
        Ok(outcome)
    }

    /// [`initialize_secondary`](Self::initialize_secondary) without the store write.
    pub async fn exchange(&self, primary: &PrimaryToken) -> AuthResult<ExchangeOutcome> {
        validator::check_primary(primary, self.clock.now())?;

        let validation = self.validate(&primary.access_token, TokenClass::Primary).await;
        if !validation.valid {
            let failure = validation
                .failure
                .unwrap_or(ValidationFailure::Rejected {
                    status: 0,
                    message: "token not accepted".to_string(),
                });
            return Err(failure.into_error());
        }
        let validated_user = validation
            .user
            .ok_or_else(|| AuthError::Validation("backend did not return a user".to_string()))?;

        let response = self
            .http_client
            .post(self.endpoint("/auth/initialize-djombi"))
            .bearer_auth(&primary.access_token)
            .json(&InitializeRequest {
                user: &validated_user,
            })
            .send()
            .await
            .map_err(AuthError::from_transport)?;

        let pair = self.read_token_pair(response, "Token exchange").await?;
        let user = parse_user(pair.user).unwrap_or(validated_user);
        Ok(ExchangeOutcome {
            secondary: SecondaryToken {
                access_token: pair.access_token,
                refresh_token: pair.refresh_token,
                issued_at: self.clock.now(),
            },
            user,
        })
    }

    /// Issue a new secondary token using the primary token as proof of identity,
    /// and persist it.
    pub async fn refresh_secondary(&self, primary: &PrimaryToken) -> AuthResult<SecondaryToken> {
        let secondary = self.request_refresh(primary).await?;
        self.store.set_tokens(&TokenUpdate::secondary(secondary.clone()))?;
        debug!("Secondary token refreshed");
        Ok(secondary)
    }

    /// [`refresh_secondary`](Self::refresh_secondary) without the store write.
    pub async fn request_refresh(&self, primary: &PrimaryToken) -> AuthResult<SecondaryToken> {
        validator::check_primary(primary, self.clock.now())?;

        let response = self
            .http_client
            .post(self.endpoint("/auth/refresh-djombi"))
            .bearer_auth(&primary.access_token)
            .send()
            .await
            .map_err(AuthError::from_transport)?;

        let pair = self.read_token_pair(response, "Secondary refresh").await?;
        Ok(SecondaryToken {
            access_token: pair.access_token,
            refresh_token: pair.refresh_token,
            issued_at: self.clock.now(),
        })
    }

    async fn read_token_pair(
        &self,
        response: reqwest::Response,
        operation: &str,
    ) -> AuthResult<TokenPairResponse> {
        let status = response.status();
        let body = response.text().await.map_err(AuthError::from_transport)?;

        if !status.is_success() {
            let body_summary = summarize_response_body(&body);
            error!(status = %status, body_summary = %body_summary, "{} failed", operation);
            return Err(AuthError::from_status(
                status,
                backend_message(status, &body),
                AuthError::ExchangeFailed,
            ));
        }

        serde_json::from_str(&body).map_err(|e| {
            AuthError::ExchangeFailed(format!("invalid {} response: {}", operation.to_lowercase(), e))
        })
    }
}
