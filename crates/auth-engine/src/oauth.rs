//! OAuth authorization-code flow (with PKCE) against the external provider.
//!
//! The controller builds the authorization URL and talks to the provider's
//! token and user-info endpoints. The callback server listens on the loopback
//! redirect URI and turns the browser redirect into a single [`FlowEvent`].

use crate::validator;
use crate::{AuthError, AuthResult};
use base64::Engine;
use chrono::Duration;
use credential_storage::{PrimaryToken, UserIdentity};
use dashboard_config_and_utils::{Clock, Config, OAuthProviderConfig};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use url::Url;

/// Lifetime assumed when the provider reports no expiry at all.
const DEFAULT_PRIMARY_LIFETIME_SECS: i64 = 3600;

/// Where the flow controller is in resolving a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    LoadStart,
    /// Resolution finished, successfully or not.
    LoadEnd,
}

/// Combined result of an OAuth attempt.
#[derive(Debug, Clone)]
pub struct FlowEvent {
    pub token: Option<PrimaryToken>,
    pub user: Option<UserIdentity>,
    pub is_authenticated: Option<bool>,
    pub lifecycle_phase: LifecyclePhase,
    pub error: Option<String>,
}

impl FlowEvent {
    pub fn load_start() -> Self {
        Self {
            token: None,
            user: None,
            is_authenticated: None,
            lifecycle_phase: LifecyclePhase::LoadStart,
            error: None,
        }
    }

    pub fn resolved(token: PrimaryToken, user: UserIdentity) -> Self {
        Self {
            token: Some(token),
            user: Some(user),
            is_authenticated: Some(true),
            lifecycle_phase: LifecyclePhase::LoadEnd,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            token: None,
            user: None,
            is_authenticated: Some(false),
            lifecycle_phase: LifecyclePhase::LoadEnd,
            error: Some(error.into()),
        }
    }

    /// Load finished with both a token and a user.
    pub fn is_resolved(&self) -> bool {
        self.lifecycle_phase == LifecyclePhase::LoadEnd && self.token.is_some() && self.user.is_some()
    }
}

/// A started authorization request. Keep it until the callback arrives.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    /// URL the user must open in a browser.
    pub url: String,
    /// CSRF value the callback must echo back.
    pub state: String,
    pub(crate) code_verifier: String,
}

/// Query parameters delivered to the redirect URI.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

impl CallbackParams {
    fn from_query(query: &str) -> Self {
        let params: HashMap<String, String> = url::form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect();
        Self {
            code: params.get("code").cloned(),
            state: params.get("state").cloned(),
            error: params
                .get("error_description")
                .or_else(|| params.get("error"))
                .cloned(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    id_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProviderErrorBody {
    error: Option<String>,
    error_description: Option<String>,
}

fn random_url_safe(bytes: usize) -> String {
    let buf: Vec<u8> = (0..bytes).map(|_| rand::random::<u8>()).collect();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(buf)
}

fn pkce_challenge(verifier: &str) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// Drives the external authorization-code flow.
#[derive(Clone)]
pub struct OAuthFlowController {
    provider: OAuthProviderConfig,
    http_client: reqwest::Client,
    clock: Arc<dyn Clock>,
}

impl OAuthFlowController {
    pub fn new(config: &Config, clock: Arc<dyn Clock>) -> AuthResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            provider: config.oauth.clone(),
            http_client,
            clock,
        })
    }

    pub fn provider(&self) -> &OAuthProviderConfig {
        &self.provider
    }

    /// Build a fresh authorization request.
    ///
    /// Opening the URL is left to the caller.
    pub fn start_flow(&self) -> AuthResult<AuthorizationRequest> {
        let state = uuid::Uuid::new_v4().simple().to_string();
        let code_verifier = random_url_safe(32);
        let challenge = pkce_challenge(&code_verifier);
        let scope = self.provider.scopes.join(" ");

        let url = Url::parse_with_params(
            &self.provider.authorization_endpoint,
            &[
                ("response_type", "code"),
                ("client_id", self.provider.client_id.as_str()),
                ("redirect_uri", self.provider.redirect_uri.as_str()),
                ("scope", scope.as_str()),
                ("state", state.as_str()),
                ("code_challenge", challenge.as_str()),
                ("code_challenge_method", "S256"),
                ("access_type", "offline"),
                ("prompt", "consent"),
            ],
        )?;

        debug!("Authorization request created");
        Ok(AuthorizationRequest {
            url: url.to_string(),
            state,
            code_verifier,
        })
    }

    /// Turn callback parameters into a finished [`FlowEvent`].
    ///
    /// Always yields a `LoadEnd` event, whether or not a session was resolved.
    pub async fn resolve_callback(
        &self,
        request: &AuthorizationRequest,
        params: CallbackParams,
    ) -> FlowEvent {
        if let Some(err) = params.error {
            warn!(error = %err, "Provider returned an authorization error");
            return FlowEvent::failure(err);
        }
        if params.state.as_deref() != Some(request.state.as_str()) {
            warn!("OAuth state mismatch");
            return FlowEvent::failure("state mismatch");
        }
        let Some(code) = params.code else {
            return FlowEvent::failure("missing authorization code");
        };

        let (token, provider_access_token) = match self.exchange_code(request, &code).await {
            Ok(pair) => pair,
            Err(e) => {
                error!(error = %e, "Authorization code exchange failed");
                return FlowEvent::failure(e.to_string());
            }
        };

        match self.fetch_user(&provider_access_token).await {
            Ok(user) => {
                info!(user_id = %user.user_id, "OAuth flow resolved");
                FlowEvent::resolved(token, user)
            }
            Err(e) => {
                error!(error = %e, "Fetching user info failed");
                FlowEvent::failure(e.to_string())
            }
        }
    }

    /// Exchange an authorization code at the token endpoint.
    ///
    /// Returns the primary token plus the provider access token used for
    /// user-info (they differ when the provider issues an ID token).
    pub async fn exchange_code(
        &self,
        request: &AuthorizationRequest,
        code: &str,
    ) -> AuthResult<(PrimaryToken, String)> {
        let mut form = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.provider.redirect_uri.as_str()),
            ("client_id", self.provider.client_id.as_str()),
            ("code_verifier", request.code_verifier.as_str()),
        ];
        if let Some(secret) = &self.provider.client_secret {
            form.push(("client_secret", secret.as_str()));
        }

        let response = self.token_request(&form).await?;
        let provider_access_token = response.access_token.clone();
        Ok((self.primary_from_response(response, None), provider_access_token))
    }

    /// Refresh the primary token with the provider.
    ///
    /// When the provider omits a new refresh token, the one passed in is kept.
    pub async fn refresh_primary(&self, refresh_token: &str) -> AuthResult<PrimaryToken> {
        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.provider.client_id.as_str()),
        ];
        if let Some(secret) = &self.provider.client_secret {
            form.push(("client_secret", secret.as_str()));
        }

        let response = self.token_request(&form).await?;
        let token = self.primary_from_response(response, Some(refresh_token));
        debug!(expires_at = %token.expires_at, "Primary token refreshed");
        Ok(token)
    }

    /// Fetch the OpenID user-info document.
    pub async fn fetch_user(&self, access_token: &str) -> AuthResult<UserIdentity> {
        let response = self
            .http_client
            .get(&self.provider.userinfo_endpoint)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(AuthError::from_transport)?;

        let status = response.status();
        if !status.is_success() {
            error!(status = %status, "User info request failed");
            return Err(AuthError::OAuth(format!("user info request failed: {}", status)));
        }

        Ok(response.json().await?)
    }

    async fn token_request(&self, form: &[(&str, &str)]) -> AuthResult<TokenResponse> {
        let response = self
            .http_client
            .post(&self.provider.token_endpoint)
            .form(form)
            .send()
            .await
            .map_err(AuthError::from_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let reason = serde_json::from_str::<ProviderErrorBody>(&body)
                .ok()
                .and_then(|b| b.error_description.or(b.error))
                .unwrap_or_else(|| status.to_string());
            error!(status = %status, "Token endpoint rejected request");
            return Err(AuthError::from_status(status, reason, AuthError::OAuth));
        }

        Ok(response.json().await?)
    }

    /// The ID token is preferred as the primary credential because it is a JWT;
    /// some providers hand out opaque access tokens.
    fn primary_from_response(&self, response: TokenResponse, previous_refresh: Option<&str>) -> PrimaryToken {
        let now = self.clock.now();
        let access_token = response.id_token.unwrap_or(response.access_token);
        let expires_at = response
            .expires_in
            .map(|secs| now + Duration::seconds(secs))
            .or_else(|| validator::decode_jwt_expiry(&access_token))
            .unwrap_or_else(|| now + Duration::seconds(DEFAULT_PRIMARY_LIFETIME_SECS));

        PrimaryToken {
            access_token,
            refresh_token: response
                .refresh_token
                .or_else(|| previous_refresh.map(str::to_string)),
            expires_at,
        }
    }
}

/// OAuth callback server that listens for the authentication redirect.
pub struct OAuthCallbackServer {
    controller: OAuthFlowController,
    port: u16,
    path: String,
    timeout: std::time::Duration,
}

impl OAuthCallbackServer {
    pub fn new(
        controller: OAuthFlowController,
        port: u16,
        path: impl Into<String>,
        timeout: std::time::Duration,
    ) -> Self {
        Self {
            controller,
            port,
            path: path.into(),
            timeout,
        }
    }

    /// Listen on the port and path of the configured redirect URI.
    pub fn from_config(controller: OAuthFlowController, config: &Config) -> AuthResult<Self> {
        let port = config
            .oauth
            .redirect_port()
            .map_err(|e| AuthError::Config(e.to_string()))?;
        let path = config
            .oauth
            .redirect_path()
            .map_err(|e| AuthError::Config(e.to_string()))?;
        Ok(Self::new(controller, port, path, config.callback_timeout()))
    }

    pub fn controller(&self) -> &OAuthFlowController {
        &self.controller
    }

    /// Get the callback URL for this server.
    pub fn callback_url(&self) -> String {
        format!("http://localhost:{}{}", self.port, self.path)
    }

    /// Wait for the browser redirect and resolve it into a `LoadEnd` event.
    ///
    /// Bind failures and timeouts are reported through the event as well.
    pub async fn wait_for_callback(&self, request: &AuthorizationRequest) -> FlowEvent {
        match self.wait_for_params(request).await {
            Ok(params) => self.controller.resolve_callback(request, params).await,
            Err(e) => FlowEvent::failure(e.to_string()),
        }
    }

    /// Start the listener and return the first callback's query parameters.
    pub async fn wait_for_params(&self, request: &AuthorizationRequest) -> AuthResult<CallbackParams> {
        let addr = format!("127.0.0.1:{}", self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| AuthError::OAuth(format!("Failed to bind to {}: {}", addr, e)))?;

        info!(port = self.port, "OAuth callback server listening");

        let (tx, rx) = oneshot::channel::<CallbackParams>();
        let tx = Arc::new(tokio::sync::Mutex::new(Some(tx)));
        let expected_state = request.state.clone();
        let callback_path = self.path.clone();

        let server_handle = tokio::spawn({
            let tx = tx.clone();
            async move {
                loop {
                    match listener.accept().await {
                        Ok((mut socket, _)) => {
                            let tx = tx.clone();
                            let expected_state = expected_state.clone();
                            let callback_path = callback_path.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(
                                    &mut socket,
                                    &callback_path,
                                    &expected_state,
                                    tx,
                                )
                                .await
                                {
                                    error!("Error handling connection: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                            break;
                        }
                    }
                }
            }
        });

        let result = match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(params)) => Ok(params),
            Ok(Err(_)) => Err(AuthError::OAuth("Internal error: channel closed".to_string())),
            Err(_) => Err(AuthError::Timeout),
        };

        server_handle.abort();
        result
    }
}

/// Handle an incoming HTTP connection.
async fn handle_connection(
    socket: &mut tokio::net::TcpStream,
    callback_path: &str,
    expected_state: &str,
    tx: Arc<tokio::sync::Mutex<Option<oneshot::Sender<CallbackParams>>>>,
) -> AuthResult<()> {
    let (reader, mut writer) = socket.split();
    let mut reader = BufReader::new(reader);
    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;

    // Drain headers so closing the socket doesn't reset the connection.
    let mut header_line = String::new();
    loop {
        header_line.clear();
        let read = reader.read_line(&mut header_line).await?;
        if read == 0 || header_line == "\r\n" || header_line == "\n" {
            break;
        }
    }

    // Parse the request line: GET /callback?... HTTP/1.1
    if !request_line.starts_with("GET ") {
        send_response(&mut writer, 405, "Method Not Allowed", "Method Not Allowed").await?;
        return Ok(());
    }

    let path_end = request_line.find(" HTTP/").unwrap_or(request_line.len());
    let Some(target) = request_line.get(4..path_end) else {
        send_response(&mut writer, 400, "Bad Request", "Bad Request").await?;
        return Ok(());
    };
    let (path, query) = target.split_once('?').unwrap_or((target, ""));

    debug!(path = %path, "Received callback request");

    if path != callback_path {
        send_response(&mut writer, 404, "Not Found", "Not Found").await?;
        return Ok(());
    }

    let params = CallbackParams::from_query(query);

    if let Some(err) = &params.error {
        send_response(&mut writer, 200, "OK", &error_page(err)).await?;
    } else if params.state.as_deref() != Some(expected_state) {
        send_response(&mut writer, 400, "Bad Request", &error_page("State mismatch")).await?;
    } else if params.code.is_none() {
        send_response(
            &mut writer,
            400,
            "Bad Request",
            &error_page("Missing authorization code"),
        )
        .await?;
    } else {
        send_response(&mut writer, 200, "OK", &success_page()).await?;
    }

    if let Some(tx) = tx.lock().await.take() {
        let _ = tx.send(params);
    }

    Ok(())
}

/// Send an HTTP response.
async fn send_response(
    writer: &mut tokio::net::tcp::WriteHalf<'_>,
    status_code: u16,
    status_text: &str,
    body: &str,
) -> AuthResult<()> {
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status_code,
        status_text,
        body.len(),
        body
    );
    writer.write_all(response.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

fn success_page() -> String {
    r#"<!DOCTYPE html>
<html>
<head><title>Djombi - Signed In</title></head>
<body style="font-family: system-ui; text-align: center; padding: 50px;">
<h1>Signed in to Djombi</h1>
<p>You can close this window and return to the terminal.</p>
<script>setTimeout(() => window.close(), 2000);</script>
</body>
</html>"#
        .to_string()
}

fn error_page(error: &str) -> String {
    let escaped = error
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;");
    format!(
        r#"<!DOCTYPE html>
<html>
<head><title>Djombi - Sign-in Failed</title></head>
<body style="font-family: system-ui; text-align: center; padding: 50px;">
<h1>Sign-in failed</h1>
<p>Error: {}</p>
<p>You can close this window and try again.</p>
</body>
</html>"#,
        escaped
    )
}
