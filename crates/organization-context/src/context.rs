//! Organization context manager.

use crate::error::{OrganizationError, OrganizationResult};
use crate::models::{NewOrganization, OrganizationMembership, OrganizationMetadata};
use auth_engine::{backend_message, summarize_response_body, TokenClass};
use chrono::Duration;
use credential_storage::{CacheEntry, CredentialStore, SecondaryToken};
use dashboard_config_and_utils::{Clock, Config};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use session_lifecycle::AuthSession;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    status: Option<String>,
    data: Option<T>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    meta: Option<SwitchMeta>,
}

impl<T> Envelope<T> {
    fn is_error(&self) -> bool {
        matches!(self.status.as_deref(), Some("error") | Some("fail") | Some("failed"))
    }
}

/// Token pair handed back by a switch, scoped to the new organization.
#[derive(Debug, Deserialize)]
struct SwitchMeta {
    access_token: Option<String>,
    refresh_token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SwitchRequest<'a> {
    organization_id: &'a str,
}

#[derive(Debug, Default)]
struct Selection {
    /// User the selection was loaded for; `None` while signed out.
    owner: Option<String>,
    organizations: Vec<OrganizationMembership>,
    current: Option<OrganizationMembership>,
    last_error: Option<String>,
}

/// Tracks the user's organizations and which one is current.
///
/// Org failures stay local: they surface as `false`/`Err` to the caller and
/// never log the user out. Only a 401 is passed on to the session.
pub struct OrganizationContext {
    http_client: reqwest::Client,
    base_url: String,
    session: AuthSession,
    store: Arc<CredentialStore>,
    clock: Arc<dyn Clock>,
    cache_ttl: Duration,
    selection: Mutex<Selection>,
}

impl OrganizationContext {
    pub fn new(
        config: &Config,
        session: AuthSession,
        store: Arc<CredentialStore>,
        clock: Arc<dyn Clock>,
    ) -> OrganizationResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(OrganizationError::from_transport)?;
        Ok(Self {
            http_client,
            base_url: config.backend_base().to_string(),
            session,
            store,
            clock,
            cache_ttl: Duration::seconds(config.organization_cache_ttl_secs as i64),
            selection: Mutex::new(Selection::default()),
        })
    }

    /// The selection is dropped whenever the signed-in user changes, logout included.
    fn selection(&self) -> MutexGuard<'_, Selection> {
        let user_id = if self.session.state().is_authenticated() {
            self.session.current_user().map(|user| user.user_id)
        } else {
            None
        };
        let mut selection = self.selection.lock().unwrap_or_else(|e| e.into_inner());
        if selection.owner != user_id {
            if selection.owner.is_some() {
                debug!("Session changed, dropping organization selection");
            }
            *selection = Selection {
                owner: user_id,
                ..Selection::default()
            };
        }
        selection
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Memberships from the last successful load.
    pub fn organizations(&self) -> Vec<OrganizationMembership> {
        self.selection().organizations.clone()
    }

    pub fn current_organization(&self) -> Option<OrganizationMembership> {
        self.selection().current.clone()
    }

    /// Message from the most recent failed operation, cleared by the next success.
    pub fn last_error(&self) -> Option<String> {
        self.selection().last_error.clone()
    }

    // ==========================================
    // Load
    // ==========================================

    /// Load the user's memberships and resolve the current one.
    ///
    /// A cached list younger than the cache TTL is used without a request.
    ///
    /// Resolution: if the persisted organization id is in the list it stays
    /// current. Otherwise the **first** membership in backend order becomes
    /// current and its id overwrites the persisted one. The outcome therefore
    /// depends on the order `GET /organizations` returns.
    ///
    /// On failure the in-memory list and current selection are emptied and
    /// the error is returned; an empty `Ok` means the user has no memberships.
    pub async fn load_organizations(&self) -> OrganizationResult<Vec<OrganizationMembership>> {
        let organizations = match self.cached_organizations() {
            Some(cached) => {
                debug!(count = cached.len(), "Using cached organizations");
                cached
            }
            None => match self.fetch_organizations().await {
                Ok(fetched) => {
                    let entry = CacheEntry::new(fetched.clone(), self.clock.now());
                    if let Err(e) = self.store.set_organization_cache(&entry) {
                        warn!(error = %e, "Failed to cache organizations");
                    }
                    fetched
                }
                Err(e) => {
                    error!(error = %e, "Failed to load organizations");
                    let mut selection = self.selection();
                    selection.organizations.clear();
                    selection.current = None;
                    selection.last_error = Some(e.to_string());
                    return Err(e);
                }
            },
        };

        let current = self.resolve_current(&organizations)?;
        let mut selection = self.selection();
        selection.organizations = organizations.clone();
        selection.current = current;
        selection.last_error = None;
        Ok(organizations)
    }

    fn cached_organizations(&self) -> Option<Vec<OrganizationMembership>> {
        self.store
            .get_organization_cache::<Vec<OrganizationMembership>>()?
            .into_fresh(self.clock.now(), self.cache_ttl)
    }

    fn resolve_current(
        &self,
        organizations: &[OrganizationMembership],
    ) -> OrganizationResult<Option<OrganizationMembership>> {
        let persisted = self.store.get_current_organization_id();

        if let Some(id) = persisted.as_deref() {
            if let Some(found) = organizations.iter().find(|m| m.organization_id == id) {
                return Ok(Some(found.clone()));
            }
        }

        match organizations.first() {
            Some(first) => {
                if persisted.is_some() {
                    info!(organization_id = %first.organization_id, "Persisted organization not found, using first membership");
                }
                self.store.set_current_organization_id(&first.organization_id)?;
                Ok(Some(first.clone()))
            }
            None => {
                if persisted.is_some() {
                    self.store.clear_current_organization_id()?;
                }
                Ok(None)
            }
        }
    }

    async fn fetch_organizations(&self) -> OrganizationResult<Vec<OrganizationMembership>> {
        let url = self.endpoint("/organizations");
        let (status, body) = self
            .send_authorized(|token| self.http_client.get(&url).bearer_auth(token))
            .await?;

        let envelope: Envelope<Vec<OrganizationMembership>> =
            parse_success(status, &body, "Organization list")?;
        let organizations = envelope.data.unwrap_or_default();
        info!(count = organizations.len(), "Organizations loaded");
        Ok(organizations)
    }

    // ==========================================
    // Switch
    // ==========================================

    /// Make `organization_id` current. Returns `false` on failure, leaving
    /// the previous selection untouched and the reason in [`last_error`](Self::last_error).
    pub async fn switch_organization(&self, organization_id: &str) -> bool {
        match self.try_switch_organization(organization_id).await {
            Ok(()) => true,
            Err(e) => {
                warn!(organization_id = %organization_id, error = %e, "Organization switch failed");
                self.selection().last_error = Some(e.to_string());
                false
            }
        }
    }

    pub async fn try_switch_organization(&self, organization_id: &str) -> OrganizationResult<()> {
        let target = self
            .selection()
            .organizations
            .iter()
            .find(|m| m.organization_id == organization_id)
            .cloned()
            .ok_or_else(|| OrganizationError::NotFound(organization_id.to_string()))?;

        let url = self.endpoint("/organizations/switch");
        let request = SwitchRequest { organization_id };
        let envelope: Envelope<serde_json::Value> = match self
            .send_authorized(|token| self.http_client.post(&url).bearer_auth(token).json(&request))
            .await
            .and_then(|(status, body)| parse_success(status, &body, "Organization switch"))
        {
            Ok(envelope) => envelope,
            Err(OrganizationError::Rejected { message, .. }) | Err(OrganizationError::Network(message)) => {
                return Err(OrganizationError::SwitchFailed(message))
            }
            Err(e) => return Err(e),
        };

        if let Some(SwitchMeta {
            access_token: Some(access_token),
            refresh_token: Some(refresh_token),
        }) = envelope.meta
        {
            self.session.rotate_secondary(SecondaryToken {
                access_token,
                refresh_token,
                issued_at: self.clock.now(),
            })?;
        }

        self.store.set_current_organization_id(organization_id)?;
        let mut selection = self.selection();
        selection.current = Some(target);
        selection.last_error = None;
        info!(organization_id = %organization_id, "Switched organization");
        Ok(())
    }

    // ==========================================
    // Create
    // ==========================================

    /// Create an organization and make it current. Returns `false` on failure.
    ///
    /// The membership list is not refetched here; the next
    /// [`load_organizations`](Self::load_organizations) misses the cache and
    /// resolves the new organization from the persisted id.
    pub async fn create_organization(&self, new_organization: NewOrganization) -> bool {
        match self.try_create_organization(&new_organization).await {
            Ok(_) => true,
            Err(e) => {
                warn!(name = %new_organization.name, error = %e, "Organization creation failed");
                self.selection().last_error = Some(e.to_string());
                false
            }
        }
    }

    pub async fn try_create_organization(
        &self,
        new_organization: &NewOrganization,
    ) -> OrganizationResult<OrganizationMetadata> {
        let url = self.endpoint("/organizations");
        let (status, body) = self
            .send_authorized(|token| {
                self.http_client
                    .post(&url)
                    .bearer_auth(token)
                    .json(new_organization)
            })
            .await?;

        let envelope: Envelope<OrganizationMetadata> =
            parse_success(status, &body, "Organization creation")?;
        let created = envelope.data.ok_or_else(|| OrganizationError::Rejected {
            status: status.as_u16(),
            message: "response did not include the new organization".to_string(),
        })?;

        self.store.invalidate_organization_cache()?;
        self.store.set_current_organization_id(&created.id)?;
        self.selection().last_error = None;
        info!(organization_id = %created.id, "Organization created");
        Ok(created)
    }

    // ==========================================
    // Transport
    // ==========================================

    /// Send with the current secondary token. A 401 is reported to the
    /// session and the request is retried once with the refreshed token.
    async fn send_authorized<F>(&self, build: F) -> OrganizationResult<(StatusCode, String)>
    where
        F: Fn(&str) -> reqwest::RequestBuilder,
    {
        let token = self.session.access_token(TokenClass::Secondary).await?;
        let (status, body) = execute(build(&token)).await?;
        if status != StatusCode::UNAUTHORIZED {
            return Ok((status, body));
        }

        warn!("Organization request unauthorized, refreshing session");
        let token = self.session.handle_unauthorized().await?;
        execute(build(&token)).await
    }
}

async fn execute(request: reqwest::RequestBuilder) -> OrganizationResult<(StatusCode, String)> {
    let response = request.send().await.map_err(OrganizationError::from_transport)?;
    let status = response.status();
    let body = response.text().await.map_err(OrganizationError::from_transport)?;
    Ok((status, body))
}

fn parse_success<T: DeserializeOwned>(
    status: StatusCode,
    body: &str,
    operation: &str,
) -> OrganizationResult<Envelope<T>> {
    if !status.is_success() {
        let body_summary = summarize_response_body(body);
        error!(status = %status, body_summary = %body_summary, "{} failed", operation);
        return Err(OrganizationError::Rejected {
            status: status.as_u16(),
            message: backend_message(status, body),
        });
    }

    let envelope: Envelope<T> = serde_json::from_str(body)?;
    if envelope.is_error() {
        return Err(OrganizationError::Rejected {
            status: status.as_u16(),
            message: envelope
                .message
                .clone()
                .unwrap_or_else(|| format!("{} refused", operation)),
        });
    }
    Ok(envelope)
}
