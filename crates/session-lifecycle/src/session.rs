//! The authenticated session.
//!
//! [`AuthSession`] owns the state machine, the background refresh task and
//! the navigation intents. It is the only component that logs a user out.
//! Tokens themselves live in the credential store; the session never caches
//! them in memory.

use crate::navigation::{NavigationIntent, NavigationQueue, NavigationTarget, Route};
use crate::refresh::run_refresh_loop;
use crate::session_fsm::{
    AuthStateChangedPayload, RefreshConfig, SessionMachine, SessionMachineInput, SessionState,
};
use auth_engine::{
    validator, AuthError, AuthResult, AuthorizationRequest, ExchangeClient, FlowEvent,
    LifecyclePhase, OAuthCallbackServer, OAuthFlowController, TokenClass, ValidationFailure,
};
use chrono::Duration;
use credential_storage::{
    AuthStatusRecord, CacheEntry, CredentialStore, PrimaryToken, SecondaryToken, StorageResult,
    TokenUpdate, UserIdentity,
};
use dashboard_config_and_utils::{Clock, Config};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Callback type for session state change notifications.
pub type AuthStateCallback = Box<dyn Fn(AuthStateChangedPayload) + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Timing for refresh checks and memoization.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Period of the background freshness check.
    pub refresh_check_interval: std::time::Duration,
    /// Secondary tokens at least this old are refreshed before use.
    pub secondary_refresh_threshold: Duration,
    /// The background task refreshes primaries expiring within this margin.
    pub primary_refresh_margin: Duration,
    /// Lifetime of a memoized backend validation.
    pub auth_status_ttl: Duration,
    pub refresh: RefreshConfig,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            refresh_check_interval: config
                .refresh_check_interval()
                .max(std::time::Duration::from_secs(1)),
            secondary_refresh_threshold: Duration::seconds(config.secondary_refresh_threshold_secs as i64),
            primary_refresh_margin: Duration::seconds(config.primary_refresh_margin_secs as i64),
            auth_status_ttl: Duration::seconds(config.auth_status_ttl_secs as i64),
            refresh: RefreshConfig::default(),
        }
    }
}

struct MachineSlot {
    machine: SessionMachine,
    /// Incremented on every applied transition.
    sequence: u64,
}

pub(crate) struct SessionInner {
    settings: SessionSettings,
    store: Arc<CredentialStore>,
    exchange: ExchangeClient,
    oauth: OAuthFlowController,
    clock: Arc<dyn Clock>,
    machine: Mutex<MachineSlot>,
    navigation: Mutex<NavigationQueue>,
    /// Bumped on every logout. Writes from an older epoch are discarded.
    epoch: Mutex<u64>,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
    /// Serializes secondary refreshes so concurrent callers share one request.
    refresh_gate: tokio::sync::Mutex<()>,
    state_callback: Mutex<Option<AuthStateCallback>>,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let handle = match self.refresh_task.get_mut() {
            Ok(slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

/// Shared handle to the session. Clones refer to the same session.
#[derive(Clone)]
pub struct AuthSession {
    inner: Arc<SessionInner>,
}

impl AuthSession {
    pub fn new(
        config: &Config,
        store: Arc<CredentialStore>,
        exchange: ExchangeClient,
        oauth: OAuthFlowController,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::with_settings(SessionSettings::from_config(config), store, exchange, oauth, clock)
    }

    pub fn with_settings(
        settings: SessionSettings,
        store: Arc<CredentialStore>,
        exchange: ExchangeClient,
        oauth: OAuthFlowController,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                settings,
                store,
                exchange,
                oauth,
                clock,
                machine: Mutex::new(MachineSlot {
                    machine: SessionMachine::new(),
                    sequence: 0,
                }),
                navigation: Mutex::new(NavigationQueue::default()),
                epoch: Mutex::new(0),
                refresh_task: Mutex::new(None),
                refresh_gate: tokio::sync::Mutex::new(()),
                state_callback: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<SessionInner>) -> Self {
        Self { inner }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.inner.settings
    }

    /// Set a callback to be notified of state changes.
    pub fn set_state_callback(&self, callback: AuthStateCallback) {
        *lock(&self.inner.state_callback) = Some(callback);
    }

    pub fn state(&self) -> SessionState {
        SessionState::from(lock(&self.inner.machine).machine.state())
    }

    pub fn current_user(&self) -> Option<UserIdentity> {
        self.inner.store.get_user()
    }

    /// Report the route the caller is showing.
    pub fn set_route(&self, route: Route) {
        lock(&self.inner.navigation).set_route(route);
    }

    /// Hand out the pending redirect, at most once per transition.
    pub fn take_navigation_intent(&self) -> Option<NavigationIntent> {
        lock(&self.inner.navigation).take()
    }

    pub fn is_refresh_task_running(&self) -> bool {
        lock(&self.inner.refresh_task)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    // ==========================================
    // Transitions
    // ==========================================

    /// Apply an input, run its side effects and notify the callback.
    fn transition(&self, input: SessionMachineInput) -> AuthResult<SessionState> {
        let (old_state, new_state, sequence) = {
            let mut slot = lock(&self.inner.machine);
            let old_state = SessionState::from(slot.machine.state());
            slot.machine.consume(&input).map_err(|_| {
                AuthError::InvalidStateTransition(format!(
                    "Cannot apply {:?} in state {}",
                    input, old_state
                ))
            })?;
            slot.sequence += 1;
            (old_state, SessionState::from(slot.machine.state()), slot.sequence)
        };

        if old_state == new_state {
            return Ok(new_state);
        }

        debug!(
            old_state = %old_state,
            new_state = %new_state,
            input = ?input,
            "Session state transition"
        );

        let effects = self.apply_side_effects(&input, new_state, sequence);
        self.notify_state_change(new_state);
        effects.map(|_| new_state)
    }

    fn apply_side_effects(
        &self,
        input: &SessionMachineInput,
        entered: SessionState,
        sequence: u64,
    ) -> AuthResult<()> {
        match entered {
            SessionState::FullyAuthenticated => {
                let mut navigation = lock(&self.inner.navigation);
                if *navigation.route() == Route::Login {
                    navigation.push(NavigationTarget::Dashboard, sequence);
                }
                drop(navigation);
                self.start_refresh_task();
                Ok(())
            }
            SessionState::LoggedOut => self.tear_down(sequence),
            SessionState::Unauthenticated if *input == SessionMachineInput::FlowFailed => {
                lock(&self.inner.navigation).push(NavigationTarget::Login, sequence);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Entering `LoggedOut`: bump the epoch, wipe the store, stop the
    /// background task and send the user to login.
    fn tear_down(&self, sequence: u64) -> AuthResult<()> {
        let cleared = {
            let mut epoch = lock(&self.inner.epoch);
            *epoch += 1;
            self.inner.store.clear_all()
        };
        self.stop_refresh_task();
        lock(&self.inner.navigation).push(NavigationTarget::Login, sequence);

        match cleared {
            Ok(()) => {
                info!("Session cleared");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Failed to clear credential store on logout");
                Err(e.into())
            }
        }
    }

    fn notify_state_change(&self, state: SessionState) {
        let callback = lock(&self.inner.state_callback);
        if let Some(callback) = callback.as_ref() {
            let (user_id, email) = match self.inner.store.get_user() {
                Some(user) if state.is_authenticated() => (Some(user.user_id), Some(user.email)),
                _ => (None, None),
            };
            callback(AuthStateChangedPayload {
                state,
                user_id,
                email,
            });
        }
    }

    fn current_epoch(&self) -> u64 {
        *lock(&self.inner.epoch)
    }

    /// Run a store write only if no logout happened since `epoch` was read.
    fn commit_if_current<F>(&self, epoch: u64, write: F) -> AuthResult<bool>
    where
        F: FnOnce(&CredentialStore) -> StorageResult<()>,
    {
        let current = lock(&self.inner.epoch);
        if *current != epoch {
            debug!(
                started_in = epoch,
                current = *current,
                "Dropping result from an earlier session"
            );
            return Ok(false);
        }
        write(&self.inner.store)?;
        Ok(true)
    }

    fn auth_status_entry(&self, user_id: &str) -> CacheEntry<AuthStatusRecord> {
        CacheEntry::new(
            AuthStatusRecord {
                authenticated: true,
                user_id: Some(user_id.to_string()),
            },
            self.inner.clock.now(),
        )
    }

    // ==========================================
    // Login
    // ==========================================

    /// Begin a new OAuth attempt.
    ///
    /// A previous `LoggedOut` state is reset first; the store was already
    /// cleared when it was entered.
    pub fn start_flow(&self) -> AuthResult<AuthorizationRequest> {
        if self.state() == SessionState::LoggedOut {
            self.transition(SessionMachineInput::Reset)?;
        }
        self.transition(SessionMachineInput::StartFlow)?;

        match self.inner.oauth.start_flow() {
            Ok(request) => Ok(request),
            Err(e) => {
                self.transition(SessionMachineInput::FlowFailed)?;
                Err(e)
            }
        }
    }

    /// Consume an event from the OAuth flow controller.
    ///
    /// A resolved event proceeds straight into the secondary exchange. A
    /// `LoadEnd` without token and user returns to `Unauthenticated` and
    /// queues a redirect to login.
    pub async fn handle_flow_event(&self, event: FlowEvent) -> AuthResult<SessionState> {
        if event.lifecycle_phase == LifecyclePhase::LoadStart {
            return Ok(self.state());
        }

        let (primary, user) = match (event.token, event.user) {
            (Some(primary), Some(user)) => (primary, user),
            _ => {
                let reason = event
                    .error
                    .unwrap_or_else(|| "no token or user resolved".to_string());
                warn!(error = %reason, "OAuth flow ended without a session");
                self.transition(SessionMachineInput::FlowFailed)?;
                return Err(AuthError::OAuth(reason));
            }
        };

        self.transition(SessionMachineInput::PrimaryReceived)?;
        debug!(user_id = %user.user_id, "Primary token received");
        self.exchange_primary(primary).await
    }

    /// Start a flow, let the caller open the URL, wait for the redirect and
    /// handle the result.
    pub async fn login<F>(&self, server: &OAuthCallbackServer, open_url: F) -> AuthResult<SessionState>
    where
        F: FnOnce(&str),
    {
        let request = self.start_flow()?;
        open_url(&request.url);
        let event = server.wait_for_callback(&request).await;
        self.handle_flow_event(event).await
    }

    /// `PrimaryAcquired -> SecondaryExchanging -> FullyAuthenticated`, or on
    /// any failure `ExchangeFailed -> LoggedOut`.
    async fn exchange_primary(&self, primary: PrimaryToken) -> AuthResult<SessionState> {
        let epoch = self.current_epoch();
        self.transition(SessionMachineInput::ExchangeStarted)?;

        let result = match self.inner.exchange.exchange(&primary).await {
            Ok(outcome) => {
                let status = self.auth_status_entry(&outcome.user.user_id);
                self.commit_if_current(epoch, |store| {
                    store.set_session(
                        &TokenUpdate::both(primary.clone(), outcome.secondary.clone()),
                        &outcome.user,
                    )?;
                    store.set_auth_status(&status)
                })
                .and_then(|committed| {
                    if committed {
                        Ok(outcome)
                    } else {
                        Err(AuthError::NotLoggedIn)
                    }
                })
            }
            Err(e) => Err(e.into_exchange_failure()),
        };

        match result {
            Ok(outcome) => {
                info!(user_id = %outcome.user.user_id, "Session fully authenticated");
                self.transition(SessionMachineInput::ExchangeSucceeded)
            }
            Err(e) => {
                warn!(error = %e, "Secondary exchange failed, discarding session");
                if self.state() == SessionState::SecondaryExchanging {
                    self.transition(SessionMachineInput::ExchangeRejected)?;
                    self.transition(SessionMachineInput::ForceLogout)?;
                }
                Err(e)
            }
        }
    }

    // ==========================================
    // Restore
    // ==========================================

    /// Rebuild the session from the store after a restart.
    ///
    /// Returns `Ok(false)` when nothing is stored. The primary is checked
    /// locally (refreshing it when expired); the secondary is validated with
    /// the backend unless a fresh memoized result exists. A rejected
    /// secondary is refreshed, then exchanged again. Transport failures leave
    /// the stored session untouched so the caller can retry.
    pub async fn restore_session(&self) -> AuthResult<bool> {
        match self.state() {
            SessionState::FullyAuthenticated => return Ok(true),
            SessionState::LoggedOut => {
                self.transition(SessionMachineInput::Reset)?;
            }
            SessionState::Unauthenticated | SessionState::PrimaryAcquired => {}
            other => {
                return Err(AuthError::InvalidStateTransition(format!(
                    "Cannot restore a session in state {}",
                    other
                )))
            }
        }

        if self.state() == SessionState::Unauthenticated {
            let Some(stored) = self.inner.store.get_primary() else {
                info!("No stored session found");
                if self.inner.store.get_secondary().is_some() || self.inner.store.get_user().is_some() {
                    warn!("Discarding partial session without a primary token");
                    self.inner.store.clear_all()?;
                }
                return Ok(false);
            };

            if !validator::is_jwt_shaped(&stored.access_token) {
                warn!("Stored primary token is malformed, discarding session");
                self.discard_session()?;
                return Err(AuthError::MalformedToken);
            }

            if stored.is_expired_at(self.inner.clock.now()) {
                info!("Stored primary token expired, attempting refresh");
                if let Err(e) = self.refresh_primary_token(&stored).await {
                    if !e.is_transient() {
                        warn!(error = %e, "Primary refresh failed on startup, discarding session");
                        self.discard_session()?;
                    }
                    return Err(e);
                }
            }

            self.transition(SessionMachineInput::SessionRestored)?;
        }

        let primary = match self.inner.store.get_primary() {
            Some(primary) => primary,
            None => {
                self.discard_session()?;
                return Err(AuthError::NotLoggedIn);
            }
        };
        self.restore_secondary(primary).await
    }

    async fn restore_secondary(&self, primary: PrimaryToken) -> AuthResult<bool> {
        let (secondary, user) = match (self.inner.store.get_secondary(), self.inner.store.get_user()) {
            (Some(secondary), Some(user)) => (secondary, user),
            _ => {
                info!("No stored secondary token, exchanging primary");
                return self.exchange_primary(primary).await.map(|_| true);
            }
        };

        if self.auth_status_is_fresh(&user) {
            debug!(user_id = %user.user_id, "Using memoized validation result");
            self.transition(SessionMachineInput::SecondaryRestored)?;
            return Ok(true);
        }

        let epoch = self.current_epoch();
        let outcome = self
            .inner
            .exchange
            .validate(&secondary.access_token, TokenClass::Secondary)
            .await;

        if outcome.valid {
            let status = self.auth_status_entry(&user.user_id);
            if !self.commit_if_current(epoch, |store| store.set_auth_status(&status))? {
                return Err(AuthError::NotLoggedIn);
            }
            info!(user_id = %user.user_id, "Session restored");
            self.transition(SessionMachineInput::SecondaryRestored)?;
            return Ok(true);
        }

        match outcome.failure {
            Some(ValidationFailure::Unauthorized { .. }) => {
                match self.refresh_secondary_token(true).await {
                    Ok(_) => {
                        info!(user_id = %user.user_id, "Session restored after secondary refresh");
                        self.transition(SessionMachineInput::SecondaryRestored)?;
                        Ok(true)
                    }
                    Err(e) if e.is_transient() => Err(e),
                    Err(e) => {
                        info!(error = %e, "Secondary refresh failed, exchanging primary again");
                        self.exchange_primary(primary).await.map(|_| true)
                    }
                }
            }
            failure => {
                let error = failure
                    .map(ValidationFailure::into_error)
                    .unwrap_or(AuthError::NotLoggedIn);
                if error.is_transient() {
                    warn!(error = %error, "Could not validate stored secondary token");
                    return Err(error);
                }
                warn!("Stored secondary token rejected, discarding session");
                self.discard_session()?;
                Err(error)
            }
        }
    }

    fn auth_status_is_fresh(&self, user: &UserIdentity) -> bool {
        self.inner
            .store
            .get_auth_status()
            .and_then(|entry| entry.into_fresh(self.inner.clock.now(), self.inner.settings.auth_status_ttl))
            .is_some_and(|record| {
                record.authenticated && record.user_id.as_deref() == Some(user.user_id.as_str())
            })
    }

    // ==========================================
    // Token access
    // ==========================================

    /// The current bearer token for `class`, refreshed first when needed.
    ///
    /// This is the one entry point for collaborators.
    pub async fn access_token(&self, class: TokenClass) -> AuthResult<String> {
        if !self.state().is_authenticated() {
            return Err(AuthError::NotLoggedIn);
        }

        match class {
            TokenClass::Primary => Ok(self.valid_primary().await?.access_token),
            TokenClass::Secondary => {
                let Some(secondary) = self.inner.store.get_secondary() else {
                    warn!("Secondary token missing from store, discarding session");
                    self.discard_session()?;
                    return Err(AuthError::NotLoggedIn);
                };
                let age = secondary.age_at(self.inner.clock.now());
                if age >= self.inner.settings.secondary_refresh_threshold {
                    debug!(age_secs = age.num_seconds(), "Secondary token stale, refreshing");
                    Ok(self.refresh_secondary_token(false).await?.access_token)
                } else {
                    Ok(secondary.access_token)
                }
            }
        }
    }

    /// A collaborator got a 401 from the backend.
    ///
    /// Tries one secondary refresh. If the refresh is refused the session is
    /// rejected and the user logged out. Transport failures are returned
    /// without logging out.
    pub async fn handle_unauthorized(&self) -> AuthResult<String> {
        if !self.state().is_authenticated() {
            return Err(AuthError::NotLoggedIn);
        }

        match self.refresh_secondary_token(true).await {
            Ok(secondary) => Ok(secondary.access_token),
            Err(e) if e.is_transient() => {
                warn!(error = %e, "Refresh after 401 could not reach the backend");
                Err(e)
            }
            Err(e) => {
                warn!(error = %e, "Refresh after 401 failed, logging out");
                self.discard_session()?;
                Err(e)
            }
        }
    }

    /// Replace the stored secondary token (organization switch).
    pub fn rotate_secondary(&self, secondary: SecondaryToken) -> AuthResult<()> {
        if !self.state().is_authenticated() {
            return Err(AuthError::NotLoggedIn);
        }
        let epoch = self.current_epoch();
        if !self.commit_if_current(epoch, |store| {
            store.set_tokens(&TokenUpdate::secondary(secondary))
        })? {
            return Err(AuthError::NotLoggedIn);
        }
        info!("Secondary token rotated");
        Ok(())
    }

    /// Explicit logout. Calling it again once logged out is a no-op.
    pub fn logout(&self) -> AuthResult<()> {
        if self.state() == SessionState::LoggedOut {
            return Ok(());
        }
        match self.transition(SessionMachineInput::LogoutRequested) {
            Ok(_) => {
                info!("Logged out");
                Ok(())
            }
            Err(AuthError::InvalidStateTransition(_)) if self.state() == SessionState::LoggedOut => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Move to `LoggedOut` from wherever the session is.
    fn discard_session(&self) -> AuthResult<()> {
        match self.state() {
            SessionState::LoggedOut => Ok(()),
            SessionState::FullyAuthenticated => {
                self.transition(SessionMachineInput::SessionRejected).map(|_| ())
            }
            _ => self.transition(SessionMachineInput::LogoutRequested).map(|_| ()),
        }
    }

    // ==========================================
    // Refresh
    // ==========================================

    async fn valid_primary(&self) -> AuthResult<PrimaryToken> {
        let Some(primary) = self.inner.store.get_primary() else {
            warn!("Primary token missing from store, discarding session");
            self.discard_session()?;
            return Err(AuthError::NotLoggedIn);
        };
        if primary.is_expired_at(self.inner.clock.now()) {
            self.refresh_primary_token(&primary).await
        } else {
            Ok(primary)
        }
    }

    async fn refresh_primary_token(&self, primary: &PrimaryToken) -> AuthResult<PrimaryToken> {
        let refresh_token = primary
            .refresh_token
            .clone()
            .ok_or_else(|| AuthError::OAuth("no refresh token for the primary token".to_string()))?;

        let epoch = self.current_epoch();
        let refreshed = self
            .with_backoff("primary refresh", || {
                self.inner.oauth.refresh_primary(&refresh_token)
            })
            .await?;

        if !self.commit_if_current(epoch, |store| {
            store.set_tokens(&TokenUpdate::primary(refreshed.clone()))
        })? {
            return Err(AuthError::NotLoggedIn);
        }
        info!(expires_at = %refreshed.expires_at, "Primary token refreshed");
        Ok(refreshed)
    }

    /// Refresh the secondary token. Unless `force` is set, a token refreshed
    /// by a concurrent caller while this one waited is reused.
    async fn refresh_secondary_token(&self, force: bool) -> AuthResult<SecondaryToken> {
        let _gate = self.inner.refresh_gate.lock().await;

        if !force {
            if let Some(current) = self.inner.store.get_secondary() {
                if current.age_at(self.inner.clock.now()) < self.inner.settings.secondary_refresh_threshold {
                    return Ok(current);
                }
            }
        }

        let primary = self.valid_primary().await?;
        let epoch = self.current_epoch();
        let secondary = self
            .with_backoff("secondary refresh", || {
                self.inner.exchange.request_refresh(&primary)
            })
            .await?;

        let status = self
            .inner
            .store
            .get_user()
            .map(|user| self.auth_status_entry(&user.user_id));
        if !self.commit_if_current(epoch, |store| {
            store.set_tokens(&TokenUpdate::secondary(secondary.clone()))?;
            match &status {
                Some(status) => store.set_auth_status(status),
                None => Ok(()),
            }
        })? {
            return Err(AuthError::NotLoggedIn);
        }
        info!("Secondary token refreshed");
        Ok(secondary)
    }

    /// Retry transient failures with exponential backoff.
    async fn with_backoff<T, F, Fut>(&self, operation: &str, mut attempt: F) -> AuthResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AuthResult<T>>,
    {
        let config = &self.inner.settings.refresh;
        let max_attempts = config.max_retries.max(1);
        let mut last_error = None;

        for n in 0..max_attempts {
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => {
                    if n + 1 < max_attempts {
                        let delay = config.delay_for_attempt(n);
                        debug!(
                            operation = operation,
                            attempt = n + 1,
                            max_attempts = max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            "Transient failure, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        warn!(operation = operation, "Retries exhausted");
        Err(last_error.unwrap_or(AuthError::Timeout))
    }

    // ==========================================
    // Background task
    // ==========================================

    fn start_refresh_task(&self) {
        let mut slot = lock(&self.inner.refresh_task);
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No async runtime; background refresh disabled");
            return;
        };
        let session = Arc::downgrade(&self.inner);
        let period = self.inner.settings.refresh_check_interval;
        *slot = Some(runtime.spawn(run_refresh_loop(session, period)));
        debug!(period_secs = period.as_secs(), "Background refresh started");
    }

    fn stop_refresh_task(&self) {
        if let Some(handle) = lock(&self.inner.refresh_task).take() {
            handle.abort();
            debug!("Background refresh stopped");
        }
    }

    /// One pass of the background freshness check.
    pub(crate) async fn run_refresh_check(&self) {
        if !self.state().is_authenticated() {
            return;
        }
        let now = self.inner.clock.now();

        let Some(primary) = self.inner.store.get_primary() else {
            warn!("Primary token vanished from store, discarding session");
            if let Err(e) = self.discard_session() {
                error!(error = %e, "Failed to discard session");
            }
            return;
        };

        // A primary without a refresh token is kept until it expires.
        if primary.expires_within(now, self.inner.settings.primary_refresh_margin) {
            match self.refresh_primary_token(&primary).await {
                Ok(_) => {}
                Err(e) if !e.is_transient() && primary.is_expired_at(self.inner.clock.now()) => {
                    warn!(error = %e, "Primary token expired and could not be refreshed");
                    if let Err(e) = self.discard_session() {
                        error!(error = %e, "Failed to discard session");
                    }
                    return;
                }
                Err(e) if primary.refresh_token.is_none() => {
                    debug!(error = %e, "Primary token nearing expiry");
                }
                Err(e) => warn!(error = %e, "Background primary refresh failed"),
            }
        }

        if let Some(secondary) = self.inner.store.get_secondary() {
            if secondary.age_at(now) >= self.inner.settings.secondary_refresh_threshold {
                if let Err(e) = self.refresh_secondary_token(false).await {
                    warn!(error = %e, "Background secondary refresh failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use credential_storage::{FileBackend, MemoryBackend};
    use dashboard_config_and_utils::ManualClock;
    use serde_json::{json, Value};
    use wiremock::matchers::{body_json, body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Harness {
        server: MockServer,
        config: Config,
        store: Arc<CredentialStore>,
        clock: Arc<ManualClock>,
        session: AuthSession,
    }

    fn build_session(config: &Config, store: Arc<CredentialStore>, clock: Arc<ManualClock>) -> AuthSession {
        let exchange = ExchangeClient::new(config, store.clone(), clock.clone()).unwrap();
        let oauth = OAuthFlowController::new(config, clock.clone()).unwrap();
        let mut settings = SessionSettings::from_config(config);
        settings.refresh.initial_delay_ms = 1;
        settings.refresh.max_delay_ms = 5;
        AuthSession::with_settings(settings, store, exchange, oauth, clock)
    }

    async fn harness_with_store(store: Arc<CredentialStore>) -> Harness {
        let server = MockServer::start().await;
        let mut config = Config::default();
        config.backend_url = server.uri();
        config.oauth.token_endpoint = format!("{}/oauth/token", server.uri());
        config.oauth.userinfo_endpoint = format!("{}/oauth/userinfo", server.uri());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let session = build_session(&config, store.clone(), clock.clone());
        Harness {
            server,
            config,
            store,
            clock,
            session,
        }
    }

    async fn harness() -> Harness {
        harness_with_store(Arc::new(CredentialStore::new(Box::new(MemoryBackend::new())))).await
    }

    fn user_json() -> Value {
        json!({ "_id": "user-1", "email": "ada@example.com", "firstName": "Ada", "lastName": "Lovelace" })
    }

    fn user() -> UserIdentity {
        serde_json::from_value(user_json()).unwrap()
    }

    fn primary(clock: &ManualClock) -> PrimaryToken {
        PrimaryToken {
            access_token: "hdr.payload.sig".to_string(),
            refresh_token: Some("primary-refresh".to_string()),
            expires_at: clock.now() + Duration::hours(2),
        }
    }

    fn secondary(clock: &ManualClock) -> SecondaryToken {
        SecondaryToken {
            access_token: "stored-secondary".to_string(),
            refresh_token: "stored-secondary-refresh".to_string(),
            issued_at: clock.now(),
        }
    }

    async fn mount_validate(server: &MockServer, token_type: &str, status: u16, times: u64) {
        let body = if status == 200 {
            json!({ "success": true, "user": user_json() })
        } else {
            json!({ "message": "rejected" })
        };
        Mock::given(method("POST"))
            .and(path("/auth/validate"))
            .and(body_json(json!({ "token_type": token_type })))
            .respond_with(ResponseTemplate::new(status).set_body_json(body))
            .expect(times)
            .mount(server)
            .await;
    }

    async fn mount_token_pair(server: &MockServer, route: &str, status: u16, access: &str, times: u64) {
        let body = if status == 200 {
            json!({ "access_token": access, "refresh_token": format!("{}-refresh", access), "user": user_json() })
        } else {
            json!({ "message": "backend said no" })
        };
        Mock::given(method("POST"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(status).set_body_json(body))
            .expect(times)
            .mount(server)
            .await;
    }

    /// Drive a successful login and drain the resulting dashboard intent.
    async fn login(h: &Harness) {
        mount_validate(&h.server, "primary", 200, 1).await;
        mount_token_pair(&h.server, "/auth/initialize-djombi", 200, "djombi-access", 1).await;

        h.session.start_flow().unwrap();
        let state = h
            .session
            .handle_flow_event(FlowEvent::resolved(primary(&h.clock), user()))
            .await
            .unwrap();
        assert_eq!(state, SessionState::FullyAuthenticated);
        h.session.take_navigation_intent();
    }

    fn assert_store_empty(store: &CredentialStore) {
        assert!(store.get_primary().is_none());
        assert!(store.get_secondary().is_none());
        assert!(store.get_user().is_none());
        assert!(store.get_auth_status().is_none());
        assert!(store.get_current_organization_id().is_none());
    }

    #[tokio::test]
    async fn test_login_exchange_success_reaches_fully_authenticated() {
        let h = harness().await;
        mount_validate(&h.server, "primary", 200, 1).await;
        mount_token_pair(&h.server, "/auth/initialize-djombi", 200, "djombi-access", 1).await;

        h.session.start_flow().unwrap();
        assert_eq!(h.session.state(), SessionState::PrimaryAcquiring);

        let token = primary(&h.clock);
        let state = h
            .session
            .handle_flow_event(FlowEvent::resolved(token.clone(), user()))
            .await
            .unwrap();

        assert_eq!(state, SessionState::FullyAuthenticated);
        assert_eq!(h.store.get_primary(), Some(token));
        assert_eq!(h.store.get_secondary().unwrap().access_token, "djombi-access");
        assert_eq!(h.store.get_user(), Some(user()));
        assert!(h.session.is_refresh_task_running());

        let intent = h.session.take_navigation_intent().unwrap();
        assert_eq!(intent.target, NavigationTarget::Dashboard);
        assert_eq!(h.session.take_navigation_intent(), None);
    }

    #[tokio::test]
    async fn test_exchange_http_500_logs_out_with_empty_store() {
        let h = harness().await;
        mount_validate(&h.server, "primary", 200, 1).await;
        mount_token_pair(&h.server, "/auth/initialize-djombi", 500, "", 1).await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = seen.clone();
        h.session.set_state_callback(Box::new(move |payload| {
            recorder.lock().unwrap().push(payload.state);
        }));

        h.session.start_flow().unwrap();
        let result = h
            .session
            .handle_flow_event(FlowEvent::resolved(primary(&h.clock), user()))
            .await;

        assert!(matches!(result, Err(AuthError::ExchangeFailed(_))));
        assert_eq!(h.session.state(), SessionState::LoggedOut);
        assert_store_empty(&h.store);
        assert!(!h.session.is_refresh_task_running());
        assert_eq!(
            h.session.take_navigation_intent().map(|i| i.target),
            Some(NavigationTarget::Login)
        );
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                SessionState::PrimaryAcquiring,
                SessionState::PrimaryAcquired,
                SessionState::SecondaryExchanging,
                SessionState::ExchangeFailed,
                SessionState::LoggedOut,
            ]
        );
    }

    #[tokio::test]
    async fn test_malformed_primary_is_rejected_without_network() {
        let h = harness().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&h.server)
            .await;

        let mut token = primary(&h.clock);
        token.access_token = "opaque".to_string();

        h.session.start_flow().unwrap();
        let result = h.session.handle_flow_event(FlowEvent::resolved(token, user())).await;

        assert!(matches!(result, Err(AuthError::MalformedToken)));
        assert_eq!(h.session.state(), SessionState::LoggedOut);
    }

    #[tokio::test]
    async fn test_flow_failure_returns_to_login() {
        let h = harness().await;
        h.session.start_flow().unwrap();

        let result = h
            .session
            .handle_flow_event(FlowEvent::failure("access_denied"))
            .await;

        assert!(matches!(result, Err(AuthError::OAuth(reason)) if reason == "access_denied"));
        assert_eq!(h.session.state(), SessionState::Unauthenticated);
        assert_eq!(
            h.session.take_navigation_intent().map(|i| i.target),
            Some(NavigationTarget::Login)
        );
    }

    #[tokio::test]
    async fn test_load_start_event_changes_nothing() {
        let h = harness().await;
        h.session.start_flow().unwrap();

        let state = h.session.handle_flow_event(FlowEvent::load_start()).await.unwrap();
        assert_eq!(state, SessionState::PrimaryAcquiring);
        assert_eq!(h.session.take_navigation_intent(), None);
    }

    #[tokio::test]
    async fn test_no_dashboard_intent_off_the_login_route() {
        let h = harness().await;
        mount_validate(&h.server, "primary", 200, 1).await;
        mount_token_pair(&h.server, "/auth/initialize-djombi", 200, "djombi-access", 1).await;
        h.session.set_route(Route::Other("/mail".to_string()));

        h.session.start_flow().unwrap();
        h.session
            .handle_flow_event(FlowEvent::resolved(primary(&h.clock), user()))
            .await
            .unwrap();

        assert_eq!(h.session.take_navigation_intent(), None);
    }

    #[tokio::test]
    async fn test_logout_clears_store_and_stops_refresh() {
        let h = harness().await;
        login(&h).await;
        h.store.set_current_organization_id("org-1").unwrap();

        h.session.logout().unwrap();

        assert_eq!(h.session.state(), SessionState::LoggedOut);
        assert_store_empty(&h.store);
        assert!(!h.session.is_refresh_task_running());
        assert_eq!(
            h.session.take_navigation_intent().map(|i| i.target),
            Some(NavigationTarget::Login)
        );

        // Idempotent.
        h.session.logout().unwrap();
        assert_eq!(h.session.take_navigation_intent(), None);
    }

    #[tokio::test]
    async fn test_start_flow_after_logout_resets() {
        let h = harness().await;
        h.session.logout().unwrap();
        assert_eq!(h.session.state(), SessionState::LoggedOut);

        h.session.start_flow().unwrap();
        assert_eq!(h.session.state(), SessionState::PrimaryAcquiring);
    }

    #[tokio::test]
    async fn test_access_token_requires_authentication() {
        let h = harness().await;
        assert!(matches!(
            h.session.access_token(TokenClass::Secondary).await,
            Err(AuthError::NotLoggedIn)
        ));
    }

    #[tokio::test]
    async fn test_access_token_refreshes_stale_secondary() {
        let h = harness().await;
        login(&h).await;
        mount_token_pair(&h.server, "/auth/refresh-djombi", 200, "refreshed-access", 1).await;

        assert_eq!(
            h.session.access_token(TokenClass::Secondary).await.unwrap(),
            "djombi-access"
        );

        h.clock.advance(Duration::minutes(50));
        assert_eq!(
            h.session.access_token(TokenClass::Secondary).await.unwrap(),
            "refreshed-access"
        );
        // Fresh again; no second refresh.
        assert_eq!(
            h.session.access_token(TokenClass::Secondary).await.unwrap(),
            "refreshed-access"
        );
    }

    #[tokio::test]
    async fn test_access_token_refreshes_expired_primary() {
        let h = harness().await;
        login(&h).await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "new.primary.token",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&h.server)
            .await;

        h.clock.advance(Duration::hours(2));
        let token = h.session.access_token(TokenClass::Primary).await.unwrap();

        assert_eq!(token, "new.primary.token");
        let stored = h.store.get_primary().unwrap();
        assert_eq!(stored.access_token, "new.primary.token");
        assert_eq!(stored.refresh_token.as_deref(), Some("primary-refresh"));
        assert_eq!(stored.expires_at, h.clock.now() + Duration::hours(1));
    }

    #[tokio::test]
    async fn test_handle_unauthorized_refreshes() {
        let h = harness().await;
        login(&h).await;
        mount_token_pair(&h.server, "/auth/refresh-djombi", 200, "after-401", 1).await;

        assert_eq!(h.session.handle_unauthorized().await.unwrap(), "after-401");
        assert_eq!(h.session.state(), SessionState::FullyAuthenticated);
        assert_eq!(h.store.get_secondary().unwrap().access_token, "after-401");
    }

    #[tokio::test]
    async fn test_handle_unauthorized_failed_refresh_logs_out() {
        let h = harness().await;
        login(&h).await;
        mount_token_pair(&h.server, "/auth/refresh-djombi", 401, "", 1).await;

        let result = h.session.handle_unauthorized().await;

        assert!(matches!(result, Err(AuthError::ExchangeFailed(_))));
        assert_eq!(h.session.state(), SessionState::LoggedOut);
        assert_store_empty(&h.store);
        assert_eq!(
            h.session.take_navigation_intent().map(|i| i.target),
            Some(NavigationTarget::Login)
        );
    }

    #[tokio::test]
    async fn test_handle_unauthorized_server_error_keeps_session() {
        let h = harness().await;
        login(&h).await;
        mount_token_pair(&h.server, "/auth/refresh-djombi", 503, "", 3).await;

        let err = h.session.handle_unauthorized().await.unwrap_err();

        assert!(err.is_transient());
        assert!(matches!(err, AuthError::ServerError { status: 503, .. }));
        assert_eq!(h.session.state(), SessionState::FullyAuthenticated);
        assert_eq!(h.store.get_secondary().unwrap().access_token, "djombi-access");
        assert_eq!(h.session.take_navigation_intent(), None);
    }

    #[tokio::test]
    async fn test_restore_without_session() {
        let h = harness().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&h.server)
            .await;

        assert!(!h.session.restore_session().await.unwrap());
        assert_eq!(h.session.state(), SessionState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_restore_memoizes_validation() {
        let h = harness().await;
        h.store
            .set_session(
                &TokenUpdate::both(primary(&h.clock), secondary(&h.clock)),
                &user(),
            )
            .unwrap();
        mount_validate(&h.server, "secondary", 200, 1).await;

        assert!(h.session.restore_session().await.unwrap());
        assert_eq!(h.session.state(), SessionState::FullyAuthenticated);
        assert_eq!(
            h.session.take_navigation_intent().map(|i| i.target),
            Some(NavigationTarget::Dashboard)
        );

        // A second process start inside the TTL skips the backend.
        h.clock.advance(Duration::minutes(4));
        let again = build_session(&h.config, h.store.clone(), h.clock.clone());
        assert!(again.restore_session().await.unwrap());
        assert_eq!(again.state(), SessionState::FullyAuthenticated);
    }

    #[tokio::test]
    async fn test_restore_revalidates_after_ttl() {
        let h = harness().await;
        h.store
            .set_session(
                &TokenUpdate::both(primary(&h.clock), secondary(&h.clock)),
                &user(),
            )
            .unwrap();
        mount_validate(&h.server, "secondary", 200, 2).await;

        assert!(h.session.restore_session().await.unwrap());

        h.clock.advance(Duration::minutes(5));
        let again = build_session(&h.config, h.store.clone(), h.clock.clone());
        assert!(again.restore_session().await.unwrap());
    }

    #[tokio::test]
    async fn test_restore_expired_primary_is_refreshed() {
        let h = harness().await;
        let mut expired = primary(&h.clock);
        expired.expires_at = h.clock.now() - Duration::minutes(1);
        h.store
            .set_session(&TokenUpdate::both(expired, secondary(&h.clock)), &user())
            .unwrap();

        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "fresh.primary.token",
                "refresh_token": "rotated-refresh",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&h.server)
            .await;
        mount_validate(&h.server, "secondary", 200, 1).await;

        assert!(h.session.restore_session().await.unwrap());
        let stored = h.store.get_primary().unwrap();
        assert_eq!(stored.access_token, "fresh.primary.token");
        assert_eq!(stored.refresh_token.as_deref(), Some("rotated-refresh"));
    }

    #[tokio::test]
    async fn test_restore_expired_primary_without_refresh_token_is_discarded() {
        let h = harness().await;
        let expired = PrimaryToken {
            access_token: "hdr.payload.sig".to_string(),
            refresh_token: None,
            expires_at: h.clock.now(),
        };
        h.store
            .set_session(&TokenUpdate::both(expired, secondary(&h.clock)), &user())
            .unwrap();

        assert!(h.session.restore_session().await.is_err());
        assert_eq!(h.session.state(), SessionState::LoggedOut);
        assert_store_empty(&h.store);
    }

    #[tokio::test]
    async fn test_restore_primary_refresh_server_error_keeps_credentials() {
        let h = harness().await;
        let expired = PrimaryToken {
            expires_at: h.clock.now(),
            ..primary(&h.clock)
        };
        h.store
            .set_session(&TokenUpdate::both(expired, secondary(&h.clock)), &user())
            .unwrap();
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&h.server)
            .await;

        let err = h.session.restore_session().await.unwrap_err();

        assert!(err.is_transient());
        assert_eq!(h.session.state(), SessionState::Unauthenticated);
        assert!(h.store.get_primary().is_some());
        assert!(h.store.get_secondary().is_some());
        assert_eq!(h.store.get_user(), Some(user()));
    }

    #[tokio::test]
    async fn test_restore_secondary_validation_server_error_keeps_credentials() {
        let h = harness().await;
        h.store
            .set_session(
                &TokenUpdate::both(primary(&h.clock), secondary(&h.clock)),
                &user(),
            )
            .unwrap();
        mount_validate(&h.server, "secondary", 503, 1).await;

        let err = h.session.restore_session().await.unwrap_err();

        assert!(matches!(err, AuthError::ServerError { status: 503, .. }));
        assert_eq!(h.session.state(), SessionState::PrimaryAcquired);
        assert_eq!(h.store.get_secondary(), Some(secondary(&h.clock)));
    }

    #[tokio::test]
    async fn test_restore_rejected_secondary_falls_back_to_exchange() {
        let h = harness().await;
        h.store
            .set_session(
                &TokenUpdate::both(primary(&h.clock), secondary(&h.clock)),
                &user(),
            )
            .unwrap();
        mount_validate(&h.server, "secondary", 401, 1).await;
        mount_token_pair(&h.server, "/auth/refresh-djombi", 401, "", 1).await;
        mount_validate(&h.server, "primary", 200, 1).await;
        mount_token_pair(&h.server, "/auth/initialize-djombi", 200, "re-exchanged", 1).await;

        assert!(h.session.restore_session().await.unwrap());
        assert_eq!(h.session.state(), SessionState::FullyAuthenticated);
        assert_eq!(h.store.get_secondary().unwrap().access_token, "re-exchanged");
    }

    #[tokio::test]
    async fn test_restore_transport_failure_keeps_credentials() {
        let h = harness().await;
        h.store
            .set_session(
                &TokenUpdate::both(primary(&h.clock), secondary(&h.clock)),
                &user(),
            )
            .unwrap();

        let offline = {
            let mut config = h.config.clone();
            config.backend_url = "http://127.0.0.1:9".to_string();
            build_session(&config, h.store.clone(), h.clock.clone())
        };

        let result = offline.restore_session().await;
        assert!(matches!(result, Err(AuthError::Network(_))));
        assert_eq!(offline.state(), SessionState::PrimaryAcquired);
        assert!(h.store.get_secondary().is_some());
    }

    #[tokio::test]
    async fn test_session_survives_process_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        let store = Arc::new(CredentialStore::new(Box::new(FileBackend::new(&path))));
        let h = harness_with_store(store).await;
        login(&h).await;
        mount_validate(&h.server, "secondary", 200, 0).await;

        // Nothing shared with the first session except the file on disk.
        let reopened = Arc::new(CredentialStore::new(Box::new(FileBackend::new(&path))));
        let restarted = build_session(&h.config, reopened, h.clock.clone());

        assert!(restarted.restore_session().await.unwrap());
        assert_eq!(
            restarted.access_token(TokenClass::Secondary).await.unwrap(),
            "djombi-access"
        );
    }

    #[tokio::test]
    async fn test_late_result_after_logout_is_dropped() {
        let h = harness().await;
        login(&h).await;

        let epoch = h.session.current_epoch();
        h.session.logout().unwrap();

        let applied = h
            .session
            .commit_if_current(epoch, |store| {
                store.set_tokens(&TokenUpdate::secondary(secondary(&h.clock)))
            })
            .unwrap();

        assert!(!applied);
        assert_store_empty(&h.store);
    }

    #[tokio::test]
    async fn test_rotate_secondary() {
        let h = harness().await;
        let mut rotated = secondary(&h.clock);
        rotated.access_token = "org-scoped".to_string();
        assert!(matches!(
            h.session.rotate_secondary(rotated.clone()),
            Err(AuthError::NotLoggedIn)
        ));

        login(&h).await;
        h.session.rotate_secondary(rotated).unwrap();
        assert_eq!(
            h.session.access_token(TokenClass::Secondary).await.unwrap(),
            "org-scoped"
        );
    }

    #[tokio::test]
    async fn test_background_check_refreshes_stale_secondary() {
        let h = harness().await;
        login(&h).await;
        mount_token_pair(&h.server, "/auth/refresh-djombi", 200, "background", 1).await;

        // Nothing stale yet.
        h.session.run_refresh_check().await;
        assert_eq!(h.store.get_secondary().unwrap().access_token, "djombi-access");

        h.clock.advance(Duration::minutes(51));
        h.session.run_refresh_check().await;
        assert_eq!(h.store.get_secondary().unwrap().access_token, "background");
    }

    #[tokio::test]
    async fn test_background_check_discards_expired_primary_without_refresh_token() {
        let h = harness().await;
        mount_validate(&h.server, "primary", 200, 1).await;
        mount_token_pair(&h.server, "/auth/initialize-djombi", 200, "djombi-access", 1).await;
        let token = PrimaryToken {
            refresh_token: None,
            ..primary(&h.clock)
        };
        h.session.start_flow().unwrap();
        h.session
            .handle_flow_event(FlowEvent::resolved(token, user()))
            .await
            .unwrap();
        h.session.take_navigation_intent();

        // Inside the refresh margin but not yet expired: kept.
        h.clock.advance(Duration::minutes(119));
        h.session.run_refresh_check().await;
        assert_eq!(h.session.state(), SessionState::FullyAuthenticated);

        h.clock.advance(Duration::hours(1));
        h.session.run_refresh_check().await;

        assert_eq!(h.session.state(), SessionState::LoggedOut);
        assert_store_empty(&h.store);
        assert_eq!(
            h.session.take_navigation_intent().map(|i| i.target),
            Some(NavigationTarget::Login)
        );
    }

    #[tokio::test]
    async fn test_background_loop_refreshes_on_its_own() {
        let h = harness().await;
        let exchange = ExchangeClient::new(&h.config, h.store.clone(), h.clock.clone()).unwrap();
        let oauth = OAuthFlowController::new(&h.config, h.clock.clone()).unwrap();
        let mut settings = SessionSettings::from_config(&h.config);
        settings.refresh_check_interval = std::time::Duration::from_millis(20);
        let session = AuthSession::with_settings(settings, h.store.clone(), exchange, oauth, h.clock.clone());

        mount_validate(&h.server, "primary", 200, 1).await;
        mount_token_pair(&h.server, "/auth/initialize-djombi", 200, "djombi-access", 1).await;
        mount_token_pair(&h.server, "/auth/refresh-djombi", 200, "from-loop", 1).await;

        session.start_flow().unwrap();
        session
            .handle_flow_event(FlowEvent::resolved(primary(&h.clock), user()))
            .await
            .unwrap();
        assert!(session.is_refresh_task_running());

        h.clock.advance(Duration::minutes(55));
        let mut refreshed = false;
        for _ in 0..100 {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            if h.store.get_secondary().map(|s| s.access_token) == Some("from-loop".to_string()) {
                refreshed = true;
                break;
            }
        }
        assert!(refreshed);

        session.logout().unwrap();
        assert!(!session.is_refresh_task_running());
    }
}
