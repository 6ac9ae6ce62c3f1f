//! Session state machine using rust-fsm.
//!
//! ## State Diagram
//!
//! ```text
//!                    ┌───────────────────┐
//!          ┌───────► │  Unauthenticated  │ (initial) ◄──────────────┐
//!          │         └─────────┬─────────┘                          │
//!          │ FlowFailed        │ StartFlow         SessionRestored    │
//!          │                   ▼                          │         │ Reset
//!          │         ┌───────────────────┐                │         │
//!          └──────── │ PrimaryAcquiring  │                │         │
//!                    └─────────┬─────────┘                │         │
//!                              │ PrimaryReceived          │         │
//!                              ▼                          │         │
//!                    ┌───────────────────┐ ◄──────────────┘         │
//!                    │  PrimaryAcquired  │ ── SecondaryRestored ──┐ │
//!                    └─────────┬─────────┘                        │ │
//!                              │ ExchangeStarted                  │ │
//!                              ▼                                  │ │
//!                    ┌───────────────────┐  ExchangeSucceeded     │ │
//!                    │SecondaryExchanging│ ─────────────────┐     │ │
//!                    └─────────┬─────────┘                  ▼     ▼ │
//!                              │ ExchangeRejected   ┌──────────────────┐
//!                              ▼                    │FullyAuthenticated│
//!                    ┌───────────────────┐          └────────┬─────────┘
//!                    │  ExchangeFailed   │                   │ SessionRejected
//!                    └─────────┬─────────┘                   ▼
//!                              │ ForceLogout        ┌──────────────────┐
//!                              └──────────────────► │    LoggedOut     │
//!                                                   └──────────────────┘
//! ```
//!
//! Every state except `LoggedOut` also accepts `LogoutRequested`.

use rust_fsm::*;
use serde::{Deserialize, Serialize};
use std::time::Duration;

state_machine! {
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub session_machine(Unauthenticated)

    Unauthenticated => {
        StartFlow => PrimaryAcquiring,
        // Persisted primary token found on startup
        SessionRestored => PrimaryAcquired,
        LogoutRequested => LoggedOut
    },
    PrimaryAcquiring => {
        PrimaryReceived => PrimaryAcquired,
        FlowFailed => Unauthenticated,
        LogoutRequested => LoggedOut
    },
    PrimaryAcquired => {
        ExchangeStarted => SecondaryExchanging,
        // Persisted secondary token still accepted by the backend
        SecondaryRestored => FullyAuthenticated,
        LogoutRequested => LoggedOut
    },
    SecondaryExchanging => {
        ExchangeSucceeded => FullyAuthenticated,
        ExchangeRejected => ExchangeFailed,
        LogoutRequested => LoggedOut
    },
    FullyAuthenticated => {
        // Backend 401 and the refresh failed too
        SessionRejected => LoggedOut,
        LogoutRequested => LoggedOut
    },
    ExchangeFailed => {
        ForceLogout => LoggedOut,
        LogoutRequested => LoggedOut
    },
    LoggedOut => {
        Reset => Unauthenticated
    }
}

pub use session_machine::Input as SessionMachineInput;
pub use session_machine::State as SessionMachineState;
pub use session_machine::StateMachine as SessionMachine;

/// Public view of the session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Unauthenticated,
    PrimaryAcquiring,
    PrimaryAcquired,
    SecondaryExchanging,
    FullyAuthenticated,
    ExchangeFailed,
    LoggedOut,
}

impl SessionState {
    /// Both tokens are held and accepted.
    pub fn is_authenticated(&self) -> bool {
        matches!(self, SessionState::FullyAuthenticated)
    }

    /// A login or exchange is in flight.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SessionState::PrimaryAcquiring
                | SessionState::PrimaryAcquired
                | SessionState::SecondaryExchanging
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Unauthenticated => "unauthenticated",
            SessionState::PrimaryAcquiring => "primary_acquiring",
            SessionState::PrimaryAcquired => "primary_acquired",
            SessionState::SecondaryExchanging => "secondary_exchanging",
            SessionState::FullyAuthenticated => "fully_authenticated",
            SessionState::ExchangeFailed => "exchange_failed",
            SessionState::LoggedOut => "logged_out",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&SessionMachineState> for SessionState {
    fn from(state: &SessionMachineState) -> Self {
        match state {
            SessionMachineState::Unauthenticated => SessionState::Unauthenticated,
            SessionMachineState::PrimaryAcquiring => SessionState::PrimaryAcquiring,
            SessionMachineState::PrimaryAcquired => SessionState::PrimaryAcquired,
            SessionMachineState::SecondaryExchanging => SessionState::SecondaryExchanging,
            SessionMachineState::FullyAuthenticated => SessionState::FullyAuthenticated,
            SessionMachineState::ExchangeFailed => SessionState::ExchangeFailed,
            SessionMachineState::LoggedOut => SessionState::LoggedOut,
        }
    }
}

/// Retry behavior for transient refresh failures.
#[derive(Debug, Clone)]
pub struct RefreshConfig {
    /// Maximum number of attempts.
    pub max_retries: u32,
    /// Initial delay between retries in milliseconds.
    pub initial_delay_ms: u64,
    /// Maximum delay between retries in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 500,
            max_delay_ms: 5000,
        }
    }
}

impl RefreshConfig {
    /// Calculate the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay_ms = self
            .initial_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt));
        Duration::from_millis(delay_ms.min(self.max_delay_ms))
    }
}

/// Payload for session state change events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthStateChangedPayload {
    pub state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}
