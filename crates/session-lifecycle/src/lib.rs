//! Session lifecycle for the Djombi auth core.
//!
//! This crate provides:
//! - an explicit FSM for the dual-token login lifecycle
//! - [`AuthSession`], which drives login, restore, refresh and logout
//! - a background task that keeps both tokens fresh
//! - navigation intents, delivered at most once per transition

mod navigation;
mod refresh;
mod session;
mod session_fsm;

pub use navigation::{NavigationIntent, NavigationTarget, Route};
pub use session::{AuthSession, AuthStateCallback, SessionSettings};
pub use session_fsm::session_machine;
pub use session_fsm::{
    AuthStateChangedPayload, RefreshConfig, SessionMachine, SessionMachineInput,
    SessionMachineState, SessionState,
};
