//! Background token refresh.

use crate::session::{AuthSession, SessionInner};
use std::sync::Weak;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::debug;

/// Check token freshness every `period` until the session is dropped or
/// leaves `FullyAuthenticated`.
///
/// Holds only a weak reference so an abandoned session is not kept alive.
/// The session also aborts the task on logout.
pub(crate) async fn run_refresh_loop(session: Weak<SessionInner>, period: Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let Some(inner) = session.upgrade() else {
            debug!("Session dropped, stopping background refresh");
            break;
        };
        let session = AuthSession::from_inner(inner);
        if !session.state().is_authenticated() {
            debug!("Session no longer authenticated, stopping background refresh");
            break;
        }
        session.run_refresh_check().await;
    }
}
