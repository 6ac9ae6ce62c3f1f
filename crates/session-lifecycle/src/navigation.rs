//! Navigation intents.
//!
//! The session decides *where* the user should go; a single router-aware
//! caller decides *when* to go there by draining [`NavigationQueue`].

use serde::{Deserialize, Serialize};

/// Route the caller is currently showing.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Route {
    #[default]
    Login,
    Dashboard,
    Other(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NavigationTarget {
    Dashboard,
    Login,
}

/// A redirect requested by one specific state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NavigationIntent {
    pub target: NavigationTarget,
    /// Sequence number of the transition that produced the intent.
    pub sequence: u64,
}

/// Holds at most one undelivered intent.
#[derive(Debug, Default)]
pub(crate) struct NavigationQueue {
    route: Route,
    pending: Option<NavigationIntent>,
    last_sequence: u64,
}

impl NavigationQueue {
    pub(crate) fn route(&self) -> &Route {
        &self.route
    }

    pub(crate) fn set_route(&mut self, route: Route) {
        self.route = route;
    }

    /// Queue an intent for `sequence`. A transition queues at most once; a
    /// newer transition replaces any undelivered older intent.
    pub(crate) fn push(&mut self, target: NavigationTarget, sequence: u64) {
        if sequence <= self.last_sequence {
            return;
        }
        self.last_sequence = sequence;
        self.pending = Some(NavigationIntent { target, sequence });
    }

    pub(crate) fn take(&mut self) -> Option<NavigationIntent> {
        self.pending.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intent_delivered_once() {
        let mut queue = NavigationQueue::default();
        queue.push(NavigationTarget::Dashboard, 1);

        assert_eq!(
            queue.take(),
            Some(NavigationIntent {
                target: NavigationTarget::Dashboard,
                sequence: 1
            })
        );
        assert_eq!(queue.take(), None);
    }

    #[test]
    fn test_same_transition_does_not_requeue() {
        let mut queue = NavigationQueue::default();
        queue.push(NavigationTarget::Dashboard, 3);
        queue.take();

        // Re-render of the same transition.
        queue.push(NavigationTarget::Dashboard, 3);
        assert_eq!(queue.take(), None);
    }

    #[test]
    fn test_newer_intent_replaces_older() {
        let mut queue = NavigationQueue::default();
        queue.push(NavigationTarget::Dashboard, 4);
        queue.push(NavigationTarget::Login, 5);

        assert_eq!(queue.take().map(|i| i.target), Some(NavigationTarget::Login));
        assert_eq!(queue.take(), None);
    }

    #[test]
    fn test_default_route_is_login() {
        let mut queue = NavigationQueue::default();
        assert_eq!(queue.route(), &Route::Login);
        queue.set_route(Route::Other("/settings".to_string()));
        assert_eq!(queue.route(), &Route::Other("/settings".to_string()));
    }
}
