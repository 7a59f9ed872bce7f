//! Server lifecycle states.

use std::fmt;
use tokio::sync::watch;
use tracing::debug;

/// `Unbound → Bound → Serving → Stopping → Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum ServerState {
    #[default]
    Unbound,
    Bound,
    Serving,
    /// The cancellation root fired or shutdown began. Calls may still be
    /// dispatched, with pre-cancelled contexts.
    Stopping,
    Stopped,
}

impl ServerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerState::Unbound => "unbound",
            ServerState::Bound => "bound",
            ServerState::Serving => "serving",
            ServerState::Stopping => "stopping",
            ServerState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Move `state` forward to `next`.
///
/// The machine only moves forward; a request to move to the current or an
/// earlier state is ignored. Returns whether the state changed.
pub(crate) fn advance(state: &watch::Sender<ServerState>, next: ServerState) -> bool {
    state.send_if_modified(|current| {
        if next > *current {
            debug!(from = %current, to = %next, "Server state changed");
            *current = next;
            true
        } else {
            false
        }
    })
}
