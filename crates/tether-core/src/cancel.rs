//! Process-wide cancellation for in-flight RPC calls.
//!
//! The server owns exactly one [`CancellationRoot`]. Every inbound call derives
//! a [`CallToken`] from it, so cancelling the root reaches every live call and
//! every call that arrives afterwards. Cancellation is one-way; a root is never
//! reset.
//!
//! # Example
//!
//! ```
//! use tether_core::cancel::CancellationRoot;
//!
//! let root = CancellationRoot::new();
//! let before = root.derive();
//!
//! assert!(root.cancel());
//! assert!(!root.cancel()); // second stop is a no-op
//!
//! assert!(before.is_cancelled());
//! assert!(root.derive().is_cancelled());
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// The single cancellable signal shared by all calls in a server.
///
/// Cloning shares the same underlying signal.
#[derive(Debug, Clone)]
pub struct CancellationRoot {
    token: CancellationToken,
    fired: Arc<AtomicBool>,
}

impl CancellationRoot {
    /// Create a new, live root.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            fired: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Cancel the root and every token derived from it.
    ///
    /// Returns `true` only for the call that performed the transition.
    pub fn cancel(&self) -> bool {
        let first = !self.fired.swap(true, Ordering::SeqCst);
        self.token.cancel();
        first
    }

    /// Check if the root has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Derive a per-call token.
    ///
    /// If the root is already cancelled the token starts out cancelled.
    pub fn derive(&self) -> CallToken {
        CallToken {
            token: self.token.child_token(),
        }
    }

    /// Wait until the root is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

impl Default for CancellationRoot {
    fn default() -> Self {
        Self::new()
    }
}

/// Cancellation signal attached to a single call.
///
/// A call token only observes; it cannot cancel its root or sibling calls.
#[derive(Debug, Clone)]
pub struct CallToken {
    token: CancellationToken,
}

impl CallToken {
    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Check cancellation and return an error if cancelled.
    ///
    /// Intended for `?` inside loops of long-running work.
    pub fn check(&self) -> Result<(), CancelledError> {
        if self.is_cancelled() {
            Err(CancelledError)
        } else {
            Ok(())
        }
    }

    /// Wait until the call is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

/// Error returned when an operation observes cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelledError;

impl std::fmt::Display for CancelledError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Operation was cancelled")
    }
}

impl std::error::Error for CancelledError {}

impl From<CancelledError> for crate::error::CallError {
    fn from(_: CancelledError) -> Self {
        crate::error::CallError::Cancelled
    }
}
