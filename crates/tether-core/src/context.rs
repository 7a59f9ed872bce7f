//! Per-call execution context.

use crate::cancel::{CallToken, CancelledError};

/// Context handed to every service call.
///
/// Built by the server's call interceptor. Carries the call's derived
/// cancellation token, so handlers receive it as an explicit parameter.
#[derive(Debug, Clone)]
pub struct CallContext {
    call_id: u64,
    service: String,
    method: String,
    token: CallToken,
}

impl CallContext {
    pub fn new(
        call_id: u64,
        service: impl Into<String>,
        method: impl Into<String>,
        token: CallToken,
    ) -> Self {
        Self {
            call_id,
            service: service.into(),
            method: method.into(),
            token,
        }
    }

    /// Server-assigned sequence number, unique within the process.
    pub fn call_id(&self) -> u64 {
        self.call_id
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn token(&self) -> &CallToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Shorthand for `self.token().check()`.
    pub fn check(&self) -> Result<(), CancelledError> {
        self.token.check()
    }
}
