//! Error types for the plugin serving layer.
//!
//! Errors are split by scope: [`ServeError`] covers process startup and the
//! lifetime of the server, and is always fatal. [`CallError`] is scoped to a
//! single RPC call and never affects other calls or the serving state.
//! [`ClientError`] is what a host-side caller sees.

use thiserror::Error;

/// Fatal error raised while bootstrapping or running the plugin server.
#[derive(Debug, Error)]
pub enum ServeError {
    // Handshake errors
    #[error("Handshake failed: magic cookie {key} is not set")]
    CookieMissing { key: String },

    #[error("Handshake failed: magic cookie {key} does not match")]
    CookieMismatch { key: String },

    // Version negotiation errors
    #[error("Incompatible plugin protocol versions: host accepts {host:?}, plugin supports {plugin:?}")]
    IncompatibleVersion { host: Vec<u32>, plugin: Vec<u32> },

    #[error("Invalid host protocol versions {value:?}: {message}")]
    InvalidHostVersions { value: String, message: String },

    #[error("Protocol version {0} is not registered")]
    UnknownVersion(u32),

    // Listener errors
    #[error("Failed to bind {network} listener: {message}")]
    ListenerBind {
        network: String,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    // Announcement errors
    #[error("Failed to announce endpoint: {message}")]
    Announce {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Server task failed: {0}")]
    Internal(String),
}

/// Result type alias for serving operations.
pub type Result<T> = std::result::Result<T, ServeError>;

impl From<std::io::Error> for ServeError {
    fn from(err: std::io::Error) -> Self {
        ServeError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for ServeError {
    fn from(err: serde_json::Error) -> Self {
        ServeError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl ServeError {
    /// Create a listener bind error from an IO failure.
    pub fn bind(network: impl Into<String>, err: std::io::Error) -> Self {
        ServeError::ListenerBind {
            network: network.into(),
            message: err.to_string(),
            source: Some(err),
        }
    }

    /// Returns true for the handshake category.
    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            ServeError::CookieMissing { .. } | ServeError::CookieMismatch { .. }
        )
    }

    /// Returns true for the version-negotiation category.
    pub fn is_version_negotiation(&self) -> bool {
        matches!(
            self,
            ServeError::IncompatibleVersion { .. }
                | ServeError::InvalidHostVersions { .. }
                | ServeError::UnknownVersion(_)
        )
    }

    /// Process exit code for this error.
    ///
    /// - 2: handshake failure
    /// - 3: version negotiation failure
    /// - 4: listener bind failure
    /// - 1: anything else
    pub fn exit_code(&self) -> u8 {
        if self.is_handshake() {
            2
        } else if self.is_version_negotiation() {
            3
        } else if matches!(self, ServeError::ListenerBind { .. }) {
            4
        } else {
            1
        }
    }
}

/// Error returned from a single RPC call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("{message}")]
    Failed { message: String },

    #[error("Invalid params: {message}")]
    InvalidParams { message: String },

    #[error("Method not found: {service}.{method}")]
    MethodNotFound { service: String, method: String },

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Internal error: {message}")]
    Internal { message: String },

    /// The call observed its cancellation signal and returned early.
    ///
    /// This is not reported to the caller as an error; the server turns it
    /// into a cancelled reply.
    #[error("Call was cancelled")]
    Cancelled,
}

impl CallError {
    /// Business-logic failure with a message.
    pub fn failed(message: impl Into<String>) -> Self {
        CallError::Failed {
            message: message.into(),
        }
    }

    /// Convert to a JSON-RPC error code.
    ///
    /// Standard codes:
    /// - -32601: Method (or service) not found
    /// - -32602: Invalid params
    /// - -32603: Internal error
    ///
    /// Application codes:
    /// - -32000: Business-logic failure
    /// - -32004: Cancelled
    pub fn to_rpc_error_code(&self) -> i32 {
        match self {
            CallError::MethodNotFound { .. } | CallError::ServiceNotFound(_) => -32601,
            CallError::InvalidParams { .. } => -32602,
            CallError::Internal { .. } => -32603,
            CallError::Failed { .. } => -32000,
            CallError::Cancelled => -32004,
        }
    }
}

impl From<serde_json::Error> for CallError {
    fn from(err: serde_json::Error) -> Self {
        CallError::InvalidParams {
            message: err.to_string(),
        }
    }
}

/// Error seen by a host-side [`RpcClient`](crate::rpc::RpcClient).
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Failed to connect to {address}: {message}")]
    Connect { address: String, message: String },

    #[error("RPC error {code}: {message}")]
    Rpc { code: i32, message: String },

    #[error("Connection to plugin lost")]
    ConnectionLost,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ServeError::CookieMissing {
            key: "PLUGIN_COOKIE".into(),
        };
        assert_eq!(
            err.to_string(),
            "Handshake failed: magic cookie PLUGIN_COOKIE is not set"
        );
    }

    #[test]
    fn test_exit_codes_are_distinct_per_category() {
        let handshake = ServeError::CookieMismatch { key: "K".into() };
        let version = ServeError::IncompatibleVersion {
            host: vec![6],
            plugin: vec![5],
        };
        let bind = ServeError::bind("tcp", std::io::Error::other("in use"));
        let other = ServeError::Config {
            message: "bad".into(),
        };

        assert_eq!(handshake.exit_code(), 2);
        assert_eq!(version.exit_code(), 3);
        assert_eq!(bind.exit_code(), 4);
        assert_eq!(other.exit_code(), 1);
    }

    #[test]
    fn test_invalid_host_versions_is_version_category() {
        let err = ServeError::InvalidHostVersions {
            value: "x".into(),
            message: "not a number".into(),
        };
        assert!(err.is_version_negotiation());
        assert!(!err.is_handshake());
    }

    #[test]
    fn test_rpc_error_codes() {
        assert_eq!(CallError::failed("boom").to_rpc_error_code(), -32000);
        assert_eq!(
            CallError::ServiceNotFound("nope".into()).to_rpc_error_code(),
            -32601
        );
        assert_eq!(
            CallError::InvalidParams {
                message: "missing".into()
            }
            .to_rpc_error_code(),
            -32602
        );
    }

    #[test]
    fn test_failed_message_is_passed_through() {
        assert_eq!(CallError::failed("disk full").to_string(), "disk full");
    }
}
