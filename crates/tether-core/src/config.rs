//! Centralized configuration for the plugin serving layer.
//!
//! Protocol constants, limits and the environment variable names the host
//! uses to talk to the plugin before the RPC channel exists.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Protocol-level configuration.
pub struct ServeConfig;

impl ServeConfig {
    /// Version of the handshake line format itself, first field of the announcement.
    pub const CORE_PROTOCOL_VERSION: u32 = 1;
    /// Transport protocol tag, last field of the announcement.
    pub const PROTOCOL_TYPE: &'static str = "jsonrpc";

    pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024; // 16MB
    pub const MAX_CONNECTIONS: usize = 64;
    pub const RESPONSE_QUEUE_DEPTH: usize = 64;
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);
    pub const MAX_CONSECUTIVE_ACCEPT_ERRORS: u32 = 16;

    pub const SOCKET_DIR_PREFIX: &'static str = "tether-plugin";
    pub const SOCKET_FILE_NAME: &'static str = "plugin.sock";
}

/// Environment variables set by the host.
pub struct EnvKeys;

impl EnvKeys {
    /// Comma-separated list of protocol versions the host accepts.
    pub const PROTOCOL_VERSIONS: &'static str = "PLUGIN_PROTOCOL_VERSIONS";
    pub const MIN_PORT: &'static str = "PLUGIN_MIN_PORT";
    pub const MAX_PORT: &'static str = "PLUGIN_MAX_PORT";
    pub const UNIX_SOCKET_DIR: &'static str = "PLUGIN_UNIX_SOCKET_DIR";
}

/// Which kind of endpoint the listener manager binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transport {
    /// Unix domain socket where available, loopback TCP otherwise.
    #[default]
    Auto,
    Unix,
    Tcp,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Auto => "auto",
            Transport::Unix => "unix",
            Transport::Tcp => "tcp",
        }
    }
}

impl FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(Transport::Auto),
            "unix" => Ok(Transport::Unix),
            "tcp" => Ok(Transport::Tcp),
            other => Err(format!("unknown transport '{}' (expected auto, unix or tcp)", other)),
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_roundtrip() {
        for transport in [Transport::Auto, Transport::Unix, Transport::Tcp] {
            let parsed: Transport = transport.as_str().parse().expect("Should parse");
            assert_eq!(transport, parsed);
        }
    }

    #[test]
    fn test_transport_rejects_unknown() {
        assert!("pipe".parse::<Transport>().is_err());
    }

    #[test]
    fn test_limits_are_reasonable() {
        assert!(ServeConfig::MAX_MESSAGE_SIZE > 1024);
        assert!(ServeConfig::MAX_CONNECTIONS > 0);
        assert!(ServeConfig::CONNECT_TIMEOUT > Duration::ZERO);
    }
}
