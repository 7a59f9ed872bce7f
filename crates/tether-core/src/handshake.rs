//! Magic cookie handshake.
//!
//! A host launches the plugin with an environment variable whose name and
//! value are compiled into both binaries. The check is not a security
//! boundary against a hostile local user; it keeps a binary that was run by
//! hand from exposing a live RPC endpoint.

use crate::env::EnvLookup;
use crate::error::{Result, ServeError};
use tracing::debug;

/// Printed to stderr when the plugin is executed directly.
pub const NOT_A_PLUGIN_MESSAGE: &str = "This binary is a plugin. These are not meant to be executed directly.\n\
Please execute the program that consumes these plugins, which will\n\
load any plugins automatically";

/// Shared secret both sides agree on out-of-band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeConfig {
    pub magic_cookie_key: &'static str,
    pub magic_cookie_value: &'static str,
}

impl HandshakeConfig {
    pub const fn new(magic_cookie_key: &'static str, magic_cookie_value: &'static str) -> Self {
        Self {
            magic_cookie_key,
            magic_cookie_value,
        }
    }

    /// Validate the magic cookie in `env`.
    ///
    /// Exact, case-sensitive comparison; the value is not trimmed.
    pub fn validate(&self, env: &dyn EnvLookup) -> Result<()> {
        match env.var(self.magic_cookie_key) {
            None => Err(ServeError::CookieMissing {
                key: self.magic_cookie_key.to_string(),
            }),
            Some(value) if value != self.magic_cookie_value => Err(ServeError::CookieMismatch {
                key: self.magic_cookie_key.to_string(),
            }),
            Some(_) => {
                debug!(key = self.magic_cookie_key, "Magic cookie accepted");
                Ok(())
            }
        }
    }
}
