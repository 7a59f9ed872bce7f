//! Environment access used during the handshake.
//!
//! Everything the plugin learns from its host before serving comes through
//! environment variables. Reading them through [`EnvLookup`] keeps the startup
//! sequence testable without mutating the process environment.

use std::collections::HashMap;

/// Source of environment variables.
pub trait EnvLookup: Send + Sync {
    /// Return the value of `key`, or `None` if it is not set.
    fn var(&self, key: &str) -> Option<String>;
}

/// Reads from the real process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvLookup for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        // A non-UTF-8 value is still "set"; surface it lossily so it fails
        // comparison instead of reading as absent.
        std::env::var_os(key).map(|v| v.to_string_lossy().into_owned())
    }
}

/// In-memory environment, mostly for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct MapEnv {
    vars: HashMap<String, String>,
}

impl MapEnv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a variable, returning the updated environment.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }
}

impl EnvLookup for MapEnv {
    fn var(&self, key: &str) -> Option<String> {
        self.vars.get(key).cloned()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for MapEnv {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            vars: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}
