//! Protocol versions, the version registry, and negotiation.
//!
//! A plugin registers one [`ServiceSet`] per protocol version it can speak.
//! The host advertises the versions it accepts through
//! `PLUGIN_PROTOCOL_VERSIONS`; the highest version present on both sides wins.

use crate::cancel::CancellationRoot;
use crate::config::EnvKeys;
use crate::controller::RESERVED_SERVICES;
use crate::env::EnvLookup;
use crate::error::{Result, ServeError};
use crate::service::RpcService;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::num::NonZeroU32;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

/// Positive integer identifying a wire-compatible set of services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct ProtocolVersion(NonZeroU32);

impl ProtocolVersion {
    /// Returns `None` for zero.
    pub const fn new(version: u32) -> Option<Self> {
        match NonZeroU32::new(version) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    pub const fn get(self) -> u32 {
        self.0.get()
    }
}

impl TryFrom<u32> for ProtocolVersion {
    type Error = String;

    fn try_from(value: u32) -> std::result::Result<Self, Self::Error> {
        Self::new(value).ok_or_else(|| "protocol version must be positive".to_string())
    }
}

impl From<ProtocolVersion> for u32 {
    fn from(value: ProtocolVersion) -> Self {
        value.get()
    }
}

impl FromStr for ProtocolVersion {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let n: u32 = s
            .parse()
            .map_err(|_| format!("'{}' is not a protocol version", s))?;
        Self::try_from(n)
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Builds the service object for one named service.
///
/// Invoked once per server, with the server's cancellation root.
pub type ServiceBinder = Arc<dyn Fn(&CancellationRoot) -> Arc<dyn RpcService> + Send + Sync>;

/// Named services available at one protocol version.
#[derive(Clone, Default)]
pub struct ServiceSet {
    services: BTreeMap<String, ServiceBinder>,
}

impl ServiceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, binder: ServiceBinder) {
        self.services.insert(name.into(), binder);
    }

    pub fn get(&self, name: &str) -> Option<&ServiceBinder> {
        self.services.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ServiceBinder)> {
        self.services.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl fmt::Debug for ServiceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.services.keys()).finish()
    }
}

/// Versions the host is willing to speak.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostVersions {
    /// The host did not advertise anything; every registered version is acceptable.
    Any,
    Only(BTreeSet<ProtocolVersion>),
}

impl HostVersions {
    /// Parse a comma-separated list such as `"5,6"`.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut versions = BTreeSet::new();
        for part in raw.split(',') {
            let part = part.trim();
            let version = part
                .parse::<ProtocolVersion>()
                .map_err(|message| ServeError::InvalidHostVersions {
                    value: raw.to_string(),
                    message,
                })?;
            versions.insert(version);
        }
        Ok(HostVersions::Only(versions))
    }

    /// Read `PLUGIN_PROTOCOL_VERSIONS` from the environment.
    pub fn from_env(env: &dyn EnvLookup) -> Result<Self> {
        match env.var(EnvKeys::PROTOCOL_VERSIONS) {
            Some(raw) => Self::parse(&raw),
            None => Ok(HostVersions::Any),
        }
    }
}

/// Pick the highest version present in both sets.
pub fn negotiate(
    plugin: &BTreeSet<ProtocolVersion>,
    host: &BTreeSet<ProtocolVersion>,
) -> Option<ProtocolVersion> {
    plugin.intersection(host).max().copied()
}

/// Mapping from protocol version to the services available at that version.
///
/// Built once at startup with [`VersionRegistry::builder`] and read-only afterwards.
#[derive(Debug, Clone)]
pub struct VersionRegistry {
    versions: BTreeMap<ProtocolVersion, ServiceSet>,
}

impl VersionRegistry {
    pub fn builder() -> VersionRegistryBuilder {
        VersionRegistryBuilder::default()
    }

    /// Registered versions in ascending order.
    pub fn versions(&self) -> impl Iterator<Item = ProtocolVersion> + '_ {
        self.versions.keys().copied()
    }

    /// Look up the services for `version`.
    pub fn service_set(&self, version: ProtocolVersion) -> Result<&ServiceSet> {
        self.versions
            .get(&version)
            .ok_or(ServeError::UnknownVersion(version.get()))
    }

    /// Select the highest registered version the host accepts.
    pub fn negotiate(&self, host: &HostVersions) -> Result<ProtocolVersion> {
        let registered: BTreeSet<ProtocolVersion> = self.versions().collect();
        let selected = match host {
            HostVersions::Any => registered.last().copied(),
            HostVersions::Only(set) => negotiate(&registered, set),
        };

        match selected {
            Some(version) => {
                info!(version = version.get(), "Negotiated protocol version");
                Ok(version)
            }
            None => {
                let host = match host {
                    HostVersions::Any => Vec::new(),
                    HostVersions::Only(set) => set.iter().map(|v| v.get()).collect(),
                };
                Err(ServeError::IncompatibleVersion {
                    host,
                    plugin: self.versions().map(|v| v.get()).collect(),
                })
            }
        }
    }
}

/// Builder for [`VersionRegistry`].
#[derive(Default)]
pub struct VersionRegistryBuilder {
    versions: BTreeMap<ProtocolVersion, ServiceSet>,
}

impl VersionRegistryBuilder {
    /// Register `binder` as service `name` at `version`.
    pub fn service(
        mut self,
        version: ProtocolVersion,
        name: impl Into<String>,
        binder: ServiceBinder,
    ) -> Self {
        self.versions.entry(version).or_default().insert(name, binder);
        self
    }

    /// Register a whole service set at `version`, replacing any previous one.
    pub fn version(mut self, version: ProtocolVersion, services: ServiceSet) -> Self {
        self.versions.insert(version, services);
        self
    }

    pub fn build(self) -> Result<VersionRegistry> {
        if self.versions.is_empty() {
            return Err(ServeError::Config {
                message: "no protocol versions registered".to_string(),
            });
        }

        for (version, set) in &self.versions {
            if set.is_empty() {
                return Err(ServeError::Config {
                    message: format!("protocol version {} has no services", version),
                });
            }
            if let Some(name) = set.names().find(|n| RESERVED_SERVICES.contains(n)) {
                return Err(ServeError::Config {
                    message: format!("service name '{}' is reserved", name),
                });
            }
            if let Some(name) = set.names().find(|n| n.is_empty() || n.contains('.')) {
                return Err(ServeError::Config {
                    message: format!("invalid service name '{}'", name),
                });
            }
            debug!(version = version.get(), services = ?set, "Registered protocol version");
        }

        Ok(VersionRegistry {
            versions: self.versions,
        })
    }
}
