//! Handshake announcement line.
//!
//! After binding, the plugin tells its host where to connect by writing one
//! line to stdout:
//!
//! ```text
//! <core-protocol>|<version>|<network>|<address>|<protocol>
//! 1|5|unix|/tmp/tether-pluginAbc123/plugin.sock|jsonrpc
//! ```
//!
//! The host parses the first line it reads, so nothing else may be written to
//! this channel. Logging goes to stderr.

use crate::config::ServeConfig;
use crate::error::{Result, ServeError};
use crate::listener::{Endpoint, Network};
use crate::version::ProtocolVersion;
use std::fmt;
use std::io::Write;
use std::str::FromStr;
use thiserror::Error;
use tracing::info;

/// The negotiated endpoint and version, as sent to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub core_protocol: u32,
    pub version: ProtocolVersion,
    pub endpoint: Endpoint,
    pub protocol: String,
}

impl Announcement {
    pub fn new(version: ProtocolVersion, endpoint: Endpoint) -> Self {
        Self {
            core_protocol: ServeConfig::CORE_PROTOCOL_VERSION,
            version,
            endpoint,
            protocol: ServeConfig::PROTOCOL_TYPE.to_string(),
        }
    }
}

impl fmt::Display for Announcement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}|{}",
            self.core_protocol,
            self.version,
            self.endpoint.network,
            self.endpoint.address,
            self.protocol
        )
    }
}

/// A line that is not a valid announcement.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Malformed announcement line {line:?}: {reason}")]
pub struct MalformedAnnouncement {
    pub line: String,
    pub reason: String,
}

impl FromStr for Announcement {
    type Err = MalformedAnnouncement;

    fn from_str(line: &str) -> std::result::Result<Self, Self::Err> {
        let malformed = |reason: String| MalformedAnnouncement {
            line: line.to_string(),
            reason,
        };
        let line = line.trim_end_matches(['\r', '\n']);

        // The address is the only field that may legitimately contain '|'
        // (a socket path), so peel fixed fields from both ends.
        let mut head = line.splitn(4, '|');
        let (Some(core), Some(version), Some(network), Some(rest)) =
            (head.next(), head.next(), head.next(), head.next())
        else {
            return Err(malformed("expected 5 '|'-separated fields".to_string()));
        };
        let Some((address, protocol)) = rest.rsplit_once('|') else {
            return Err(malformed("expected 5 '|'-separated fields".to_string()));
        };

        let core_protocol = core
            .parse()
            .map_err(|_| malformed(format!("bad core protocol '{}'", core)))?;
        let version = version.parse().map_err(malformed)?;
        let network: Network = network.parse().map_err(malformed)?;
        if address.is_empty() {
            return Err(malformed("empty address".to_string()));
        }
        if protocol.is_empty() {
            return Err(malformed("empty protocol".to_string()));
        }

        Ok(Self {
            core_protocol,
            version,
            endpoint: Endpoint {
                network,
                address: address.to_string(),
            },
            protocol: protocol.to_string(),
        })
    }
}

/// Writes the announcement line, at most once.
pub struct Announcer {
    out: Box<dyn Write + Send>,
    announced: bool,
}

impl Announcer {
    /// Announce on the process's stdout.
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }

    /// Announce on an arbitrary sink.
    pub fn new(out: impl Write + Send + 'static) -> Self {
        Self {
            out: Box::new(out),
            announced: false,
        }
    }

    pub fn has_announced(&self) -> bool {
        self.announced
    }

    /// Write `announcement` followed by a newline and flush.
    ///
    /// Fails if this announcer has already written a line.
    pub fn announce(&mut self, announcement: &Announcement) -> Result<()> {
        if self.announced {
            return Err(ServeError::Announce {
                message: "endpoint was already announced".to_string(),
                source: None,
            });
        }

        let line = format!("{}\n", announcement);
        self.out
            .write_all(line.as_bytes())
            .and_then(|_| self.out.flush())
            .map_err(|e| ServeError::Announce {
                message: e.to_string(),
                source: Some(e),
            })?;
        self.announced = true;

        info!(
            version = announcement.version.get(),
            endpoint = %announcement.endpoint,
            "Announced plugin endpoint"
        );
        Ok(())
    }
}

impl fmt::Debug for Announcer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Announcer")
            .field("announced", &self.announced)
            .finish()
    }
}
