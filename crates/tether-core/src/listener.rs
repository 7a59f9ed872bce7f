//! Listener manager: binds the endpoint the host will dial.
//!
//! On unix the plugin listens on a domain socket inside a private temporary
//! directory; elsewhere it listens on a loopback TCP port. A caller may supply
//! an already-bound listener instead (embedding and tests).

use crate::config::{EnvKeys, ServeConfig, Transport};
use crate::env::EnvLookup;
use crate::error::{Result, ServeError};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::str::FromStr;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

/// Network family of a bound endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Unix,
    Tcp,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Unix => "unix",
            Network::Tcp => "tcp",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "unix" => Ok(Network::Unix),
            "tcp" => Ok(Network::Tcp),
            other => Err(format!("unknown network '{}'", other)),
        }
    }
}

/// Address of a bound transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub network: Network,
    pub address: String,
}

impl Endpoint {
    pub fn tcp(addr: SocketAddr) -> Self {
        Self {
            network: Network::Tcp,
            address: addr.to_string(),
        }
    }

    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self {
            network: Network::Unix,
            address: path.into().to_string_lossy().into_owned(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.network, self.address)
    }
}

/// How to bind when no listener is supplied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListenerConfig {
    pub transport: Transport,
    /// Parent directory for the socket's temp directory.
    pub unix_socket_dir: Option<PathBuf>,
    /// Inclusive TCP port range; `None` lets the OS pick.
    pub port_range: Option<RangeInclusive<u16>>,
}

impl ListenerConfig {
    /// Read `PLUGIN_UNIX_SOCKET_DIR`, `PLUGIN_MIN_PORT` and `PLUGIN_MAX_PORT`.
    ///
    /// The port range only applies when both bounds are set.
    pub fn from_env(env: &dyn EnvLookup, transport: Transport) -> Result<Self> {
        let unix_socket_dir = env
            .var(EnvKeys::UNIX_SOCKET_DIR)
            .filter(|d| !d.is_empty())
            .map(PathBuf::from);

        let port_range = match (env.var(EnvKeys::MIN_PORT), env.var(EnvKeys::MAX_PORT)) {
            (Some(min), Some(max)) => {
                let min = parse_port(EnvKeys::MIN_PORT, &min)?;
                let max = parse_port(EnvKeys::MAX_PORT, &max)?;
                if min > max {
                    return Err(ServeError::ListenerBind {
                        network: Network::Tcp.to_string(),
                        message: format!("port range {}-{} is empty", min, max),
                        source: None,
                    });
                }
                Some(min..=max)
            }
            _ => None,
        };

        Ok(Self {
            transport,
            unix_socket_dir,
            port_range,
        })
    }

    /// The concrete network `Auto` resolves to on this platform.
    pub fn network(&self) -> Network {
        match self.transport {
            Transport::Unix => Network::Unix,
            Transport::Tcp => Network::Tcp,
            Transport::Auto if cfg!(unix) => Network::Unix,
            Transport::Auto => Network::Tcp,
        }
    }
}

fn parse_port(key: &str, value: &str) -> Result<u16> {
    value.trim().parse().map_err(|_| ServeError::ListenerBind {
        network: Network::Tcp.to_string(),
        message: format!("{}={:?} is not a valid port", key, value),
        source: None,
    })
}

enum ListenerKind {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix {
        listener: UnixListener,
        // Removes the socket directory when the listener is dropped.
        _dir: Option<tempfile::TempDir>,
    },
}

/// A bound listener together with the endpoint it is reachable at.
pub struct PluginListener {
    kind: ListenerKind,
    endpoint: Endpoint,
}

/// A connection accepted from a [`PluginListener`].
pub(crate) enum Accepted {
    Tcp(TcpStream, SocketAddr),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl PluginListener {
    /// Bind a fresh endpoint according to `config`.
    pub async fn bind(config: &ListenerConfig) -> Result<Self> {
        let listener = match config.network() {
            Network::Tcp => Self::bind_tcp(config.port_range.clone()).await?,
            Network::Unix => Self::bind_unix(config)?,
        };
        info!(endpoint = %listener.endpoint, "Listener bound");
        Ok(listener)
    }

    async fn bind_tcp(range: Option<RangeInclusive<u16>>) -> Result<Self> {
        let Some(range) = range else {
            let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
                .await
                .map_err(|e| ServeError::bind("tcp", e))?;
            return Self::from_tcp(listener);
        };

        let mut last_err = None;
        for port in range.clone() {
            match TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await {
                Ok(listener) => return Self::from_tcp(listener),
                Err(e) => {
                    debug!(port, error = %e, "Port unavailable");
                    last_err = Some(e);
                }
            }
        }

        Err(ServeError::ListenerBind {
            network: Network::Tcp.to_string(),
            message: format!(
                "no free port in range {}-{}",
                range.start(),
                range.end()
            ),
            source: last_err,
        })
    }

    #[cfg(unix)]
    fn bind_unix(config: &ListenerConfig) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(ServeConfig::SOCKET_DIR_PREFIX);
        let dir = match &config.unix_socket_dir {
            Some(parent) => builder.tempdir_in(parent),
            None => builder.tempdir(),
        }
        .map_err(|e| ServeError::bind("unix", e))?;

        let path = dir.path().join(ServeConfig::SOCKET_FILE_NAME);
        let listener = UnixListener::bind(&path).map_err(|e| ServeError::bind("unix", e))?;

        Ok(Self {
            kind: ListenerKind::Unix {
                listener,
                _dir: Some(dir),
            },
            endpoint: Endpoint::unix(path),
        })
    }

    #[cfg(not(unix))]
    fn bind_unix(_config: &ListenerConfig) -> Result<Self> {
        Err(ServeError::ListenerBind {
            network: Network::Unix.to_string(),
            message: "unix domain sockets are not supported on this platform".to_string(),
            source: None,
        })
    }

    /// Wrap an already-bound TCP listener.
    pub fn from_tcp(listener: TcpListener) -> Result<Self> {
        let addr = listener.local_addr().map_err(|e| ServeError::bind("tcp", e))?;
        Ok(Self {
            kind: ListenerKind::Tcp(listener),
            endpoint: Endpoint::tcp(addr),
        })
    }

    /// Wrap an already-bound unix listener. The caller keeps ownership of the
    /// socket file.
    #[cfg(unix)]
    pub fn from_unix(listener: UnixListener) -> Result<Self> {
        let addr = listener.local_addr().map_err(|e| ServeError::bind("unix", e))?;
        let path = addr.as_pathname().ok_or_else(|| ServeError::ListenerBind {
            network: Network::Unix.to_string(),
            message: "unnamed unix sockets cannot be announced".to_string(),
            source: None,
        })?;
        let endpoint = Endpoint::unix(path);
        Ok(Self {
            kind: ListenerKind::Unix {
                listener,
                _dir: None,
            },
            endpoint,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub(crate) async fn accept(&self) -> std::io::Result<Accepted> {
        match &self.kind {
            ListenerKind::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                Ok(Accepted::Tcp(stream, peer))
            }
            #[cfg(unix)]
            ListenerKind::Unix { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                Ok(Accepted::Unix(stream))
            }
        }
    }
}

impl fmt::Debug for PluginListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginListener")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}
