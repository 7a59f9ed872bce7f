//! Plugin entrypoint: handshake, negotiate, bind, announce, serve.
//!
//! [`start`] performs the bootstrap steps strictly in order and returns as
//! soon as the server is accepting calls. Any failure before the announcement
//! leaves stdout untouched, so the host never sees a half-written handshake.

use crate::announce::{Announcement, Announcer};
use crate::cancel::CancellationRoot;
use crate::config::Transport;
use crate::env::{EnvLookup, ProcessEnv};
use crate::error::{Result, ServeError};
use crate::handshake::HandshakeConfig;
use crate::listener::{Endpoint, ListenerConfig, PluginListener};
use crate::rpc::{RpcServerFactory, ServerHandle, ServerState};
use crate::version::{HostVersions, ProtocolVersion, VersionRegistry};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Everything needed to serve a plugin.
pub struct ServeOptions {
    pub handshake: HandshakeConfig,
    pub registry: VersionRegistry,
    /// Pre-bound listener. When absent one is bound from the environment.
    pub listener: Option<PluginListener>,
    pub transport: Transport,
    /// Where the announcement goes. Defaults to stdout.
    pub announcer: Option<Announcer>,
    pub env: Arc<dyn EnvLookup>,
}

impl ServeOptions {
    pub fn new(handshake: HandshakeConfig, registry: VersionRegistry) -> Self {
        Self {
            handshake,
            registry,
            listener: None,
            transport: Transport::default(),
            announcer: None,
            env: Arc::new(ProcessEnv),
        }
    }

    pub fn with_listener(mut self, listener: PluginListener) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_announcer(mut self, announcer: Announcer) -> Self {
        self.announcer = Some(announcer);
        self
    }

    pub fn with_env(mut self, env: impl EnvLookup + 'static) -> Self {
        self.env = Arc::new(env);
        self
    }
}

/// A plugin that has announced its endpoint and is serving.
#[derive(Debug)]
pub struct RunningPlugin {
    version: ProtocolVersion,
    endpoint: Endpoint,
    handle: ServerHandle,
    task: JoinHandle<Result<()>>,
}

impl RunningPlugin {
    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    pub fn root(&self) -> &CancellationRoot {
        self.handle.root()
    }

    pub fn state(&self) -> ServerState {
        self.handle.state()
    }

    /// Begin graceful shutdown. Use [`RunningPlugin::wait`] to block until done.
    pub fn shutdown(&self) {
        self.handle.shutdown();
    }

    /// Wait for the server to stop.
    pub async fn wait(self) -> Result<()> {
        self.task
            .await
            .map_err(|e| ServeError::Internal(format!("server task failed: {}", e)))?
    }
}

/// Bootstrap the plugin and start serving in the background.
pub async fn start(opts: ServeOptions) -> Result<RunningPlugin> {
    let ServeOptions {
        handshake,
        registry,
        listener,
        transport,
        announcer,
        env,
    } = opts;

    handshake.validate(env.as_ref())?;

    let host = HostVersions::from_env(env.as_ref())?;
    let version = registry.negotiate(&host)?;

    let listener = match listener {
        Some(listener) => {
            debug!(endpoint = %listener.endpoint(), "Using pre-bound listener");
            listener
        }
        None => {
            let config = ListenerConfig::from_env(env.as_ref(), transport)?;
            PluginListener::bind(&config).await?
        }
    };

    let root = CancellationRoot::new();
    let server = RpcServerFactory::new(&registry, root).build(version, listener)?;
    let endpoint = server.endpoint().clone();

    let mut announcer = announcer.unwrap_or_else(Announcer::stdout);
    announcer.announce(&Announcement::new(version, endpoint.clone()))?;

    let handle = server.handle();
    let task = tokio::spawn(server.serve());
    handle.wait_for(ServerState::Serving).await;

    info!(version = version.get(), endpoint = %endpoint, "Plugin started");
    Ok(RunningPlugin {
        version,
        endpoint,
        handle,
        task,
    })
}

/// Bootstrap the plugin and serve until it shuts down.
pub async fn serve(opts: ServeOptions) -> Result<()> {
    start(opts).await?.wait().await
}
