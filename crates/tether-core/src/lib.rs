//! Tether Core - serve a plugin subprocess to its host over a handshake-negotiated RPC channel.
//!
//! A host launches the plugin with a magic cookie and the protocol versions it
//! speaks in the environment. The plugin validates the cookie, picks the
//! highest common version, binds a local endpoint, announces it on stdout, and
//! then serves the services registered for that version.
//!
//! Every call runs with a [`CallContext`] derived from one
//! [`CancellationRoot`]; cancelling the root (the `stop` method) signals every
//! in-flight and future call to wind down.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tether_core::{HandshakeConfig, ProtocolVersion, ProviderAdapter, ServeOptions, VersionRegistry};
//!
//! const HANDSHAKE: HandshakeConfig = HandshakeConfig::new("MY_PLUGIN_COOKIE", "s3cr3t");
//!
//! #[tokio::main]
//! async fn main() -> tether_core::Result<()> {
//!     let registry = VersionRegistry::builder()
//!         .service(
//!             ProtocolVersion::new(5).unwrap(),
//!             "provider",
//!             ProviderAdapter::binder(Arc::new(MyProvider::default())),
//!         )
//!         .build()?;
//!
//!     tether_core::serve(ServeOptions::new(HANDSHAKE, registry)).await
//! }
//! ```

pub mod adapter;
pub mod announce;
pub mod cancel;
pub mod config;
pub mod context;
pub mod controller;
pub mod env;
pub mod error;
pub mod handshake;
pub mod listener;
pub mod rpc;
pub mod serve;
pub mod service;
pub mod version;

// Re-export commonly used types
pub use adapter::{Provider, ProviderAdapter};
pub use announce::{Announcement, Announcer};
pub use cancel::{CallToken, CancellationRoot, CancelledError};
pub use config::{EnvKeys, ServeConfig, Transport};
pub use context::CallContext;
pub use env::{EnvLookup, MapEnv, ProcessEnv};
pub use error::{CallError, ClientError, Result, ServeError};
pub use handshake::{HandshakeConfig, NOT_A_PLUGIN_MESSAGE};
pub use listener::{Endpoint, ListenerConfig, Network, PluginListener};
pub use rpc::{CallReply, RpcClient, RpcServer, RpcServerFactory, ServerHandle, ServerState};
pub use serve::{serve, start, RunningPlugin, ServeOptions};
pub use service::{RpcService, ServiceRouter};
pub use version::{HostVersions, ProtocolVersion, ServiceBinder, ServiceSet, VersionRegistry};
