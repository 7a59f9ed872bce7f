//! Tether RPC plugin - serves the sample provider to a host process.
//!
//! The host launches this binary with the magic cookie and the protocol
//! versions it speaks in the environment, then reads the announcement line
//! from stdout and connects. Logs go to stderr.
//!
//! Exit codes: 0 after a graceful shutdown, 2 when the handshake fails,
//! 3 when no protocol version is shared, 4 when no listener can be bound,
//! 1 for anything else.

mod provider;

use anyhow::Result;
use clap::Parser;
use provider::SampleProvider;
use std::process::ExitCode;
use std::sync::Arc;
use tether_core::{
    HandshakeConfig, ProtocolVersion, ProviderAdapter, ServeError, ServeOptions, Transport,
    VersionRegistry, NOT_A_PLUGIN_MESSAGE,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Cookie shared with hosts that launch this plugin.
const HANDSHAKE: HandshakeConfig = HandshakeConfig::new(
    "TETHER_PLUGIN_MAGIC_COOKIE",
    "7c1e0b4f9d2a48e6b3f5a0c8d1e2f3a4",
);

/// Protocol version the sample provider is served at.
const PLUGIN_VERSION: u32 = 5;

/// Service name the sample provider is mounted under.
const PROVIDER_SERVICE: &str = "provider";

#[derive(Parser, Debug)]
#[command(name = "tether-rpc")]
#[command(about = "Sample plugin served over the tether handshake protocol")]
struct Args {
    /// Enable debug logging (overrides RUST_LOG)
    #[arg(short, long)]
    debug: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    /// Endpoint kind to bind: auto, unix or tcp
    #[arg(long, default_value_t = Transport::Auto)]
    transport: Transport,
}

fn init_logging(args: &Args) {
    let filter = if args.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    // stdout carries the announcement line only.
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false);

    if args.log_json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

/// Wait for ctrl-c, or SIGTERM on unix.
async fn shutdown_signal() -> std::io::Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.map(|_| "SIGINT"),
            _ = terminate.recv() => Ok("SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.map(|_| "ctrl-c")
    }
}

async fn run(args: Args) -> Result<()> {
    let version = ProtocolVersion::try_from(PLUGIN_VERSION).map_err(anyhow::Error::msg)?;
    let registry = VersionRegistry::builder()
        .service(
            version,
            PROVIDER_SERVICE,
            ProviderAdapter::binder(Arc::new(SampleProvider::new())),
        )
        .build()?;

    let options = ServeOptions::new(HANDSHAKE, registry).with_transport(args.transport);
    let plugin = tether_core::start(options).await?;

    info!(
        version = plugin.version().get(),
        endpoint = %plugin.endpoint(),
        "Tether RPC plugin running"
    );

    let handle = plugin.handle();
    let signal = tokio::spawn(async move {
        match shutdown_signal().await {
            Ok(name) => {
                info!("{} received, shutting down", name);
                handle.shutdown();
            }
            Err(e) => warn!("Failed to install signal handler: {}", e),
        }
    });

    let result = plugin.wait().await;
    signal.abort();
    result?;

    info!("Tether RPC plugin exited");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let code = match err.downcast_ref::<ServeError>() {
                Some(serve_err) => {
                    if serve_err.is_handshake() {
                        eprintln!("{}", NOT_A_PLUGIN_MESSAGE);
                    }
                    serve_err.exit_code()
                }
                None => 1,
            };
            error!("{:#}", err);
            ExitCode::from(code)
        }
    }
}
