//! End-to-end serving scenarios, in process.
//!
//! The plugin side runs through `tether_core::start` with an injected
//! environment and a buffer in place of stdout; the host side parses the
//! announcement and talks to the endpoint with `RpcClient`.

use serde_json::{json, Value};
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether_core::{
    Announcement, Announcer, CallContext, CallError, CallReply, HandshakeConfig, MapEnv,
    ProtocolVersion, Provider, ProviderAdapter, RpcClient, ServeError, ServeOptions, ServerState,
    Transport, VersionRegistry,
};

const HANDSHAKE: HandshakeConfig = HandshakeConfig::new("SCENARIO_COOKIE", "0f1e2d3c");

#[derive(Clone, Default)]
struct Stdout(Arc<Mutex<Vec<u8>>>);

impl Write for Stdout {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Stdout {
    fn lines(&self) -> Vec<String> {
        String::from_utf8(self.0.lock().unwrap().clone())
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }
}

/// Records what each call's context looked like when it returned.
#[derive(Default)]
struct Recorder {
    started: AtomicUsize,
    observed: Mutex<Vec<(String, bool)>>,
}

impl Provider for Recorder {
    fn methods(&self) -> &[&'static str] {
        &["work", "peek"]
    }

    fn call(&self, ctx: &CallContext, method: &str, params: Value) -> Result<Value, CallError> {
        let label = params["label"].as_str().unwrap_or("?").to_string();
        match method {
            "work" => {
                self.started.fetch_add(1, Ordering::SeqCst);
                while !ctx.is_cancelled() {
                    std::thread::sleep(Duration::from_millis(5));
                }
                self.observed.lock().unwrap().push((label, true));
                Err(CallError::Cancelled)
            }
            _ => {
                let cancelled = ctx.is_cancelled();
                self.observed.lock().unwrap().push((label, cancelled));
                Ok(json!({ "cancelled": cancelled }))
            }
        }
    }
}

fn registry(provider: Arc<Recorder>, versions: &[u32]) -> VersionRegistry {
    let mut builder = VersionRegistry::builder();
    for v in versions {
        builder = builder.service(
            ProtocolVersion::new(*v).unwrap(),
            "recorder",
            ProviderAdapter::binder(provider.clone()),
        );
    }
    builder.build().unwrap()
}

fn options(env: MapEnv, versions: &[u32], out: &Stdout) -> ServeOptions {
    ServeOptions::new(HANDSHAKE, registry(Arc::new(Recorder::default()), versions))
        .with_env(env)
        .with_transport(Transport::Tcp)
        .with_announcer(Announcer::new(out.clone()))
}

fn cookie() -> MapEnv {
    MapEnv::new().with("SCENARIO_COOKIE", "0f1e2d3c")
}

#[tokio::test]
async fn test_unset_cookie_never_binds_or_announces() {
    let out = Stdout::default();
    let err = tether_core::start(options(MapEnv::new(), &[5], &out))
        .await
        .unwrap_err();

    assert!(matches!(err, ServeError::CookieMissing { .. }));
    assert_eq!(err.exit_code(), 2);
    assert!(out.lines().is_empty());
}

#[tokio::test]
async fn test_highest_common_version_is_announced_once() {
    let out = Stdout::default();
    let env = cookie().with("PLUGIN_PROTOCOL_VERSIONS", "5,6");
    let plugin = tether_core::start(options(env, &[5], &out)).await.unwrap();

    let lines = out.lines();
    assert_eq!(lines.len(), 1);
    let announcement: Announcement = lines[0].parse().unwrap();
    assert_eq!(lines[0].split('|').nth(1), Some("5"));
    assert_eq!(announcement.version, plugin.version());

    let client = RpcClient::connect(&announcement.endpoint).await.unwrap();
    assert_eq!(client.health().await.unwrap(), json!({"status": "ok"}));

    client.shutdown().await.unwrap();
    plugin.wait().await.unwrap();
    assert_eq!(out.lines().len(), 1);
}

#[tokio::test]
async fn test_registry_picks_highest_of_several() {
    let out = Stdout::default();
    let env = cookie().with("PLUGIN_PROTOCOL_VERSIONS", "5, 6 ,7");
    let plugin = tether_core::start(options(env, &[4, 5, 6], &out))
        .await
        .unwrap();
    assert_eq!(plugin.version().get(), 6);

    plugin.shutdown();
    plugin.wait().await.unwrap();
}

#[tokio::test]
async fn test_absent_host_versions_accepts_highest_registered() {
    let out = Stdout::default();
    let plugin = tether_core::start(options(cookie(), &[3, 8], &out))
        .await
        .unwrap();
    assert_eq!(plugin.version().get(), 8);

    plugin.shutdown();
    plugin.wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_cancels_in_flight_and_later_calls() {
    let recorder = Arc::new(Recorder::default());
    let out = Stdout::default();
    let opts = ServeOptions::new(HANDSHAKE, registry(recorder.clone(), &[5]))
        .with_env(cookie())
        .with_transport(Transport::Tcp)
        .with_announcer(Announcer::new(out.clone()));
    let plugin = tether_core::start(opts).await.unwrap();
    let client = Arc::new(RpcClient::connect(plugin.endpoint()).await.unwrap());

    let spawn_work = |label: &'static str| {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .call("recorder", "work", json!({ "label": label }))
                .await
        })
    };
    let a = spawn_work("A");
    let b = spawn_work("B");

    while recorder.started.load(Ordering::SeqCst) < 2 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(plugin.state(), ServerState::Serving);

    client.stop("recorder").await.unwrap();

    for call in [a, b] {
        let reply = tokio::time::timeout(Duration::from_secs(2), call)
            .await
            .expect("in-flight call should observe cancellation")
            .unwrap()
            .unwrap();
        assert_eq!(reply, CallReply::Cancelled);
    }

    let c = client
        .call("recorder", "peek", json!({ "label": "C" }))
        .await
        .unwrap();
    assert_eq!(c, CallReply::Completed(json!({ "cancelled": true })));
    assert_eq!(plugin.state(), ServerState::Stopping);

    let mut observed = recorder.observed.lock().unwrap().clone();
    observed.sort();
    assert_eq!(
        observed,
        vec![
            ("A".to_string(), true),
            ("B".to_string(), true),
            ("C".to_string(), true),
        ]
    );

    // Stopping twice is harmless.
    client.stop("recorder").await.unwrap();

    client.shutdown().await.unwrap();
    let handle = plugin.handle();
    plugin.wait().await.unwrap();
    assert_eq!(handle.state(), ServerState::Stopped);
}

#[cfg(unix)]
#[tokio::test]
async fn test_unix_socket_in_requested_directory_is_removed() {
    let dir = tempfile::tempdir().unwrap();
    let out = Stdout::default();
    let env = cookie().with("PLUGIN_UNIX_SOCKET_DIR", dir.path().to_string_lossy());
    let opts = ServeOptions::new(HANDSHAKE, registry(Arc::new(Recorder::default()), &[5]))
        .with_env(env)
        .with_transport(Transport::Unix)
        .with_announcer(Announcer::new(out.clone()));
    let plugin = tether_core::start(opts).await.unwrap();

    let announcement: Announcement = out.lines()[0].parse().unwrap();
    let socket = std::path::PathBuf::from(&announcement.endpoint.address);
    assert!(socket.starts_with(dir.path()));
    assert!(socket.exists());

    let client = RpcClient::connect(&announcement.endpoint).await.unwrap();
    client.shutdown().await.unwrap();
    plugin.wait().await.unwrap();

    assert!(!socket.exists());
}
