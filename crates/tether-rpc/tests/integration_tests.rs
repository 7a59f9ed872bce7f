//! Integration tests for the tether-rpc plugin binary.
//!
//! Each test launches the binary the way a host would, with the handshake
//! variables in its environment, and checks exit codes, the announcement line
//! on stdout, and the RPC surface behind it.

use serde_json::json;
use std::process::Stdio;
use std::time::Duration;
use tether_core::{Announcement, CallReply, RpcClient};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};

const COOKIE_KEY: &str = "TETHER_PLUGIN_MAGIC_COOKIE";
const COOKIE_VALUE: &str = "7c1e0b4f9d2a48e6b3f5a0c8d1e2f3a4";

const HOST_ENV: [&str; 5] = [
    COOKIE_KEY,
    "PLUGIN_PROTOCOL_VERSIONS",
    "PLUGIN_MIN_PORT",
    "PLUGIN_MAX_PORT",
    "PLUGIN_UNIX_SOCKET_DIR",
];

fn command(envs: &[(&str, &str)], args: &[&str]) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_tether-rpc"));
    for key in HOST_ENV {
        cmd.env_remove(key);
    }
    cmd.envs(envs.iter().copied())
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

/// Run the plugin to completion and return (exit code, stdout, stderr).
async fn run_to_exit(envs: &[(&str, &str)], args: &[&str]) -> (i32, String, String) {
    let output = tokio::time::timeout(Duration::from_secs(20), command(envs, args).output())
        .await
        .expect("plugin should exit on its own")
        .expect("failed to run tether-rpc");

    (
        output.status.code().unwrap_or(-1),
        String::from_utf8_lossy(&output.stdout).into_owned(),
        String::from_utf8_lossy(&output.stderr).into_owned(),
    )
}

struct PluginProcess {
    child: Child,
    stdout: Lines<BufReader<ChildStdout>>,
    announcement: Announcement,
}

impl PluginProcess {
    /// Launch the plugin and wait for its announcement line.
    async fn launch(envs: &[(&str, &str)], args: &[&str]) -> Self {
        let mut child = command(envs, args)
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to spawn tether-rpc");
        let stdout = child.stdout.take().expect("failed to capture stdout");
        let mut stdout = BufReader::new(stdout).lines();

        let line = tokio::time::timeout(Duration::from_secs(20), stdout.next_line())
            .await
            .expect("announcement line not emitted in time")
            .expect("failed to read tether-rpc stdout")
            .expect("tether-rpc closed stdout without announcing");
        let announcement: Announcement = line.parse().expect("malformed announcement line");

        Self {
            child,
            stdout,
            announcement,
        }
    }

    async fn connect(&self) -> RpcClient {
        RpcClient::connect(&self.announcement.endpoint)
            .await
            .expect("failed to connect to announced endpoint")
    }

    /// Wait for exit; stdout must carry nothing after the announcement.
    async fn wait_for_exit(mut self) -> i32 {
        let status = tokio::time::timeout(Duration::from_secs(10), self.child.wait())
            .await
            .expect("plugin should exit after shutdown")
            .expect("failed to wait for tether-rpc");

        let mut rest = String::new();
        self.stdout
            .into_inner()
            .read_to_string(&mut rest)
            .await
            .expect("failed to drain stdout");
        assert_eq!(rest, "", "nothing may follow the announcement line");

        status.code().unwrap_or(-1)
    }
}

fn host_env(versions: &'static str) -> Vec<(&'static str, &'static str)> {
    vec![(COOKIE_KEY, COOKIE_VALUE), ("PLUGIN_PROTOCOL_VERSIONS", versions)]
}

// =============================================================================
// Bootstrap failures
// =============================================================================

#[tokio::test]
async fn test_missing_cookie_exits_without_announcing() {
    let (code, stdout, stderr) = run_to_exit(&[], &[]).await;

    assert_eq!(code, 2);
    assert_eq!(stdout, "");
    assert!(stderr.contains("This binary is a plugin"));
}

#[tokio::test]
async fn test_wrong_cookie_exits_without_announcing() {
    let (code, stdout, _) = run_to_exit(&[(COOKIE_KEY, "not-the-cookie")], &[]).await;

    assert_eq!(code, 2);
    assert_eq!(stdout, "");
}

#[tokio::test]
async fn test_cookie_comparison_is_exact() {
    let padded = format!("{} ", COOKIE_VALUE);
    let (code, stdout, _) = run_to_exit(&[(COOKIE_KEY, padded.as_str())], &[]).await;

    assert_eq!(code, 2);
    assert_eq!(stdout, "");
}

#[tokio::test]
async fn test_incompatible_versions_exit_code() {
    let (code, stdout, stderr) = run_to_exit(&host_env("6,7"), &[]).await;

    assert_eq!(code, 3);
    assert_eq!(stdout, "");
    assert!(!stderr.contains("This binary is a plugin"));
}

#[tokio::test]
async fn test_malformed_versions_exit_code() {
    let (code, stdout, _) = run_to_exit(&host_env("5,six"), &[]).await;

    assert_eq!(code, 3);
    assert_eq!(stdout, "");
}

#[tokio::test]
async fn test_invalid_port_range_exit_code() {
    let mut envs = host_env("5");
    envs.push(("PLUGIN_MIN_PORT", "9000"));
    envs.push(("PLUGIN_MAX_PORT", "8000"));
    let (code, stdout, _) = run_to_exit(&envs, &["--transport", "tcp"]).await;

    assert_eq!(code, 4);
    assert_eq!(stdout, "");
}

// =============================================================================
// Serving
// =============================================================================

#[tokio::test]
async fn test_announces_highest_common_version() {
    let plugin = PluginProcess::launch(&host_env("5,6"), &[]).await;
    assert_eq!(plugin.announcement.core_protocol, 1);
    assert_eq!(plugin.announcement.version.get(), 5);
    assert_eq!(plugin.announcement.protocol, "jsonrpc");

    let client = plugin.connect().await;
    let reply = client
        .call("provider", "echo", json!({"greeting": "hello"}))
        .await
        .unwrap();
    assert_eq!(reply, CallReply::Completed(json!({"greeting": "hello"})));

    client.shutdown().await.unwrap();
    assert_eq!(plugin.wait_for_exit().await, 0);
}

#[tokio::test]
async fn test_tcp_transport_serves_on_loopback() {
    let plugin = PluginProcess::launch(&host_env("5"), &["--transport", "tcp"]).await;
    let line = plugin.announcement.to_string();
    assert!(line.starts_with("1|5|tcp|127.0.0.1:"), "got {line}");

    let client = plugin.connect().await;
    assert_eq!(client.health().await.unwrap(), json!({"status": "ok"}));

    let err = client.call("provider", "fail", json!({"message": "nope"})).await;
    assert!(matches!(
        err,
        Err(tether_core::ClientError::Rpc { code: -32000, .. })
    ));

    client.shutdown().await.unwrap();
    assert_eq!(plugin.wait_for_exit().await, 0);
}

#[tokio::test]
async fn test_stop_cancels_in_flight_and_later_calls() {
    let plugin = PluginProcess::launch(&host_env("5"), &[]).await;
    let client = std::sync::Arc::new(plugin.connect().await);

    let spawn_sleep = |client: std::sync::Arc<RpcClient>| {
        tokio::spawn(async move {
            client
                .call("provider", "sleep", json!({"ms": 30_000}))
                .await
        })
    };
    let a = spawn_sleep(client.clone());
    let b = spawn_sleep(client.clone());
    tokio::time::sleep(Duration::from_millis(200)).await;

    client.stop("provider").await.unwrap();

    for call in [a, b] {
        let reply = tokio::time::timeout(Duration::from_secs(5), call)
            .await
            .expect("in-flight call should observe cancellation")
            .unwrap()
            .unwrap();
        assert_eq!(reply, CallReply::Cancelled);
    }

    let c = client.call("provider", "context", json!({})).await.unwrap();
    let c = c.into_value().unwrap();
    assert_eq!(c["cancelled"], true);

    let health = client.health().await.unwrap();
    assert_eq!(health, json!({"status": "stopping"}));

    client.shutdown().await.unwrap();
    assert_eq!(plugin.wait_for_exit().await, 0);
}

#[cfg(unix)]
#[tokio::test]
async fn test_sigterm_drains_and_exits_cleanly() {
    let plugin = PluginProcess::launch(&host_env("5"), &[]).await;
    let client = plugin.connect().await;
    assert_eq!(client.health().await.unwrap(), json!({"status": "ok"}));

    let pid = plugin.child.id().expect("plugin should still be running");
    let status = std::process::Command::new("kill")
        .args(["-TERM", &pid.to_string()])
        .status()
        .expect("failed to run kill");
    assert!(status.success());

    assert_eq!(plugin.wait_for_exit().await, 0);
}
