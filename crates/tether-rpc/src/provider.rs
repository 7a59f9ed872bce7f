//! Sample provider served by the plugin binary.

use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tether_core::{CallContext, CallError, Provider};
use tracing::debug;

/// Interval at which long-running calls poll their context.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Deserialize)]
struct SleepParams {
    ms: u64,
}

#[derive(Debug, Default, Deserialize)]
struct FailParams {
    #[serde(default)]
    message: Option<String>,
}

/// Echo, sleep, fail and introspection methods for exercising a host.
#[derive(Debug, Default)]
pub struct SampleProvider {
    calls: AtomicU64,
}

impl SampleProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn sleep(&self, ctx: &CallContext, params: Value) -> Result<Value, CallError> {
        let params: SleepParams = serde_json::from_value(params)?;
        let deadline = Instant::now() + Duration::from_millis(params.ms);

        while Instant::now() < deadline {
            ctx.check()?;
            std::thread::sleep(POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now())));
        }
        Ok(json!({ "slept_ms": params.ms }))
    }
}

impl Provider for SampleProvider {
    fn methods(&self) -> &[&'static str] {
        &["echo", "sleep", "fail", "context", "stats"]
    }

    fn call(&self, ctx: &CallContext, method: &str, params: Value) -> Result<Value, CallError> {
        let calls = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(call_id = ctx.call_id(), method, calls, "SampleProvider call");

        match method {
            "echo" => Ok(params),
            "sleep" => self.sleep(ctx, params),
            "fail" => {
                let params: FailParams = serde_json::from_value(params).unwrap_or_default();
                Err(CallError::failed(
                    params.message.unwrap_or_else(|| "requested failure".to_string()),
                ))
            }
            "context" => Ok(json!({
                "call_id": ctx.call_id(),
                "service": ctx.service(),
                "method": ctx.method(),
                "cancelled": ctx.is_cancelled(),
            })),
            "stats" => Ok(json!({ "calls": calls })),
            other => Err(CallError::MethodNotFound {
                service: ctx.service().to_string(),
                method: other.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::CancellationRoot;

    fn ctx(root: &CancellationRoot, method: &str) -> CallContext {
        CallContext::new(1, "provider", method, root.derive())
    }

    #[test]
    fn test_echo_returns_params() {
        let provider = SampleProvider::new();
        let root = CancellationRoot::new();
        let value = provider
            .call(&ctx(&root, "echo"), "echo", json!({"a": [1, 2]}))
            .unwrap();
        assert_eq!(value, json!({"a": [1, 2]}));
    }

    #[test]
    fn test_sleep_completes() {
        let provider = SampleProvider::new();
        let root = CancellationRoot::new();
        let value = provider
            .call(&ctx(&root, "sleep"), "sleep", json!({"ms": 20}))
            .unwrap();
        assert_eq!(value, json!({"slept_ms": 20}));
    }

    #[test]
    fn test_sleep_observes_cancellation() {
        let provider = SampleProvider::new();
        let root = CancellationRoot::new();
        root.cancel();

        let started = Instant::now();
        let err = provider
            .call(&ctx(&root, "sleep"), "sleep", json!({"ms": 10_000}))
            .unwrap_err();
        assert_eq!(err, CallError::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_sleep_rejects_bad_params() {
        let provider = SampleProvider::new();
        let root = CancellationRoot::new();
        let err = provider
            .call(&ctx(&root, "sleep"), "sleep", json!({"ms": "soon"}))
            .unwrap_err();
        assert!(matches!(err, CallError::InvalidParams { .. }));
    }

    #[test]
    fn test_fail_and_stats() {
        let provider = SampleProvider::new();
        let root = CancellationRoot::new();

        let err = provider
            .call(&ctx(&root, "fail"), "fail", json!({"message": "boom"}))
            .unwrap_err();
        assert_eq!(err, CallError::failed("boom"));

        let stats = provider
            .call(&ctx(&root, "stats"), "stats", Value::Null)
            .unwrap();
        assert_eq!(stats, json!({"calls": 2}));
    }

    #[test]
    fn test_context_reports_cancellation() {
        let provider = SampleProvider::new();
        let root = CancellationRoot::new();
        let before = provider
            .call(&ctx(&root, "context"), "context", Value::Null)
            .unwrap();
        assert_eq!(before["cancelled"], false);

        root.cancel();
        let after = provider
            .call(&ctx(&root, "context"), "context", Value::Null)
            .unwrap();
        assert_eq!(after["cancelled"], true);
        assert_eq!(after["service"], "provider");
    }
}
