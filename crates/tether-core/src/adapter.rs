//! Service adapter: exposes a plain synchronous provider as an RPC service.
//!
//! The adapter forwards each RPC method to [`Provider::call`] and hands back
//! whatever it returns. It also answers the reserved `stop` method by
//! cancelling the server's [`CancellationRoot`], which is how a host asks
//! every in-flight call to wind down.
//!
//! Provider calls run on tokio's blocking pool, so a provider that spins while
//! polling its context does not stall the runtime.

use crate::cancel::CancellationRoot;
use crate::context::CallContext;
use crate::error::CallError;
use crate::service::RpcService;
use crate::version::ServiceBinder;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

/// Reserved method that cancels the cancellation root.
pub const STOP_METHOD: &str = "stop";

/// Business logic served by the plugin.
///
/// One instance is shared by all concurrent calls for the life of the
/// process. The `Sync` bound makes sharing possible; keeping internal state
/// consistent under concurrent calls is up to the implementation.
pub trait Provider: Send + Sync + 'static {
    /// Method names this provider answers. `stop` is reserved.
    fn methods(&self) -> &[&'static str];

    /// Handle one call.
    ///
    /// Long-running work should check `ctx` periodically and return
    /// [`CallError::Cancelled`] (usually through `ctx.check()?`).
    fn call(&self, ctx: &CallContext, method: &str, params: Value) -> Result<Value, CallError>;
}

/// Adapts a [`Provider`] to [`RpcService`].
pub struct ProviderAdapter<P: Provider> {
    provider: Arc<P>,
    root: CancellationRoot,
}

impl<P: Provider> ProviderAdapter<P> {
    pub fn new(provider: Arc<P>, root: CancellationRoot) -> Self {
        Self { provider, root }
    }

    /// Binder for a [`VersionRegistry`](crate::version::VersionRegistry) entry.
    pub fn binder(provider: Arc<P>) -> ServiceBinder {
        Arc::new(move |root: &CancellationRoot| {
            Arc::new(ProviderAdapter::new(provider.clone(), root.clone())) as Arc<dyn RpcService>
        })
    }

    fn stop(&self) {
        if self.root.cancel() {
            info!("Stop requested, cancelling in-flight calls");
        } else {
            debug!("Stop requested again, already cancelled");
        }
    }
}

#[async_trait::async_trait]
impl<P: Provider> RpcService for ProviderAdapter<P> {
    async fn call(&self, ctx: &CallContext, method: &str, params: Value) -> Result<Value, CallError> {
        if method == STOP_METHOD {
            self.stop();
            return Ok(Value::Null);
        }

        if !self.provider.methods().iter().any(|m| *m == method) {
            return Err(CallError::MethodNotFound {
                service: ctx.service().to_string(),
                method: method.to_string(),
            });
        }

        let provider = self.provider.clone();
        let ctx = ctx.clone();
        let method = method.to_string();
        tokio::task::spawn_blocking(move || provider.call(&ctx, &method, params))
            .await
            .map_err(|e| CallError::Internal {
                message: format!("provider call did not complete: {}", e),
            })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    struct Calculator;

    impl Provider for Calculator {
        fn methods(&self) -> &[&'static str] {
            &["add", "divide", "spin"]
        }

        fn call(&self, ctx: &CallContext, method: &str, params: Value) -> Result<Value, CallError> {
            let a = params["a"].as_i64().unwrap_or(0);
            let b = params["b"].as_i64().unwrap_or(0);
            match method {
                "add" => Ok(json!(a + b)),
                "divide" if b == 0 => Err(CallError::failed("division by zero")),
                "divide" => Ok(json!(a / b)),
                "spin" => loop {
                    ctx.check()?;
                    std::thread::sleep(Duration::from_millis(5));
                },
                _ => unreachable!(),
            }
        }
    }

    fn adapter() -> (ProviderAdapter<Calculator>, CancellationRoot) {
        let root = CancellationRoot::new();
        (ProviderAdapter::new(Arc::new(Calculator), root.clone()), root)
    }

    fn ctx(root: &CancellationRoot, method: &str) -> CallContext {
        CallContext::new(1, "calc", method, root.derive())
    }

    #[tokio::test]
    async fn test_forwards_result() {
        let (adapter, root) = adapter();
        let value = adapter
            .call(&ctx(&root, "add"), "add", json!({"a": 2, "b": 3}))
            .await
            .unwrap();
        assert_eq!(value, json!(5));
    }

    #[tokio::test]
    async fn test_forwards_error_unmodified() {
        let (adapter, root) = adapter();
        let err = adapter
            .call(&ctx(&root, "divide"), "divide", json!({"a": 1, "b": 0}))
            .await
            .unwrap_err();
        assert_eq!(err, CallError::failed("division by zero"));
    }

    #[tokio::test]
    async fn test_unknown_method_never_reaches_provider() {
        let (adapter, root) = adapter();
        let err = adapter
            .call(&ctx(&root, "multiply"), "multiply", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::MethodNotFound { .. }));
    }

    #[tokio::test]
    async fn test_stop_cancels_running_call() {
        let (adapter, root) = adapter();
        let adapter = Arc::new(adapter);

        let spinning = {
            let adapter = adapter.clone();
            let ctx = ctx(&root, "spin");
            tokio::spawn(async move { adapter.call(&ctx, "spin", json!({})).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        adapter
            .call(&ctx(&root, STOP_METHOD), STOP_METHOD, Value::Null)
            .await
            .unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), spinning)
            .await
            .expect("spinning call should return after stop")
            .unwrap();
        assert_eq!(result, Err(CallError::Cancelled));
        assert!(root.is_cancelled());
    }

    #[tokio::test]
    async fn test_binder_shares_root() {
        let provider = Arc::new(Calculator);
        let root = CancellationRoot::new();
        let service = (ProviderAdapter::binder(provider))(&root);

        service
            .call(&ctx(&root, STOP_METHOD), STOP_METHOD, Value::Null)
            .await
            .unwrap();
        assert!(root.is_cancelled());
    }
}
