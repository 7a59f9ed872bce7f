//! Built-in services mounted at every protocol version.
//!
//! - `health.check` reports whether the server is still taking normal work.
//! - `controller.shutdown` asks the server to stop accepting connections,
//!   drain in-flight calls, and return from `serve`.

use crate::cancel::CancellationRoot;
use crate::context::CallContext;
use crate::error::CallError;
use crate::service::RpcService;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::info;

pub const HEALTH_SERVICE: &str = "health";
pub const CONTROLLER_SERVICE: &str = "controller";

/// Names plugin services may not register under.
pub const RESERVED_SERVICES: &[&str] = &[HEALTH_SERVICE, CONTROLLER_SERVICE];

/// Health check service.
pub struct HealthService {
    root: CancellationRoot,
}

impl HealthService {
    pub fn new(root: CancellationRoot) -> Self {
        Self { root }
    }
}

#[async_trait::async_trait]
impl RpcService for HealthService {
    async fn call(&self, ctx: &CallContext, method: &str, _params: Value) -> Result<Value, CallError> {
        match method {
            "check" => {
                let status = if self.root.is_cancelled() { "stopping" } else { "ok" };
                Ok(json!({ "status": status }))
            }
            _ => Err(CallError::MethodNotFound {
                service: ctx.service().to_string(),
                method: method.to_string(),
            }),
        }
    }
}

/// Server lifecycle control.
pub struct ControllerService {
    shutdown: CancellationToken,
}

impl ControllerService {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self { shutdown }
    }
}

#[async_trait::async_trait]
impl RpcService for ControllerService {
    async fn call(&self, ctx: &CallContext, method: &str, _params: Value) -> Result<Value, CallError> {
        match method {
            "shutdown" => {
                info!("Shutdown requested by host");
                self.shutdown.cancel();
                Ok(json!({ "status": "shutting_down" }))
            }
            _ => Err(CallError::MethodNotFound {
                service: ctx.service().to_string(),
                method: method.to_string(),
            }),
        }
    }
}
