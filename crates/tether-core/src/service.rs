//! The RPC service contract and the per-server service router.

use crate::context::CallContext;
use crate::error::CallError;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A named service mounted on the RPC server.
///
/// Implementations are shared by every concurrent call and must be safe to
/// invoke concurrently.
#[async_trait::async_trait]
pub trait RpcService: Send + Sync + 'static {
    /// Handle `method` with `params`.
    ///
    /// Long-running work should watch `ctx` and return
    /// [`CallError::Cancelled`] once it observes cancellation.
    async fn call(&self, ctx: &CallContext, method: &str, params: Value)
        -> Result<Value, CallError>;
}

/// Services mounted on one server, keyed by name.
#[derive(Default, Clone)]
pub struct ServiceRouter {
    services: HashMap<String, Arc<dyn RpcService>>,
}

impl ServiceRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, service: Arc<dyn RpcService>) {
        self.services.insert(name.into(), service);
    }

    pub fn get(&self, name: &str) -> Result<&Arc<dyn RpcService>, CallError> {
        self.services
            .get(name)
            .ok_or_else(|| CallError::ServiceNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    /// Mounted service names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.services.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for ServiceRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRouter")
            .field("services", &self.names())
            .finish()
    }
}

/// Split a wire method name `service.method`.
pub fn split_method(name: &str) -> Option<(&str, &str)> {
    let (service, method) = name.split_once('.')?;
    if service.is_empty() || method.is_empty() {
        return None;
    }
    Some((service, method))
}
