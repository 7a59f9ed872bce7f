//! RPC server factory, cancellation interceptor, and accept loop.
//!
//! The factory mounts the services registered for the negotiated version on a
//! router, next to the built-in health and controller services. Every inbound
//! call passes through the [`CallInterceptor`], which derives the call's
//! [`CallContext`] from the server's [`CancellationRoot`] before the service
//! sees it.
//!
//! # Concurrency
//!
//! Each connection runs a reader loop in its own task. Every request frame is
//! dispatched in a separate task, so calls on the same connection run
//! concurrently; replies are funnelled through one writer task per connection
//! and matched to requests by id. All of these tasks are tracked, and shutdown
//! waits for them to finish. Calls are never aborted; they are only signalled
//! through their context.

use super::protocol::{read_frame, write_frame, RpcRequest, RpcResponse};
use super::state::{advance, ServerState};
use crate::cancel::CancellationRoot;
use crate::config::ServeConfig;
use crate::context::CallContext;
use crate::controller::{ControllerService, HealthService, CONTROLLER_SERVICE, HEALTH_SERVICE};
use crate::error::{CallError, Result, ServeError};
use crate::listener::{Accepted, Endpoint, PluginListener};
use crate::service::{split_method, ServiceRouter};
use crate::version::{ProtocolVersion, VersionRegistry};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, debug_span, error, info, warn, Instrument};

/// Derives each call's execution context from the cancellation root.
#[derive(Debug)]
pub struct CallInterceptor {
    root: CancellationRoot,
    next_call_id: AtomicU64,
}

impl CallInterceptor {
    pub fn new(root: CancellationRoot) -> Self {
        Self {
            root,
            next_call_id: AtomicU64::new(1),
        }
    }

    /// Build the context for one inbound call.
    ///
    /// After the root is cancelled the context is cancelled from creation.
    pub fn intercept(&self, service: &str, method: &str) -> CallContext {
        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        CallContext::new(call_id, service, method, self.root.derive())
    }
}

/// Router plus interceptor, shared by every connection.
struct Dispatcher {
    router: ServiceRouter,
    interceptor: CallInterceptor,
}

impl Dispatcher {
    async fn handle_frame(&self, frame: &[u8]) -> RpcResponse {
        let request: RpcRequest = match serde_json::from_slice(frame) {
            Ok(req) => req,
            Err(e) => {
                return RpcResponse::error(None, -32700, format!("Parse error: {}", e));
            }
        };

        if request.jsonrpc != "2.0" {
            return RpcResponse::error(
                request.id,
                -32600,
                "Invalid Request: expected jsonrpc 2.0".to_string(),
            );
        }

        let id = request.id.clone();
        let Some((service, method)) = split_method(&request.method) else {
            return RpcResponse::error(
                id,
                -32601,
                format!("Method not found: {}", request.method),
            );
        };
        let params = request
            .params
            .unwrap_or(Value::Object(Default::default()));

        let ctx = self.interceptor.intercept(service, method);
        let span = debug_span!("rpc_call", call_id = ctx.call_id(), service, method);
        let result = async {
            debug!(cancelled = ctx.is_cancelled(), "Dispatching call");
            match self.router.get(service) {
                Ok(svc) => svc.call(&ctx, method, params).await,
                Err(e) => Err(e),
            }
        }
        .instrument(span)
        .await;

        match result {
            Ok(value) => RpcResponse::success(id, value),
            Err(CallError::Cancelled) => {
                debug!(call_id = ctx.call_id(), "Call returned after cancellation");
                RpcResponse::cancelled(id)
            }
            Err(e) => {
                warn!(call_id = ctx.call_id(), "RPC error for {}: {}", request.method, e);
                RpcResponse::error(id, e.to_rpc_error_code(), e.to_string())
            }
        }
    }
}

/// Builds an [`RpcServer`] for a negotiated protocol version.
pub struct RpcServerFactory<'a> {
    registry: &'a VersionRegistry,
    root: CancellationRoot,
}

impl<'a> RpcServerFactory<'a> {
    pub fn new(registry: &'a VersionRegistry, root: CancellationRoot) -> Self {
        Self { registry, root }
    }

    /// Mount the services for `version` and take ownership of `listener`.
    pub fn build(self, version: ProtocolVersion, listener: PluginListener) -> Result<RpcServer> {
        let services = self.registry.service_set(version)?;
        let shutdown = CancellationToken::new();

        let mut router = ServiceRouter::new();
        for (name, binder) in services.iter() {
            router.insert(name, binder(&self.root));
        }
        router.insert(
            HEALTH_SERVICE,
            Arc::new(HealthService::new(self.root.clone())),
        );
        router.insert(
            CONTROLLER_SERVICE,
            Arc::new(ControllerService::new(shutdown.clone())),
        );

        let (state, _) = watch::channel(ServerState::Unbound);
        advance(&state, ServerState::Bound);

        Ok(RpcServer {
            listener,
            version,
            dispatcher: Arc::new(Dispatcher {
                router,
                interceptor: CallInterceptor::new(self.root.clone()),
            }),
            root: self.root,
            shutdown,
            state,
            tracker: TaskTracker::new(),
        })
    }
}

/// A bound RPC server, ready to serve.
pub struct RpcServer {
    listener: PluginListener,
    version: ProtocolVersion,
    dispatcher: Arc<Dispatcher>,
    root: CancellationRoot,
    shutdown: CancellationToken,
    state: watch::Sender<ServerState>,
    tracker: TaskTracker,
}

impl RpcServer {
    pub fn endpoint(&self) -> &Endpoint {
        self.listener.endpoint()
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// Mounted service names.
    pub fn services(&self) -> Vec<&str> {
        self.dispatcher.router.names()
    }

    /// Handle for controlling and observing the server once it is serving.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            root: self.root.clone(),
            shutdown: self.shutdown.clone(),
            state: self.state.subscribe(),
        }
    }

    /// Run the accept loop until shutdown, then drain in-flight calls.
    pub async fn serve(self) -> Result<()> {
        let RpcServer {
            listener,
            version,
            dispatcher,
            root,
            shutdown,
            state,
            tracker,
        } = self;
        let connections = Arc::new(Semaphore::new(ServeConfig::MAX_CONNECTIONS));

        advance(&state, ServerState::Serving);
        info!(
            endpoint = %listener.endpoint(),
            version = version.get(),
            services = ?dispatcher.router.names(),
            "RPC server serving"
        );

        let mut root_fired = false;
        let mut accept_errors = AcceptErrors::default();
        let mut listener_error = None;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("RPC server shutting down");
                    break;
                }
                _ = root.cancelled(), if !root_fired => {
                    root_fired = true;
                    advance(&state, ServerState::Stopping);
                    info!("Cancellation root fired, new calls start cancelled");
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok(conn) => {
                            accept_errors.reset();
                            let Ok(permit) = connections.clone().try_acquire_owned() else {
                                warn!(
                                    "Rejecting connection: at max capacity ({})",
                                    ServeConfig::MAX_CONNECTIONS
                                );
                                continue;
                            };

                            let dispatcher = dispatcher.clone();
                            let conn_shutdown = shutdown.clone();
                            let conn_tracker = tracker.clone();
                            tracker.spawn(async move {
                                let _permit = permit;
                                let result = match conn {
                                    Accepted::Tcp(stream, peer) => {
                                        debug!(%peer, "Connection accepted");
                                        handle_connection(stream, dispatcher, conn_shutdown, conn_tracker).await
                                    }
                                    #[cfg(unix)]
                                    Accepted::Unix(stream) => {
                                        debug!("Connection accepted");
                                        handle_connection(stream, dispatcher, conn_shutdown, conn_tracker).await
                                    }
                                };
                                if let Err(e) = result {
                                    debug!("Connection ended: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            if accept_errors.record() {
                                error!("Listener failed {} times in a row, closing: {}", accept_errors.consecutive, e);
                                listener_error = Some(e);
                                break;
                            }
                            warn!("Accept error: {}", e);
                            tokio::time::sleep(ServeConfig::ACCEPT_ERROR_BACKOFF).await;
                        }
                    }
                }
            }
        }

        advance(&state, ServerState::Stopping);
        drop(listener);
        shutdown.cancel();
        tracker.close();
        tracker.wait().await;
        advance(&state, ServerState::Stopped);
        info!("RPC server stopped");

        match listener_error {
            Some(e) => Err(ServeError::Io {
                message: format!("listener closed: {}", e),
                source: Some(e),
            }),
            None => Ok(()),
        }
    }
}

/// Consecutive accept failures. Past the limit the listener counts as closed.
#[derive(Debug, Default)]
struct AcceptErrors {
    consecutive: u32,
}

impl AcceptErrors {
    fn reset(&mut self) {
        self.consecutive = 0;
    }

    /// Record one failure; true once the limit is reached.
    fn record(&mut self) -> bool {
        self.consecutive += 1;
        self.consecutive >= ServeConfig::MAX_CONSECUTIVE_ACCEPT_ERRORS
    }
}

/// Serialize a reply, replacing it with an internal error when it cannot be
/// framed. The dispatch task owns this so a bad reply fails only its own call.
fn encode_response(response: &RpcResponse) -> Vec<u8> {
    let encoded = serde_json::to_vec(response)
        .map_err(|e| format!("failed to serialize response: {}", e))
        .and_then(|bytes| {
            if bytes.len() > ServeConfig::MAX_MESSAGE_SIZE {
                Err(format!(
                    "response too large: {} bytes exceeds maximum {}",
                    bytes.len(),
                    ServeConfig::MAX_MESSAGE_SIZE
                ))
            } else {
                Ok(bytes)
            }
        });

    match encoded {
        Ok(bytes) => bytes,
        Err(message) => {
            warn!("Replacing reply {:?}: {}", response.id, message);
            let fallback = RpcResponse::error(response.id.clone(), -32603, message);
            serde_json::to_vec(&fallback).unwrap_or_default()
        }
    }
}

async fn handle_connection<S>(
    stream: S,
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(ServeConfig::RESPONSE_QUEUE_DEPTH);

    let writer_task = tracker.spawn(async move {
        while let Some(bytes) = rx.recv().await {
            write_frame(&mut writer, &bytes).await?;
        }
        Ok::<(), ServeError>(())
    });

    loop {
        let frame = tokio::select! {
            result = read_frame(&mut reader) => {
                match result? {
                    Some(f) => f,
                    None => break, // Clean disconnect
                }
            }
            _ = shutdown.cancelled() => break,
            _ = tx.closed() => {
                debug!("Reply writer closed, ending connection");
                break;
            }
        };

        let dispatcher = dispatcher.clone();
        let tx = tx.clone();
        tracker.spawn(async move {
            let response = dispatcher.handle_frame(&frame).await;
            // A closed channel means the writer failed and the reader loop
            // is already ending the connection.
            let _ = tx.send(encode_response(&response)).await;
        });
    }

    // The writer drains replies of calls still in flight, then exits once
    // every sender is dropped.
    drop(tx);
    writer_task
        .await
        .map_err(|e| ServeError::Internal(e.to_string()))?
}

/// Control and observation handle for a running [`RpcServer`].
#[derive(Debug, Clone)]
pub struct ServerHandle {
    root: CancellationRoot,
    shutdown: CancellationToken,
    state: watch::Receiver<ServerState>,
}

impl ServerHandle {
    /// Request graceful shutdown: stop accepting, drain calls, return from `serve`.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Cancel the cancellation root, as the `stop` control method does.
    pub fn stop_calls(&self) -> bool {
        self.root.cancel()
    }

    pub fn root(&self) -> &CancellationRoot {
        &self.root
    }

    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    /// Wait until the server reaches `target` or a later state.
    pub async fn wait_for(&self, target: ServerState) -> ServerState {
        let mut rx = self.state.clone();
        // Closed means the server is gone; report the last state it published.
        let _ = rx.wait_for(|s| *s >= target).await;
        let reached = *rx.borrow();
        reached
    }
}
