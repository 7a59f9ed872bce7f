//! Host-side RPC client for a served plugin.
//!
//! Connects to the endpoint a plugin announced and invokes `service.method`
//! calls over the framed JSON-RPC protocol.
//!
//! # Thread Safety
//!
//! Calls may be issued concurrently from many tasks. Writes are serialized
//! through a tokio `Mutex`; a background reader task routes each response to
//! its caller by request id, so replies may arrive in any order.

use super::protocol::{read_frame, write_frame, RpcRequest, RpcResponse};
use crate::config::ServeConfig;
use crate::error::ClientError;
use crate::listener::{Endpoint, Network};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

type BoxStream = Box<dyn AsyncStream>;

/// Callers waiting for a reply, keyed by request id. `None` once the
/// connection is gone.
type Pending = Arc<StdMutex<Option<HashMap<u64, oneshot::Sender<RpcResponse>>>>>;

fn lock_pending(
    pending: &StdMutex<Option<HashMap<u64, oneshot::Sender<RpcResponse>>>>,
) -> MutexGuard<'_, Option<HashMap<u64, oneshot::Sender<RpcResponse>>>> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Outcome of a call that reached the plugin and was answered.
#[derive(Debug, Clone, PartialEq)]
pub enum CallReply {
    Completed(Value),
    /// The call observed cancellation and returned early.
    Cancelled,
}

impl CallReply {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CallReply::Cancelled)
    }

    pub fn into_value(self) -> Option<Value> {
        match self {
            CallReply::Completed(value) => Some(value),
            CallReply::Cancelled => None,
        }
    }
}

/// RPC client connected to one plugin endpoint.
pub struct RpcClient {
    writer: Mutex<WriteHalf<BoxStream>>,
    pending: Pending,
    next_id: AtomicU64,
    endpoint: Endpoint,
    reader: JoinHandle<()>,
}

impl RpcClient {
    /// Connect to an announced endpoint.
    ///
    /// Uses [`ServeConfig::CONNECT_TIMEOUT`].
    pub async fn connect(endpoint: &Endpoint) -> Result<Self, ClientError> {
        let connect_err = |message: String| ClientError::Connect {
            address: endpoint.address.clone(),
            message,
        };

        let stream: BoxStream = match endpoint.network {
            Network::Tcp => {
                let stream = tokio::time::timeout(
                    ServeConfig::CONNECT_TIMEOUT,
                    TcpStream::connect(endpoint.address.as_str()),
                )
                .await
                .map_err(|_| connect_err("timed out".to_string()))?
                .map_err(|e| connect_err(e.to_string()))?;
                Box::new(stream)
            }
            #[cfg(unix)]
            Network::Unix => {
                let stream = tokio::time::timeout(
                    ServeConfig::CONNECT_TIMEOUT,
                    tokio::net::UnixStream::connect(endpoint.address.as_str()),
                )
                .await
                .map_err(|_| connect_err("timed out".to_string()))?
                .map_err(|e| connect_err(e.to_string()))?;
                Box::new(stream)
            }
            #[cfg(not(unix))]
            Network::Unix => {
                return Err(connect_err(
                    "unix domain sockets are not supported on this platform".to_string(),
                ));
            }
        };

        debug!("RPC client connected to {}", endpoint);
        Ok(Self::from_stream(stream, endpoint.clone()))
    }

    fn from_stream(stream: BoxStream, endpoint: Endpoint) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        let pending: Pending = Arc::new(StdMutex::new(Some(HashMap::new())));
        let reader = tokio::spawn(read_responses(reader, pending.clone()));

        Self {
            writer: Mutex::new(writer),
            pending,
            next_id: AtomicU64::new(1),
            endpoint,
            reader,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Invoke `service.method` and wait for its reply.
    ///
    /// A call that returned early because of cancellation yields
    /// [`CallReply::Cancelled`], not an error.
    pub async fn call(
        &self,
        service: &str,
        method: &str,
        params: Value,
    ) -> Result<CallReply, ClientError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = RpcRequest::new(format!("{}.{}", service, method), params, id);
        let request_bytes = serde_json::to_vec(&request)?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = lock_pending(&self.pending);
            let Some(waiting) = pending.as_mut() else {
                return Err(ClientError::ConnectionLost);
            };
            waiting.insert(id, tx);
        }

        let written = {
            let mut writer = self.writer.lock().await;
            write_frame(&mut *writer, &request_bytes).await
        };
        if let Err(e) = written {
            debug!("Failed to send request {}: {}", id, e);
            if let Some(waiting) = lock_pending(&self.pending).as_mut() {
                waiting.remove(&id);
            }
            return Err(ClientError::ConnectionLost);
        }

        let response = rx.await.map_err(|_| ClientError::ConnectionLost)?;

        if let Some(err) = response.error {
            return Err(ClientError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        if response.cancelled {
            return Ok(CallReply::Cancelled);
        }
        Ok(CallReply::Completed(response.result.unwrap_or(Value::Null)))
    }

    /// `health.check`
    pub async fn health(&self) -> Result<Value, ClientError> {
        let reply = self.call("health", "check", Value::Null).await?;
        Ok(reply.into_value().unwrap_or(Value::Null))
    }

    /// Cancel the plugin's cancellation root through `service.stop`.
    pub async fn stop(&self, service: &str) -> Result<(), ClientError> {
        self.call(service, "stop", Value::Null).await.map(|_| ())
    }

    /// Ask the plugin to shut down gracefully (`controller.shutdown`).
    pub async fn shutdown(&self) -> Result<(), ClientError> {
        self.call("controller", "shutdown", Value::Null)
            .await
            .map(|_| ())
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcClient")
            .field("endpoint", &self.endpoint)
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish()
    }
}

async fn read_responses(mut reader: ReadHalf<BoxStream>, pending: Pending) {
    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!("Plugin closed the connection");
                break;
            }
            Err(e) => {
                warn!("Failed to read RPC response: {}", e);
                break;
            }
        };

        let response: RpcResponse = match serde_json::from_slice(&frame) {
            Ok(response) => response,
            Err(e) => {
                warn!("Malformed RPC response: {}", e);
                continue;
            }
        };
        let Some(id) = response.id.as_ref().and_then(Value::as_u64) else {
            warn!("RPC response without a request id: {:?}", response.error);
            continue;
        };

        let waiter = lock_pending(&pending)
            .as_mut()
            .and_then(|waiting| waiting.remove(&id));
        match waiter {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => debug!("No caller waiting for response {}", id),
        }
    }

    // Dropping the senders wakes every waiting caller with ConnectionLost.
    lock_pending(&pending).take();
}
