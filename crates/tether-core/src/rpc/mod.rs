//! Framed JSON-RPC transport between host and plugin.
//!
//! The plugin side runs an [`RpcServer`] built by [`RpcServerFactory`]; the
//! host side connects with an [`RpcClient`].

pub mod client;
pub mod protocol;
pub mod server;
mod state;

pub use client::{CallReply, RpcClient};
pub use protocol::{RpcErrorObject, RpcRequest, RpcResponse};
pub use server::{CallInterceptor, RpcServer, RpcServerFactory, ServerHandle};
pub use state::ServerState;
