//! # trirpc-server
//!
//! Axum transports for a [`MethodRegistry`](trirpc_core::MethodRegistry).
//!
//! - Direct endpoints: `GET|POST /{method}?arg=value`
//! - JSON-RPC at `/`, with an HTML endpoint listing for empty requests
//! - Websocket sessions with ping/pong liveness and server-to-client calls
//! - `tcp://` or `unix://` listeners with an optional connection cap
//! - Graceful shutdown via `CancellationToken`
//! - Optional Prometheus `/metrics`

#![deny(unsafe_code)]

pub mod config;
pub mod errors;
pub mod http;
pub mod listener;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use config::{ServerConfig, TlsFiles, WsConfig};
pub use errors::ServerError;
pub use listener::{PeerAddr, RpcListener};
pub use server::{RpcServer, ServerHandle};
pub use shutdown::ShutdownCoordinator;
