//! # trirpc-client
//!
//! Clients for trirpc servers:
//! - [`UriClient`]: direct endpoints, arguments in the query string
//! - [`JsonRpcClient`]: JSON-RPC over `POST /`
//! - [`WsClient`]: websocket session with correlated calls and server events

#![deny(unsafe_code)]

pub mod error;
pub mod http;
pub mod params;
pub mod ws;

pub use error::{ClientError, Result};
pub use http::{HttpClient, JsonRpcClient, UriClient};
pub use params::Params;
pub use ws::{WsClient, WsClientConfig, WsEvent};
