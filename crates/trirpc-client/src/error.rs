//! Client error types.

use thiserror::Error;
use trirpc_core::addr::AddrError;
use trirpc_core::{CallFailure, CodecError, ErrorBody};

/// Errors surfaced by every client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The address could not be parsed.
    #[error("invalid address: {0}")]
    Addr(#[from] AddrError),

    /// HTTP clients only dial TCP.
    #[error("HTTP clients need a tcp:// address, got {0}")]
    UnsupportedAddr(String),

    /// Transport-level HTTP failure.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("HTTP {status}: {body}")]
    Status {
        /// Status code.
        status: u16,
        /// Response body, as text.
        body: String,
    },

    /// Websocket handshake or transport failure.
    #[error("websocket: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),

    /// Local IO (unix socket dial).
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// The server answered with an error envelope.
    #[error("RPC error: {0}")]
    Rpc(ErrorBody),

    /// The response id did not match the request.
    #[error("response id {actual:?} does not match request id {expected:?}")]
    IdMismatch {
        /// Id that was sent.
        expected: String,
        /// Id that came back.
        actual: String,
    },

    /// A result could not be decoded into the requested type.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Encoding a request failed.
    #[error("encode: {0}")]
    Encode(#[from] serde_json::Error),

    /// A correlated call did not complete.
    #[error("call failed: {0}")]
    Call(#[from] CallFailure),

    /// The client was stopped or its connection closed.
    #[error("client closed")]
    Closed,
}

/// Result alias for client calls.
pub type Result<T> = std::result::Result<T, ClientError>;

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_error_display_includes_detail() {
        let err = ClientError::Rpc(ErrorBody {
            code: -32601,
            message: "Method not found".into(),
            data: Some("nope".into()),
        });
        assert_eq!(err.to_string(), "RPC error: Method not found (-32601): nope");
    }

    #[test]
    fn status_display() {
        let err = ClientError::Status {
            status: 413,
            body: "length limit exceeded".into(),
        };
        assert_eq!(err.to_string(), "HTTP 413: length limit exceeded");
    }

    #[test]
    fn call_failure_converts() {
        let err: ClientError = CallFailure::Cancelled {
            reason: "client stopped".into(),
        }
        .into();
        assert!(matches!(err, ClientError::Call(_)));
    }
}
