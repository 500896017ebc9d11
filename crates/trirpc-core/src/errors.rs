//! Protocol error taxonomy.

use serde_json::Value;

use crate::types::ErrorBody;

// ── Error codes ─────────────────────────────────────────────────────

/// The five failure classes a caller can observe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Payload was not valid JSON or not a request.
    ParseError,
    /// Well-formed JSON that is not a valid request.
    InvalidRequest,
    /// Unknown method, or a websocket-only method over HTTP.
    MethodNotFound,
    /// Arguments did not decode against the method's parameters.
    InvalidParams,
    /// The method failed, panicked or timed out.
    InternalError,
}

impl ErrorCode {
    /// Numeric JSON-RPC 2.0 code.
    pub const fn code(self) -> i32 {
        match self {
            Self::ParseError => -32700,
            Self::InvalidRequest => -32600,
            Self::MethodNotFound => -32601,
            Self::InvalidParams => -32602,
            Self::InternalError => -32603,
        }
    }

    /// Canonical message for the code.
    pub const fn message(self) -> &'static str {
        match self {
            Self::ParseError => "Parse error",
            Self::InvalidRequest => "Invalid request",
            Self::MethodNotFound => "Method not found",
            Self::InvalidParams => "Invalid params",
            Self::InternalError => "Internal error",
        }
    }

    /// Label used in metrics.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ParseError => "PARSE_ERROR",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::MethodNotFound => "METHOD_NOT_FOUND",
            Self::InvalidParams => "INVALID_PARAMS",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Reverse lookup from a numeric code.
    pub fn from_code(code: i32) -> Option<Self> {
        [
            Self::ParseError,
            Self::InvalidRequest,
            Self::MethodNotFound,
            Self::InvalidParams,
            Self::InternalError,
        ]
        .into_iter()
        .find(|c| c.code() == code)
    }
}

// ── Error type ──────────────────────────────────────────────────────

/// Failure produced while turning a request into a response.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// Undecodable payload.
    #[error("parse error: {detail}")]
    Parse {
        /// What went wrong.
        detail: String,
    },

    /// Structurally invalid request.
    #[error("invalid request: {detail}")]
    InvalidRequest {
        /// What went wrong.
        detail: String,
    },

    /// No callable binding for this transport.
    #[error("method not found: {method}")]
    MethodNotFound {
        /// Requested name.
        method: String,
    },

    /// Argument decoding failed.
    #[error("invalid params: {detail}")]
    InvalidParams {
        /// Offending parameter and codec error.
        detail: String,
    },

    /// The bound function failed.
    #[error("internal error: {detail}")]
    Internal {
        /// Error message returned by the function.
        detail: String,
    },
}

impl RpcError {
    /// Classification of this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Parse { .. } => ErrorCode::ParseError,
            Self::InvalidRequest { .. } => ErrorCode::InvalidRequest,
            Self::MethodNotFound { .. } => ErrorCode::MethodNotFound,
            Self::InvalidParams { .. } => ErrorCode::InvalidParams,
            Self::Internal { .. } => ErrorCode::InternalError,
        }
    }

    /// Convert to the wire-format error body.
    pub fn to_error_body(&self) -> ErrorBody {
        let code = self.code();
        let detail = match self {
            Self::Parse { detail }
            | Self::InvalidRequest { detail }
            | Self::InvalidParams { detail }
            | Self::Internal { detail } => detail,
            Self::MethodNotFound { method } => method,
        };
        ErrorBody {
            code: code.code(),
            message: code.message().to_owned(),
            data: (!detail.is_empty()).then(|| Value::String(detail.clone())),
        }
    }
}
