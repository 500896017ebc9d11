//! Wire envelopes shared by every transport.
//!
//! A [`Response`] always carries exactly one of `result` or `error`; the
//! invariant lives in [`Outcome`] and is re-checked when decoding.

use std::fmt;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::RpcError;

/// Protocol version stamped on every response.
pub const JSONRPC_VERSION: &str = "2.0";

/// Incoming call. An empty `id` marks a notification.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Optional version marker, accepted and ignored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,
    /// Correlation id.
    #[serde(
        default,
        deserialize_with = "deserialize_id",
        skip_serializing_if = "String::is_empty"
    )]
    pub id: String,
    /// Registered method name.
    pub method: String,
    /// Named object or positional array, decoded against the binding later.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    /// Build a correlated request.
    pub fn new(id: impl Into<String>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: Some(JSONRPC_VERSION.to_owned()),
            id: id.into(),
            method: method.into(),
            params,
        }
    }

    /// Build a notification (no id, never answered).
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self::new(String::new(), method, params)
    }

    /// True when no response must be produced.
    pub fn is_notification(&self) -> bool {
        self.id.is_empty()
    }
}

/// Structured error carried by a failed [`Response`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Numeric JSON-RPC code.
    pub code: i32,
    /// Canonical text for the code.
    pub message: String,
    /// Detail about this particular failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl fmt::Display for ErrorBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)?;
        match &self.data {
            Some(Value::String(detail)) => write!(f, ": {detail}"),
            Some(other) => write!(f, ": {other}"),
            None => Ok(()),
        }
    }
}

impl std::error::Error for ErrorBody {}

/// Result or error, never both.
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    /// Serialized return value.
    Result(Value),
    /// Failure description.
    Error(ErrorBody),
}

/// Outgoing answer to a [`Request`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(into = "WireResponse", try_from = "WireResponse")]
pub struct Response {
    /// Echoed request id; empty for direct HTTP calls.
    pub id: String,
    /// Payload.
    pub outcome: Outcome,
}

impl Response {
    /// Build a success response.
    pub fn success(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            outcome: Outcome::Result(result),
        }
    }

    /// Build an error response from a protocol error.
    pub fn failure(id: impl Into<String>, error: &RpcError) -> Self {
        Self::from_error_body(id, error.to_error_body())
    }

    /// Build an error response from an already shaped body.
    pub fn from_error_body(id: impl Into<String>, body: ErrorBody) -> Self {
        Self {
            id: id.into(),
            outcome: Outcome::Error(body),
        }
    }

    /// The result payload, if the call succeeded.
    pub fn result(&self) -> Option<&Value> {
        match &self.outcome {
            Outcome::Result(value) => Some(value),
            Outcome::Error(_) => None,
        }
    }

    /// The error body, if the call failed.
    pub fn error(&self) -> Option<&ErrorBody> {
        match &self.outcome {
            Outcome::Result(_) => None,
            Outcome::Error(body) => Some(body),
        }
    }

    /// Split into a standard `Result`.
    pub fn into_result(self) -> Result<Value, ErrorBody> {
        match self.outcome {
            Outcome::Result(value) => Ok(value),
            Outcome::Error(body) => Err(body),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
struct WireResponse {
    #[serde(default = "default_version")]
    jsonrpc: String,
    #[serde(
        default,
        deserialize_with = "deserialize_id",
        skip_serializing_if = "String::is_empty"
    )]
    id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<ErrorBody>,
}

fn default_version() -> String {
    JSONRPC_VERSION.to_owned()
}

impl From<Response> for WireResponse {
    fn from(response: Response) -> Self {
        let (result, error) = match response.outcome {
            Outcome::Result(value) => (Some(value), None),
            Outcome::Error(body) => (None, Some(body)),
        };
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            id: response.id,
            result,
            error,
        }
    }
}

impl TryFrom<WireResponse> for Response {
    type Error = String;

    fn try_from(wire: WireResponse) -> Result<Self, Self::Error> {
        // `"result": null` arrives as `None`, so a null result with an error is still a failure.
        let outcome = match (wire.result, wire.error) {
            (Some(_), Some(_)) => return Err("response carries both result and error".into()),
            (None, Some(body)) => Outcome::Error(body),
            (result, None) => Outcome::Result(result.unwrap_or(Value::Null)),
        };
        Ok(Self {
            id: wire.id,
            outcome,
        })
    }
}

/// Ids are strings on the wire, but numeric and null ids are tolerated.
fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(String::new()),
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(de::Error::custom(format!(
            "request id must be a string, got {other}"
        ))),
    }
}
