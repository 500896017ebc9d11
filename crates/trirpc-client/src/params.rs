//! Ordered, named call arguments.
//!
//! Byte arguments are kept apart from JSON values so each transport can
//! encode them exactly: `0x`-prefixed hex in query strings, base64 in JSON
//! bodies.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::Result;

#[derive(Clone, Debug, PartialEq)]
enum Arg {
    Json(Value),
    Bytes(Vec<u8>),
}

impl Arg {
    fn to_json(&self) -> Value {
        match self {
            Self::Json(v) => v.clone(),
            Self::Bytes(b) => Value::String(STANDARD.encode(b)),
        }
    }

    fn to_query(&self) -> Result<String> {
        Ok(match self {
            Self::Json(v) => serde_json::to_string(v)?,
            Self::Bytes(b) => format!("0x{}", hex::encode_upper(b)),
        })
    }
}

/// Call arguments, in registration order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Params {
    args: Vec<(String, Arg)>,
}

impl Params {
    /// No arguments.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a JSON-representable argument.
    #[must_use]
    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.args.push((name.to_owned(), Arg::Json(value.into())));
        self
    }

    /// Add any serializable argument.
    pub fn try_with<T: Serialize + ?Sized>(mut self, name: &str, value: &T) -> Result<Self> {
        self.args
            .push((name.to_owned(), Arg::Json(serde_json::to_value(value)?)));
        Ok(self)
    }

    /// Add a byte-string argument.
    #[must_use]
    pub fn bytes(mut self, name: &str, value: impl Into<Vec<u8>>) -> Self {
        self.args.push((name.to_owned(), Arg::Bytes(value.into())));
        self
    }

    /// Number of arguments.
    pub fn len(&self) -> usize {
        self.args.len()
    }

    /// Whether there are no arguments.
    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// JSON object keyed by argument name.
    pub fn to_named(&self) -> Value {
        let map: Map<String, Value> = self
            .args
            .iter()
            .map(|(name, arg)| (name.clone(), arg.to_json()))
            .collect();
        Value::Object(map)
    }

    /// JSON array in argument order.
    pub fn to_positional(&self) -> Value {
        Value::Array(self.args.iter().map(|(_, arg)| arg.to_json()).collect())
    }

    /// `name=value` pairs for a URI call; every value is JSON text.
    pub fn to_query_pairs(&self) -> Result<Vec<(String, String)>> {
        self.args
            .iter()
            .map(|(name, arg)| Ok((name.clone(), arg.to_query()?)))
            .collect()
    }
}
