//! Argument decoding.
//!
//! Turns named objects, positional arrays and query-string pairs into the
//! ordered, typed argument list a [`MethodBinding`] expects. Every failure is
//! [`RpcError::InvalidParams`] and nothing here invokes the bound function.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::codec::{Bytes, Codec, CodecError};
use crate::errors::RpcError;
use crate::handler::DecodedArg;
use crate::param::ParamKind;
use crate::registry::{MethodBinding, ParamSpec};

static INTEGER_LITERAL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^-?[0-9]+$").unwrap());

fn invalid(detail: impl Into<String>) -> RpcError {
    RpcError::InvalidParams {
        detail: detail.into(),
    }
}

fn decode_one(param: &ParamSpec, codec: &Codec, value: Value) -> Result<DecodedArg, RpcError> {
    (param.shape().decode)(codec, value)
        .map_err(|e| invalid(format!("error decoding parameter `{}`: {e}", param.name())))
}

/// Decode the `params` member of a JSON-RPC request.
///
/// Absent or null params give every parameter its zero value.
pub fn decode_json_params(
    binding: &MethodBinding,
    codec: &Codec,
    params: Option<Value>,
) -> Result<Vec<DecodedArg>, RpcError> {
    match params {
        None | Some(Value::Null) => Ok(binding.zero_args()),
        Some(Value::Object(map)) => decode_named(binding, codec, map),
        Some(Value::Array(items)) => decode_positional(binding, codec, items),
        Some(other) => Err(invalid(format!(
            "unknown type for JSON params: {}; expected map or array",
            json_kind(&other)
        ))),
    }
}

/// Decode by parameter name; missing or null fields become zero values.
pub fn decode_named(
    binding: &MethodBinding,
    codec: &Codec,
    mut fields: Map<String, Value>,
) -> Result<Vec<DecodedArg>, RpcError> {
    binding
        .params()
        .iter()
        .map(|param| match fields.remove(param.name()) {
            None | Some(Value::Null) => Ok((param.shape().zero)()),
            Some(value) => decode_one(param, codec, value),
        })
        .collect()
}

/// Decode by position; the array length must equal the parameter count.
pub fn decode_positional(
    binding: &MethodBinding,
    codec: &Codec,
    items: Vec<Value>,
) -> Result<Vec<DecodedArg>, RpcError> {
    let params = binding.params();
    if items.len() != params.len() {
        let names: Vec<&str> = binding.arg_names().collect();
        return Err(invalid(format!(
            "expected {} parameters ({}), got {} ({})",
            params.len(),
            names.join(", "),
            items.len(),
            Value::Array(items),
        )));
    }
    params
        .iter()
        .zip(items)
        .map(|(param, value)| decode_one(param, codec, value))
        .collect()
}

/// Decode query-string pairs. The first value for a name wins.
pub fn decode_query(
    binding: &MethodBinding,
    codec: &Codec,
    pairs: &[(String, String)],
) -> Result<Vec<DecodedArg>, RpcError> {
    binding
        .params()
        .iter()
        .map(|param| {
            let raw = pairs
                .iter()
                .find(|(k, _)| k == param.name())
                .map(|(_, v)| v.as_str());
            match raw {
                None | Some("") => Ok((param.shape().zero)()),
                Some(raw) => decode_query_value(param, codec, raw),
            }
        })
        .collect()
}

fn decode_query_value(param: &ParamSpec, codec: &Codec, raw: &str) -> Result<DecodedArg, RpcError> {
    let kind = param.kind();
    match classify(&kind, param.type_name(), raw) {
        Ok(Some(value)) => decode_one(param, codec, value),
        Ok(None) => decode_raw_json(param, codec, raw, &kind).map_err(|e| {
            invalid(format!("error decoding parameter `{}`: {e}", param.name()))
        }),
        Err(detail) => Err(invalid(format!("parameter `{}`: {detail}", param.name()))),
    }
}

/// Plain JSON decode, falling back to the verbatim text for string targets.
fn decode_raw_json(
    param: &ParamSpec,
    codec: &Codec,
    raw: &str,
    kind: &ParamKind,
) -> Result<DecodedArg, CodecError> {
    let decode = param.shape().decode;
    let attempt = serde_json::from_str::<Value>(raw)
        .map_err(CodecError::from)
        .and_then(|value| decode(codec, value));
    match attempt {
        Ok(arg) => Ok(arg),
        Err(err) if kind.accepts_text() => {
            decode(codec, Value::String(raw.to_owned())).map_err(|_| err)
        }
        Err(err) => Err(err),
    }
}

/// Query heuristics. `Ok(None)` means no rule matched.
fn classify(kind: &ParamKind, type_name: &str, raw: &str) -> Result<Option<Value>, String> {
    if let ParamKind::Optional(inner) = kind {
        return classify(inner, type_name, raw);
    }

    if *kind == ParamKind::Integer && INTEGER_LITERAL.is_match(raw) {
        return integer_value(raw).map(Some);
    }

    if let Some(hex_digits) = strip_hex_prefix(raw) {
        return match kind {
            ParamKind::String => {
                let bytes = hex::decode(hex_digits).map_err(|e| format!("invalid hex: {e}"))?;
                String::from_utf8(bytes)
                    .map(|s| Some(Value::String(s)))
                    .map_err(|e| format!("hex string is not UTF-8: {e}"))
            }
            ParamKind::Bytes => {
                let bytes = hex::decode(hex_digits).map_err(|e| format!("invalid hex: {e}"))?;
                serde_json::to_value(Bytes(bytes))
                    .map(Some)
                    .map_err(|e| e.to_string())
            }
            _ => Err(format!(
                "got a hex string arg, but expected `{type_name}`"
            )),
        };
    }

    if *kind == ParamKind::Bytes && is_quoted(raw) {
        let text: String =
            serde_json::from_str(raw).map_err(|e| format!("invalid quoted string: {e}"))?;
        return serde_json::to_value(Bytes(text.into_bytes()))
            .map(Some)
            .map_err(|e| e.to_string());
    }

    Ok(None)
}

fn integer_value(raw: &str) -> Result<Value, String> {
    if let Ok(n) = raw.parse::<i64>() {
        return Ok(Value::from(n));
    }
    raw.parse::<u64>()
        .map(Value::from)
        .map_err(|_| format!("integer `{raw}` is out of range"))
}

fn strip_hex_prefix(raw: &str) -> Option<&str> {
    let prefix = raw.get(..2)?;
    if prefix.eq_ignore_ascii_case("0x") {
        raw.get(2..)
    } else {
        None
    }
}

fn is_quoted(raw: &str) -> bool {
    raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"')
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
