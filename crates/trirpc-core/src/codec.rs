//! JSON codec with a concrete-type registry.
//!
//! Types registered with [`Codec::register_concrete`] are written as
//! `{"type": <name>, "value": <payload>}` wherever the codec serializes them,
//! and read back either into a known Rust type ([`Codec::from_value`]) or
//! through the name registry ([`Codec::decode_any`]). Unregistered types are
//! plain JSON.

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

/// Key holding the concrete name in a tagged value.
pub const TYPE_KEY: &str = "type";
/// Key holding the payload in a tagged value.
pub const VALUE_KEY: &str = "value";

/// Codec failures.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON (de)serialization failed.
    #[error("{0}")]
    Json(#[from] serde_json::Error),

    /// Tagged value names a different concrete type.
    #[error("expected concrete type `{expected}`, found `{found}`")]
    TypeMismatch {
        /// Name registered for the target type.
        expected: String,
        /// Name found on the wire.
        found: String,
    },

    /// Registered type arrived without its tag.
    #[error("value for concrete type `{0}` is missing its type tag")]
    MissingTag(String),

    /// No type registered under this name.
    #[error("unknown concrete type `{0}`")]
    UnknownType(String),

    /// Name already used by another type.
    #[error("concrete name `{0}` is already registered")]
    DuplicateName(String),

    /// Type already registered under another name.
    #[error("type `{0}` is already registered")]
    DuplicateType(&'static str),
}

// ── Bytes ───────────────────────────────────────────────────────────

/// Byte sequence, base64 in JSON.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Bytes(pub Vec<u8>);

impl Bytes {
    /// Consume into the inner vector.
    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }
}

impl Deref for Bytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for Bytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for Bytes {
    fn from(v: Vec<u8>) -> Self {
        Self(v)
    }
}

impl From<&[u8]> for Bytes {
    fn from(v: &[u8]) -> Self {
        Self(v.to_vec())
    }
}

impl From<&str> for Bytes {
    fn from(v: &str) -> Self {
        Self(v.as_bytes().to_vec())
    }
}

impl Serialize for Bytes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Bytes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Self)
            .map_err(serde::de::Error::custom)
    }
}

// ── TypedValue ──────────────────────────────────────────────────────

/// Serialized return value that remembers its concrete Rust type.
#[derive(Clone, Debug, PartialEq)]
pub struct TypedValue {
    type_id: TypeId,
    type_name: &'static str,
    value: Value,
}

impl TypedValue {
    /// Serialize `value`, recording its type.
    pub fn new<T: Serialize + 'static>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            type_id: TypeId::of::<T>(),
            type_name: type_name::<T>(),
            value: serde_json::to_value(value)?,
        })
    }

    /// Rust type name of the original value.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Untagged payload.
    pub fn value(&self) -> &Value {
        &self.value
    }
}

// ── Codec ───────────────────────────────────────────────────────────

type AnyDecodeFn = fn(Value) -> Result<Box<dyn Any + Send>, serde_json::Error>;

struct Concrete {
    type_id: TypeId,
    decode: AnyDecodeFn,
}

fn decode_boxed<T: DeserializeOwned + Send + 'static>(
    value: Value,
) -> Result<Box<dyn Any + Send>, serde_json::Error> {
    Ok(Box::new(serde_json::from_value::<T>(value)?))
}

/// JSON codec shared by the server, its sessions and clients.
#[derive(Default)]
pub struct Codec {
    names: HashMap<TypeId, String>,
    concretes: HashMap<String, Concrete>,
}

impl fmt::Debug for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.concretes.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("Codec").field("concretes", &names).finish()
    }
}

impl Codec {
    /// Codec with no registered concrete types.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` under `name` so its values serialize tagged.
    pub fn register_concrete<T>(&mut self, name: &str) -> Result<(), CodecError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        let type_id = TypeId::of::<T>();
        if self.concretes.contains_key(name) {
            return Err(CodecError::DuplicateName(name.to_owned()));
        }
        if self.names.contains_key(&type_id) {
            return Err(CodecError::DuplicateType(type_name::<T>()));
        }
        let _ = self.names.insert(type_id, name.to_owned());
        let _ = self.concretes.insert(
            name.to_owned(),
            Concrete {
                type_id,
                decode: decode_boxed::<T>,
            },
        );
        Ok(())
    }

    /// Name registered for `T`, if any.
    pub fn concrete_name<T: 'static>(&self) -> Option<&str> {
        self.names.get(&TypeId::of::<T>()).map(String::as_str)
    }

    /// Attach the type tag to a serialized value when its type is registered.
    pub fn tag(&self, typed: TypedValue) -> Value {
        match self.names.get(&typed.type_id) {
            Some(name) => wrap(name, typed.value),
            None => typed.value,
        }
    }

    /// Serialize to a JSON value, tagged when registered.
    pub fn to_value<T: Serialize + 'static>(&self, value: &T) -> Result<Value, CodecError> {
        Ok(self.tag(TypedValue::new(value)?))
    }

    /// Deserialize from a JSON value, expecting the tag when `T` is registered.
    pub fn from_value<T: DeserializeOwned + 'static>(&self, value: Value) -> Result<T, CodecError> {
        match self.names.get(&TypeId::of::<T>()) {
            Some(expected) => {
                let (found, payload) = unwrap_tagged(value)
                    .ok_or_else(|| CodecError::MissingTag(expected.clone()))?;
                if &found != expected {
                    return Err(CodecError::TypeMismatch {
                        expected: expected.clone(),
                        found,
                    });
                }
                Ok(serde_json::from_value(payload)?)
            }
            None => Ok(serde_json::from_value(value)?),
        }
    }

    /// `encode(value) -> bytes`.
    pub fn encode<T: Serialize + 'static>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(&self.to_value(value)?)?)
    }

    /// `decode(bytes, targetType) -> value`.
    pub fn decode<T: DeserializeOwned + 'static>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        self.from_value(serde_json::from_slice(bytes)?)
    }

    /// Decode a tagged value through the name registry.
    ///
    /// Returns the concrete name with the boxed value; callers downcast.
    pub fn decode_any(&self, value: Value) -> Result<(String, Box<dyn Any + Send>), CodecError> {
        let (name, payload) =
            unwrap_tagged(value).ok_or_else(|| CodecError::MissingTag("<any>".into()))?;
        let concrete = self
            .concretes
            .get(&name)
            .ok_or_else(|| CodecError::UnknownType(name.clone()))?;
        debug_assert_eq!(self.names.get(&concrete.type_id), Some(&name));
        let boxed = (concrete.decode)(payload)?;
        Ok((name, boxed))
    }
}

fn wrap(name: &str, value: Value) -> Value {
    let mut map = Map::with_capacity(2);
    let _ = map.insert(TYPE_KEY.to_owned(), Value::String(name.to_owned()));
    let _ = map.insert(VALUE_KEY.to_owned(), value);
    Value::Object(map)
}

fn unwrap_tagged(value: Value) -> Option<(String, Value)> {
    let Value::Object(mut map) = value else {
        return None;
    };
    let Some(Value::String(name)) = map.remove(TYPE_KEY) else {
        return None;
    };
    let payload = map.remove(VALUE_KEY).unwrap_or(Value::Null);
    Some((name, payload))
}
