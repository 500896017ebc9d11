//! Parameter descriptors.
//!
//! Query-string decoding needs to know a little about each parameter's
//! type (is it an integer, a string, a byte sequence) before handing the
//! value to serde. [`RpcParam`] carries that knowledge; user types opt in
//! with an empty impl and are treated as [`ParamKind::Other`].

use std::collections::{BTreeMap, HashMap};

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::codec::Bytes;

/// Coarse shape of a parameter type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParamKind {
    /// Any primitive integer.
    Integer,
    /// `String`.
    String,
    /// [`Bytes`].
    Bytes,
    /// `Option<T>` around another kind.
    Optional(Box<ParamKind>),
    /// Everything else; decoded as plain JSON.
    Other,
}

impl ParamKind {
    /// Kind with any `Optional` layers removed.
    pub fn base(&self) -> &ParamKind {
        match self {
            Self::Optional(inner) => inner.base(),
            other => other,
        }
    }

    /// Whether raw query text may be taken verbatim as this kind.
    pub fn accepts_text(&self) -> bool {
        matches!(self.base(), Self::String)
    }
}

/// A type usable as a method parameter.
pub trait RpcParam: DeserializeOwned + Default + Send + 'static {
    /// Shape used by the query-string heuristics.
    fn kind() -> ParamKind {
        ParamKind::Other
    }
}

macro_rules! integer_params {
    ($($t:ty),* $(,)?) => {
        $(
            impl RpcParam for $t {
                fn kind() -> ParamKind {
                    ParamKind::Integer
                }
            }
        )*
    };
}

// Integers past 64 bits are not params: JSON numbers only carry i64/u64.
integer_params!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);

impl RpcParam for String {
    fn kind() -> ParamKind {
        ParamKind::String
    }
}

impl RpcParam for Bytes {
    fn kind() -> ParamKind {
        ParamKind::Bytes
    }
}

impl<T: RpcParam> RpcParam for Option<T> {
    fn kind() -> ParamKind {
        ParamKind::Optional(Box::new(T::kind()))
    }
}

impl RpcParam for bool {}
impl RpcParam for f32 {}
impl RpcParam for f64 {}
impl RpcParam for Value {}
impl<T: DeserializeOwned + Send + 'static> RpcParam for Vec<T> {}
impl<T: DeserializeOwned + Send + 'static> RpcParam for BTreeMap<String, T> {}
impl<T: DeserializeOwned + Send + 'static> RpcParam for HashMap<String, T> {}
