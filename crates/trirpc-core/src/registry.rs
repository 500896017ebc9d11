//! Method registry.
//!
//! Built once at startup, then shared behind an `Arc` and only read.

use std::collections::HashMap;

use crate::context::ConnectionContext;
use crate::handler::{CallAdapter, CallFuture, ConnectionHandler, DecodedArg, Handler, ParamShape};
use crate::param::ParamKind;

/// Rejected registration.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    /// Name empty or not usable as a URL path segment.
    #[error("invalid method name `{0}`")]
    InvalidName(String),

    /// Name already taken.
    #[error("method `{0}` is already registered")]
    Duplicate(String),

    /// `arg_names` does not match the function's arity.
    #[error("method `{method}` takes {expected} arguments but {actual} names were given")]
    ArityMismatch {
        /// Method name.
        method: String,
        /// User-visible parameter count.
        expected: usize,
        /// Supplied names.
        actual: usize,
    },
}

/// One named parameter.
#[derive(Clone, Debug)]
pub struct ParamSpec {
    name: String,
    shape: ParamShape,
}

impl ParamSpec {
    /// Wire name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Heuristic kind.
    pub fn kind(&self) -> ParamKind {
        self.shape.kind()
    }

    /// Rust type name.
    pub fn type_name(&self) -> &'static str {
        self.shape.type_name
    }

    /// Type-erased shape.
    pub fn shape(&self) -> &ParamShape {
        &self.shape
    }
}

/// A registered method.
pub struct MethodBinding {
    name: String,
    params: Vec<ParamSpec>,
    result_type: &'static str,
    connection_bound: bool,
    call: CallAdapter,
}

impl std::fmt::Debug for MethodBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodBinding")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("result_type", &self.result_type)
            .field("connection_bound", &self.connection_bound)
            .finish_non_exhaustive()
    }
}

impl MethodBinding {
    /// Method name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// User-visible parameters in order.
    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    /// Parameter names in order.
    pub fn arg_names(&self) -> impl Iterator<Item = &str> {
        self.params.iter().map(ParamSpec::name)
    }

    /// Rust type names of every runtime parameter, context first when bound.
    pub fn param_types(&self) -> Vec<&'static str> {
        let context = self
            .connection_bound
            .then(std::any::type_name::<ConnectionContext>);
        context
            .into_iter()
            .chain(self.params.iter().map(ParamSpec::type_name))
            .collect()
    }

    /// Rust type name of the success value.
    pub fn result_type(&self) -> &'static str {
        self.result_type
    }

    /// Whether the method receives the calling session and is websocket-only.
    pub fn is_connection_bound(&self) -> bool {
        self.connection_bound
    }

    /// Invoke with already decoded arguments.
    pub fn invoke(&self, ctx: Option<ConnectionContext>, args: Vec<DecodedArg>) -> CallFuture {
        (self.call)(ctx, args)
    }

    /// Zero value for every parameter.
    pub fn zero_args(&self) -> Vec<DecodedArg> {
        self.params.iter().map(|p| (p.shape.zero)()).collect()
    }
}

/// Name → binding map.
#[derive(Debug, Default)]
pub struct MethodRegistry {
    methods: HashMap<String, MethodBinding>,
}

impl MethodRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function callable over every transport.
    pub fn register<H, Args>(
        &mut self,
        name: &str,
        handler: H,
        arg_names: &[&str],
    ) -> Result<(), RegistryError>
    where
        H: Handler<Args>,
    {
        self.insert(
            name,
            arg_names,
            H::params(),
            H::result_type(),
            false,
            handler.into_adapter(),
        )
    }

    /// Register a websocket-only function receiving the calling session.
    pub fn register_ws<H, Args>(
        &mut self,
        name: &str,
        handler: H,
        arg_names: &[&str],
    ) -> Result<(), RegistryError>
    where
        H: ConnectionHandler<Args>,
    {
        self.insert(
            name,
            arg_names,
            H::params(),
            H::result_type(),
            true,
            handler.into_adapter(),
        )
    }

    fn insert(
        &mut self,
        name: &str,
        arg_names: &[&str],
        shapes: Vec<ParamShape>,
        result_type: &'static str,
        connection_bound: bool,
        call: CallAdapter,
    ) -> Result<(), RegistryError> {
        if !is_valid_name(name) {
            return Err(RegistryError::InvalidName(name.to_owned()));
        }
        if self.methods.contains_key(name) {
            return Err(RegistryError::Duplicate(name.to_owned()));
        }
        if arg_names.len() != shapes.len() {
            return Err(RegistryError::ArityMismatch {
                method: name.to_owned(),
                expected: shapes.len(),
                actual: arg_names.len(),
            });
        }
        let params = arg_names
            .iter()
            .zip(shapes)
            .map(|(arg, shape)| ParamSpec {
                name: (*arg).to_owned(),
                shape,
            })
            .collect();
        tracing::debug!(method = name, connection_bound, "registered method");
        let _ = self.methods.insert(
            name.to_owned(),
            MethodBinding {
                name: name.to_owned(),
                params,
                result_type,
                connection_bound,
                call,
            },
        );
        Ok(())
    }

    /// Look up a binding; `None` for unknown names.
    pub fn get(&self, name: &str) -> Option<&MethodBinding> {
        self.methods.get(name)
    }

    /// Whether a method is registered.
    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Sorted method names.
    pub fn methods(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Bindings sorted by name.
    pub fn iter(&self) -> impl Iterator<Item = &MethodBinding> {
        let mut bindings: Vec<&MethodBinding> = self.methods.values().collect();
        bindings.sort_unstable_by(|a, b| a.name.cmp(&b.name));
        bindings.into_iter()
    }

    /// Number of registered methods.
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

/// Unreserved URL path characters only, so every name maps to `/{name}`.
fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.' | b'~'))
}
