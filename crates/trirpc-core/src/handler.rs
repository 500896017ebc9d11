//! Typed async functions erased into a uniform call adapter.
//!
//! Any `Fn(A1, ..., An) -> impl Future<Output = Result<R, E>>` with up to
//! eight [`RpcParam`] arguments implements [`Handler`]. Functions whose first
//! argument is a [`ConnectionContext`] implement [`ConnectionHandler`] and
//! are only callable over a websocket session.

use std::any::{Any, type_name};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;

use crate::codec::{Codec, CodecError, TypedValue};
use crate::context::ConnectionContext;
use crate::param::{ParamKind, RpcParam};

/// One decoded argument, downcast by the adapter.
pub type DecodedArg = Box<dyn Any + Send>;

/// Decodes a JSON value into a boxed argument of a fixed type.
pub type DecodeFn = fn(&Codec, Value) -> Result<DecodedArg, CodecError>;

/// Produces the zero value of a fixed type.
pub type ZeroFn = fn() -> DecodedArg;

/// Future returned by a call adapter.
pub type CallFuture = BoxFuture<'static, Result<TypedValue, CallError>>;

/// Uniform entry point into a registered function.
pub type CallAdapter =
    Arc<dyn Fn(Option<ConnectionContext>, Vec<DecodedArg>) -> CallFuture + Send + Sync>;

/// Failure inside a call adapter.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// The function returned its error value.
    #[error("{0}")]
    Failed(String),

    /// Wrong number of decoded arguments.
    #[error("expected {expected} arguments, got {actual}")]
    ArgumentCount {
        /// Declared arity.
        expected: usize,
        /// Supplied count.
        actual: usize,
    },

    /// Decoded argument had the wrong type.
    #[error("argument {index} is not a `{expected}`")]
    ArgumentType {
        /// Zero-based position.
        index: usize,
        /// Declared type.
        expected: &'static str,
    },

    /// Connection-bound function called without a session.
    #[error("method requires a websocket connection")]
    MissingContext,

    /// Return value failed to serialize.
    #[error("failed to serialize result: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Compile-time description of one parameter type.
#[derive(Clone, Copy)]
pub struct ParamShape {
    /// Rust type name.
    pub type_name: &'static str,
    kind: fn() -> ParamKind,
    /// Typed decoder.
    pub decode: DecodeFn,
    /// Zero-value constructor.
    pub zero: ZeroFn,
}

impl std::fmt::Debug for ParamShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParamShape")
            .field("type_name", &self.type_name)
            .field("kind", &self.kind())
            .finish_non_exhaustive()
    }
}

impl ParamShape {
    /// Shape of `T`.
    pub fn of<T: RpcParam>() -> Self {
        Self {
            type_name: type_name::<T>(),
            kind: T::kind,
            decode: decode_arg::<T>,
            zero: zero_arg::<T>,
        }
    }

    /// Heuristic kind.
    pub fn kind(&self) -> ParamKind {
        (self.kind)()
    }
}

fn decode_arg<T: RpcParam>(codec: &Codec, value: Value) -> Result<DecodedArg, CodecError> {
    Ok(Box::new(codec.from_value::<T>(value)?))
}

fn zero_arg<T: RpcParam>() -> DecodedArg {
    Box::new(T::default())
}

/// Pulls typed arguments out of the erased list in order.
struct ArgReader {
    args: std::vec::IntoIter<DecodedArg>,
    index: usize,
}

impl ArgReader {
    fn new(args: Vec<DecodedArg>, expected: usize) -> Result<Self, CallError> {
        if args.len() != expected {
            return Err(CallError::ArgumentCount {
                expected,
                actual: args.len(),
            });
        }
        Ok(Self {
            args: args.into_iter(),
            index: 0,
        })
    }

    fn next<T: 'static>(&mut self) -> Result<T, CallError> {
        let index = self.index;
        self.index += 1;
        let arg = self.args.next().ok_or(CallError::ArgumentCount {
            expected: index + 1,
            actual: index,
        })?;
        arg.downcast::<T>()
            .map(|boxed| *boxed)
            .map_err(|_| CallError::ArgumentType {
                index,
                expected: type_name::<T>(),
            })
    }
}

/// A stateless typed function callable over every transport.
pub trait Handler<Args>: Clone + Send + Sync + 'static {
    /// Parameter shapes in declaration order.
    fn params() -> Vec<ParamShape>;
    /// Rust name of the success type.
    fn result_type() -> &'static str;
    /// Erase into a call adapter.
    fn into_adapter(self) -> CallAdapter;
}

/// A function whose first argument is the calling websocket session.
pub trait ConnectionHandler<Args>: Clone + Send + Sync + 'static {
    /// Parameter shapes in declaration order, excluding the context.
    fn params() -> Vec<ParamShape>;
    /// Rust name of the success type.
    fn result_type() -> &'static str;
    /// Erase into a call adapter.
    fn into_adapter(self) -> CallAdapter;
}

macro_rules! impl_handlers {
    ($($ty:ident $arg:ident),*) => {
        impl<F, Fut, R, E, $($ty,)*> Handler<($($ty,)*)> for F
        where
            F: Fn($($ty),*) -> Fut + Clone + Send + Sync + 'static,
            Fut: Future<Output = Result<R, E>> + Send + 'static,
            R: Serialize + Send + 'static,
            E: Display + Send + 'static,
            $($ty: RpcParam,)*
        {
            fn params() -> Vec<ParamShape> {
                vec![$(ParamShape::of::<$ty>()),*]
            }

            fn result_type() -> &'static str {
                type_name::<R>()
            }

            #[allow(unused_mut, unused_variables)]
            fn into_adapter(self) -> CallAdapter {
                let arity = <Self as Handler<($($ty,)*)>>::params().len();
                Arc::new(move |_ctx: Option<ConnectionContext>, args: Vec<DecodedArg>| {
                    let f = self.clone();
                    Box::pin(async move {
                        let mut reader = ArgReader::new(args, arity)?;
                        $(let $arg = reader.next::<$ty>()?;)*
                        let value = f($($arg),*)
                            .await
                            .map_err(|e| CallError::Failed(e.to_string()))?;
                        Ok::<_, CallError>(TypedValue::new(&value)?)
                    }) as CallFuture
                })
            }
        }

        impl<F, Fut, R, E, $($ty,)*> ConnectionHandler<($($ty,)*)> for F
        where
            F: Fn(ConnectionContext, $($ty),*) -> Fut + Clone + Send + Sync + 'static,
            Fut: Future<Output = Result<R, E>> + Send + 'static,
            R: Serialize + Send + 'static,
            E: Display + Send + 'static,
            $($ty: RpcParam,)*
        {
            fn params() -> Vec<ParamShape> {
                vec![$(ParamShape::of::<$ty>()),*]
            }

            fn result_type() -> &'static str {
                type_name::<R>()
            }

            #[allow(unused_mut, unused_variables)]
            fn into_adapter(self) -> CallAdapter {
                let arity = <Self as ConnectionHandler<($($ty,)*)>>::params().len();
                Arc::new(move |ctx: Option<ConnectionContext>, args: Vec<DecodedArg>| {
                    let f = self.clone();
                    Box::pin(async move {
                        let ctx = ctx.ok_or(CallError::MissingContext)?;
                        let mut reader = ArgReader::new(args, arity)?;
                        $(let $arg = reader.next::<$ty>()?;)*
                        let value = f(ctx, $($arg),*)
                            .await
                            .map_err(|e| CallError::Failed(e.to_string()))?;
                        Ok::<_, CallError>(TypedValue::new(&value)?)
                    }) as CallFuture
                })
            }
        }
    };
}

impl_handlers!();
impl_handlers!(T1 a1);
impl_handlers!(T1 a1, T2 a2);
impl_handlers!(T1 a1, T2 a2, T3 a3);
impl_handlers!(T1 a1, T2 a2, T3 a3, T4 a4);
impl_handlers!(T1 a1, T2 a2, T3 a3, T4 a4, T5 a5);
impl_handlers!(T1 a1, T2 a2, T3 a3, T4 a4, T5 a5, T6 a6);
impl_handlers!(T1 a1, T2 a2, T3 a3, T4 a4, T5 a5, T6 a6, T7 a7);
impl_handlers!(T1 a1, T2 a2, T3 a3, T4 a4, T5 a5, T6 a6, T7 a7, T8 a8);
