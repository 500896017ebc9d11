//! # trirpc-core
//!
//! Transport-independent half of the trirpc runtime.
//!
//! - [`types`]: `Request` / `Response` / `ErrorBody` wire envelopes
//! - [`errors`]: protocol error taxonomy and JSON-RPC codes
//! - [`codec`]: JSON codec with a concrete-type registry for polymorphic values
//! - [`param`]: parameter descriptors (`RpcParam`, `ParamKind`)
//! - [`handler`]: `Handler` / `ConnectionHandler` traits that erase typed async functions
//! - [`registry`]: `MethodRegistry` of `MethodBinding`s
//! - [`decode`]: named, positional and query-string argument decoding
//! - [`dispatch`]: `Dispatcher` turning a binding plus arguments into a `Response`
//! - [`context`]: `ConnectionContext` handed to connection-bound methods
//! - [`correlation`]: pending-call table shared by server sessions and clients
//! - [`addr`]: `tcp://` / `unix://` listen address parsing
//! - [`logging`]: tracing subscriber bootstrap
//! - [`metrics`]: metric names recorded across the workspace

#![deny(unsafe_code)]

pub mod addr;
pub mod codec;
pub mod context;
pub mod correlation;
pub mod decode;
pub mod dispatch;
pub mod errors;
pub mod handler;
pub mod logging;
pub mod metrics;
pub mod param;
pub mod registry;
pub mod types;

pub use addr::ListenAddr;
pub use codec::{Bytes, Codec, CodecError, TypedValue};
pub use context::{ConnectionContext, SessionError, SessionLink};
pub use correlation::{CallFailure, CallOutcome, CorrelationTable, PendingCall};
pub use dispatch::{Dispatcher, Transport};
pub use errors::{ErrorCode, RpcError};
pub use handler::{ConnectionHandler, Handler};
pub use param::{ParamKind, RpcParam};
pub use registry::{MethodBinding, MethodRegistry, ParamSpec, RegistryError};
pub use types::{ErrorBody, Request, Response};
