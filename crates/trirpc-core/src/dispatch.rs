//! Dispatcher: binding + decoded arguments → `Response`.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt as _;
use metrics::{counter, histogram};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::codec::Codec;
use crate::context::ConnectionContext;
use crate::decode::{decode_json_params, decode_query};
use crate::errors::{ErrorCode, RpcError};
use crate::handler::{CallError, DecodedArg};
use crate::metrics::{RPC_ERRORS_TOTAL, RPC_REQUESTS_TOTAL, RPC_REQUEST_DURATION_SECONDS};
use crate::registry::{MethodBinding, MethodRegistry};
use crate::types::{Request, Response};

/// Calls slower than this are logged as warnings.
const SLOW_CALL: Duration = Duration::from_secs(5);

/// Surface a request arrived on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transport {
    /// Direct endpoint or JSON-RPC over HTTP.
    Http,
    /// A websocket session.
    WebSocket,
}

/// Invokes registered methods and shapes their outcome into responses.
#[derive(Clone, Debug)]
pub struct Dispatcher {
    registry: Arc<MethodRegistry>,
    codec: Arc<Codec>,
    timeout: Option<Duration>,
}

impl Dispatcher {
    /// Maximum time a single method is allowed to run by default.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

    /// Dispatcher with the default timeout.
    pub fn new(registry: Arc<MethodRegistry>, codec: Arc<Codec>) -> Self {
        Self {
            registry,
            codec,
            timeout: Some(Self::DEFAULT_TIMEOUT),
        }
    }

    /// Override the per-call timeout; `None` disables it.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Shared registry.
    pub fn registry(&self) -> &Arc<MethodRegistry> {
        &self.registry
    }

    /// Shared codec.
    pub fn codec(&self) -> &Arc<Codec> {
        &self.codec
    }

    /// Find a binding callable over `transport`.
    pub fn lookup(&self, method: &str, transport: Transport) -> Result<&MethodBinding, RpcError> {
        match self.registry.get(method) {
            Some(binding) if transport == Transport::WebSocket || !binding.is_connection_bound() => {
                Ok(binding)
            }
            _ => Err(RpcError::MethodNotFound {
                method: method.to_owned(),
            }),
        }
    }

    /// Run the bound function, converting errors, panics and timeouts.
    pub async fn invoke(
        &self,
        binding: &MethodBinding,
        ctx: Option<ConnectionContext>,
        args: Vec<DecodedArg>,
    ) -> Result<Value, RpcError> {
        let method = binding.name();
        counter!(RPC_REQUESTS_TOTAL, "method" => method.to_owned()).increment(1);

        let ctx = ctx.filter(|_| binding.is_connection_bound());
        let start = Instant::now();
        let call = AssertUnwindSafe(binding.invoke(ctx, args)).catch_unwind();
        let outcome = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, call).await.ok(),
            None => Some(call.await),
        };

        let result = match outcome {
            Some(Ok(Ok(typed))) => Ok(self.codec.tag(typed)),
            Some(Ok(Err(CallError::Failed(detail)))) => Err(RpcError::Internal { detail }),
            Some(Ok(Err(other))) => Err(RpcError::Internal {
                detail: other.to_string(),
            }),
            Some(Err(panic)) => {
                let msg = panic_message(&panic);
                error!(method, panic = %msg, "method panicked");
                Err(RpcError::Internal {
                    detail: format!("method `{method}` panicked: {msg}"),
                })
            }
            None => {
                error!(method, "method timed out after {:?}", self.timeout);
                Err(RpcError::Internal {
                    detail: format!("method `{method}` timed out"),
                })
            }
        };

        let duration = start.elapsed();
        histogram!(RPC_REQUEST_DURATION_SECONDS, "method" => method.to_owned())
            .record(duration.as_secs_f64());
        if duration >= SLOW_CALL {
            warn!(
                method,
                duration_secs = duration.as_secs_f64(),
                "slow RPC call"
            );
        }
        if let Err(err) = &result {
            record_error(method, err.code());
        }
        result
    }

    /// Invoke and wrap the outcome in a response carrying `id`.
    pub async fn call(
        &self,
        binding: &MethodBinding,
        ctx: Option<ConnectionContext>,
        id: &str,
        args: Vec<DecodedArg>,
    ) -> Response {
        match self.invoke(binding, ctx, args).await {
            Ok(value) => Response::success(id, value),
            Err(err) => Response::failure(id, &err),
        }
    }

    /// Direct HTTP path: arguments come from query-string pairs, the id is empty.
    pub async fn handle_query(&self, method: &str, pairs: &[(String, String)]) -> Response {
        let binding = match self.lookup(method, Transport::Http) {
            Ok(binding) => binding,
            Err(err) => {
                record_error(method, err.code());
                return Response::failure("", &err);
            }
        };
        match decode_query(binding, &self.codec, pairs) {
            Ok(args) => self.call(binding, None, "", args).await,
            Err(err) => {
                record_error(method, err.code());
                Response::failure("", &err)
            }
        }
    }

    /// Full JSON-RPC path: lookup, decode params, invoke.
    ///
    /// Returns `None` for notifications, which are still executed.
    pub async fn handle_request(
        &self,
        request: Request,
        transport: Transport,
        ctx: Option<ConnectionContext>,
    ) -> Option<Response> {
        let Request {
            id, method, params, ..
        } = request;

        let response = match self.lookup(&method, transport) {
            Err(err) => {
                record_error(&method, err.code());
                Response::failure(&id, &err)
            }
            Ok(binding) => match decode_json_params(binding, &self.codec, params) {
                Err(err) => {
                    record_error(&method, err.code());
                    Response::failure(&id, &err)
                }
                Ok(args) => self.call(binding, ctx, &id, args).await,
            },
        };

        if id.is_empty() {
            match response.error() {
                Some(err) => warn!(method, error = %err, "notification failed"),
                None => debug!(method, "notification handled"),
            }
            return None;
        }
        Some(response)
    }
}

fn record_error(method: &str, code: ErrorCode) {
    counter!(RPC_ERRORS_TOTAL, "method" => method.to_owned(), "code" => code.as_str()).increment(1);
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_owned()
}
