//! Session handle passed to connection-bound methods.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::codec::{Codec, CodecError};
use crate::correlation::PendingCall;
use crate::types::{Request, Response};

/// Failure writing to a session.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// The session is draining or closed.
    #[error("session closed")]
    Closed,

    /// The outbound queue is full.
    #[error("outbound queue full")]
    QueueFull,

    /// The payload could not be encoded.
    #[error("encode failed: {0}")]
    Encode(String),
}

impl From<CodecError> for SessionError {
    fn from(err: CodecError) -> Self {
        Self::Encode(err.to_string())
    }
}

/// What a websocket session exposes to the methods it dispatches.
#[async_trait]
pub trait SessionLink: Send + Sync {
    /// Connection identity.
    fn connection_id(&self) -> &str;

    /// Peer address, when known.
    fn remote_addr(&self) -> Option<&str>;

    /// Queue a response, waiting for space.
    async fn write_response(&self, response: Response) -> Result<(), SessionError>;

    /// Queue a response, failing fast when the queue is full.
    fn try_write_response(&self, response: Response) -> Result<(), SessionError>;

    /// Register a correlation slot for `request` and queue it.
    async fn call(&self, request: Request) -> Result<PendingCall, SessionError>;

    /// Whether the session still accepts writes.
    fn is_open(&self) -> bool;
}

/// The calling session, plus the id of the request being served.
#[derive(Clone)]
pub struct ConnectionContext {
    link: Arc<dyn SessionLink>,
    codec: Arc<Codec>,
    request_id: String,
}

impl fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("connection_id", &self.link.connection_id())
            .field("request_id", &self.request_id)
            .finish_non_exhaustive()
    }
}

impl ConnectionContext {
    /// Bind a session to one inbound request.
    pub fn new(link: Arc<dyn SessionLink>, codec: Arc<Codec>, request_id: impl Into<String>) -> Self {
        Self {
            link,
            codec,
            request_id: request_id.into(),
        }
    }

    /// Connection identity.
    pub fn connection_id(&self) -> &str {
        self.link.connection_id()
    }

    /// Peer address, when known.
    pub fn remote_addr(&self) -> Option<&str> {
        self.link.remote_addr()
    }

    /// Id of the request currently being served.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Shared codec.
    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    /// Whether the session still accepts writes.
    pub fn is_open(&self) -> bool {
        self.link.is_open()
    }

    /// Push a response to the client, waiting for queue space.
    pub async fn write_response(&self, response: Response) -> Result<(), SessionError> {
        self.link.write_response(response).await
    }

    /// Push a response without waiting.
    pub fn try_write_response(&self, response: Response) -> Result<(), SessionError> {
        self.link.try_write_response(response)
    }

    /// Push a result value under `id`, encoded by the codec.
    pub async fn push<T: Serialize + 'static>(&self, id: &str, value: &T) -> Result<(), SessionError> {
        let value = self.codec.to_value(value)?;
        self.write_response(Response::success(id, value)).await
    }

    /// Issue a correlated request to the client.
    pub async fn call<P: Serialize + 'static>(
        &self,
        method: &str,
        params: &P,
    ) -> Result<PendingCall, SessionError> {
        let params = self.codec.to_value(params)?;
        let id = format!("srv-{}", uuid::Uuid::now_v7());
        self.link
            .call(Request::new(id, method, Some(params)))
            .await
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingLink;
    use super::*;
    use serde_json::json;

    fn context(link: &Arc<RecordingLink>) -> ConnectionContext {
        ConnectionContext::new(link.clone(), Arc::new(Codec::new()), "req-1")
    }

    #[test]
    fn exposes_identity() {
        let link = Arc::new(RecordingLink::default());
        let ctx = context(&link);
        assert_eq!(ctx.connection_id(), "conn-test");
        assert_eq!(ctx.remote_addr(), Some("127.0.0.1:1"));
        assert_eq!(ctx.request_id(), "req-1");
        assert!(ctx.is_open());
    }

    #[tokio::test]
    async fn push_encodes_value() {
        let link = Arc::new(RecordingLink::default());
        let ctx = context(&link);
        ctx.push("ev-1", &json!({"n": 1})).await.unwrap();
        let written = link.written.lock();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].id, "ev-1");
        assert_eq!(written[0].result(), Some(&json!({"n": 1})));
    }

    #[tokio::test]
    async fn call_registers_and_resolves() {
        let link = Arc::new(RecordingLink::default());
        let ctx = context(&link);
        let pending = ctx.call("client.ping", &json!({})).await.unwrap();
        assert!(pending.id().starts_with("srv-"));

        let sent = link.requests.lock()[0].clone();
        assert_eq!(sent.method, "client.ping");

        link.table
            .lock()
            .resolve(Response::success(sent.id, json!("pong")))
            .unwrap();
        assert_eq!(pending.await.unwrap().result(), Some(&json!("pong")));
    }
}
