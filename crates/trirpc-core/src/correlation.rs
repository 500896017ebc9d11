//! Correlation table: outstanding request id → single-resolution slot.
//!
//! Used by server sessions for server-issued calls and by the websocket
//! client for its own calls. A slot resolves at most once; closing the table
//! cancels every slot and fails later registrations immediately.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use tokio::sync::oneshot;
use tracing::debug;

use crate::types::Response;

/// Why a call finished without a response.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CallFailure {
    /// Connection closed or client stopped.
    #[error("call cancelled: {reason}")]
    Cancelled {
        /// Human-readable cause.
        reason: String,
    },

    /// The request could not be written.
    #[error("transport error: {0}")]
    Transport(String),
}

/// What a pending call resolves to.
pub type CallOutcome = Result<Response, CallFailure>;

struct CallRecord {
    tx: oneshot::Sender<CallOutcome>,
    method: String,
    created_at: Instant,
}

/// Outstanding calls for one connection.
#[derive(Default)]
pub struct CorrelationTable {
    pending: HashMap<String, CallRecord>,
    closed: Option<String>,
}

impl CorrelationTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a call, returning the slot that will deliver its outcome.
    ///
    /// Re-registering a live id cancels the earlier slot.
    pub fn register(&mut self, id: &str, method: &str) -> PendingCall {
        let (tx, rx) = oneshot::channel();
        if let Some(reason) = &self.closed {
            let _ = tx.send(Err(CallFailure::Cancelled {
                reason: reason.clone(),
            }));
            return PendingCall::new(id, rx);
        }
        let record = CallRecord {
            tx,
            method: method.to_owned(),
            created_at: Instant::now(),
        };
        if let Some(previous) = self.pending.insert(id.to_owned(), record) {
            let _ = previous.tx.send(Err(CallFailure::Cancelled {
                reason: format!("superseded by a new call with id {id}"),
            }));
        }
        PendingCall::new(id, rx)
    }

    /// Deliver a response to its slot.
    ///
    /// Hands the response back when no call with that id is pending.
    pub fn resolve(&mut self, response: Response) -> Result<(), Response> {
        let Some(record) = self.pending.remove(&response.id) else {
            return Err(response);
        };
        debug!(
            id = %response.id,
            method = %record.method,
            elapsed_ms = record.created_at.elapsed().as_millis(),
            "call resolved"
        );
        let _ = record.tx.send(Ok(response));
        Ok(())
    }

    /// Fail one call. Returns `false` when the id is unknown.
    pub fn fail(&mut self, id: &str, failure: CallFailure) -> bool {
        match self.pending.remove(id) {
            Some(record) => record.tx.send(Err(failure)).is_ok(),
            None => false,
        }
    }

    /// Check if a call is pending.
    pub fn has_pending(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    /// Number of pending calls.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Whether [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.closed.is_some()
    }

    /// Cancel every pending call and refuse new ones. Returns how many were cancelled.
    pub fn close(&mut self, reason: &str) -> usize {
        if self.closed.is_none() {
            self.closed = Some(reason.to_owned());
        }
        self.cancel_all(reason)
    }

    /// Cancel every pending call, leaving the table open.
    pub fn cancel_all(&mut self, reason: &str) -> usize {
        let count = self.pending.len();
        for (_, record) in self.pending.drain() {
            let _ = record.tx.send(Err(CallFailure::Cancelled {
                reason: reason.to_owned(),
            }));
        }
        count
    }
}

/// Awaitable slot returned by `call`.
#[derive(Debug)]
pub struct PendingCall {
    id: String,
    rx: oneshot::Receiver<CallOutcome>,
}

impl PendingCall {
    fn new(id: &str, rx: oneshot::Receiver<CallOutcome>) -> Self {
        Self {
            id: id.to_owned(),
            rx,
        }
    }

    /// Request id this slot waits for.
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Future for PendingCall {
    type Output = CallOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|res| {
            res.unwrap_or_else(|_| {
                Err(CallFailure::Cancelled {
                    reason: "correlation table dropped".into(),
                })
            })
        })
    }
}
