//! Per-session state shared by the inbound loop, the outbound loop and the
//! dispatch tasks of one websocket connection.

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use trirpc_core::metrics::WS_SEND_DROPS_TOTAL;
use trirpc_core::{CorrelationTable, PendingCall, Request, Response, SessionError, SessionLink};

/// Lifecycle of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SessionState {
    /// Upgrade in progress.
    Connecting = 0,
    /// Both loops running.
    Open = 1,
    /// Flushing queued frames; new writes are refused.
    Draining = 2,
    /// Released; pending calls have been cancelled.
    Closed = 3,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Draining,
            _ => Self::Closed,
        }
    }
}

/// One websocket connection.
pub struct WsConnection {
    id: String,
    remote_addr: Option<String>,
    tx: mpsc::Sender<String>,
    state: AtomicU8,
    pending: Mutex<CorrelationTable>,
    cancel: CancellationToken,
    connected_at: Instant,
    last_seen: Mutex<Instant>,
    dropped_frames: AtomicU64,
}

impl std::fmt::Debug for WsConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsConnection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl WsConnection {
    /// New connection in `Connecting` state. `cancel` stops both loops.
    pub fn new(
        id: String,
        remote_addr: Option<String>,
        tx: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            remote_addr,
            tx,
            state: AtomicU8::new(SessionState::Connecting as u8),
            pending: Mutex::new(CorrelationTable::new()),
            cancel,
            connected_at: now,
            last_seen: Mutex::new(now),
            dropped_frames: AtomicU64::new(0),
        }
    }

    /// Connection id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move forward to `next`. Returns `false` if the session was already
    /// at or past it.
    fn advance(&self, next: SessionState) -> bool {
        let prev = self.state.fetch_max(next as u8, Ordering::AcqRel);
        prev < next as u8
    }

    /// Upgrade finished.
    pub fn open(&self) {
        let _ = self.advance(SessionState::Open);
    }

    /// Stop accepting writes and ask both loops to wind down.
    pub fn begin_draining(&self) {
        if self.advance(SessionState::Draining) {
            debug!(conn_id = %self.id, "session draining");
        }
        self.cancel.cancel();
    }

    /// Final state. Cancels every outstanding server-issued call.
    pub fn close(&self) -> usize {
        self.cancel.cancel();
        let _ = self.advance(SessionState::Closed);
        self.pending.lock().close("session closed")
    }

    /// Token cancelled when the session starts draining.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Record inbound activity.
    pub fn mark_alive(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    /// Time since the last inbound frame.
    pub fn last_seen_elapsed(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Frames refused because the queue was full.
    pub fn drop_count(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    /// Outstanding server-issued calls.
    pub fn pending_calls(&self) -> usize {
        self.pending.lock().pending_count()
    }

    /// Route a client response to the call waiting on its id.
    pub fn resolve(&self, response: Response) -> Result<(), Response> {
        self.pending.lock().resolve(response)
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.state() == SessionState::Open {
            Ok(())
        } else {
            Err(SessionError::Closed)
        }
    }

    /// Queue a text frame without waiting.
    pub fn try_enqueue(&self, frame: String) -> Result<(), SessionError> {
        self.ensure_open()?;
        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                let _ = self.dropped_frames.fetch_add(1, Ordering::Relaxed);
                counter!(WS_SEND_DROPS_TOTAL).increment(1);
                Err(SessionError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => Err(SessionError::Closed),
        }
    }

    /// Queue a text frame, waiting for space until the session drains.
    pub async fn enqueue(&self, frame: String) -> Result<(), SessionError> {
        self.ensure_open()?;
        tokio::select! {
            () = self.cancel.cancelled() => Err(SessionError::Closed),
            sent = self.tx.send(frame) => sent.map_err(|_| SessionError::Closed),
        }
    }
}

fn encode(message: &impl serde::Serialize) -> Result<String, SessionError> {
    serde_json::to_string(message).map_err(|e| SessionError::Encode(e.to_string()))
}

#[async_trait]
impl SessionLink for WsConnection {
    fn connection_id(&self) -> &str {
        &self.id
    }

    fn remote_addr(&self) -> Option<&str> {
        self.remote_addr.as_deref()
    }

    async fn write_response(&self, response: Response) -> Result<(), SessionError> {
        self.enqueue(encode(&response)?).await
    }

    fn try_write_response(&self, response: Response) -> Result<(), SessionError> {
        self.try_enqueue(encode(&response)?)
    }

    async fn call(&self, request: Request) -> Result<PendingCall, SessionError> {
        let frame = encode(&request)?;
        let pending = self.pending.lock().register(&request.id, &request.method);
        if let Err(err) = self.enqueue(frame).await {
            let _ = self.pending.lock().fail(
                &request.id,
                trirpc_core::CallFailure::Transport(err.to_string()),
            );
            return Err(err);
        }
        Ok(pending)
    }

    fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;
    use trirpc_core::CallFailure;

    fn make_connection(capacity: usize) -> (WsConnection, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity);
        let conn = WsConnection::new(
            "conn_1".into(),
            Some("127.0.0.1:9".into()),
            tx,
            CancellationToken::new(),
        );
        conn.open();
        (conn, rx)
    }

    #[test]
    fn starts_connecting_then_opens() {
        let (tx, _rx) = mpsc::channel(1);
        let conn = WsConnection::new("c".into(), None, tx, CancellationToken::new());
        assert_eq!(conn.state(), SessionState::Connecting);
        assert!(!conn.is_open());
        conn.open();
        assert_eq!(conn.state(), SessionState::Open);
        assert_eq!(conn.remote_addr(), None);
    }

    #[test]
    fn state_never_moves_backwards() {
        let (conn, _rx) = make_connection(4);
        let _ = conn.close();
        conn.open();
        conn.begin_draining();
        assert_eq!(conn.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn write_response_queues_json() {
        let (conn, mut rx) = make_connection(4);
        conn.write_response(Response::success("7", json!(1)))
            .await
            .unwrap();
        let frame: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame, json!({"jsonrpc": "2.0", "id": "7", "result": 1}));
    }

    #[tokio::test]
    async fn full_queue_counts_drop() {
        let (conn, _rx) = make_connection(1);
        conn.try_write_response(Response::success("1", json!(null)))
            .unwrap();
        let err = conn
            .try_write_response(Response::success("2", json!(null)))
            .unwrap_err();
        assert_eq!(err, SessionError::QueueFull);
        assert_eq!(conn.drop_count(), 1);
    }

    #[tokio::test]
    async fn draining_refuses_writes() {
        let (conn, _rx) = make_connection(4);
        conn.begin_draining();
        assert!(conn.cancel_token().is_cancelled());
        let err = conn
            .write_response(Response::success("1", json!(null)))
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::Closed);
    }

    #[tokio::test]
    async fn blocked_write_released_by_drain() {
        let (conn, _rx) = make_connection(1);
        let conn = std::sync::Arc::new(conn);
        conn.try_enqueue("a".into()).unwrap();
        let waiter = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.enqueue("b".into()).await })
        };
        tokio::task::yield_now().await;
        conn.begin_draining();
        assert_eq!(waiter.await.unwrap(), Err(SessionError::Closed));
    }

    #[tokio::test]
    async fn server_call_resolves_from_client_response() {
        let (conn, mut rx) = make_connection(4);
        let pending = conn
            .call(Request::new("srv-1", "confirm", Some(json!({"ok": true}))))
            .await
            .unwrap();
        let sent: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(sent["method"], "confirm");
        assert_eq!(conn.pending_calls(), 1);

        conn.resolve(Response::success("srv-1", json!("yes"))).unwrap();
        let resp = pending.await.unwrap();
        assert_eq!(resp.result(), Some(&json!("yes")));
    }

    #[tokio::test]
    async fn close_cancels_outstanding_calls() {
        let (conn, _rx) = make_connection(4);
        let pending = conn
            .call(Request::new("srv-2", "confirm", None))
            .await
            .unwrap();
        assert_eq!(conn.close(), 1);
        assert_matches!(pending.await, Err(CallFailure::Cancelled { .. }));
    }

    #[test]
    fn unknown_response_is_returned() {
        let (conn, _rx) = make_connection(4);
        let back = conn
            .resolve(Response::success("nobody", json!(null)))
            .unwrap_err();
        assert_eq!(back.id, "nobody");
    }

    #[test]
    fn mark_alive_resets_clock() {
        let (conn, _rx) = make_connection(4);
        conn.mark_alive();
        assert!(conn.last_seen_elapsed() < Duration::from_secs(1));
        assert!(conn.age() < Duration::from_secs(5));
    }
}
