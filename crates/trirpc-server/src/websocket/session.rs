//! Websocket session lifecycle, from upgrade through close.
//!
//! Two loops per session:
//! - inbound (this task): reads frames under the read deadline, answers
//!   control frames, spawns one dispatch task per request (at most
//!   `max_inflight_requests` at a time), routes client responses into the
//!   correlation table;
//! - outbound (spawned): drains the bounded queue to the socket with a write
//!   deadline per frame and pings every `ping_period`.
//!
//! Either loop failing, the peer closing, or server shutdown moves the
//! session to `Draining`: the outbound loop flushes what is already queued,
//! sends a close frame, and the session ends `Closed`. Dispatches still
//! running at that point are aborted.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use serde_json::Value;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use trirpc_core::metrics::{WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL};
use trirpc_core::{
    ConnectionContext, Dispatcher, Request, Response, RpcError, SessionLink as _, Transport,
};

use super::connection::WsConnection;
use crate::config::WsConfig;

/// Drive one upgraded socket until it closes.
#[instrument(skip_all, fields(conn_id = %conn_id))]
pub async fn run_ws_session(
    socket: WebSocket,
    conn_id: String,
    remote_addr: Option<String>,
    dispatcher: Arc<Dispatcher>,
    config: WsConfig,
    cancel: CancellationToken,
) {
    let (ws_tx, ws_rx) = socket.split();
    let (send_tx, send_rx) = mpsc::channel::<String>(config.write_channel_capacity);
    let conn = Arc::new(WsConnection::new(
        conn_id.clone(),
        remote_addr.clone(),
        send_tx,
        cancel,
    ));
    conn.open();

    let started = Instant::now();
    info!(remote = remote_addr.as_deref().unwrap_or("-"), "websocket connected");
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);

    let outbound = tokio::spawn(write_loop(ws_tx, send_rx, Arc::clone(&conn), config.clone()));
    let mut inflight = Inflight::new(config.max_inflight_requests);
    read_loop(ws_rx, &conn, &dispatcher, &config, &mut inflight).await;

    conn.begin_draining();
    if let Err(e) = outbound.await {
        warn!(error = %e, "outbound task failed");
    }
    let cancelled = conn.close();
    let aborted = inflight.abort_all().await;

    info!(
        duration_secs = started.elapsed().as_secs_f64(),
        cancelled_calls = cancelled,
        aborted_dispatches = aborted,
        dropped_frames = conn.drop_count(),
        "websocket disconnected"
    );
    counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
}

async fn read_loop(
    mut ws_rx: SplitStream<WebSocket>,
    conn: &Arc<WsConnection>,
    dispatcher: &Arc<Dispatcher>,
    config: &WsConfig,
    inflight: &mut Inflight,
) {
    let cancel = conn.cancel_token().clone();
    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => {
                debug!("session cancelled");
                return;
            }
            next = tokio::time::timeout(config.read_wait, ws_rx.next()) => next,
        };

        let msg = match next {
            Err(_) => {
                warn!(read_wait = ?config.read_wait, "no frame within read deadline, closing");
                return;
            }
            Ok(None) => return,
            Ok(Some(Err(e))) => {
                debug!(error = %e, "read failed");
                return;
            }
            Ok(Some(Ok(msg))) => msg,
        };
        conn.mark_alive();

        let text = match msg {
            Message::Text(t) => t.as_str().to_owned(),
            Message::Binary(data) => match String::from_utf8(data.to_vec()) {
                Ok(s) => s,
                Err(_) => {
                    info!(len = data.len(), "ignoring non-UTF8 binary frame");
                    continue;
                }
            },
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(frame) => {
                debug!(?frame, "peer sent close frame");
                return;
            }
        };
        handle_frame(&text, conn, dispatcher, inflight);
    }
}

// ── In-flight dispatches ────────────────────────────────────────────

/// Dispatch tasks owned by one session, capped by a semaphore.
struct Inflight {
    tasks: JoinSet<()>,
    permits: Arc<Semaphore>,
    limit: usize,
}

impl Inflight {
    fn new(limit: usize) -> Self {
        Self {
            tasks: JoinSet::new(),
            permits: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    /// Spawn `task` if a slot is free. Returns `false` at the limit.
    fn try_spawn<F>(&mut self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.reap();
        let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
            return false;
        };
        let _ = self.tasks.spawn(async move {
            task.await;
            drop(permit);
        });
        true
    }

    /// Tasks spawned and not yet reaped.
    fn len(&self) -> usize {
        self.tasks.len()
    }

    fn reap(&mut self) {
        while let Some(joined) = self.tasks.try_join_next() {
            if let Err(e) = joined {
                if e.is_panic() {
                    warn!(error = %e, "dispatch task panicked");
                }
            }
        }
    }

    /// Abort whatever is still running and wait for it to unwind.
    async fn abort_all(&mut self) -> usize {
        self.reap();
        let running = self.tasks.len();
        self.tasks.shutdown().await;
        running
    }
}

/// Client responses carry `result` or `error` but no method.
fn is_response(value: &Value) -> bool {
    value.as_object().is_some_and(|obj| {
        !obj.contains_key("method") && (obj.contains_key("result") || obj.contains_key("error"))
    })
}

fn handle_frame(
    text: &str,
    conn: &Arc<WsConnection>,
    dispatcher: &Arc<Dispatcher>,
    inflight: &mut Inflight,
) {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            let err = RpcError::Parse {
                detail: e.to_string(),
            };
            reply(conn, Response::failure(uuid::Uuid::now_v7().to_string(), &err));
            return;
        }
    };

    if is_response(&value) {
        match serde_json::from_value::<Response>(value) {
            Ok(response) => {
                if let Err(orphan) = conn.resolve(response) {
                    warn!(id = %orphan.id, "response for unknown call");
                }
            }
            Err(e) => warn!(error = %e, "malformed response from client"),
        }
        return;
    }

    let request: Request = match serde_json::from_value(value.clone()) {
        Ok(r) => r,
        Err(e) => {
            let id = value
                .get("id")
                .and_then(Value::as_str)
                .map_or_else(|| uuid::Uuid::now_v7().to_string(), str::to_owned);
            let err = RpcError::InvalidRequest {
                detail: e.to_string(),
            };
            reply(conn, Response::failure(id, &err));
            return;
        }
    };

    let id = request.id.clone();
    let task_conn = Arc::clone(conn);
    let dispatcher = Arc::clone(dispatcher);
    let spawned = inflight.try_spawn(async move {
        let conn = task_conn;
        let ctx = ConnectionContext::new(
            conn.clone(),
            Arc::clone(dispatcher.codec()),
            request.id.clone(),
        );
        if let Some(response) = dispatcher
            .handle_request(request, Transport::WebSocket, Some(ctx))
            .await
        {
            if let Err(e) = conn.write_response(response).await {
                debug!(error = %e, "response discarded");
            }
        }
    });
    if spawned {
        return;
    }

    warn!(id = %id, running = inflight.len(), limit = inflight.limit, "too many requests in flight, rejecting");
    if !id.is_empty() {
        let err = RpcError::Internal {
            detail: format!("too many requests in flight (limit {})", inflight.limit),
        };
        reply(conn, Response::failure(id, &err));
    }
}

fn reply(conn: &WsConnection, response: Response) {
    if let Err(e) = conn.try_write_response(response) {
        debug!(error = %e, "error response discarded");
    }
}

async fn write_frame(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    msg: Message,
    config: &WsConfig,
) -> Result<(), String> {
    match tokio::time::timeout(config.write_wait, ws_tx.send(msg)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!("write exceeded {:?}", config.write_wait)),
    }
}

async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut send_rx: mpsc::Receiver<String>,
    conn: Arc<WsConnection>,
    config: WsConfig,
) {
    let cancel = conn.cancel_token().clone();
    let mut ping = tokio::time::interval(config.ping_period);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // Skip the immediate first tick
    let _ = ping.tick().await;

    loop {
        let outcome = tokio::select! {
            () = cancel.cancelled() => break,
            frame = send_rx.recv() => match frame {
                Some(text) => write_frame(&mut ws_tx, Message::Text(text.into()), &config).await,
                None => break,
            },
            _ = ping.tick() => write_frame(&mut ws_tx, Message::Ping(Vec::new().into()), &config).await,
        };
        if let Err(e) = outcome {
            warn!(error = %e, "write failed, closing");
            conn.begin_draining();
            return;
        }
    }

    // Draining: flush what was queued before the cut-off.
    send_rx.close();
    let mut flushed = 0usize;
    while let Ok(text) = send_rx.try_recv() {
        if let Err(e) = write_frame(&mut ws_tx, Message::Text(text.into()), &config).await {
            debug!(error = %e, "flush aborted");
            return;
        }
        flushed += 1;
    }
    if flushed > 0 {
        debug!(flushed, "flushed queued frames");
    }
    let _ = write_frame(&mut ws_tx, Message::Close(None), &config).await;
}
