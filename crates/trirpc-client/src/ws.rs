//! Websocket client with request correlation.
//!
//! `call` registers the request id in a [`CorrelationTable`] and returns a
//! [`PendingCall`] right away; the read loop resolves it when the matching
//! response arrives. Everything else the server sends (responses to
//! uncorrelated `send`s, server-issued requests) surfaces via
//! [`WsClient::next_event`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::{SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use trirpc_core::{
    CallFailure, Codec, CorrelationTable, ListenAddr, PendingCall, Request, Response,
};

use crate::error::{ClientError, Result};
use crate::params::Params;

/// Websocket client tuning.
#[derive(Clone, Debug)]
pub struct WsClientConfig {
    /// Upgrade path on the server.
    pub endpoint: String,
    /// Ping interval.
    pub ping_period: Duration,
    /// Close after this long without any inbound frame.
    pub read_wait: Duration,
    /// Deadline for one frame write.
    pub write_wait: Duration,
    /// Outbound queue capacity.
    pub queue_capacity: usize,
    /// Unclaimed inbound events buffered for [`WsClient::next_event`];
    /// further events are dropped and counted.
    pub event_capacity: usize,
}

impl Default for WsClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "/websocket".into(),
            ping_period: Duration::from_secs(27),
            read_wait: Duration::from_secs(30),
            write_wait: Duration::from_secs(10),
            queue_capacity: 1000,
            event_capacity: 1000,
        }
    }
}

/// Inbound traffic not claimed by a pending call.
#[derive(Clone, Debug, PartialEq)]
pub enum WsEvent {
    /// A response with no waiting call.
    Response(Response),
    /// A request issued by the server.
    Request(Request),
}

/// A connected websocket client.
pub struct WsClient {
    tx: mpsc::Sender<Message>,
    pending: Arc<Mutex<CorrelationTable>>,
    events: tokio::sync::Mutex<mpsc::Receiver<WsEvent>>,
    dropped_events: Arc<AtomicU64>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    codec: Arc<Codec>,
}

impl std::fmt::Debug for WsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsClient")
            .field("pending", &self.pending.lock().pending_count())
            .field("stopped", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl WsClient {
    /// Dial `remote` (`tcp://` or `unix://`) and start both loops.
    pub async fn connect(remote: &str, config: WsClientConfig) -> Result<Self> {
        Self::connect_with_codec(remote, config, Arc::new(Codec::new())).await
    }

    /// Dial with a codec for decoding results.
    pub async fn connect_with_codec(
        remote: &str,
        config: WsClientConfig,
        codec: Arc<Codec>,
    ) -> Result<Self> {
        let addr: ListenAddr = remote.parse()?;
        let url = addr.ws_url(&config.endpoint);
        match &addr {
            ListenAddr::Tcp(_) => {
                let (ws, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
                info!(%url, "websocket client connected");
                Ok(Self::spawn(ws, config, codec))
            }
            ListenAddr::Unix(path) => {
                let stream = tokio::net::UnixStream::connect(path).await?;
                let (ws, _) = tokio_tungstenite::client_async(url.as_str(), stream).await?;
                info!(path = %path.display(), "websocket client connected");
                Ok(Self::spawn(ws, config, codec))
            }
        }
    }

    fn spawn<S>(ws: WebSocketStream<S>, config: WsClientConfig, codec: Arc<Codec>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (ws_tx, ws_rx) = ws.split();
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let (events_tx, events_rx) = mpsc::channel(config.event_capacity.max(1));
        let dropped_events = Arc::new(AtomicU64::new(0));
        let pending = Arc::new(Mutex::new(CorrelationTable::new()));
        let cancel = CancellationToken::new();

        let writer = tokio::spawn(write_loop(ws_tx, rx, cancel.clone(), config.clone()));
        let reader = tokio::spawn(read_loop(
            ws_rx,
            Arc::clone(&pending),
            EventSink::new(events_tx, Arc::clone(&dropped_events)),
            cancel.clone(),
            config.read_wait,
        ));

        Self {
            tx,
            pending,
            events: tokio::sync::Mutex::new(events_rx),
            dropped_events,
            cancel,
            tasks: Mutex::new(vec![writer, reader]),
            codec,
        }
    }

    async fn send_frame(&self, request: &impl serde::Serialize) -> Result<()> {
        let text = serde_json::to_string(request)?;
        tokio::select! {
            () = self.cancel.cancelled() => Err(ClientError::Closed),
            sent = self.tx.send(Message::Text(text.into())) => sent.map_err(|_| ClientError::Closed),
        }
    }

    async fn correlated(&self, request: Request) -> Result<PendingCall> {
        if self.cancel.is_cancelled() {
            return Err(ClientError::Closed);
        }
        let pending = self.pending.lock().register(&request.id, &request.method);
        if let Err(err) = self.send_frame(&request).await {
            let _ = self
                .pending
                .lock()
                .fail(&request.id, CallFailure::Transport(err.to_string()));
            return Err(err);
        }
        Ok(pending)
    }

    /// Correlated call with named params.
    pub async fn call(&self, method: &str, params: &Params) -> Result<PendingCall> {
        let id = uuid::Uuid::now_v7().to_string();
        self.correlated(Request::new(id, method, Some(params.to_named())))
            .await
    }

    /// Correlated call with positional params.
    pub async fn call_with_array_params(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<PendingCall> {
        let id = uuid::Uuid::now_v7().to_string();
        self.correlated(Request::new(id, method, Some(Value::Array(params))))
            .await
    }

    /// Call, wait, and decode the result as `R`.
    pub async fn request<R>(&self, method: &str, params: &Params) -> Result<R>
    where
        R: DeserializeOwned + 'static,
    {
        let response = self.call(method, params).await?.await?;
        let value = response.into_result().map_err(ClientError::Rpc)?;
        Ok(self.codec.from_value(value)?)
    }

    /// Send without correlation; the answer arrives as a [`WsEvent::Response`].
    pub async fn send(&self, request: &Request) -> Result<()> {
        self.send_frame(request).await
    }

    /// Notification: empty id, nothing comes back.
    pub async fn notify(&self, method: &str, params: &Params) -> Result<()> {
        self.send_frame(&Request::notification(method, Some(params.to_named())))
            .await
    }

    /// Answer a request the server issued.
    pub async fn respond(&self, response: &Response) -> Result<()> {
        self.send_frame(response).await
    }

    /// Next unsolicited event; `None` once the connection is gone.
    pub async fn next_event(&self) -> Option<WsEvent> {
        self.events.lock().await.recv().await
    }

    /// Events dropped because nobody drained [`Self::next_event`].
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Outstanding correlated calls.
    pub fn pending_calls(&self) -> usize {
        self.pending.lock().pending_count()
    }

    /// Whether the connection is still up.
    pub fn is_connected(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Close the connection and cancel every outstanding call.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let cancelled = self.pending.lock().close("client stopped");
        if cancelled > 0 {
            debug!(cancelled, "cancelled outstanding calls");
        }
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }
}

impl Drop for WsClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn classify(text: &str) -> std::result::Result<WsEvent, serde_json::Error> {
    let value: Value = serde_json::from_str(text)?;
    if value.get("method").is_some() {
        Ok(WsEvent::Request(serde_json::from_value(value)?))
    } else {
        Ok(WsEvent::Response(serde_json::from_value(value)?))
    }
}

/// Bounded hand-off from the read loop to [`WsClient::next_event`].
struct EventSink {
    tx: mpsc::Sender<WsEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventSink {
    fn new(tx: mpsc::Sender<WsEvent>, dropped: Arc<AtomicU64>) -> Self {
        Self { tx, dropped }
    }

    /// Never blocks the read loop; a full buffer drops the event.
    fn deliver(&self, event: WsEvent) {
        match self.tx.try_send(event) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(event)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                let id = match &event {
                    WsEvent::Response(r) => r.id.as_str(),
                    WsEvent::Request(r) => r.id.as_str(),
                };
                warn!(id, dropped, "event buffer full, dropping event");
            }
        }
    }
}

async fn read_loop<S>(
    mut ws_rx: S,
    pending: Arc<Mutex<CorrelationTable>>,
    events: EventSink,
    cancel: CancellationToken,
    read_wait: Duration,
) where
    S: Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => break,
            next = tokio::time::timeout(read_wait, ws_rx.next()) => next,
        };
        let msg = match next {
            Err(_) => {
                warn!(?read_wait, "no frame from server within read deadline");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!(error = %e, "read failed");
                break;
            }
            Ok(Some(Ok(msg))) => msg,
        };

        let text = match msg {
            Message::Text(t) => t.as_str().to_owned(),
            Message::Binary(b) => match String::from_utf8(b.to_vec()) {
                Ok(s) => s,
                Err(_) => continue,
            },
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
        };

        match classify(&text) {
            Ok(WsEvent::Response(response)) => {
                let unclaimed = pending.lock().resolve(response);
                if let Err(response) = unclaimed {
                    events.deliver(WsEvent::Response(response));
                }
            }
            Ok(event) => events.deliver(event),
            Err(e) => warn!(error = %e, "unparseable frame from server"),
        }
    }

    cancel.cancel();
    let _ = pending.lock().close("connection closed");
}

async fn write_loop<S>(
    mut ws_tx: S,
    mut rx: mpsc::Receiver<Message>,
    cancel: CancellationToken,
    config: WsClientConfig,
) where
    S: futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let mut ping = tokio::time::interval(config.ping_period);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let _ = ping.tick().await;

    loop {
        let msg = tokio::select! {
            () = cancel.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
            _ = ping.tick() => Message::Ping(Vec::new().into()),
        };
        match tokio::time::timeout(config.write_wait, ws_tx.send(msg)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(error = %e, "write failed");
                cancel.cancel();
                return;
            }
            Err(_) => {
                warn!(write_wait = ?config.write_wait, "write timed out");
                cancel.cancel();
                return;
            }
        }
    }

    let _ = tokio::time::timeout(config.write_wait, ws_tx.send(Message::Close(None))).await;
}
