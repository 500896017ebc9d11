//! Websocket sessions driven by a raw tungstenite client.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use trirpc_core::{Codec, ConnectionContext, MethodRegistry};
use trirpc_server::{RpcServer, ServerConfig, ServerHandle, WsConfig};

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Number of `park` calls currently executing.
static PARKED: AtomicUsize = AtomicUsize::new(0);

struct Parked;

impl Drop for Parked {
    fn drop(&mut self) {
        let _ = PARKED.fetch_sub(1, Ordering::SeqCst);
    }
}

fn registry() -> MethodRegistry {
    let mut reg = MethodRegistry::new();
    reg.register(
        "park",
        || async {
            let _ = PARKED.fetch_add(1, Ordering::SeqCst);
            let _parked = Parked;
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, String>(())
        },
        &[],
    )
    .unwrap();
    reg.register(
        "echo",
        |arg: String| async move { Ok::<_, String>(json!({ "value": arg })) },
        &["arg"],
    )
    .unwrap();
    reg.register(
        "sleep_echo",
        |ms: u64, arg: String| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok::<_, String>(arg)
        },
        &["ms", "arg"],
    )
    .unwrap();
    reg.register_ws(
        "whoami",
        |ctx: ConnectionContext| async move {
            Ok::<_, String>(json!({
                "connection": ctx.connection_id(),
                "request": ctx.request_id(),
                "has_remote": ctx.remote_addr().is_some(),
            }))
        },
        &[],
    )
    .unwrap();
    reg.register_ws(
        "ask_client",
        |ctx: ConnectionContext, question: String| async move {
            let pending = ctx.call("confirm", &json!({ "question": question })).await
                .map_err(|e| e.to_string())?;
            let answer = pending.await.map_err(|e| e.to_string())?;
            answer
                .into_result()
                .map_err(|e| e.to_string())
        },
        &["question"],
    )
    .unwrap();
    reg
}

async fn boot(ws: WsConfig) -> ServerHandle {
    let config = ServerConfig {
        ws,
        ..ServerConfig::default()
    };
    RpcServer::new(config, registry(), Codec::new())
        .start()
        .await
        .unwrap()
}

async fn connect(handle: &ServerHandle) -> WsStream {
    let (ws, _) = connect_async(handle.ws_url()).await.unwrap();
    ws
}

async fn send(ws: &mut WsStream, value: Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

/// Next JSON text frame, skipping control frames.
async fn next_json(ws: &mut WsStream) -> Value {
    loop {
        let msg = timeout(TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .unwrap();
        match msg {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => {}
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

#[tokio::test]
async fn request_gets_response() {
    let handle = boot(WsConfig::default()).await;
    let mut ws = connect(&handle).await;

    send(&mut ws, json!({"jsonrpc": "2.0", "id": "1", "method": "echo", "params": {"arg": "acbd"}})).await;
    let resp = next_json(&mut ws).await;
    assert_eq!(resp, json!({"jsonrpc": "2.0", "id": "1", "result": {"value": "acbd"}}));

    send(&mut ws, json!({"id": "2", "method": "echo", "params": ["positional"]})).await;
    assert_eq!(next_json(&mut ws).await["result"]["value"], "positional");

    let _ = handle.shutdown(Some(TIMEOUT)).await;
}

#[tokio::test]
async fn binary_frames_are_accepted() {
    let handle = boot(WsConfig::default()).await;
    let mut ws = connect(&handle).await;

    let body = json!({"id": "b", "method": "echo", "params": {"arg": "bin"}}).to_string();
    ws.send(Message::Binary(body.into_bytes().into())).await.unwrap();
    assert_eq!(next_json(&mut ws).await["result"]["value"], "bin");

    let _ = handle.shutdown(Some(TIMEOUT)).await;
}

#[tokio::test]
async fn notification_is_not_answered() {
    let handle = boot(WsConfig::default()).await;
    let mut ws = connect(&handle).await;

    send(&mut ws, json!({"method": "echo", "params": {"arg": "quiet"}})).await;
    send(&mut ws, json!({"id": "after", "method": "echo", "params": {"arg": "loud"}})).await;
    let resp = next_json(&mut ws).await;
    assert_eq!(resp["id"], "after");

    let _ = handle.shutdown(Some(TIMEOUT)).await;
}

#[tokio::test]
async fn parse_error_keeps_session_open() {
    let handle = boot(WsConfig::default()).await;
    let mut ws = connect(&handle).await;

    ws.send(Message::Text("{broken".into())).await.unwrap();
    assert_eq!(next_json(&mut ws).await["error"]["code"], -32700);

    send(&mut ws, json!({"id": "ok", "method": "echo", "params": {"arg": "x"}})).await;
    assert_eq!(next_json(&mut ws).await["id"], "ok");

    let _ = handle.shutdown(Some(TIMEOUT)).await;
}

#[tokio::test]
async fn connection_bound_method_sees_session() {
    let handle = boot(WsConfig::default()).await;
    let mut ws = connect(&handle).await;

    send(&mut ws, json!({"id": "w1", "method": "whoami"})).await;
    let resp = next_json(&mut ws).await;
    let result = &resp["result"];
    assert!(result["connection"].as_str().unwrap().starts_with("ws-"));
    assert_eq!(result["request"], "w1");
    assert_eq!(result["has_remote"], true);

    let _ = handle.shutdown(Some(TIMEOUT)).await;
}

#[tokio::test]
async fn slow_call_does_not_block_fast_one() {
    let handle = boot(WsConfig::default()).await;
    let mut ws = connect(&handle).await;

    send(&mut ws, json!({"id": "slow", "method": "sleep_echo", "params": {"ms": 300, "arg": "s"}})).await;
    send(&mut ws, json!({"id": "fast", "method": "sleep_echo", "params": {"ms": 0, "arg": "f"}})).await;

    let first = next_json(&mut ws).await;
    let second = next_json(&mut ws).await;
    assert_eq!(first["id"], "fast");
    assert_eq!(first["result"], "f");
    assert_eq!(second["id"], "slow");
    assert_eq!(second["result"], "s");

    let _ = handle.shutdown(Some(TIMEOUT)).await;
}

#[tokio::test]
async fn server_call_is_answered_by_client() {
    let handle = boot(WsConfig::default()).await;
    let mut ws = connect(&handle).await;

    send(&mut ws, json!({"id": "q", "method": "ask_client", "params": {"question": "proceed?"}})).await;

    let server_request = next_json(&mut ws).await;
    assert_eq!(server_request["method"], "confirm");
    assert_eq!(server_request["params"]["question"], "proceed?");
    let call_id = server_request["id"].as_str().unwrap().to_owned();
    assert!(call_id.starts_with("srv-"));

    send(&mut ws, json!({"jsonrpc": "2.0", "id": call_id, "result": "yes"})).await;
    let resp = next_json(&mut ws).await;
    assert_eq!(resp["id"], "q");
    assert_eq!(resp["result"], "yes");

    let _ = handle.shutdown(Some(TIMEOUT)).await;
}

#[tokio::test]
async fn silent_client_is_closed_after_read_wait() {
    let handle = boot(WsConfig {
        ping_period: Duration::from_millis(100),
        read_wait: Duration::from_millis(300),
        ..WsConfig::default()
    })
    .await;
    let mut ws = connect(&handle).await;

    // Not polling the stream means pings go unanswered.
    tokio::time::sleep(Duration::from_millis(800)).await;

    let closed = timeout(TIMEOUT, async {
        while let Some(msg) = ws.next().await {
            match msg {
                Ok(Message::Close(_)) | Err(_) => return true,
                Ok(_) => {}
            }
        }
        true
    })
    .await
    .unwrap();
    assert!(closed);

    let _ = handle.shutdown(Some(TIMEOUT)).await;
}

#[tokio::test]
async fn client_answering_pings_stays_open() {
    let handle = boot(WsConfig {
        ping_period: Duration::from_millis(100),
        read_wait: Duration::from_millis(300),
        ..WsConfig::default()
    })
    .await;
    let mut ws = connect(&handle).await;

    // Polling the stream makes tungstenite answer each ping with a pong.
    let mut pings = 0;
    let deadline = tokio::time::Instant::now() + Duration::from_millis(1000);
    while let Ok(Some(msg)) = tokio::time::timeout_at(deadline, ws.next()).await {
        match msg.unwrap() {
            Message::Ping(_) => pings += 1,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
    assert!(pings >= 3, "expected several pings, saw {pings}");

    send(&mut ws, json!({"id": "still", "method": "echo", "params": {"arg": "here"}})).await;
    assert_eq!(next_json(&mut ws).await["id"], "still");

    let _ = handle.shutdown(Some(TIMEOUT)).await;
}

#[tokio::test]
async fn shutdown_closes_sessions() {
    let handle = boot(WsConfig::default()).await;
    let mut ws = connect(&handle).await;

    send(&mut ws, json!({"id": "1", "method": "echo", "params": {"arg": "a"}})).await;
    let _ = next_json(&mut ws).await;

    assert!(handle.shutdown(Some(TIMEOUT)).await);

    let ended = timeout(TIMEOUT, async {
        loop {
            match ws.next().await {
                None | Some(Err(_) | Ok(Message::Close(_))) => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(ended.is_ok());
}

async fn wait_for_parked(expected: usize) {
    let reached = timeout(TIMEOUT, async {
        while PARKED.load(Ordering::SeqCst) != expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(
        reached.is_ok(),
        "parked calls stuck at {}, expected {expected}",
        PARKED.load(Ordering::SeqCst)
    );
}

#[tokio::test]
async fn flooded_session_is_capped_and_aborted_on_disconnect() {
    let handle = boot(WsConfig {
        max_inflight_requests: 4,
        ..WsConfig::default()
    })
    .await;
    let mut ws = connect(&handle).await;

    for i in 0..50 {
        send(&mut ws, json!({"id": format!("p{i}"), "method": "park"})).await;
    }
    for i in 4..50 {
        let resp = next_json(&mut ws).await;
        assert_eq!(resp["id"], format!("p{i}"));
        assert_eq!(resp["error"]["code"], -32603);
    }
    wait_for_parked(4).await;

    drop(ws);
    wait_for_parked(0).await;

    let _ = handle.shutdown(Some(TIMEOUT)).await;
}
