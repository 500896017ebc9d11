//! Websocket transport: upgrade handler, per-connection state and the
//! session loops.

pub mod connection;
pub mod session;

use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::response::Response;
use std::sync::Arc;

use crate::http::{AppState, RemoteAddr};

/// `GET {endpoint}`: upgrade and hand the socket to a new session.
pub async fn ws_handler(
    State(state): State<AppState>,
    RemoteAddr(remote): RemoteAddr,
    ws: WebSocketUpgrade,
) -> Response {
    let conn_id = format!("ws-{}", uuid::Uuid::now_v7());
    let dispatcher = Arc::clone(&state.dispatcher);
    let config = state.ws.as_ref().clone();
    let cancel = state.shutdown.child_token();
    ws.on_failed_upgrade(|e| tracing::warn!(error = %e, "websocket upgrade failed"))
        .on_upgrade(move |socket| {
            session::run_ws_session(socket, conn_id, remote, dispatcher, config, cancel)
        })
}
