//! `RpcServer`: router assembly, binding and serving.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::serve::Listener as _;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use trirpc_core::{Codec, Dispatcher, ListenAddr, MethodRegistry};

use crate::config::ServerConfig;
use crate::errors::ServerError;
use crate::http::{AppState, build_router};
use crate::listener::{PeerAddr, RpcListener};
use crate::shutdown::ShutdownCoordinator;

/// A configured server, not yet listening.
pub struct RpcServer {
    config: ServerConfig,
    dispatcher: Arc<Dispatcher>,
    shutdown: Arc<ShutdownCoordinator>,
    metrics: Option<PrometheusHandle>,
}

impl RpcServer {
    /// Server exposing `registry`, encoding results with `codec`.
    pub fn new(config: ServerConfig, registry: MethodRegistry, codec: Codec) -> Self {
        let dispatcher = Dispatcher::new(Arc::new(registry), Arc::new(codec))
            .with_timeout(config.handler_timeout);
        Self {
            config,
            dispatcher: Arc::new(dispatcher),
            shutdown: Arc::new(ShutdownCoordinator::new()),
            metrics: None,
        }
    }

    /// Serve `GET /metrics` from an already installed recorder.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Active configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Shared dispatcher.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Cancelling this token stops the server and every session.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.token()
    }

    /// The complete axum router, without connect info.
    pub fn router(&self) -> Result<Router, ServerError> {
        let state = AppState {
            dispatcher: Arc::clone(&self.dispatcher),
            ws: Arc::new(self.config.ws.clone()),
            shutdown: self.shutdown.token(),
            metrics: self.metrics.clone(),
        };
        build_router(state, self.config.max_body_bytes)
    }

    /// Bind the listen address and serve in a background task.
    pub async fn start(mut self) -> Result<ServerHandle, ServerError> {
        self.config.validate()?;
        if let Some(tls) = &self.config.tls {
            return Err(ServerError::TlsUnsupported {
                cert: tls.cert.display().to_string(),
                key: tls.key.display().to_string(),
            });
        }
        if self.config.metrics_enabled && self.metrics.is_none() {
            self.metrics = Some(crate::metrics::install_recorder()?);
        }

        let router = self.router()?;
        let listener =
            RpcListener::bind(&self.config.listen, self.config.max_open_connections).await?;
        let local_addr = listener.local_addr()?.to_listen_addr();
        let unix_path = listener.unix_path().cloned();
        info!(
            addr = %local_addr,
            methods = self.dispatcher.registry().len(),
            max_open_connections = ?self.config.max_open_connections,
            "rpc server listening"
        );

        let token = self.shutdown.token();
        let task = tokio::spawn(async move {
            let service = router.into_make_service_with_connect_info::<PeerAddr>();
            if let Err(e) = axum::serve(listener, service)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
            {
                error!(error = %e, "server stopped with error");
            }
            if let Some(path) = unix_path {
                let _ = std::fs::remove_file(path);
            }
            info!("rpc server stopped");
        });

        Ok(ServerHandle {
            local_addr,
            ws_endpoint: self.config.ws.endpoint.clone(),
            shutdown: self.shutdown,
            task,
        })
    }
}

/// A running server.
#[derive(Debug)]
pub struct ServerHandle {
    local_addr: ListenAddr,
    ws_endpoint: String,
    shutdown: Arc<ShutdownCoordinator>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    /// Bound address, with the real port when `:0` was requested.
    pub fn local_addr(&self) -> &ListenAddr {
        &self.local_addr
    }

    /// `http://host:port`; `None` on unix sockets.
    pub fn http_url(&self) -> Option<String> {
        self.local_addr.http_base()
    }

    /// Websocket URL of the session endpoint.
    pub fn ws_url(&self) -> String {
        self.local_addr.ws_url(&self.ws_endpoint)
    }

    /// Token that stops the server when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.token()
    }

    /// Stop accepting, close sessions, and wait for the serve task.
    pub async fn shutdown(self, timeout: Option<Duration>) -> bool {
        self.shutdown
            .graceful_shutdown(vec![self.task], timeout)
            .await
    }

    /// Wait until the server stops on its own (its token was cancelled).
    pub async fn wait(self) {
        if let Err(e) = self.task.await {
            error!(error = %e, "server task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TlsFiles;
    use assert_matches::assert_matches;

    fn registry() -> MethodRegistry {
        let mut reg = MethodRegistry::new();
        reg.register(
            "double",
            |n: i64| async move { Ok::<_, String>(n * 2) },
            &["n"],
        )
        .unwrap();
        reg
    }

    #[tokio::test]
    async fn serves_direct_endpoint_on_ephemeral_port() {
        let server = RpcServer::new(ServerConfig::default(), registry(), Codec::new());
        let handle = server.start().await.unwrap();
        let base = handle.http_url().unwrap();
        assert!(!base.ends_with(":0"));

        let body: serde_json::Value = reqwest::get(format!("{base}/double?n=21"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["result"], 42);

        assert!(handle.shutdown(Some(Duration::from_secs(5))).await);
    }

    #[tokio::test]
    async fn tls_files_are_rejected() {
        let mut config = ServerConfig::default();
        config.tls = Some(TlsFiles {
            cert: "cert.pem".into(),
            key: "key.pem".into(),
        });
        let err = RpcServer::new(config, registry(), Codec::new())
            .start()
            .await
            .unwrap_err();
        assert_matches!(err, ServerError::TlsUnsupported { .. });
    }

    #[tokio::test]
    async fn unusable_config_fails_start() {
        let mut config = ServerConfig::default();
        config.ws.write_channel_capacity = 0;
        let err = RpcServer::new(config, registry(), Codec::new())
            .start()
            .await
            .unwrap_err();
        assert_matches!(err, ServerError::InvalidConfig(msg) if msg.contains("write_channel_capacity"));
    }

    #[tokio::test]
    async fn ws_url_uses_endpoint() {
        let handle = RpcServer::new(ServerConfig::default(), registry(), Codec::new())
            .start()
            .await
            .unwrap();
        assert!(handle.ws_url().starts_with("ws://127.0.0.1:"));
        assert!(handle.ws_url().ends_with("/websocket"));
        let token = handle.shutdown_token();
        token.cancel();
        handle.wait().await;
    }

    #[tokio::test]
    async fn unix_socket_file_removed_after_stop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.sock");
        let config = ServerConfig::default().with_listen(ListenAddr::Unix(path.clone()));
        let handle = RpcServer::new(config, registry(), Codec::new())
            .start()
            .await
            .unwrap();
        assert!(path.exists());
        assert!(handle.http_url().is_none());
        assert!(handle.shutdown(Some(Duration::from_secs(5))).await);
        assert!(!path.exists());
    }

    #[test]
    fn router_builds_without_listening() {
        let server = RpcServer::new(ServerConfig::default(), registry(), Codec::new());
        assert!(server.router().is_ok());
        assert_eq!(server.dispatcher().registry().len(), 1);
        assert!(!server.shutdown_token().is_cancelled());
    }
}
