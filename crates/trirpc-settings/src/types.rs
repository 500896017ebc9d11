//! Settings types and their compiled defaults.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use trirpc_core::ListenAddr;
use trirpc_core::logging::LogFormat;

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcSettings {
    /// Listener and HTTP settings.
    pub server: ServerSettings,
    /// Websocket session settings.
    pub websocket: WebSocketSettings,
    /// Log output.
    pub logging: LoggingSettings,
    /// Prometheus exporter.
    pub metrics: MetricsSettings,
}

/// Listener and HTTP transport settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// `tcp://host:port` or `unix:///path`.
    pub listen_address: String,
    /// Maximum simultaneous connections; 0 means unlimited.
    pub max_open_connections: usize,
    /// Request bodies above this size are rejected with 413.
    pub max_body_bytes: usize,
    /// Per-call timeout in milliseconds; 0 disables it.
    pub handler_timeout_ms: u64,
    /// TLS certificate (PEM).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_cert_file: Option<PathBuf>,
    /// TLS private key (PEM).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_key_file: Option<PathBuf>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_address: "tcp://127.0.0.1:26657".to_string(),
            max_open_connections: 0,
            max_body_bytes: 1 << 20,
            handler_timeout_ms: 60_000,
            tls_cert_file: None,
            tls_key_file: None,
        }
    }
}

impl ServerSettings {
    /// Parsed listen address.
    pub fn listen_addr(&self) -> Result<ListenAddr> {
        self.listen_address
            .parse()
            .map_err(|e| SettingsError::InvalidValue(format!("server.listen_address: {e}")))
    }

    /// Per-call timeout, `None` when disabled.
    pub fn handler_timeout(&self) -> Option<Duration> {
        (self.handler_timeout_ms > 0).then(|| Duration::from_millis(self.handler_timeout_ms))
    }

    /// Connection limit, `None` when unlimited.
    pub fn connection_limit(&self) -> Option<usize> {
        (self.max_open_connections > 0).then_some(self.max_open_connections)
    }
}

/// Websocket session settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketSettings {
    /// Upgrade path.
    pub endpoint: String,
    /// Outbound queue capacity per session.
    pub write_channel_capacity: usize,
    /// Deadline for a single frame write, in milliseconds.
    pub write_wait_ms: u64,
    /// Session closes after this long without any inbound frame, in milliseconds.
    pub read_wait_ms: u64,
    /// Ping interval in milliseconds; must be shorter than `read_wait_ms`.
    pub ping_period_ms: u64,
    /// Requests one session may have executing at once.
    pub max_inflight_requests: usize,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            endpoint: "/websocket".to_string(),
            write_channel_capacity: 1000,
            write_wait_ms: 10_000,
            read_wait_ms: 30_000,
            ping_period_ms: 27_000,
            max_inflight_requests: 64,
        }
    }
}

impl WebSocketSettings {
    /// Write deadline.
    pub fn write_wait(&self) -> Duration {
        Duration::from_millis(self.write_wait_ms)
    }

    /// Read deadline.
    pub fn read_wait(&self) -> Duration {
        Duration::from_millis(self.read_wait_ms)
    }

    /// Ping interval.
    pub fn ping_period(&self) -> Duration {
        Duration::from_millis(self.ping_period_ms)
    }
}

/// Log output settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Line format.
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}

/// Prometheus exporter settings.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSettings {
    /// Install the recorder and serve `GET /metrics`.
    pub enabled: bool,
}

impl RpcSettings {
    /// Reject combinations the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        let _ = self.server.listen_addr()?;
        if self.server.max_body_bytes == 0 {
            return Err(SettingsError::InvalidValue(
                "server.max_body_bytes must be positive".into(),
            ));
        }
        if self.server.tls_cert_file.is_some() != self.server.tls_key_file.is_some() {
            return Err(SettingsError::InvalidValue(
                "server.tls_cert_file and server.tls_key_file must be set together".into(),
            ));
        }

        let ws = &self.websocket;
        if !ws.endpoint.starts_with('/') {
            return Err(SettingsError::InvalidValue(format!(
                "websocket.endpoint must start with '/', got {:?}",
                ws.endpoint
            )));
        }
        if ws.write_channel_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "websocket.write_channel_capacity must be positive".into(),
            ));
        }
        if ws.max_inflight_requests == 0 {
            return Err(SettingsError::InvalidValue(
                "websocket.max_inflight_requests must be positive".into(),
            ));
        }
        if ws.write_wait_ms == 0 || ws.ping_period_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "websocket.write_wait_ms and websocket.ping_period_ms must be positive".into(),
            ));
        }
        if ws.ping_period_ms >= ws.read_wait_ms {
            return Err(SettingsError::InvalidValue(format!(
                "websocket.ping_period_ms ({}) must be less than websocket.read_wait_ms ({})",
                ws.ping_period_ms, ws.read_wait_ms
            )));
        }
        Ok(())
    }
}
