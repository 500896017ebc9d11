//! Server configuration, resolved from [`RpcSettings`].

use std::path::PathBuf;
use std::time::Duration;

use trirpc_core::ListenAddr;
use trirpc_settings::RpcSettings;

use crate::errors::ServerError;

/// Websocket session tuning.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WsConfig {
    /// Upgrade path.
    pub endpoint: String,
    /// Outbound queue capacity per session.
    pub write_channel_capacity: usize,
    /// Deadline for one frame write.
    pub write_wait: Duration,
    /// Silence after which a session is closed.
    pub read_wait: Duration,
    /// Interval between server pings.
    pub ping_period: Duration,
    /// Requests one session may have executing at once; extra requests are
    /// answered with an error without being dispatched.
    pub max_inflight_requests: usize,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            endpoint: "/websocket".into(),
            write_channel_capacity: 1000,
            write_wait: Duration::from_secs(10),
            read_wait: Duration::from_secs(30),
            ping_period: Duration::from_secs(27),
            max_inflight_requests: 64,
        }
    }
}

impl WsConfig {
    /// Reject values a session cannot run with.
    pub fn validate(&self) -> Result<(), ServerError> {
        let invalid = |msg: String| Err(ServerError::InvalidConfig(msg));
        if !self.endpoint.starts_with('/') {
            return invalid(format!(
                "websocket endpoint must start with '/', got {:?}",
                self.endpoint
            ));
        }
        if self.write_channel_capacity == 0 {
            return invalid("websocket write_channel_capacity must be positive".into());
        }
        if self.max_inflight_requests == 0 {
            return invalid("websocket max_inflight_requests must be positive".into());
        }
        if self.write_wait.is_zero() || self.ping_period.is_zero() {
            return invalid("websocket write_wait and ping_period must be positive".into());
        }
        if self.ping_period >= self.read_wait {
            return invalid(format!(
                "websocket ping_period ({:?}) must be less than read_wait ({:?})",
                self.ping_period, self.read_wait
            ));
        }
        Ok(())
    }
}

/// TLS certificate and key paths.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlsFiles {
    /// PEM certificate.
    pub cert: PathBuf,
    /// PEM private key.
    pub key: PathBuf,
}

/// Configuration for an [`RpcServer`](crate::server::RpcServer).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    /// Where to listen.
    pub listen: ListenAddr,
    /// Maximum simultaneous connections (`None` = unlimited).
    pub max_open_connections: Option<usize>,
    /// Maximum request body size.
    pub max_body_bytes: usize,
    /// Per-call timeout (`None` = no limit).
    pub handler_timeout: Option<Duration>,
    /// TLS files, if configured.
    pub tls: Option<TlsFiles>,
    /// Websocket sessions.
    pub ws: WsConfig,
    /// Serve `GET /metrics`.
    pub metrics_enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: ListenAddr::Tcp("127.0.0.1:0".into()),
            max_open_connections: None,
            max_body_bytes: 1 << 20,
            handler_timeout: Some(Duration::from_secs(60)),
            tls: None,
            ws: WsConfig::default(),
            metrics_enabled: false,
        }
    }
}

impl ServerConfig {
    /// Resolve validated settings into a server configuration.
    pub fn from_settings(settings: &RpcSettings) -> Result<Self, ServerError> {
        settings.validate()?;
        let server = &settings.server;
        let ws = &settings.websocket;
        let tls = match (&server.tls_cert_file, &server.tls_key_file) {
            (Some(cert), Some(key)) => Some(TlsFiles {
                cert: cert.clone(),
                key: key.clone(),
            }),
            _ => None,
        };
        Ok(Self {
            listen: server.listen_address.parse()?,
            max_open_connections: server.connection_limit(),
            max_body_bytes: server.max_body_bytes,
            handler_timeout: server.handler_timeout(),
            tls,
            ws: WsConfig {
                endpoint: ws.endpoint.clone(),
                write_channel_capacity: ws.write_channel_capacity,
                write_wait: ws.write_wait(),
                read_wait: ws.read_wait(),
                ping_period: ws.ping_period(),
                max_inflight_requests: ws.max_inflight_requests,
            },
            metrics_enabled: settings.metrics.enabled,
        })
    }

    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.max_body_bytes == 0 {
            return Err(ServerError::InvalidConfig(
                "max_body_bytes must be positive".into(),
            ));
        }
        if self.max_open_connections == Some(0) {
            return Err(ServerError::InvalidConfig(
                "max_open_connections must be positive when set".into(),
            ));
        }
        self.ws.validate()
    }

    /// Same configuration, listening elsewhere.
    #[must_use]
    pub fn with_listen(mut self, listen: ListenAddr) -> Self {
        self.listen = listen;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn default_listens_on_ephemeral_port() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.listen, ListenAddr::Tcp("127.0.0.1:0".into()));
        assert_eq!(cfg.max_body_bytes, 1_048_576);
        assert!(cfg.tls.is_none());
    }

    #[test]
    fn default_ws_matches_settings_defaults() {
        let from_settings = ServerConfig::from_settings(&RpcSettings::default()).unwrap();
        assert_eq!(from_settings.ws, WsConfig::default());
        assert_eq!(
            from_settings.listen,
            ListenAddr::Tcp("127.0.0.1:26657".into())
        );
    }

    #[test]
    fn settings_carry_over() {
        let mut settings = RpcSettings::default();
        settings.server.listen_address = "unix:///tmp/node.sock".into();
        settings.server.max_open_connections = 12;
        settings.server.handler_timeout_ms = 0;
        settings.server.tls_cert_file = Some("c.pem".into());
        settings.server.tls_key_file = Some("k.pem".into());
        settings.metrics.enabled = true;

        let cfg = ServerConfig::from_settings(&settings).unwrap();
        assert_eq!(cfg.listen, ListenAddr::Unix("/tmp/node.sock".into()));
        assert_eq!(cfg.max_open_connections, Some(12));
        assert_eq!(cfg.handler_timeout, None);
        assert_eq!(cfg.tls.unwrap().key, PathBuf::from("k.pem"));
        assert!(cfg.metrics_enabled);
    }

    #[test]
    fn invalid_settings_rejected() {
        let mut settings = RpcSettings::default();
        settings.websocket.write_channel_capacity = 0;
        let err = ServerConfig::from_settings(&settings).unwrap_err();
        assert_matches!(err, ServerError::Settings(_));
    }

    #[test]
    fn defaults_validate() {
        ServerConfig::default().validate().unwrap();
        WsConfig::default().validate().unwrap();
    }

    #[test]
    fn unusable_ws_values_rejected() {
        let cases = [
            WsConfig {
                endpoint: "ws".into(),
                ..WsConfig::default()
            },
            WsConfig {
                write_channel_capacity: 0,
                ..WsConfig::default()
            },
            WsConfig {
                max_inflight_requests: 0,
                ..WsConfig::default()
            },
            WsConfig {
                ping_period: Duration::ZERO,
                ..WsConfig::default()
            },
            WsConfig {
                write_wait: Duration::ZERO,
                ..WsConfig::default()
            },
            WsConfig {
                ping_period: Duration::from_secs(30),
                read_wait: Duration::from_secs(30),
                ..WsConfig::default()
            },
        ];
        for ws in cases {
            let err = ws.validate().unwrap_err();
            assert_matches!(err, ServerError::InvalidConfig(_), "{ws:?}");
        }
    }

    #[test]
    fn unusable_server_values_rejected() {
        let cfg = ServerConfig {
            max_body_bytes: 0,
            ..ServerConfig::default()
        };
        assert_matches!(cfg.validate(), Err(ServerError::InvalidConfig(_)));

        let cfg = ServerConfig {
            max_open_connections: Some(0),
            ..ServerConfig::default()
        };
        assert_matches!(cfg.validate(), Err(ServerError::InvalidConfig(_)));
    }

    #[test]
    fn with_listen_overrides() {
        let cfg = ServerConfig::default().with_listen(ListenAddr::Tcp("0.0.0.0:80".into()));
        assert_eq!(cfg.listen.to_string(), "tcp://0.0.0.0:80");
    }
}
