//! Server error types.

use thiserror::Error;
use trirpc_core::addr::AddrError;
use trirpc_settings::SettingsError;

/// Errors raised while building or starting a server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Binding or accepting on the listener failed.
    #[error("listener error: {0}")]
    Io(#[from] std::io::Error),

    /// The listen address could not be parsed.
    #[error("invalid listen address: {0}")]
    Addr(#[from] AddrError),

    /// Settings failed to load or validate.
    #[error(transparent)]
    Settings(#[from] SettingsError),

    /// TLS files were configured, but this build serves plaintext only.
    #[error("TLS is not supported by this server (cert: {cert}, key: {key})")]
    TlsUnsupported {
        /// Configured certificate path.
        cert: String,
        /// Configured key path.
        key: String,
    },

    /// A configuration value the server cannot run with.
    #[error("invalid server configuration: {0}")]
    InvalidConfig(String),

    /// Two routes would share a path.
    #[error("route conflict: {path} is registered twice")]
    RouteConflict {
        /// Contested path.
        path: String,
    },

    /// The Prometheus recorder could not be installed.
    #[error("metrics recorder: {0}")]
    Metrics(String),
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
