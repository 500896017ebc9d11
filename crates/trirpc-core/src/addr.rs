//! `proto://address` parsing for listeners and dialers.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Malformed listen address.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AddrError {
    /// No `://` separator.
    #[error("invalid listening address {0} (use fully formed addresses, including the tcp:// or unix:// prefix)")]
    MissingScheme(String),

    /// Scheme other than `tcp` or `unix`.
    #[error("unsupported scheme `{0}` (expected tcp or unix)")]
    UnsupportedScheme(String),

    /// Nothing after the scheme.
    #[error("empty address after `{0}://`")]
    Empty(String),
}

/// Where to listen or dial.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ListenAddr {
    /// `tcp://host:port`.
    Tcp(String),
    /// `unix:///path/to.sock`.
    Unix(PathBuf),
}

impl ListenAddr {
    /// Base URL for HTTP clients; `None` for unix sockets.
    pub fn http_base(&self) -> Option<String> {
        match self {
            Self::Tcp(hostport) => Some(format!("http://{hostport}")),
            Self::Unix(_) => None,
        }
    }

    /// Websocket URL for `endpoint`. Unix sockets use a placeholder host.
    pub fn ws_url(&self, endpoint: &str) -> String {
        match self {
            Self::Tcp(hostport) => format!("ws://{hostport}{endpoint}"),
            Self::Unix(_) => format!("ws://localhost{endpoint}"),
        }
    }
}

impl FromStr for ListenAddr {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| AddrError::MissingScheme(s.to_owned()))?;
        if rest.is_empty() {
            return Err(AddrError::Empty(scheme.to_owned()));
        }
        match scheme {
            "tcp" => Ok(Self::Tcp(rest.to_owned())),
            "unix" => Ok(Self::Unix(PathBuf::from(rest))),
            other => Err(AddrError::UnsupportedScheme(other.to_owned())),
        }
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(hostport) => write!(f, "tcp://{hostport}"),
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_tcp() {
        let addr: ListenAddr = "tcp://127.0.0.1:26657".parse().unwrap();
        assert_eq!(addr, ListenAddr::Tcp("127.0.0.1:26657".into()));
        assert_eq!(addr.http_base().unwrap(), "http://127.0.0.1:26657");
        assert_eq!(addr.ws_url("/websocket"), "ws://127.0.0.1:26657/websocket");
    }

    #[test]
    fn parse_unix() {
        let addr: ListenAddr = "unix:///tmp/rpc.sock".parse().unwrap();
        assert_eq!(addr, ListenAddr::Unix(PathBuf::from("/tmp/rpc.sock")));
        assert!(addr.http_base().is_none());
        assert_eq!(addr.to_string(), "unix:///tmp/rpc.sock");
    }

    #[test]
    fn missing_scheme() {
        let err = "127.0.0.1:80".parse::<ListenAddr>().unwrap_err();
        assert!(matches!(err, AddrError::MissingScheme(_)));
    }

    #[test]
    fn unsupported_scheme() {
        let err = "udp://1.2.3.4:5".parse::<ListenAddr>().unwrap_err();
        assert_eq!(err, AddrError::UnsupportedScheme("udp".into()));
    }

    #[test]
    fn empty_rest() {
        assert_eq!(
            "tcp://".parse::<ListenAddr>().unwrap_err(),
            AddrError::Empty("tcp".into())
        );
    }

    #[test]
    fn display_roundtrip() {
        for s in ["tcp://0.0.0.0:1", "unix://relative.sock"] {
            assert_eq!(s.parse::<ListenAddr>().unwrap().to_string(), s);
        }
    }
}
