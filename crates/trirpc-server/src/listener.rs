//! TCP / unix listener with an optional cap on open connections.
//!
//! A permit is taken from the semaphore before `accept`, and travels with the
//! accepted stream; dropping the stream frees the slot.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::extract::connect_info::Connected;
use axum::serve::{IncomingStream, Listener};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error};
use trirpc_core::ListenAddr;

/// Address of an accepted peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerAddr {
    /// TCP peer.
    Tcp(std::net::SocketAddr),
    /// Unix socket peer; usually unnamed.
    Unix(Option<PathBuf>),
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "{addr}"),
            Self::Unix(Some(path)) => write!(f, "unix:{}", path.display()),
            Self::Unix(None) => f.write_str("unix"),
        }
    }
}

impl PeerAddr {
    /// As a listen address (meaningful for the server's own local address).
    pub fn to_listen_addr(&self) -> ListenAddr {
        match self {
            Self::Tcp(addr) => ListenAddr::Tcp(addr.to_string()),
            Self::Unix(path) => ListenAddr::Unix(path.clone().unwrap_or_default()),
        }
    }
}

impl Connected<IncomingStream<'_, RpcListener>> for PeerAddr {
    fn connect_info(stream: IncomingStream<'_, RpcListener>) -> Self {
        stream.remote_addr().clone()
    }
}

enum Socket {
    Tcp(TcpListener),
    Unix(UnixListener, PathBuf),
}

/// Listener handed to `axum::serve`.
pub struct RpcListener {
    socket: Socket,
    limit: Option<Arc<Semaphore>>,
}

impl fmt::Debug for RpcListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.socket {
            Socket::Tcp(_) => "tcp",
            Socket::Unix(..) => "unix",
        };
        f.debug_struct("RpcListener")
            .field("kind", &kind)
            .field("limit", &self.limit.as_ref().map(|s| s.available_permits()))
            .finish()
    }
}

impl RpcListener {
    /// Bind `addr`, allowing at most `max_open` simultaneous connections.
    pub async fn bind(addr: &ListenAddr, max_open: Option<usize>) -> io::Result<Self> {
        let socket = match addr {
            ListenAddr::Tcp(hostport) => Socket::Tcp(TcpListener::bind(hostport.as_str()).await?),
            ListenAddr::Unix(path) => Socket::Unix(UnixListener::bind(path)?, path.clone()),
        };
        Ok(Self {
            socket,
            limit: max_open.map(|n| Arc::new(Semaphore::new(n))),
        })
    }

    /// Path of the unix socket file, if any.
    pub fn unix_path(&self) -> Option<&PathBuf> {
        match &self.socket {
            Socket::Unix(_, path) => Some(path),
            Socket::Tcp(_) => None,
        }
    }

    async fn accept_raw(&self) -> io::Result<(Stream, PeerAddr)> {
        match &self.socket {
            Socket::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                let _ = stream.set_nodelay(true);
                Ok((Stream::Tcp(stream), PeerAddr::Tcp(addr)))
            }
            Socket::Unix(listener, _) => {
                let (stream, addr) = listener.accept().await?;
                let path = addr.as_pathname().map(PathBuf::from);
                Ok((Stream::Unix(stream), PeerAddr::Unix(path)))
            }
        }
    }
}

impl Listener for RpcListener {
    type Io = LimitedStream;
    type Addr = PeerAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            let permit = match &self.limit {
                Some(sem) => match Arc::clone(sem).acquire_owned().await {
                    Ok(permit) => Some(permit),
                    // The semaphore is never closed.
                    Err(_) => None,
                },
                None => None,
            };

            match self.accept_raw().await {
                Ok((stream, addr)) => {
                    debug!(peer = %addr, "accepted connection");
                    return (
                        LimitedStream {
                            stream,
                            _permit: permit,
                        },
                        addr,
                    );
                }
                Err(e) if is_connection_error(&e) => {}
                Err(e) => {
                    // Usually fd exhaustion; back off instead of spinning.
                    error!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        match &self.socket {
            Socket::Tcp(listener) => listener.local_addr().map(PeerAddr::Tcp),
            Socket::Unix(_, path) => Ok(PeerAddr::Unix(Some(path.clone()))),
        }
    }
}

fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

/// Accepted stream holding its connection slot.
pub struct LimitedStream {
    stream: Stream,
    _permit: Option<OwnedSemaphorePermit>,
}

impl AsyncRead for LimitedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.get_mut().stream {
            Stream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Stream::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for LimitedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut self.get_mut().stream {
            Stream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Stream::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        match &mut self.get_mut().stream {
            Stream::Tcp(s) => Pin::new(s).poll_write_vectored(cx, bufs),
            Stream::Unix(s) => Pin::new(s).poll_write_vectored(cx, bufs),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match &self.stream {
            Stream::Tcp(s) => s.is_write_vectored(),
            Stream::Unix(s) => s.is_write_vectored(),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().stream {
            Stream::Tcp(s) => Pin::new(s).poll_flush(cx),
            Stream::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().stream {
            Stream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Stream::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}
