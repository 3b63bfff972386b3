//! Outbound TCP transport with bounded connect and aggressive keepalive
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpSocket, TcpStream};
use tracing::{debug, warn};

/// Idle time, probe interval, and probe count for keepalive. Middleboxes
/// that silently drop state are noticed within a couple of minutes.
const KEEPALIVE_IDLE: Duration = Duration::from_secs(10);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
const KEEPALIVE_PROBES: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The camouflaged tunnel to a rendezvous endpoint.
    Remote,
    /// The plain connection to the local administrative service.
    Local,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Remote => write!(f, "remote"),
            Role::Local => write!(f, "local"),
        }
    }
}

/// An established byte stream. Dropping it closes the socket.
#[derive(Debug)]
pub struct Connection {
    role: Role,
    peer: SocketAddr,
    stream: TcpStream,
}

impl Connection {
    pub(crate) fn new(role: Role, peer: SocketAddr, stream: TcpStream) -> Self {
        Self { role, peer, stream }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

/// Opens a TCP connection to a rendezvous address. The connect is abandoned,
/// and the socket closed, once `timeout` passes without an answer.
pub async fn connect(
    address: Ipv4Addr,
    port: u16,
    timeout: Duration,
) -> Result<Connection, ConnError> {
    let peer = SocketAddr::from((address, port));
    let socket = TcpSocket::new_v4().map_err(ConnError::SocketCreateFailed)?;

    let stream = match tokio::time::timeout(timeout, socket.connect(peer)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => return Err(ConnError::from_connect(err)),
        Err(_) => return Err(ConnError::Timeout(timeout)),
    };

    debug!(%peer, "transport connected");
    apply_keepalive(&stream);
    Ok(Connection::new(Role::Remote, peer, stream))
}

/// Enables keepalive and tightens its timers. Each option is set on its
/// own so one unsupported knob does not cost us the others.
fn apply_keepalive(stream: &TcpStream) {
    let sock = SockRef::from(stream);

    if let Err(err) = sock.set_keepalive(true) {
        warn!(error = %err, "SO_KEEPALIVE failed");
    }
    if let Err(err) = sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(KEEPALIVE_IDLE)) {
        warn!(error = %err, "TCP_KEEPIDLE failed");
    }
    #[cfg(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "freebsd"
    ))]
    {
        let interval = TcpKeepalive::new().with_interval(KEEPALIVE_INTERVAL);
        if let Err(err) = sock.set_tcp_keepalive(&interval) {
            warn!(error = %err, "TCP_KEEPINTVL failed");
        }
        let retries = TcpKeepalive::new().with_retries(KEEPALIVE_PROBES);
        if let Err(err) = sock.set_tcp_keepalive(&retries) {
            warn!(error = %err, "TCP_KEEPCNT failed");
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnError {
    #[error("could not create socket: {0}")]
    SocketCreateFailed(#[source] io::Error),
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection refused: {0}")]
    Refused(#[source] io::Error),
    #[error("destination unreachable: {0}")]
    Unreachable(#[source] io::Error),
}

impl ConnError {
    pub(crate) fn from_connect(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted => ConnError::Refused(err),
            _ => ConnError::Unreachable(err),
        }
    }
}
