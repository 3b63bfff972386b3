use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Bytes moved per wakeup.
pub const CHUNK_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Remote,
    Local,
}

impl Side {
    fn other(self) -> Self {
        match self {
            Side::Remote => Side::Local,
            Side::Local => Side::Remote,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Remote => write!(f, "remote"),
            Side::Local => write!(f, "local"),
        }
    }
}

/// Why a forwarding loop stopped.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("{0} side closed")]
    Closed(Side),
    #[error("{side} side failed: {source}")]
    Io {
        side: Side,
        #[source]
        source: io::Error,
    },
    #[error("no traffic for {0:?}")]
    IdleTimeout(Duration),
}

#[derive(Debug)]
pub struct ForwardReport {
    pub remote_to_local: u64,
    pub local_to_remote: u64,
    pub reason: ForwardError,
}

/// Relays bytes between the tunnel and the local service until either side
/// closes or fails. Both streams are consumed and closed on return.
pub async fn forward<R, L>(
    mut remote: R,
    mut local: L,
    idle_timeout: Option<Duration>,
) -> ForwardReport
where
    R: AsyncRead + AsyncWrite + Unpin,
    L: AsyncRead + AsyncWrite + Unpin,
{
    let mut remote_buf = [0u8; CHUNK_SIZE];
    let mut local_buf = [0u8; CHUNK_SIZE];
    let mut remote_to_local = 0u64;
    let mut local_to_remote = 0u64;

    let reason = loop {
        let ready = async {
            tokio::select! {
                read = remote.read(&mut remote_buf) => (Side::Remote, read),
                read = local.read(&mut local_buf) => (Side::Local, read),
            }
        };
        let (side, read) = match idle_timeout {
            Some(limit) => match tokio::time::timeout(limit, ready).await {
                Ok(ready) => ready,
                Err(_) => break ForwardError::IdleTimeout(limit),
            },
            None => ready.await,
        };

        let n = match read {
            Ok(0) => break ForwardError::Closed(side),
            Ok(n) => n,
            Err(source) => break ForwardError::Io { side, source },
        };

        let written = match side {
            Side::Remote => relay(&mut local, &remote_buf[..n]).await,
            Side::Local => relay(&mut remote, &local_buf[..n]).await,
        };
        if let Err(source) = written {
            break ForwardError::Io {
                side: side.other(),
                source,
            };
        }
        match side {
            Side::Remote => remote_to_local += n as u64,
            Side::Local => local_to_remote += n as u64,
        }
    };

    debug!(remote_to_local, local_to_remote, reason = %reason, "forwarding stopped");
    ForwardReport {
        remote_to_local,
        local_to_remote,
        reason,
    }
}

async fn relay<W: AsyncWrite + Unpin>(dest: &mut W, chunk: &[u8]) -> io::Result<()> {
    dest.write_all(chunk).await?;
    dest.flush().await
}
