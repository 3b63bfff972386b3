use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::debug;

use crate::transport::{ConnError, Connection, Role};

/// Conventional administrative port on the host, the local SSH daemon.
pub const DEFAULT_LOCAL_PORT: u16 = 22;

/// Connects to the administrative service on loopback. Without a timeout
/// the operating system's connect timeout applies.
pub async fn connect_local(port: u16, timeout: Option<Duration>) -> Result<Connection, ConnError> {
    let peer = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    debug!(%peer, "connecting to local service");

    let connecting = TcpStream::connect(peer);
    let stream = match timeout {
        Some(limit) => tokio::time::timeout(limit, connecting)
            .await
            .map_err(|_| ConnError::Timeout(limit))?,
        None => connecting.await,
    }
    .map_err(ConnError::from_connect)?;

    Ok(Connection::new(Role::Local, peer, stream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connects_to_loopback_service() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let conn = connect_local(port, None).await.unwrap();
        assert_eq!(conn.role(), Role::Local);
        assert_eq!(conn.peer(), SocketAddr::from((Ipv4Addr::LOCALHOST, port)));
    }

    #[tokio::test]
    async fn test_missing_service_is_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = connect_local(port, Some(Duration::from_secs(1))).await;
        assert!(matches!(result, Err(ConnError::Refused(_))), "{result:?}");
    }
}
