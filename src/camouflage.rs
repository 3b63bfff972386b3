//! The opening exchange that makes a lifeline tunnel look like a browser
//! performing a WebSocket upgrade.
//!
//! The far end routes on the `X-LF-Name` header and answers with a `101`
//! status line followed by whatever headers it likes (it may pad them to
//! get past inspecting firewalls). Everything after the blank line that
//! closes those headers is tunnel payload.

use std::io;
use std::time::Duration;

use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tracing::debug;

pub const REQUEST_PATH: &str = "/lifeline/1";
pub const EXPECTED_STATUS: &[u8] = b"HTTP/1.1 101 Switching Protocols";

const USER_AGENT: &str = concat!(
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 ",
    "(KHTML, like Gecko) Chrome/51.0.2704.63 Safari/537.36"
);
const WEBSOCKET_KEY: &str = "x3JJHMbDL1EzLkh9GBhXDw==";
const WEBSOCKET_PROTOCOL: &str = "chat, superchat";

/// Upper bound on status line plus headers.
pub const MAX_HEADER_BYTES: usize = 64 * 1024;

/// A connection past the handshake. Bytes the server sent right behind its
/// headers sit in the buffer and are read before anything else.
pub type Camouflaged<S> = BufReader<S>;

pub type HandshakeOutcome<S> = Result<Camouflaged<S>, HandshakeError>;

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("sending upgrade request failed: {0}")]
    TransportFailed(#[source] io::Error),
    #[error("unexpected status line {0:?}")]
    UnexpectedStatusLine(String),
    #[error("connection closed during {0}")]
    PrematureClose(&'static str),
    #[error("response headers exceed {MAX_HEADER_BYTES} bytes")]
    HeaderOverflow,
    #[error("no upgrade response within {0:?}")]
    Timeout(Duration),
}

/// The identity announced in `X-LF-Name` when none is configured.
pub fn default_identity() -> String {
    format!("legacy.{}", local_hostname())
}

fn local_hostname() -> String {
    match nix::unistd::gethostname() {
        Ok(name) if !name.is_empty() => name.to_string_lossy().into_owned(),
        _ => "?".to_string(),
    }
}

pub fn build_request(remote_name: &str, identity: &str) -> String {
    format!(
        "GET {REQUEST_PATH} HTTP/1.1\r\n\
         Host: {remote_name}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         User-Agent: {USER_AGENT}\r\n\
         Sec-WebSocket-Key: {WEBSOCKET_KEY}\r\n\
         Sec-WebSocket-Protocol: {WEBSOCKET_PROTOCOL}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         X-LF-Name: {identity}\r\n\
         \r\n"
    )
}

/// Runs the upgrade exchange over `conn`. With a `timeout` the whole
/// exchange must finish in time; without one a server that accepts and
/// never answers blocks us indefinitely.
pub async fn perform<S>(
    conn: S,
    remote_name: &str,
    identity: &str,
    timeout: Option<Duration>,
) -> HandshakeOutcome<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let exchange = exchange(conn, remote_name, identity);
    match timeout {
        Some(limit) => tokio::time::timeout(limit, exchange)
            .await
            .unwrap_or(Err(HandshakeError::Timeout(limit))),
        None => exchange.await,
    }
}

async fn exchange<S>(mut conn: S, remote_name: &str, identity: &str) -> HandshakeOutcome<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = build_request(remote_name, identity);
    conn.write_all(request.as_bytes())
        .await
        .map_err(HandshakeError::TransportFailed)?;
    conn.flush().await.map_err(HandshakeError::TransportFailed)?;

    let mut reader = BufReader::new(conn);
    let mut scanner = HeaderScanner::default();
    scanner.read_status_line(&mut reader).await?;
    scanner.skip_headers(&mut reader).await?;
    debug!(remote_name, header_bytes = scanner.consumed, "upgrade response accepted");
    Ok(reader)
}

/// Line-oriented reader for the response head. Tracks how much of the
/// header budget has been used.
#[derive(Default)]
struct HeaderScanner {
    line: Vec<u8>,
    consumed: usize,
}

impl HeaderScanner {
    /// Reads one line including its `\n`. Returns `false` on end of stream.
    async fn next_line<R>(
        &mut self,
        reader: &mut R,
        phase: &'static str,
    ) -> Result<bool, HandshakeError>
    where
        R: AsyncBufRead + Unpin,
    {
        self.line.clear();
        let remaining = (MAX_HEADER_BYTES - self.consumed) as u64 + 1;
        let read = (&mut *reader)
            .take(remaining)
            .read_until(b'\n', &mut self.line)
            .await
            .map_err(|_| HandshakeError::PrematureClose(phase))?;
        self.consumed += read;
        if self.consumed > MAX_HEADER_BYTES {
            return Err(HandshakeError::HeaderOverflow);
        }
        Ok(self.line.ends_with(b"\n"))
    }

    async fn read_status_line<R>(&mut self, reader: &mut R) -> Result<(), HandshakeError>
    where
        R: AsyncBufRead + Unpin,
    {
        let complete = self.next_line(reader, "status line").await?;
        if !self.line.starts_with(EXPECTED_STATUS) {
            if !complete && EXPECTED_STATUS.starts_with(&self.line) {
                return Err(HandshakeError::PrematureClose("status line"));
            }
            let shown = String::from_utf8_lossy(trim_terminator(&self.line)).into_owned();
            return Err(HandshakeError::UnexpectedStatusLine(shown));
        }
        if !complete {
            return Err(HandshakeError::PrematureClose("response headers"));
        }
        Ok(())
    }

    /// Discards header lines up to and including the first blank one.
    async fn skip_headers<R>(&mut self, reader: &mut R) -> Result<(), HandshakeError>
    where
        R: AsyncBufRead + Unpin,
    {
        loop {
            if !self.next_line(reader, "response headers").await? {
                return Err(HandshakeError::PrematureClose("response headers"));
            }
            if trim_terminator(&self.line).is_empty() {
                return Ok(());
            }
        }
    }
}

fn trim_terminator(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, DuplexStream};

    const UPGRADE: &[u8] = b"HTTP/1.1 101 Switching Protocols\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        \r\n";

    /// Reads the client's request off the server end of the pipe.
    async fn read_request(server: &mut DuplexStream) -> String {
        let mut request = Vec::new();
        let mut byte = [0u8; 1];
        while !request.ends_with(b"\r\n\r\n") {
            server.read_exact(&mut byte).await.unwrap();
            request.push(byte[0]);
        }
        String::from_utf8(request).unwrap()
    }

    async fn serve(response: &'static [u8]) -> HandshakeOutcome<DuplexStream> {
        let (client, mut server) = duplex(4096);
        let server_task = tokio::spawn(async move {
            read_request(&mut server).await;
            server.write_all(response).await.unwrap();
        });
        let timeout = Some(Duration::from_secs(2));
        let outcome = perform(client, "relay.example", "legacy.box", timeout).await;
        server_task.await.unwrap();
        outcome
    }

    #[test]
    fn test_request_has_upgrade_shape() {
        let request = build_request("relay.example", "legacy.box");
        let lines: Vec<&str> = request.split("\r\n").collect();

        assert_eq!(lines[0], "GET /lifeline/1 HTTP/1.1");
        assert_eq!(lines[1], "Host: relay.example");
        assert!(lines.contains(&"Upgrade: websocket"));
        assert!(lines.contains(&"Connection: Upgrade"));
        assert!(lines.contains(&"Sec-WebSocket-Key: x3JJHMbDL1EzLkh9GBhXDw=="));
        assert!(lines.contains(&"Sec-WebSocket-Version: 13"));
        assert!(lines.contains(&"X-LF-Name: legacy.box"));
        assert!(request.ends_with("X-LF-Name: legacy.box\r\n\r\n"));
    }

    #[test]
    fn test_default_identity_is_prefixed() {
        let identity = default_identity();
        assert!(identity.starts_with("legacy."));
        assert!(identity.len() > "legacy.".len());

        let hostname = nix::unistd::gethostname().unwrap();
        assert_eq!(identity, format!("legacy.{}", hostname.to_string_lossy()));
    }

    #[tokio::test]
    async fn test_upgrade_leaves_stream_at_payload() {
        let (client, mut server) = duplex(4096);
        let server_task = tokio::spawn(async move {
            let request = read_request(&mut server).await;
            let mut response = UPGRADE.to_vec();
            response.extend_from_slice(b"hello");
            server.write_all(&response).await.unwrap();
            (request, server)
        });

        let mut tunnel = perform(client, "relay.example", "legacy.box", None).await.unwrap();
        let (request, _server) = server_task.await.unwrap();
        assert!(request.starts_with("GET /lifeline/1 HTTP/1.1\r\nHost: relay.example\r\n"));

        let mut payload = [0u8; 5];
        tunnel.read_exact(&mut payload).await.unwrap();
        assert_eq!(&payload, b"hello");
    }

    #[tokio::test]
    async fn test_bare_newline_blank_line_ends_headers() {
        let (client, mut server) = duplex(4096);
        tokio::spawn(async move {
            read_request(&mut server).await;
            server
                .write_all(b"HTTP/1.1 101 Switching Protocols\nX-Pad: aaaa\n\nSSH-2.0")
                .await
                .unwrap();
            // keep the pipe open until the client is done
            let mut sink = Vec::new();
            let _ = server.read_to_end(&mut sink).await;
        });

        let mut tunnel = perform(client, "relay.example", "legacy.box", None).await.unwrap();
        let mut payload = [0u8; 7];
        tunnel.read_exact(&mut payload).await.unwrap();
        assert_eq!(&payload, b"SSH-2.0");
    }

    #[tokio::test]
    async fn test_padding_lines_do_not_end_headers_early() {
        let (client, mut server) = duplex(4096);
        tokio::spawn(async move {
            read_request(&mut server).await;
            server
                .write_all(
                    b"HTTP/1.1 101 Switching Protocols\r\nX-Pad: \r\r\r\r\nX-More: 1\r\n\r\n!",
                )
                .await
                .unwrap();
            let mut sink = Vec::new();
            let _ = server.read_to_end(&mut sink).await;
        });

        let mut tunnel = perform(client, "relay.example", "legacy.box", None).await.unwrap();
        let mut payload = [0u8; 1];
        tunnel.read_exact(&mut payload).await.unwrap();
        assert_eq!(&payload, b"!");
    }

    #[tokio::test]
    async fn test_other_status_is_rejected() {
        let outcome = serve(b"HTTP/1.1 200 OK\r\n\r\n").await;
        match outcome {
            Err(HandshakeError::UnexpectedStatusLine(line)) => assert_eq!(line, "HTTP/1.1 200 OK"),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_short_status_is_premature_close() {
        let outcome = serve(b"HTTP/1.1 101 Swi").await;
        assert!(matches!(outcome, Err(HandshakeError::PrematureClose("status line"))));
    }

    #[tokio::test]
    async fn test_close_inside_headers_is_premature_close() {
        let outcome = serve(b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n").await;
        assert!(matches!(outcome, Err(HandshakeError::PrematureClose("response headers"))));
    }

    #[tokio::test]
    async fn test_endless_headers_overflow() {
        let (client, mut server) = duplex(64 * 1024);
        tokio::spawn(async move {
            read_request(&mut server).await;
            server.write_all(b"HTTP/1.1 101 Switching Protocols\r\n").await.unwrap();
            let pad = [b'x'; 1024];
            loop {
                if server.write_all(&pad).await.is_err() {
                    return;
                }
            }
        });

        let timeout = Some(Duration::from_secs(5));
        let outcome = perform(client, "relay.example", "legacy.box", timeout).await;
        assert!(matches!(outcome, Err(HandshakeError::HeaderOverflow)));
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let (client, mut server) = duplex(4096);
        tokio::spawn(async move {
            read_request(&mut server).await;
            let mut sink = Vec::new();
            let _ = server.read_to_end(&mut sink).await;
        });

        let timeout = Some(Duration::from_millis(100));
        let outcome = perform(client, "relay.example", "legacy.box", timeout).await;
        assert!(matches!(outcome, Err(HandshakeError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_write_failure_is_transport_failure() {
        let (client, server) = duplex(64);
        drop(server);
        let outcome = perform(client, "relay.example", "legacy.box", None).await;
        assert!(matches!(outcome, Err(HandshakeError::TransportFailed(_))));
    }
}
