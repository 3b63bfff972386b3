use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::dns::{parse_answers, DnsError, DnsQuery, DnsRecord, Header, DNS_PORT};

/// Receive buffer for one reply. Larger than the classic 512 byte limit so
/// replies from EDNS-happy middleboxes are not cut short.
const RECV_BUFFER_SIZE: usize = 4096;

/// Resolves a hostname against one specific nameserver.
#[async_trait]
pub trait DnsResolver: Send + Sync {
    async fn lookup(
        &self,
        nameserver: Ipv4Addr,
        hostname: &str,
    ) -> Result<Vec<DnsRecord>, DnsError>;
}

/// Sends a single UDP query straight to the nameserver, bypassing the
/// system resolver.
#[derive(Debug, Clone)]
pub struct StubResolver {
    timeout: Duration,
    port: u16,
}

impl StubResolver {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            port: DNS_PORT,
        }
    }

    /// Queries nameservers on a port other than 53.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    async fn exchange(&self, query: &DnsQuery) -> Result<Vec<DnsRecord>, DnsError> {
        let wire = query.encode()?;
        let server = SocketAddr::from((query.nameserver, self.port));

        let sock = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
            .await
            .map_err(DnsError::Unreachable)?;
        sock.connect(server).await.map_err(DnsError::Unreachable)?;
        let sent = sock.send(&wire).await.map_err(DnsError::Unreachable)?;
        if sent != wire.len() {
            return Err(DnsError::Unreachable(io::Error::new(
                io::ErrorKind::WriteZero,
                "short UDP send",
            )));
        }

        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            let len = sock.recv(&mut buf).await.map_err(DnsError::Unreachable)?;
            let reply = &buf[..len];

            // Stray datagrams are ignored; the deadline bounds the wait.
            let header = match Header::parse(reply) {
                Ok(header) if header.answers(query.id) => header,
                _ => {
                    debug!(nameserver = %query.nameserver, len, "ignoring unrelated datagram");
                    continue;
                }
            };

            if header.is_truncated() {
                warn!(
                    nameserver = %query.nameserver,
                    hostname = %query.hostname,
                    "reply truncated, using partial answer"
                );
            }
            if header.rcode() != 0 {
                debug!(
                    nameserver = %query.nameserver,
                    hostname = %query.hostname,
                    rcode = header.rcode(),
                    "nameserver returned error code"
                );
            }
            return parse_answers(reply);
        }
    }
}

#[async_trait]
impl DnsResolver for StubResolver {
    async fn lookup(
        &self,
        nameserver: Ipv4Addr,
        hostname: &str,
    ) -> Result<Vec<DnsRecord>, DnsError> {
        let query = DnsQuery::new(nameserver, hostname, rand::random());
        debug!(%nameserver, hostname, id = query.id, "sending dns query");

        match tokio::time::timeout(self.timeout, self.exchange(&query)).await {
            Ok(result) => result,
            Err(_) => Err(DnsError::Timeout(self.timeout)),
        }
    }
}
