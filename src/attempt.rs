use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use scopeguard::defer;
use tracing::{debug, info};

use crate::camouflage::{self, HandshakeError};
use crate::forward::{self, ForwardReport};
use crate::local_service;
use crate::transport::{self, ConnError};

/// The pipeline stage an attempt failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Resolve,
    Connect,
    Handshake,
    LocalConnect,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Resolve => write!(f, "resolve"),
            Stage::Connect => write!(f, "connect"),
            Stage::Handshake => write!(f, "handshake"),
            Stage::LocalConnect => write!(f, "local-connect"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AttemptError {
    #[error("transport: {0}")]
    Connect(#[source] ConnError),
    #[error("handshake: {0}")]
    Handshake(#[source] HandshakeError),
    #[error("local service: {0}")]
    LocalConnect(#[source] ConnError),
}

impl AttemptError {
    pub fn stage(&self) -> Stage {
        match self {
            AttemptError::Connect(_) => Stage::Connect,
            AttemptError::Handshake(_) => Stage::Handshake,
            AttemptError::LocalConnect(_) => Stage::LocalConnect,
        }
    }
}

/// Knobs shared by every attempt of a sweep.
#[derive(Debug, Clone)]
pub struct AttemptSettings {
    pub remote_port: u16,
    pub connect_timeout: Duration,
    pub handshake_timeout: Option<Duration>,
    pub local_port: u16,
    pub local_connect_timeout: Option<Duration>,
    pub idle_timeout: Option<Duration>,
    /// Sent as `X-LF-Name`.
    pub identity: String,
}

/// Runs one (endpoint, address) candidate to completion.
#[async_trait]
pub trait AttemptRunner: Send + Sync {
    async fn run(&self, endpoint: &str, address: Ipv4Addr) -> Result<ForwardReport, AttemptError>;
}

/// Attempts over real sockets: connect, handshake, local connect, forward.
#[derive(Debug, Clone)]
pub struct LiveAttempts {
    settings: AttemptSettings,
}

impl LiveAttempts {
    pub fn new(settings: AttemptSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl AttemptRunner for LiveAttempts {
    async fn run(&self, endpoint: &str, address: Ipv4Addr) -> Result<ForwardReport, AttemptError> {
        let settings = &self.settings;
        defer! {
            debug!(endpoint, %address, "attempt released");
        }

        info!(endpoint, %address, port = settings.remote_port, "connecting");
        let remote = transport::connect(address, settings.remote_port, settings.connect_timeout)
            .await
            .map_err(AttemptError::Connect)?;

        let tunnel = camouflage::perform(
            remote,
            endpoint,
            &settings.identity,
            settings.handshake_timeout,
        )
        .await
        .map_err(AttemptError::Handshake)?;
        info!(endpoint, %address, "upgrade accepted");

        // The tunnel is dropped, and closed, if the local service is missing.
        let local =
            local_service::connect_local(settings.local_port, settings.local_connect_timeout)
                .await
                .map_err(AttemptError::LocalConnect)?;
        info!(endpoint, %address, local_port = settings.local_port, "forwarding to local service");

        Ok(forward::forward(tunnel, local, settings.idle_timeout).await)
    }
}
