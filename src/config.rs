use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::attempt::AttemptSettings;

/// A rendezvous endpoint: a literal IPv4 address or a hostname.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct RendezvousEndpoint(String);

impl RendezvousEndpoint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The address if the endpoint is written as one.
    pub fn literal(&self) -> Option<Ipv4Addr> {
        self.0.parse().ok()
    }
}

impl TryFrom<String> for RendezvousEndpoint {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(ConfigError::EmptyEndpoint);
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl FromStr for RendezvousEndpoint {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_from(s.to_string())
    }
}

impl std::fmt::Display for RendezvousEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where nameservers come from: one literal address, or a resolver
/// configuration file listing any number of them.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum NameserverSource {
    Literal(Ipv4Addr),
    ResolverFile(PathBuf),
}

impl NameserverSource {
    /// The nameservers this source stands for, in order. A file that
    /// cannot be read yields none.
    pub fn expand(&self) -> Vec<Ipv4Addr> {
        match self {
            NameserverSource::Literal(addr) => vec![*addr],
            NameserverSource::ResolverFile(path) => match fs::read_to_string(path) {
                Ok(content) => parse_resolv_conf(&content),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "cannot read resolver config");
                    Vec::new()
                }
            },
        }
    }
}

impl TryFrom<String> for NameserverSource {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let value = value.trim();
        if value.starts_with('/') {
            return Ok(NameserverSource::ResolverFile(PathBuf::from(value)));
        }
        value
            .parse()
            .map(NameserverSource::Literal)
            .map_err(|_| ConfigError::InvalidNameserver(value.to_string()))
    }
}

impl FromStr for NameserverSource {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_from(s.to_string())
    }
}

impl std::fmt::Display for NameserverSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NameserverSource::Literal(addr) => addr.fmt(f),
            NameserverSource::ResolverFile(path) => path.display().fmt(f),
        }
    }
}

/// Extracts `nameserver` entries from resolv.conf style content. Only IPv4
/// servers are usable; anything else is logged and skipped.
pub fn parse_resolv_conf(content: &str) -> Vec<Ipv4Addr> {
    let mut servers = Vec::new();

    for raw_line in content.lines() {
        let line = raw_line.split(['#', ';']).next().unwrap_or_default().trim();
        let mut words = line.split_whitespace();
        if words.next() != Some("nameserver") {
            continue;
        }
        let Some(server) = words.next() else {
            continue;
        };

        match server.parse::<IpAddr>() {
            Ok(IpAddr::V4(addr)) => servers.push(addr),
            Ok(IpAddr::V6(addr)) => {
                warn!(nameserver = %addr, "skipping IPv6 nameserver");
            }
            Err(err) => {
                warn!(nameserver = server, error = %err, "unparsable nameserver entry");
            }
        }
    }
    servers
}

/// Everything one sweep needs. Every key is optional in the file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LifelineConfig {
    pub endpoints: Vec<RendezvousEndpoint>,
    pub nameservers: Vec<NameserverSource>,
    pub remote_port: u16,
    pub local_port: u16,
    pub dns_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// 0 waits for the upgrade response forever.
    pub handshake_timeout_secs: u64,
    /// 0 leaves the local connect to the OS default.
    pub local_connect_timeout_secs: u64,
    /// 0 keeps a quiet tunnel open indefinitely.
    pub idle_timeout_secs: u64,
    pub grace_period_secs: u64,
    /// Overrides the `legacy.<hostname>` identity.
    pub identity: Option<String>,
}

impl Default for LifelineConfig {
    fn default() -> Self {
        Self {
            endpoints: [
                "lifeline.hy5.berlin",
                "lifeline.exys.org",
                "lifeline.captif.io",
                "lifeline.superscale.io",
            ]
            .into_iter()
            .map(|name| RendezvousEndpoint(name.to_string()))
            .collect(),
            nameservers: vec![
                NameserverSource::Literal(Ipv4Addr::new(1, 1, 1, 1)),
                NameserverSource::Literal(Ipv4Addr::new(1, 0, 0, 1)),
                NameserverSource::Literal(Ipv4Addr::new(8, 8, 8, 8)),
                NameserverSource::Literal(Ipv4Addr::new(8, 8, 4, 4)),
                NameserverSource::ResolverFile(PathBuf::from("/etc/resolv.conf")),
            ],
            remote_port: 80,
            local_port: crate::local_service::DEFAULT_LOCAL_PORT,
            dns_timeout_secs: 5,
            connect_timeout_secs: 5,
            handshake_timeout_secs: 30,
            local_connect_timeout_secs: 0,
            idle_timeout_secs: 0,
            grace_period_secs: 5,
            identity: None,
        }
    }
}

impl LifelineConfig {
    /// Reads a TOML config file, or returns the defaults when `path` is
    /// `None`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn dns_timeout(&self) -> Duration {
        Duration::from_secs(self.dns_timeout_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn attempt_settings(&self, identity: String) -> AttemptSettings {
        AttemptSettings {
            remote_port: self.remote_port,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            handshake_timeout: optional_secs(self.handshake_timeout_secs),
            local_port: self.local_port,
            local_connect_timeout: optional_secs(self.local_connect_timeout_secs),
            idle_timeout: optional_secs(self.idle_timeout_secs),
            identity,
        }
    }
}

fn optional_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("nameserver {0:?} is neither an IPv4 address nor an absolute path")]
    InvalidNameserver(String),
    #[error("empty rendezvous endpoint")]
    EmptyEndpoint,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolv_conf_nameservers_in_order() {
        let content = "# generated by NetworkManager\n\
                       search lan\n\
                       nameserver 198.51.100.1\n\
                       nameserver   192.0.2.53 # upstream\n\
                       ; nameserver 192.0.2.99\n\
                       nameserver fe80::1\n\
                       nameserver not-an-ip\n\
                       nameserver\n\
                       options edns0\n";

        assert_eq!(
            parse_resolv_conf(content),
            vec![Ipv4Addr::new(198, 51, 100, 1), Ipv4Addr::new(192, 0, 2, 53)]
        );
    }

    #[test]
    fn test_nameserver_source_forms() {
        assert_eq!(
            "1.1.1.1".parse::<NameserverSource>().unwrap(),
            NameserverSource::Literal(Ipv4Addr::new(1, 1, 1, 1))
        );
        assert_eq!(
            "/etc/resolv.conf".parse::<NameserverSource>().unwrap(),
            NameserverSource::ResolverFile(PathBuf::from("/etc/resolv.conf"))
        );
        assert!(matches!(
            "dns.example".parse::<NameserverSource>(),
            Err(ConfigError::InvalidNameserver(_))
        ));
    }

    #[test]
    fn test_missing_resolver_file_expands_to_nothing() {
        let source =
            NameserverSource::ResolverFile(PathBuf::from("/nonexistent/lifeline/resolv.conf"));
        assert!(source.expand().is_empty());
    }

    #[test]
    fn test_endpoint_literal_detection() {
        let literal: RendezvousEndpoint = "203.0.113.5".parse().unwrap();
        let named: RendezvousEndpoint = "relay.example".parse().unwrap();

        assert_eq!(literal.literal(), Some(Ipv4Addr::new(203, 0, 113, 5)));
        assert_eq!(named.literal(), None);
        assert!(matches!("  ".parse::<RendezvousEndpoint>(), Err(ConfigError::EmptyEndpoint)));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = LifelineConfig::from_toml(
            r#"
            endpoints = ["relay.example", "203.0.113.5"]
            nameservers = ["198.51.100.1", "/etc/resolv.conf"]
            handshake_timeout_secs = 0
            identity = "legacy.box-17"
            "#,
        )
        .unwrap();

        assert_eq!(config.endpoints.len(), 2);
        assert_eq!(config.remote_port, 80);
        assert_eq!(config.local_port, 22);
        assert_eq!(config.dns_timeout(), Duration::from_secs(5));

        let settings = config.attempt_settings("legacy.box-17".to_string());
        assert_eq!(settings.handshake_timeout, None);
        assert_eq!(settings.connect_timeout, Duration::from_secs(5));
        assert_eq!(settings.idle_timeout, None);
    }

    #[test]
    fn test_toml_rejects_bad_entries() {
        assert!(LifelineConfig::from_toml("nameservers = [\"resolver.example\"]").is_err());
        assert!(LifelineConfig::from_toml("endpoints = [\"\"]").is_err());
        assert!(LifelineConfig::from_toml("retries = 3").is_err());
    }

    #[test]
    fn test_defaults_cover_public_and_system_resolvers() {
        let config = LifelineConfig::default();
        assert_eq!(config.endpoints.len(), 4);
        let nameservers: Vec<String> = config.nameservers.iter().map(ToString::to_string).collect();
        assert_eq!(nameservers, ["1.1.1.1", "1.0.0.1", "8.8.8.8", "8.8.4.4", "/etc/resolv.conf"]);
        assert_eq!(config.grace_period(), Duration::from_secs(5));
    }
}
