use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use lifeline::attempt::LiveAttempts;
use lifeline::camouflage;
use lifeline::config::{LifelineConfig, NameserverSource, RendezvousEndpoint};
use lifeline::dns_resolver::StubResolver;
use lifeline::logging::{self, LogLevel};
use lifeline::sweep::Sweep;

/// Reaches a rendezvous relay through a camouflaged upgrade and hands the
/// tunnel to the local administrative service.
#[derive(Debug, Parser)]
#[command(name = "lifeline", version)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, value_name = "CONFIG")]
    config: Option<PathBuf>,

    /// Rendezvous endpoint, replaces the configured list (repeatable)
    #[arg(short, long = "endpoint", value_name = "ENDPOINT")]
    endpoints: Vec<RendezvousEndpoint>,

    /// Nameserver address or resolver file, replaces the configured list (repeatable)
    #[arg(short, long = "nameserver", value_name = "NAMESERVER")]
    nameservers: Vec<NameserverSource>,

    /// Value announced in X-LF-Name
    #[arg(long, value_name = "NAME")]
    identity: Option<String>,

    /// More output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(LogLevel::from_verbosity(cli.verbose));

    let mut config = LifelineConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if !cli.endpoints.is_empty() {
        config.endpoints = cli.endpoints;
    }
    if !cli.nameservers.is_empty() {
        config.nameservers = cli.nameservers;
    }
    let identity = cli
        .identity
        .or_else(|| config.identity.clone())
        .unwrap_or_else(camouflage::default_identity);

    info!(
        endpoints = config.endpoints.len(),
        nameservers = config.nameservers.len(),
        identity = %identity,
        local_port = config.local_port,
        "starting sweep"
    );

    let sweep = Sweep::new(
        config.nameservers.clone(),
        config.endpoints.clone(),
        StubResolver::new(config.dns_timeout()),
        LiveAttempts::new(config.attempt_settings(identity)),
    );
    let stats = sweep.run().await;
    stats.log_summary();

    tokio::time::sleep(config.grace_period()).await;
    Ok(())
}
