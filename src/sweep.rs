use std::net::Ipv4Addr;

use tracing::{info, warn};

use crate::attempt::{AttemptRunner, Stage};
use crate::config::{NameserverSource, RendezvousEndpoint};
use crate::dns_resolver::DnsResolver;
use crate::stats::SweepStats;

/// One pass over every nameserver × endpoint candidate.
///
/// Candidates run one after another in configured order, and DNS answers in
/// the order the nameserver returned them. A failure at any stage is logged
/// and counted and the sweep moves on to the next candidate.
pub struct Sweep<R, A> {
    nameservers: Vec<NameserverSource>,
    endpoints: Vec<RendezvousEndpoint>,
    resolver: R,
    attempts: A,
}

impl<R: DnsResolver, A: AttemptRunner> Sweep<R, A> {
    pub fn new(
        nameservers: Vec<NameserverSource>,
        endpoints: Vec<RendezvousEndpoint>,
        resolver: R,
        attempts: A,
    ) -> Self {
        Self {
            nameservers,
            endpoints,
            resolver,
            attempts,
        }
    }

    pub async fn run(&self) -> SweepStats {
        let mut stats = SweepStats::default();

        for source in &self.nameservers {
            let servers = source.expand();
            if servers.is_empty() {
                warn!(source = %source, "nameserver source yielded no usable servers");
            }
            for nameserver in servers {
                stats.nameserver_tried();
                for endpoint in &self.endpoints {
                    self.try_endpoint(nameserver, endpoint, &mut stats).await;
                }
            }
        }
        stats
    }

    async fn try_endpoint(
        &self,
        nameserver: Ipv4Addr,
        endpoint: &RendezvousEndpoint,
        stats: &mut SweepStats,
    ) {
        let name = endpoint.as_str();

        let addresses = match endpoint.literal() {
            Some(address) => vec![address],
            None => match self.resolver.lookup(nameserver, name).await {
                Ok(records) => {
                    info!(endpoint = name, %nameserver, records = records.len(), "resolved");
                    records.into_iter().map(|record| record.address).collect()
                }
                Err(err) => {
                    warn!(
                        stage = %Stage::Resolve,
                        endpoint = name,
                        %nameserver,
                        error = %err,
                        "attempt failed"
                    );
                    stats.failed(Stage::Resolve);
                    return;
                }
            },
        };

        for address in addresses {
            stats.attempt_started();
            match self.attempts.run(name, address).await {
                Ok(report) => {
                    info!(
                        endpoint = name,
                        %nameserver,
                        %address,
                        bytes_in = report.remote_to_local,
                        bytes_out = report.local_to_remote,
                        reason = %report.reason,
                        "tunnel closed"
                    );
                    stats.tunnel_closed(&report);
                }
                Err(err) => {
                    warn!(
                        stage = %err.stage(),
                        endpoint = name,
                        %nameserver,
                        %address,
                        error = %err,
                        "attempt failed"
                    );
                    stats.failed(err.stage());
                }
            }
        }
    }
}
