use std::collections::BTreeMap;

use tracing::info;

use crate::attempt::Stage;
use crate::forward::ForwardReport;

/// Tallies for one sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepStats {
    pub nameservers: u32,
    pub attempts: u32,
    pub tunnels: u32,
    pub failures: BTreeMap<Stage, u32>,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

impl SweepStats {
    pub fn nameserver_tried(&mut self) {
        self.nameservers += 1;
    }

    pub fn attempt_started(&mut self) {
        self.attempts += 1;
    }

    pub fn failed(&mut self, stage: Stage) {
        *self.failures.entry(stage).or_default() += 1;
    }

    pub fn failures_in(&self, stage: Stage) -> u32 {
        self.failures.get(&stage).copied().unwrap_or(0)
    }

    pub fn tunnel_closed(&mut self, report: &ForwardReport) {
        self.tunnels += 1;
        self.bytes_in += report.remote_to_local;
        self.bytes_out += report.local_to_remote;
    }

    pub fn log_summary(&self) {
        info!(
            nameservers = self.nameservers,
            attempts = self.attempts,
            tunnels = self.tunnels,
            resolve_failed = self.failures_in(Stage::Resolve),
            connect_failed = self.failures_in(Stage::Connect),
            handshake_failed = self.failures_in(Stage::Handshake),
            local_failed = self.failures_in(Stage::LocalConnect),
            bytes_in = self.bytes_in,
            bytes_out = self.bytes_out,
            "sweep finished"
        );
    }
}
