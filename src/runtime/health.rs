//! Node health monitor
//!
//! Probes every registered node concurrently. A slow node costs at most the
//! probe timeout and never delays the others. Every probe result is stored.

use futures_util::future::join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

use crate::custody::{NodeClient, NodeError};
use crate::error::Result;
use crate::storage::NodeStore;
use crate::types::{HealthCheckRecord, KeyShareNode, NodeStatus};

/// Summary of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthSummary {
    pub healthy: usize,
    pub unhealthy: usize,
}

pub struct HealthMonitor {
    store: Arc<dyn NodeStore>,
    client: Arc<dyn NodeClient>,
    probe_timeout: Duration,
}

impl HealthMonitor {
    pub fn new(
        store: Arc<dyn NodeStore>,
        client: Arc<dyn NodeClient>,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            store,
            client,
            probe_timeout,
        }
    }

    async fn probe(&self, node: &KeyShareNode) -> HealthCheckRecord {
        let started = Instant::now();
        let result = tokio::time::timeout(self.probe_timeout, self.client.health(node))
            .await
            .unwrap_or(Err(NodeError::Timeout(self.probe_timeout)));
        let latency_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(()) => HealthCheckRecord::healthy(node.id, latency_ms),
            Err(e) => HealthCheckRecord::unhealthy(node.id, latency_ms, e.to_string()),
        }
    }

    /// Probe every node once and record the results
    pub async fn check_all(&self) -> Result<Vec<HealthCheckRecord>> {
        let nodes = self.store.list_nodes().await?;
        let records = join_all(nodes.iter().map(|node| self.probe(node))).await;

        let mut summary = HealthSummary::default();
        let mut first_error = None;
        for (node, record) in nodes.iter().zip(&records) {
            if let Err(e) = self.store.record_health(record).await {
                tracing::error!(
                    target: "tss::custody",
                    node = %node.name,
                    error = %e,
                    "Failed to record health check"
                );
                first_error.get_or_insert(e);
            }

            if record.status == NodeStatus::Healthy {
                summary.healthy += 1;
            } else {
                summary.unhealthy += 1;
                if node.status != NodeStatus::Unhealthy {
                    tracing::warn!(
                        target: "tss::custody",
                        node = %node.name,
                        error = record.error.as_deref().unwrap_or_default(),
                        "Key-share node became unhealthy"
                    );
                }
            }
        }

        tracing::info!(
            target: "tss::custody",
            healthy = summary.healthy,
            unhealthy = summary.unhealthy,
            "Health sweep complete"
        );

        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(records),
        }
    }

    /// Sweep every `interval` until `shutdown` flips to true
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.check_all().await {
                        tracing::error!(target: "tss::custody", error = %e, "Health sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}
