//! Periodic health and resource refresh for every registered node.
//!
//! Each tick probes the tags and running-models endpoints, updates the
//! node's health flag, resident models and derived free-memory figures, and
//! infers a GPU class for undeclared nodes that report VRAM usage. Probes are
//! jittered per node by up to 10% of the interval so a large fleet is not hit
//! in lockstep. Selection passes read registry snapshots, so a slow probe
//! never blocks routing.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    client::{NodeClient, RunningModel},
    config::{MonitorConfig, NodeClass},
    registry::{LoadedModel, Node, NodeRegistry},
};

pub struct Monitor {
    registry: Arc<NodeRegistry>,
    client: Arc<NodeClient>,
    cfg: MonitorConfig,
}

impl Monitor {
    pub fn new(registry: Arc<NodeRegistry>, client: Arc<NodeClient>, cfg: MonitorConfig) -> Self {
        Self { registry, client, cfg }
    }

    /// Background loop: refresh all nodes every interval until cancellation.
    pub async fn run(self, cancel: CancellationToken) {
        let interval_ms = self.cfg.interval_ms;
        let monitor = Arc::new(self);
        let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("monitor loop stopped");
                    return;
                }
                _ = interval.tick() => {
                    monitor.refresh_fleet(interval_ms).await;
                }
            }
        }
    }

    /// Refresh every node concurrently, each after its own jitter delay.
    async fn refresh_fleet(self: &Arc<Self>, interval_ms: u64) {
        let max_jitter = interval_ms / 10;
        let mut tasks = Vec::new();
        for node in self.registry.snapshot().iter() {
            let monitor = Arc::clone(self);
            let node = Arc::clone(node);
            let jitter = if max_jitter == 0 {
                0
            } else {
                rand::thread_rng().gen_range(0..max_jitter)
            };
            tasks.push(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(jitter)).await;
                monitor.refresh_node(&node).await;
            }));
        }
        for task in tasks {
            let _ = task.await;
        }
    }

    /// Probe one node and fold the results into the registry.
    pub async fn refresh_node(&self, node: &Node) {
        let tags = match self.client.tags(node).await {
            Ok(models) => models,
            Err(e) => {
                warn!(node = %node.id, error = %e, "health probe failed");
                self.registry.update(&node.id, |n| n.healthy = false);
                return;
            }
        };
        let names: Vec<String> = tags.into_iter().map(|m| m.name).collect();

        // A node that answers tags but not ps is healthy with unknown
        // residency; previous loaded-model data is left in place.
        let running = match self.client.running(node).await {
            Ok(models) => Some(models),
            Err(e) => {
                debug!(node = %node.id, error = %e, "running-models probe failed");
                None
            }
        };

        self.registry.update(&node.id, |n| {
            n.healthy = true;
            n.last_probe_at = Some(Utc::now());
            n.available_models = names.clone();

            if let Some(running) = &running {
                apply_residency(n, running);
            }
        });
    }
}

/// Fold a running-models listing into the node: resident set, inferred
/// class, and derived free memory where totals are declared.
fn apply_residency(node: &mut Node, running: &[RunningModel]) {
    node.loaded_models = running
        .iter()
        .map(|m| LoadedModel {
            name: m.name.clone(),
            size_bytes: m.size,
            vram_bytes: m.size_vram,
            expires_at: m.expires_at.as_deref().and_then(parse_expiry),
        })
        .collect();

    let vram_used: u64 = running.iter().map(|m| m.size_vram).sum();
    let ram_used: u64 = running.iter().map(|m| m.size.saturating_sub(m.size_vram)).sum();

    if node.class == NodeClass::Unknown && vram_used > 0 {
        node.class = NodeClass::Gpu;
    }
    if node.vram_total_bytes > 0 {
        node.vram_free_bytes = node.vram_total_bytes.saturating_sub(vram_used);
    }
    if node.ram_total_bytes > 0 {
        node.ram_free_bytes = node.ram_total_bytes.saturating_sub(ram_used);
    }
}

fn parse_expiry(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
