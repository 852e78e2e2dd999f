//! Node discovery: seeds, environment, and an optional local-subnet sweep.
//!
//! Sources in order of precedence: operator-supplied seed entries from the
//! config file, then addresses in the `FLEET_NODES` environment variable,
//! then (when enabled) a one-shot probe of the local /24 at startup.
//!
//! Seeds are permanent: a seed that stops answering is removed from the
//! registry after the grace window like any other node, but keeps being
//! re-probed every tick and reappears as soon as it answers again. A node
//! with requests still in flight is never removed, no matter how many probes
//! it has missed.

use std::{sync::Arc, time::Duration};

use futures_util::{stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    client::NodeClient,
    config::{parse_host_port, DiscoveryConfig, NodeSeed},
    registry::{Node, NodeRegistry},
    scheduler::Scheduler,
};

/// Environment variable holding extra comma-separated `host:port` seeds.
pub const FLEET_NODES_ENV: &str = "FLEET_NODES";

/// How many subnet addresses are probed concurrently.
const SCAN_FANOUT: usize = 32;

pub struct Discovery {
    registry: Arc<NodeRegistry>,
    client: Arc<NodeClient>,
    scheduler: Scheduler,
    cfg: DiscoveryConfig,
    seeds: Vec<NodeSeed>,
}

impl Discovery {
    pub fn new(
        registry: Arc<NodeRegistry>,
        client: Arc<NodeClient>,
        scheduler: Scheduler,
        cfg: DiscoveryConfig,
    ) -> Self {
        let mut seeds = cfg.nodes.clone();
        for addr in &cfg.seeds {
            // Validated at config load; skip defensively anyway.
            if let Ok((host, port)) = parse_host_port(addr) {
                seeds.push(NodeSeed {
                    host,
                    port,
                    class: Default::default(),
                    vram_total_bytes: 0,
                    ram_total_bytes: 0,
                });
            }
        }
        for (host, port) in env_seeds(std::env::var(FLEET_NODES_ENV).ok().as_deref()) {
            seeds.push(NodeSeed {
                host,
                port,
                class: Default::default(),
                vram_total_bytes: 0,
                ram_total_bytes: 0,
            });
        }

        Self { registry, client, scheduler, cfg, seeds }
    }

    /// Background loop: one full pass at startup (including the subnet sweep
    /// when enabled), then seed and known-node probing on the configured
    /// interval until cancellation.
    pub async fn run(self, cancel: CancellationToken) {
        self.probe_seeds().await;
        if self.cfg.scan_local_subnet {
            self.scan_subnet().await;
        }

        let mut interval = tokio::time::interval(Duration::from_millis(self.cfg.interval_ms));
        interval.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("discovery loop stopped");
                    return;
                }
                _ = interval.tick() => {
                    self.probe_seeds().await;
                    self.probe_known().await;
                }
            }
        }
    }

    /// Probe every configured seed that is not currently registered, and
    /// register the ones that answer.
    pub async fn probe_seeds(&self) {
        for seed in &self.seeds {
            let id = format!("{}:{}", seed.host, seed.port);
            if self.registry.get(&id).is_some() {
                continue;
            }
            let base_url = format!("http://{}:{}", seed.host, seed.port);
            match self.client.tags_at(&base_url).await {
                Ok(models) => {
                    info!(node = %id, models = models.len(), "seed node registered");
                    self.register(seed, models.into_iter().map(|m| m.name).collect());
                }
                Err(e) => {
                    debug!(node = %id, error = %e, "seed probe failed");
                }
            }
        }
    }

    /// Re-probe every registered node; count misses and remove nodes past the
    /// grace window, unless they still have requests in flight.
    pub async fn probe_known(&self) {
        for node in self.registry.snapshot().iter() {
            match self.client.tags(node).await {
                Ok(models) => {
                    let names: Vec<String> = models.into_iter().map(|m| m.name).collect();
                    self.registry.update(&node.id, |n| {
                        n.probe_failures = 0;
                        n.last_probe_at = Some(chrono::Utc::now());
                        n.available_models = names.clone();
                    });
                }
                Err(e) => {
                    let mut failures = 0;
                    self.registry.update(&node.id, |n| {
                        n.probe_failures += 1;
                        failures = n.probe_failures;
                    });
                    if failures >= self.cfg.grace_failures {
                        if self.scheduler.node_in_flight(&node.id) > 0 {
                            debug!(node = %node.id, "grace expired but requests in flight — keeping");
                        } else if self.registry.remove(&node.id) {
                            warn!(node = %node.id, missed = failures, error = %e, "node removed after missed probes");
                        }
                    } else {
                        debug!(node = %node.id, missed = failures, error = %e, "node missed a probe");
                    }
                }
            }
        }
    }

    /// One-shot sweep of the local /24: every address is probed on the
    /// configured port with a short timeout, and responders are registered.
    pub async fn scan_subnet(&self) {
        let Some(local) = local_ipv4() else {
            warn!("subnet scan enabled but no local IPv4 address found");
            return;
        };
        let octets = local.octets();
        let timeout = Duration::from_millis(self.cfg.timeout_ms);
        let port = self.cfg.probe_port;
        info!(subnet = %format!("{}.{}.{}.0/24", octets[0], octets[1], octets[2]), port, "scanning local subnet");

        let hosts: Vec<String> = (1u8..=254)
            .map(|i| format!("{}.{}.{}.{}", octets[0], octets[1], octets[2], i))
            .collect();

        let found: Vec<(String, Vec<String>)> = stream::iter(hosts)
            .map(|host| {
                let client = Arc::clone(&self.client);
                async move {
                    let base_url = format!("http://{host}:{port}");
                    match client.tags_at_with_timeout(&base_url, timeout).await {
                        Ok(models) => {
                            Some((host, models.into_iter().map(|m| m.name).collect()))
                        }
                        Err(_) => None,
                    }
                }
            })
            .buffer_unordered(SCAN_FANOUT)
            .filter_map(|r| async move { r })
            .collect()
            .await;

        for (host, models) in found {
            let seed = NodeSeed {
                host,
                port,
                class: Default::default(),
                vram_total_bytes: 0,
                ram_total_bytes: 0,
            };
            info!(node = %format!("{}:{}", seed.host, seed.port), "subnet scan found a node");
            self.register(&seed, models);
        }
    }

    fn register(&self, seed: &NodeSeed, available_models: Vec<String>) {
        let mut node = Node::new(seed.host.clone(), seed.port);
        node.class = seed.class;
        node.vram_total_bytes = seed.vram_total_bytes;
        node.ram_total_bytes = seed.ram_total_bytes;
        node.ram_free_bytes = seed.ram_total_bytes;
        node.vram_free_bytes = seed.vram_total_bytes;
        node.available_models = available_models;
        node.last_probe_at = Some(chrono::Utc::now());
        self.registry.upsert(node);
    }
}

/// Parse the `FLEET_NODES` value: comma-separated `host:port`, whitespace
/// tolerated, malformed entries skipped with a warning.
fn env_seeds(value: Option<&str>) -> Vec<(String, u16)> {
    let Some(value) = value else {
        return Vec::new();
    };
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|entry| match parse_host_port(entry) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                warn!(entry, error = %e, "ignoring malformed FLEET_NODES entry");
                None
            }
        })
        .collect()
}

/// The local IPv4 address, found by opening a UDP socket toward a public
/// address. No packet is sent; this only asks the OS for the route source.
fn local_ipv4() -> Option<std::net::Ipv4Addr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    match socket.local_addr().ok()? {
        std::net::SocketAddr::V4(addr) => Some(*addr.ip()),
        std::net::SocketAddr::V6(_) => None,
    }
}
