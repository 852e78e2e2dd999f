//! Configuration types for llm-fleet.
//!
//! Config is loaded once at startup from a TOML file and validated before the
//! server opens any ports. Invalid configs are rejected with a clear error
//! rather than silently falling back to defaults. A *missing* file is fine:
//! every section has workable defaults, so a bare `llm-fleet` starts up and
//! discovers nodes from `FLEET_NODES` or the local subnet.
//!
//! # Example
//! ```toml
//! [server]
//! port = 8080
//!
//! [discovery]
//! seeds = ["10.0.0.5:11434"]
//! scan_local_subnet = false
//!
//! [routing]
//! default_mode = "fast"
//!
//! [[catalog.chains]]
//! task   = "chat"
//! models = ["big-70b", "med-13b", "small-3b"]
//! ```

use std::{collections::HashMap, path::Path};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Hardware class of a backend node.
///
/// Declared by the operator in seed entries, or inferred by the monitor from
/// the node's loaded-model VRAM usage. `Unknown` nodes are treated as
/// CPU-like for fit checks but earn no GPU bonus in FAST scoring.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeClass {
    Gpu,
    Cpu,
    #[default]
    Unknown,
}

impl std::fmt::Display for NodeClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Gpu => "gpu",
            Self::Cpu => "cpu",
            Self::Unknown => "unknown",
        })
    }
}

/// How candidate nodes are ranked for a request.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RoutingMode {
    /// Performance-first: weighted score over load, hardware, memory headroom,
    /// locality and observed latency.
    #[default]
    Fast,

    /// Stability-first: only nodes with a proven success rate are considered;
    /// ranked by success rate, then latency variance, then uptime.
    Reliable,

    /// Resource-efficient background work: CPU nodes that fit the model in
    /// RAM come first, queueing is acceptable.
    Async,
}

impl std::fmt::Display for RoutingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Fast => "fast",
            Self::Reliable => "reliable",
            Self::Async => "async",
        })
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub discovery: DiscoveryConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub request: RequestConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub routing: RoutingConfig,

    #[serde(default)]
    pub reliability: ReliabilityConfig,

    #[serde(default)]
    pub catalog: CatalogConfig,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let config: Self = toml::from_str(&content).context("parsing config TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, or fall back to pure defaults when the file is absent.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            let config = Self::default();
            config.validate()?;
            Ok(config)
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.scheduler.max_in_flight >= 1,
            "scheduler.max_in_flight must be at least 1"
        );
        anyhow::ensure!(
            self.scheduler.per_node_cap >= 1,
            "scheduler.per_node_cap must be at least 1"
        );
        anyhow::ensure!(
            self.reliability.min_success_rate > 0.0 && self.reliability.min_success_rate <= 1.0,
            "reliability.min_success_rate must be in (0, 1]"
        );
        anyhow::ensure!(
            self.reliability.latency_window >= 1,
            "reliability.latency_window must be at least 1"
        );
        anyhow::ensure!(
            self.discovery.interval_ms >= 1,
            "discovery.interval_ms must be at least 1"
        );
        anyhow::ensure!(
            self.monitor.interval_ms >= 1,
            "monitor.interval_ms must be at least 1"
        );

        let w = &self.routing;
        for (name, value) in [
            ("w_load", w.w_load),
            ("w_gpu", w.w_gpu),
            ("w_vram", w.w_vram),
            ("w_local", w.w_local),
            ("w_latency", w.w_latency),
            ("w_failure", w.w_failure),
        ] {
            anyhow::ensure!(
                value.is_finite() && value >= 0.0,
                "routing.{name} must be finite and non-negative, got {value}"
            );
        }

        // Every seed must parse as host:port
        for seed in &self.discovery.seeds {
            parse_host_port(seed)
                .with_context(|| format!("discovery.seeds entry `{seed}` is not host:port"))?;
        }

        for chain in &self.catalog.chains {
            anyhow::ensure!(
                chain.models.len() >= 2,
                "catalog chain for task `{}` needs at least two models",
                chain.task
            );
        }

        Ok(())
    }
}

/// Split a `host:port` string. Splits on the last colon, so an unbracketed
/// IPv6 literal fails loudly in validation rather than probing a bogus host.
pub fn parse_host_port(s: &str) -> anyhow::Result<(String, u16)> {
    let (host, port) = s
        .rsplit_once(':')
        .with_context(|| format!("`{s}` has no `:port` suffix"))?;
    anyhow::ensure!(!host.is_empty() && !host.contains(':'), "bad host in `{s}`");
    let port: u16 = port.parse().with_context(|| format!("bad port in `{s}`"))?;
    Ok((host.to_string(), port))
}

/// HTTP serving surface.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Port for the public API (default: 8080).
    #[serde(default = "defaults::port")]
    pub port: u16,

    /// Log level override (also controlled by `RUST_LOG` env var).
    #[serde(default)]
    pub log_level: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty server config must deserialize")
    }
}

/// A seed node with declared static metadata.
///
/// Backends do not report total memory over the wire, so VRAM/RAM totals are
/// operator-declared here; the monitor derives free values from loaded-model
/// usage. Zero means unknown.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeSeed {
    pub host: String,
    pub port: u16,

    #[serde(default)]
    pub class: NodeClass,

    #[serde(default)]
    pub vram_total_bytes: u64,

    #[serde(default)]
    pub ram_total_bytes: u64,
}

/// Node discovery settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DiscoveryConfig {
    /// Plain `host:port` seed addresses.
    #[serde(default)]
    pub seeds: Vec<String>,

    /// Seed nodes with declared hardware metadata.
    #[serde(default)]
    pub nodes: Vec<NodeSeed>,

    /// Probe every address on the local /24 once at startup (default: off).
    #[serde(default)]
    pub scan_local_subnet: bool,

    /// Port tried during the subnet scan (default: 11434).
    #[serde(default = "defaults::probe_port")]
    pub probe_port: u16,

    /// Per-probe timeout during the subnet scan, in milliseconds (default: 500).
    #[serde(default = "defaults::discovery_timeout_ms")]
    pub timeout_ms: u64,

    /// Consecutive failed probes before a node is removed (default: 3).
    #[serde(default = "defaults::grace_failures")]
    pub grace_failures: u32,

    /// Refresh period for seed/known-node probing, in milliseconds (default: 10 000).
    #[serde(default = "defaults::discovery_interval_ms")]
    pub interval_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty discovery config must deserialize")
    }
}

/// Health & resource monitor settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitorConfig {
    /// Health/resource refresh period in milliseconds (default: 120 000).
    #[serde(default = "defaults::monitor_interval_ms")]
    pub interval_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty monitor config must deserialize")
    }
}

/// Timeouts for backend requests.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RequestConfig {
    /// Per-attempt generate timeout in milliseconds (default: 1 800 000).
    ///
    /// Deliberately enormous: a single inference on a large model on CPU
    /// routinely takes many minutes. Also bounds the idle gap between
    /// stream chunks.
    #[serde(default = "defaults::request_timeout_ms")]
    pub timeout_ms: u64,

    /// Connection timeout in milliseconds (default: 10 000).
    #[serde(default = "defaults::connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Timeout for tags/ps probes in milliseconds (default: 10 000).
    #[serde(default = "defaults::probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

impl Default for RequestConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty request config must deserialize")
    }
}

/// Admission control settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerConfig {
    /// Global in-flight request cap (default: 4).
    #[serde(default = "defaults::max_in_flight")]
    pub max_in_flight: usize,

    /// Per-node in-flight cap (default: 2).
    #[serde(default = "defaults::per_node_cap")]
    pub per_node_cap: usize,

    /// Waiting-queue length beyond which new requests are rejected with
    /// `Overloaded` instead of queueing (default: 32).
    #[serde(default = "defaults::queue_soft_cap")]
    pub queue_soft_cap: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty scheduler config must deserialize")
    }
}

/// Routing mode and FAST scoring weights.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RoutingConfig {
    /// Mode used when a request does not name one (default: fast).
    #[serde(default)]
    pub default_mode: RoutingMode,

    /// Weight of `1 / (1 + in_flight)`.
    #[serde(default = "defaults::w_load")]
    pub w_load: f64,
    /// Bonus for GPU-class nodes.
    #[serde(default = "defaults::w_gpu")]
    pub w_gpu: f64,
    /// Weight of the free-VRAM ratio.
    #[serde(default = "defaults::w_vram")]
    pub w_vram: f64,
    /// Bonus for loopback nodes.
    #[serde(default = "defaults::w_local")]
    pub w_local: f64,
    /// Weight of `1 / (1 + latency_mean_secs)`.
    #[serde(default = "defaults::w_latency")]
    pub w_latency: f64,
    /// Penalty weight for the recent failure rate.
    #[serde(default = "defaults::w_failure")]
    pub w_failure: f64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty routing config must deserialize")
    }
}

/// Reliability-tracker settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReliabilityConfig {
    /// Success-rate floor applied in RELIABLE mode (default: 0.95).
    #[serde(default = "defaults::min_success_rate")]
    pub min_success_rate: f64,

    /// Completed requests required before RELIABLE trusts a node's stats
    /// (default: 10).
    #[serde(default = "defaults::warm_requests")]
    pub warm_requests: u64,

    /// Size of the per-node latency ring buffer (default: 100).
    #[serde(default = "defaults::latency_window")]
    pub latency_window: usize,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty reliability config must deserialize")
    }
}

/// One fallback chain: models ordered from most to least demanding.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChainConfig {
    /// Opaque task tag supplied by callers; the router only uses it for lookup.
    pub task: String,
    pub models: Vec<String>,
}

/// Model catalog settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CatalogConfig {
    /// Slack added to a node's free memory in fit checks, to tolerate stale
    /// readings (default: 512 MiB).
    #[serde(default = "defaults::safety_margin_bytes")]
    pub safety_margin_bytes: u64,

    /// Model-name glob → approximate size in bytes. Overrides and augments
    /// the built-in table.
    #[serde(default)]
    pub model_sizes: HashMap<String, u64>,

    /// Extra OOM-indicating regexes, appended to the built-in set.
    #[serde(default)]
    pub oom_patterns: Vec<String>,

    /// Per-task fallback chains.
    #[serde(default)]
    pub chains: Vec<ChainConfig>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty catalog config must deserialize")
    }
}

mod defaults {
    pub fn port() -> u16 { 8080 }
    pub fn probe_port() -> u16 { 11434 }
    pub fn discovery_timeout_ms() -> u64 { 500 }
    pub fn grace_failures() -> u32 { 3 }
    pub fn discovery_interval_ms() -> u64 { 10_000 }
    pub fn monitor_interval_ms() -> u64 { 120_000 }
    pub fn request_timeout_ms() -> u64 { 1_800_000 }
    pub fn connect_timeout_ms() -> u64 { 10_000 }
    pub fn probe_timeout_ms() -> u64 { 10_000 }
    pub fn max_in_flight() -> usize { 4 }
    pub fn per_node_cap() -> usize { 2 }
    pub fn queue_soft_cap() -> usize { 32 }
    pub fn w_load() -> f64 { 1.0 }
    pub fn w_gpu() -> f64 { 1.5 }
    pub fn w_vram() -> f64 { 0.5 }
    pub fn w_local() -> f64 { 0.4 }
    pub fn w_latency() -> f64 { 0.6 }
    pub fn w_failure() -> f64 { 0.8 }
    pub fn min_success_rate() -> f64 { 0.95 }
    pub fn warm_requests() -> u64 { 10 }
    pub fn latency_window() -> usize { 100 }
    pub fn safety_margin_bytes() -> u64 { 512 * 1024 * 1024 }
}

#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn minimal_config() -> Config {
        toml::from_str(
            r#"
            [discovery]
            seeds = ["10.0.0.5:11434", "10.0.0.6:11434"]

            [[discovery.nodes]]
            host = "10.0.0.7"
            port = 11434
            class = "gpu"
            vram_total_bytes = 25769803776

            [[catalog.chains]]
            task   = "chat"
            models = ["big-70b", "med-13b", "small-3b"]
            "#,
        )
        .expect("minimal config should parse")
    }

    // -----------------------------------------------------------------------
    // Parsing & validation
    // -----------------------------------------------------------------------

    #[test]
    fn parse_example_config() {
        let content = include_str!("../config.example.toml");
        let config: Config = toml::from_str(content).expect("example config should parse");
        config.validate().expect("example config should be valid");
    }

    #[test]
    fn empty_config_is_valid_and_carries_defaults() {
        let config: Config = toml::from_str("").expect("empty config should parse");
        config.validate().expect("defaults should validate");

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.discovery.grace_failures, 3);
        assert_eq!(config.discovery.interval_ms, 10_000);
        assert_eq!(config.monitor.interval_ms, 120_000);
        assert_eq!(config.request.timeout_ms, 1_800_000);
        assert_eq!(config.request.connect_timeout_ms, 10_000);
        assert_eq!(config.scheduler.max_in_flight, 4);
        assert_eq!(config.scheduler.per_node_cap, 2);
        assert_eq!(config.routing.default_mode, RoutingMode::Fast);
        assert_eq!(config.reliability.warm_requests, 10);
        assert_eq!(config.reliability.latency_window, 100);
    }

    #[test]
    fn validation_rejects_bad_seed_address() {
        let mut config = minimal_config();
        config.discovery.seeds.push("no-port-here".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_rejects_zero_in_flight_cap() {
        let mut config = minimal_config();
        config.scheduler.max_in_flight = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_rejects_out_of_range_success_rate() {
        let mut config = minimal_config();
        config.reliability.min_success_rate = 1.5;
        assert!(config.validate().is_err());
        config.reliability.min_success_rate = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_rejects_negative_weight() {
        let mut config = minimal_config();
        config.routing.w_gpu = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_rejects_single_model_chain() {
        let mut config = minimal_config();
        config.catalog.chains.push(ChainConfig {
            task: "summarize".into(),
            models: vec!["only-one".into()],
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn detailed_seed_nodes_parse_with_metadata() {
        let config = minimal_config();
        assert_eq!(config.discovery.nodes.len(), 1);
        let node = &config.discovery.nodes[0];
        assert_eq!(node.class, NodeClass::Gpu);
        assert_eq!(node.vram_total_bytes, 25_769_803_776);
        assert_eq!(node.ram_total_bytes, 0);
    }

    // -----------------------------------------------------------------------
    // host:port parsing
    // -----------------------------------------------------------------------

    #[test]
    fn parse_host_port_accepts_plain_address() {
        let (host, port) = parse_host_port("10.0.0.5:11434").unwrap();
        assert_eq!(host, "10.0.0.5");
        assert_eq!(port, 11434);
    }

    #[test]
    fn parse_host_port_rejects_missing_or_bad_port() {
        assert!(parse_host_port("nohost").is_err());
        assert!(parse_host_port("host:notaport").is_err());
        assert!(parse_host_port(":1234").is_err());
        assert!(parse_host_port("[::1]:1234").is_err());
    }

    // -----------------------------------------------------------------------
    // Enum deserialization
    // -----------------------------------------------------------------------

    #[test]
    fn routing_mode_deserializes_from_snake_case() {
        #[derive(Deserialize)]
        struct Wrap {
            mode: RoutingMode,
        }
        let fast: Wrap = toml::from_str("mode = \"fast\"").unwrap();
        assert_eq!(fast.mode, RoutingMode::Fast);
        let reliable: Wrap = toml::from_str("mode = \"reliable\"").unwrap();
        assert_eq!(reliable.mode, RoutingMode::Reliable);
        let bg: Wrap = toml::from_str("mode = \"async\"").unwrap();
        assert_eq!(bg.mode, RoutingMode::Async);
    }

    #[test]
    fn node_class_deserializes_and_defaults_to_unknown() {
        #[derive(Deserialize)]
        struct Wrap {
            #[serde(default)]
            class: NodeClass,
        }
        let gpu: Wrap = toml::from_str("class = \"gpu\"").unwrap();
        assert_eq!(gpu.class, NodeClass::Gpu);
        let none: Wrap = toml::from_str("").unwrap();
        assert_eq!(none.class, NodeClass::Unknown);
    }
}
