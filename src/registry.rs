//! The authoritative set of known backend nodes and their live state.
//!
//! [`NodeRegistry`] is the only shared mutable structure in the fleet. Reads
//! go through [`NodeRegistry::snapshot`], which hands out an `Arc` to an
//! immutable node list; writes clone-and-swap the list under a lock. A
//! selection pass therefore always sees a consistent picture and never blocks
//! on discovery or monitoring, and no reader can observe torn node state.

use std::{
    sync::{Arc, RwLock},
    time::Instant,
};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::NodeClass;

/// A model currently resident on a node, as reported by its running-models
/// endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadedModel {
    pub name: String,
    pub size_bytes: u64,
    /// Bytes resident in GPU memory; 0 for CPU-resident models.
    pub vram_bytes: u64,
    /// When the backend will evict the model, if it said so.
    pub expires_at: Option<DateTime<Utc>>,
}

/// One backend node.
///
/// Created by discovery, refreshed by the monitor, flipped unhealthy by the
/// router on hard errors. In-flight request counts are owned by the scheduler,
/// not stored here.
#[derive(Debug, Clone)]
pub struct Node {
    /// Stable identifier, `host:port`.
    pub id: String,
    pub host: String,
    pub port: u16,

    /// Declared or inferred hardware class.
    pub class: NodeClass,

    pub healthy: bool,
    pub last_probe_at: Option<DateTime<Utc>>,
    /// Consecutive failed discovery probes; reset on any success.
    pub probe_failures: u32,

    /// When this node entered the registry. Monotonic, used for uptime ranking.
    pub first_seen: Instant,

    /// Model names from the last successful tags probe.
    pub available_models: Vec<String>,
    /// Models currently resident, from the last running-models probe.
    pub loaded_models: Vec<LoadedModel>,

    /// Declared totals; 0 means unknown.
    pub vram_total_bytes: u64,
    pub ram_total_bytes: u64,
    /// Derived free values; meaningful only when the matching total is known.
    pub vram_free_bytes: u64,
    pub ram_free_bytes: u64,
}

impl Node {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        Self {
            id: format!("{host}:{port}"),
            host,
            port,
            class: NodeClass::Unknown,
            healthy: true,
            last_probe_at: None,
            probe_failures: 0,
            first_seen: Instant::now(),
            available_models: Vec::new(),
            loaded_models: Vec::new(),
            vram_total_bytes: 0,
            ram_total_bytes: 0,
            vram_free_bytes: 0,
            ram_free_bytes: 0,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Whether the node runs on this machine. Used for the FAST local bonus
    /// and the `prefer_local` constraint.
    pub fn is_local(&self) -> bool {
        self.host == "localhost" || self.host.starts_with("127.")
    }

    /// Free VRAM as a fraction of the declared total; 0.0 when unknown.
    pub fn free_vram_ratio(&self) -> f64 {
        if self.vram_total_bytes == 0 {
            0.0
        } else {
            self.vram_free_bytes as f64 / self.vram_total_bytes as f64
        }
    }

    pub fn uptime(&self) -> std::time::Duration {
        self.first_seen.elapsed()
    }
}

/// Copy-on-write node set.
pub struct NodeRegistry {
    /// The lock is held only long enough to clone or swap the `Arc`, so
    /// snapshot readers never contend with writers mid-mutation.
    nodes: RwLock<Arc<Vec<Arc<Node>>>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// An immutable view of the current node set.
    pub fn snapshot(&self) -> Arc<Vec<Arc<Node>>> {
        self.nodes.read().expect("registry lock poisoned").clone()
    }

    pub fn get(&self, id: &str) -> Option<Arc<Node>> {
        self.snapshot().iter().find(|n| n.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Insert a discovery-derived node, or merge its static metadata into an
    /// existing entry. Live state (health, loaded models, free memory, probe
    /// bookkeeping) is preserved on merge; declared metadata only overwrites
    /// when the incoming value is actually known.
    pub fn upsert(&self, incoming: Node) {
        let mut guard = self.nodes.write().expect("registry lock poisoned");
        let mut next: Vec<Arc<Node>> = guard.as_ref().clone();

        match next.iter_mut().find(|n| n.id == incoming.id) {
            Some(slot) => {
                let mut merged = slot.as_ref().clone();
                if incoming.class != NodeClass::Unknown {
                    merged.class = incoming.class;
                }
                if incoming.vram_total_bytes != 0 {
                    merged.vram_total_bytes = incoming.vram_total_bytes;
                }
                if incoming.ram_total_bytes != 0 {
                    merged.ram_total_bytes = incoming.ram_total_bytes;
                }
                *slot = Arc::new(merged);
            }
            None => next.push(Arc::new(incoming)),
        }

        *guard = Arc::new(next);
    }

    /// Atomically apply a partial state update to one node.
    ///
    /// Returns false when the node is no longer registered.
    pub fn update(&self, id: &str, patch: impl FnOnce(&mut Node)) -> bool {
        let mut guard = self.nodes.write().expect("registry lock poisoned");
        let mut next: Vec<Arc<Node>> = guard.as_ref().clone();

        let Some(slot) = next.iter_mut().find(|n| n.id == id) else {
            return false;
        };
        let mut node = slot.as_ref().clone();
        patch(&mut node);
        *slot = Arc::new(node);

        *guard = Arc::new(next);
        true
    }

    /// Drop a node. Callers are responsible for the removal grace policy.
    pub fn remove(&self, id: &str) -> bool {
        let mut guard = self.nodes.write().expect("registry lock poisoned");
        let before = guard.len();
        let next: Vec<Arc<Node>> = guard.iter().filter(|n| n.id != id).cloned().collect();
        let removed = next.len() != before;
        *guard = Arc::new(next);
        removed
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gpu_node(host: &str) -> Node {
        let mut n = Node::new(host, 11434);
        n.class = NodeClass::Gpu;
        n.vram_total_bytes = 24 * 1024 * 1024 * 1024;
        n
    }

    // -----------------------------------------------------------------------
    // Upsert
    // -----------------------------------------------------------------------

    #[test]
    fn upsert_inserts_new_node() {
        let registry = NodeRegistry::new();
        registry.upsert(Node::new("10.0.0.5", 11434));

        assert_eq!(registry.len(), 1);
        let node = registry.get("10.0.0.5:11434").unwrap();
        assert_eq!(node.host, "10.0.0.5");
        assert!(node.healthy);
    }

    #[test]
    fn upsert_merge_preserves_live_state() {
        let registry = NodeRegistry::new();
        registry.upsert(gpu_node("10.0.0.5"));
        registry.update("10.0.0.5:11434", |n| {
            n.healthy = false;
            n.vram_free_bytes = 123;
            n.loaded_models.push(LoadedModel {
                name: "small-1b".into(),
                size_bytes: 1,
                vram_bytes: 1,
                expires_at: None,
            });
        });

        // Re-discovery of the same address must not clobber live state.
        registry.upsert(Node::new("10.0.0.5", 11434));

        let node = registry.get("10.0.0.5:11434").unwrap();
        assert!(!node.healthy);
        assert_eq!(node.vram_free_bytes, 123);
        assert_eq!(node.loaded_models.len(), 1);
        // Declared metadata survives a metadata-less rediscovery
        assert_eq!(node.class, NodeClass::Gpu);
        assert_eq!(node.vram_total_bytes, 24 * 1024 * 1024 * 1024);
    }

    #[test]
    fn upsert_merge_overwrites_known_metadata() {
        let registry = NodeRegistry::new();
        registry.upsert(Node::new("10.0.0.5", 11434));

        let mut declared = Node::new("10.0.0.5", 11434);
        declared.class = NodeClass::Cpu;
        declared.ram_total_bytes = 64;
        registry.upsert(declared);

        let node = registry.get("10.0.0.5:11434").unwrap();
        assert_eq!(node.class, NodeClass::Cpu);
        assert_eq!(node.ram_total_bytes, 64);
    }

    // -----------------------------------------------------------------------
    // Snapshot isolation
    // -----------------------------------------------------------------------

    #[test]
    fn snapshot_is_immutable_under_concurrent_updates() {
        let registry = NodeRegistry::new();
        registry.upsert(Node::new("a", 1));

        let snapshot = registry.snapshot();
        registry.update("a:1", |n| n.healthy = false);
        registry.upsert(Node::new("b", 2));

        // The earlier snapshot still shows one healthy node.
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot[0].healthy);
        // A fresh snapshot sees both writes.
        let fresh = registry.snapshot();
        assert_eq!(fresh.len(), 2);
        assert!(!fresh.iter().find(|n| n.id == "a:1").unwrap().healthy);
    }

    // -----------------------------------------------------------------------
    // Update / remove
    // -----------------------------------------------------------------------

    #[test]
    fn update_returns_false_for_unknown_node() {
        let registry = NodeRegistry::new();
        assert!(!registry.update("ghost:1", |n| n.healthy = false));
    }

    #[test]
    fn remove_drops_only_the_named_node() {
        let registry = NodeRegistry::new();
        registry.upsert(Node::new("a", 1));
        registry.upsert(Node::new("b", 2));

        assert!(registry.remove("a:1"));
        assert!(!registry.remove("a:1"));
        assert_eq!(registry.len(), 1);
        assert!(registry.get("b:2").is_some());
    }

    // -----------------------------------------------------------------------
    // Node helpers
    // -----------------------------------------------------------------------

    #[test]
    fn node_id_and_base_url_derive_from_address() {
        let node = Node::new("10.0.0.5", 11434);
        assert_eq!(node.id, "10.0.0.5:11434");
        assert_eq!(node.base_url(), "http://10.0.0.5:11434");
    }

    #[test]
    fn loopback_hosts_are_local() {
        assert!(Node::new("localhost", 11434).is_local());
        assert!(Node::new("127.0.0.1", 11434).is_local());
        assert!(!Node::new("10.0.0.5", 11434).is_local());
    }

    #[test]
    fn free_vram_ratio_handles_unknown_total() {
        let mut node = Node::new("a", 1);
        assert_eq!(node.free_vram_ratio(), 0.0);
        node.vram_total_bytes = 100;
        node.vram_free_bytes = 25;
        assert!((node.free_vram_ratio() - 0.25).abs() < f64::EPSILON);
    }
}
