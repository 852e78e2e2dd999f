//! Admission control and node selection.
//!
//! The scheduler is the single cross-request serialization point. It owns a
//! global in-flight budget with a priority-ordered waiting queue, per-node
//! in-flight counters, and the ranking logic for the three routing modes.
//!
//! Permits and node leases are RAII guards: release happens on drop, so the
//! counters cannot leak on early returns, cancellation, or panics.
//!
//! A waiter that is canceled or deadline-expired removes itself from the
//! queue without side effects. A waiter whose future is dropped outright is
//! swept lazily: permit handoff skips dead receivers, and the queue is purged
//! of them before an `Overloaded` rejection is issued.

use std::{
    cmp::Reverse,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::{
    catalog::ModelCatalog,
    config::{NodeClass, ReliabilityConfig, RoutingConfig, RoutingMode, SchedulerConfig},
    registry::Node,
    reliability::ReliabilityTracker,
};

/// Why admission was refused.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("scheduler queue is full")]
    Overloaded,
    #[error("canceled while waiting for a permit")]
    Canceled,
    #[error("deadline expired while waiting for a permit")]
    DeadlineExceeded,
}

/// Per-request routing constraints.
#[derive(Debug, Clone, Default)]
pub struct Constraints {
    /// Exclude nodes with less free VRAM than this (unknown VRAM passes).
    pub min_free_vram_bytes: Option<u64>,
    /// Route to exactly this node; no silent fallback.
    pub pin_node_id: Option<String>,
    /// Restrict to loopback nodes when any qualifies.
    pub prefer_local: bool,
    /// Override the RELIABLE success-rate floor; in other modes, exclude warm
    /// nodes observed below it.
    pub min_success_rate: Option<f64>,
    /// Rank CPU-class nodes ahead of GPU regardless of mode scoring.
    pub prefer_cpu: bool,
}

struct Waiter {
    seq: u64,
    priority: u8,
    /// ASYNC-mode requests queue behind FAST/RELIABLE waiters of equal priority.
    background: bool,
    tx: oneshot::Sender<()>,
}

#[derive(Default)]
struct Admission {
    in_flight: usize,
    queue: Vec<Waiter>,
}

struct Inner {
    max_in_flight: usize,
    per_node_cap: usize,
    queue_soft_cap: usize,
    state: Mutex<Admission>,
    node_load: DashMap<String, usize>,
    seq: AtomicU64,
}

impl Inner {
    /// Release one unit of the global budget, preferring to hand it to the
    /// best waiter instead of returning it to the pool.
    fn release(&self) {
        let mut state = self.state.lock().expect("scheduler lock poisoned");
        loop {
            let Some(idx) = best_waiter(&state.queue) else {
                state.in_flight -= 1;
                return;
            };
            let waiter = state.queue.swap_remove(idx);
            if waiter.tx.send(()).is_ok() {
                // Permit transferred; in_flight is unchanged.
                return;
            }
            // Receiver is gone (abandoned waiter) — try the next one.
        }
    }
}

/// Index of the waiter to admit next: highest priority, foreground before
/// background at equal priority, FIFO within that.
fn best_waiter(queue: &[Waiter]) -> Option<usize> {
    queue
        .iter()
        .enumerate()
        .min_by_key(|(_, w)| (Reverse(w.priority), w.background, w.seq))
        .map(|(idx, _)| idx)
}

/// A unit of the global in-flight budget. Dropping it re-admits the queue head.
pub struct Permit {
    inner: Arc<Inner>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.inner.release();
    }
}

/// A unit of one node's in-flight budget.
pub struct NodeLease {
    inner: Arc<Inner>,
    node_id: String,
}

impl Drop for NodeLease {
    fn drop(&mut self) {
        if let Some(mut count) = self.inner.node_load.get_mut(&self.node_id) {
            *count = count.saturating_sub(1);
        }
    }
}

/// Bounded-concurrency admission plus mode-ranked candidate selection.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
    routing: RoutingConfig,
    reliability: ReliabilityConfig,
}

impl Scheduler {
    pub fn new(
        scheduler: &SchedulerConfig,
        routing: RoutingConfig,
        reliability: ReliabilityConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                max_in_flight: scheduler.max_in_flight,
                per_node_cap: scheduler.per_node_cap,
                queue_soft_cap: scheduler.queue_soft_cap,
                state: Mutex::new(Admission::default()),
                node_load: DashMap::new(),
                seq: AtomicU64::new(0),
            }),
            routing,
            reliability,
        }
    }

    /// Acquire a unit of the global budget, waiting in priority order.
    pub async fn acquire(
        &self,
        priority: u8,
        background: bool,
        deadline: tokio::time::Instant,
        cancel: &CancellationToken,
    ) -> Result<Permit, AdmissionError> {
        let (seq, rx) = {
            let mut state = self.inner.state.lock().expect("scheduler lock poisoned");
            if state.in_flight < self.inner.max_in_flight {
                state.in_flight += 1;
                return Ok(Permit { inner: Arc::clone(&self.inner) });
            }
            if state.queue.len() >= self.inner.queue_soft_cap {
                // Abandoned waiters don't count against live traffic.
                state.queue.retain(|w| !w.tx.is_closed());
                if state.queue.len() >= self.inner.queue_soft_cap {
                    return Err(AdmissionError::Overloaded);
                }
            }
            let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = oneshot::channel();
            state.queue.push(Waiter { seq, priority, background, tx });
            (seq, rx)
        };

        let mut rx = rx;
        tokio::select! {
            _ = cancel.cancelled() => {
                self.abandon(seq, &mut rx);
                Err(AdmissionError::Canceled)
            }
            _ = tokio::time::sleep_until(deadline) => {
                self.abandon(seq, &mut rx);
                Err(AdmissionError::DeadlineExceeded)
            }
            handoff = &mut rx => match handoff {
                Ok(()) => Ok(Permit { inner: Arc::clone(&self.inner) }),
                // The scheduler never drops senders without sending; treat a
                // closed channel as cancellation.
                Err(_) => Err(AdmissionError::Canceled),
            }
        }
    }

    /// Remove a waiter from the queue. If a permit won the race and was
    /// already dispatched to it, release that permit again.
    fn abandon(&self, seq: u64, rx: &mut oneshot::Receiver<()>) {
        let removed = {
            let mut state = self.inner.state.lock().expect("scheduler lock poisoned");
            let before = state.queue.len();
            state.queue.retain(|w| w.seq != seq);
            state.queue.len() != before
        };
        if !removed {
            if let Ok(()) = rx.try_recv() {
                self.inner.release();
            }
        }
    }

    /// Claim a unit of `node_id`'s budget, or `None` when the node is at its cap.
    pub fn try_lease(&self, node_id: &str) -> Option<NodeLease> {
        let mut count = self.inner.node_load.entry(node_id.to_owned()).or_insert(0);
        if *count >= self.inner.per_node_cap {
            return None;
        }
        *count += 1;
        drop(count);
        Some(NodeLease {
            inner: Arc::clone(&self.inner),
            node_id: node_id.to_owned(),
        })
    }

    pub fn node_in_flight(&self, node_id: &str) -> usize {
        self.inner.node_load.get(node_id).map(|c| *c).unwrap_or(0)
    }

    pub fn global_in_flight(&self) -> usize {
        self.inner.state.lock().expect("scheduler lock poisoned").in_flight
    }

    pub fn queue_len(&self) -> usize {
        self.inner.state.lock().expect("scheduler lock poisoned").queue.len()
    }

    /// Rank the nodes of `snapshot` for one request.
    ///
    /// Returns an ordered candidate list (best first) so the router can fail
    /// over; an empty list means nothing eligible fits.
    pub fn plan(
        &self,
        model: &str,
        mode: RoutingMode,
        constraints: &Constraints,
        snapshot: &[Arc<Node>],
        tracker: &ReliabilityTracker,
        catalog: &ModelCatalog,
    ) -> Vec<String> {
        let mut eligible: Vec<&Arc<Node>> = snapshot
            .iter()
            .filter(|n| n.healthy)
            .filter(|n| catalog.fits(model, n))
            .filter(|n| match constraints.min_free_vram_bytes {
                // Unknown VRAM totals are not excluded by the constraint alone.
                Some(min) => n.vram_total_bytes == 0 || n.vram_free_bytes >= min,
                None => true,
            })
            .filter(|n| match constraints.min_success_rate {
                Some(floor) if mode != RoutingMode::Reliable => {
                    !tracker.is_warm(&n.id) || tracker.stats(&n.id).success_rate >= floor
                }
                _ => true,
            })
            .collect();

        if constraints.prefer_local && eligible.iter().any(|n| n.is_local()) {
            eligible.retain(|n| n.is_local());
        }

        let mut ordered = match mode {
            RoutingMode::Fast => self.rank_fast(eligible, tracker),
            RoutingMode::Reliable => self.rank_reliable(eligible, constraints, tracker),
            RoutingMode::Async => self.rank_async(eligible),
        };

        if constraints.prefer_cpu {
            // Stable partition keeps each group's internal order.
            let (cpu, gpu): (Vec<_>, Vec<_>) = ordered
                .into_iter()
                .partition(|n| n.class != NodeClass::Gpu);
            ordered = cpu.into_iter().chain(gpu).collect();
        }

        ordered.into_iter().map(|n| n.id.clone()).collect()
    }

    /// FAST: weighted score over load, hardware, memory headroom, locality,
    /// latency and recent failures. Ties break toward lower in-flight, then
    /// stable node id.
    fn rank_fast<'a>(
        &self,
        eligible: Vec<&'a Arc<Node>>,
        tracker: &ReliabilityTracker,
    ) -> Vec<&'a Arc<Node>> {
        let w = &self.routing;
        let mut scored: Vec<(f64, usize, &'a Arc<Node>)> = eligible
            .into_iter()
            .map(|n| {
                let in_flight = self.node_in_flight(&n.id);
                let stats = tracker.stats(&n.id);
                let gpu_bonus = if n.class == NodeClass::Gpu { 1.0 } else { 0.0 };
                let local_bonus = if n.is_local() { 1.0 } else { 0.0 };
                let failure_penalty = 1.0 - tracker.ranking_rate(&n.id);
                let score = w.w_load * (1.0 / (1.0 + in_flight as f64))
                    + w.w_gpu * gpu_bonus
                    + w.w_vram * n.free_vram_ratio()
                    + w.w_local * local_bonus
                    + w.w_latency * (1.0 / (1.0 + stats.latency_mean_ms / 1000.0))
                    - w.w_failure * failure_penalty;
                (score, in_flight, n)
            })
            .collect();

        scored.sort_by(|a, b| {
            b.0.total_cmp(&a.0)
                .then(a.1.cmp(&b.1))
                .then(a.2.id.cmp(&b.2.id))
        });
        scored.into_iter().map(|(_, _, n)| n).collect()
    }

    /// RELIABLE: warm nodes at or above the success-rate floor, ranked by
    /// rate, then latency variance, then uptime. Falls back to FAST scoring
    /// when no node qualifies.
    fn rank_reliable<'a>(
        &self,
        eligible: Vec<&'a Arc<Node>>,
        constraints: &Constraints,
        tracker: &ReliabilityTracker,
    ) -> Vec<&'a Arc<Node>> {
        let floor = constraints
            .min_success_rate
            .unwrap_or(self.reliability.min_success_rate);

        let mut proven: Vec<&'a Arc<Node>> = eligible
            .iter()
            .copied()
            .filter(|n| tracker.is_warm(&n.id) && tracker.stats(&n.id).success_rate >= floor)
            .collect();

        if proven.is_empty() {
            return self.rank_fast(eligible, tracker);
        }

        proven.sort_by(|a, b| {
            let sa = tracker.stats(&a.id);
            let sb = tracker.stats(&b.id);
            sb.success_rate
                .total_cmp(&sa.success_rate)
                .then(sa.latency_variance.total_cmp(&sb.latency_variance))
                .then(b.uptime().cmp(&a.uptime()))
                .then(a.id.cmp(&b.id))
        });
        proven
    }

    /// ASYNC: CPU-class nodes first (lowest in-flight wins), GPU nodes as a
    /// failover tail. No local preference.
    fn rank_async<'a>(&self, eligible: Vec<&'a Arc<Node>>) -> Vec<&'a Arc<Node>> {
        let (mut cpu, mut gpu): (Vec<_>, Vec<_>) = eligible
            .into_iter()
            .partition(|n| n.class != NodeClass::Gpu);

        let by_load = |a: &&Arc<Node>, b: &&Arc<Node>| {
            self.node_in_flight(&a.id)
                .cmp(&self.node_in_flight(&b.id))
                .then(a.id.cmp(&b.id))
        };
        cpu.sort_by(by_load);
        gpu.sort_by(by_load);
        cpu.into_iter().chain(gpu).collect()
    }
}
