//! Request routing — the brain of llm-fleet.
//!
//! Three routing modes are supported:
//!
//! - **FAST**: performance-first weighted scoring across healthy nodes.
//! - **RELIABLE**: stability-first; only nodes with a proven success rate.
//! - **ASYNC**: resource-efficient background work; CPU nodes preferred,
//!   queueing acceptable.
//!
//! The router composes the registry, scheduler, reliability tracker, model
//! catalog and backend client. For every request it resolves the effective
//! model, asks the scheduler for an ordered candidate list, and walks that
//! list with failover: transport failures and 5xx move on to the next
//! candidate, 4xx and cancellation are terminal, and out-of-memory failures
//! walk the task's fallback chain to a smaller model. Every terminated
//! attempt lands in the reliability tracker whether or not failover
//! ultimately succeeded, and every response carries a [`RouteDecision`]
//! describing which nodes were tried and why.

use std::{
    collections::HashMap,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use futures_util::{stream, Stream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    catalog::ModelCatalog,
    client::{ChunkStream, ClientError, GenerateChunk, ModelInfo, NodeClient},
    config::{NodeClass, RequestConfig, RoutingMode},
    error::RouteError,
    registry::{LoadedModel, Node, NodeRegistry},
    reliability::{FailureKind, ReliabilityStats, ReliabilityTracker},
    scheduler::{AdmissionError, Constraints, NodeLease, Permit, Scheduler},
};

/// Deadline used when the caller sets none: far enough to be "unbounded"
/// without risking instant arithmetic overflow.
const NO_DEADLINE: Duration = Duration::from_secs(30 * 86_400);

/// One inference request, as seen by the router.
#[derive(Debug)]
pub struct GenerateRequest {
    /// Opaque id; echoed in the decision. Defaults to a fresh UUID.
    pub id: String,
    pub model: String,
    /// Pass-through body for the backend (prompt, options, ...). The router
    /// only rewrites the `model` and `stream` fields.
    pub payload: Value,
    /// Priority in `[0, 10]`; higher is dequeued first. Values above 10 clamp.
    pub priority: u8,
    /// Routing mode; `None` uses the configured default.
    pub mode: Option<RoutingMode>,
    /// Tag for fallback-chain lookup. Opaque to the router.
    pub task_kind: Option<String>,
    pub constraints: Constraints,
    /// Per-attempt timeout override in milliseconds.
    pub attempt_timeout_ms: Option<u64>,
    /// Total request budget in milliseconds; `None` means unbounded.
    pub deadline_ms: Option<u64>,
    pub cancel: CancellationToken,
}

impl GenerateRequest {
    pub fn new(model: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            model: model.into(),
            payload,
            priority: 5,
            mode: None,
            task_kind: None,
            constraints: Constraints::default(),
            attempt_timeout_ms: None,
            deadline_ms: None,
            cancel: CancellationToken::new(),
        }
    }
}

/// Outcome of one attempt against one node.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failed { kind: FailureKind },
}

#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub node_id: String,
    pub model: String,
    pub outcome: AttemptOutcome,
    pub latency_ms: u64,
}

/// How a request was routed; returned with every response and embedded in
/// every routing failure so callers can reconstruct what was tried.
#[derive(Debug, Clone, Serialize)]
pub struct RouteDecision {
    pub request_id: String,
    pub mode: RoutingMode,
    pub selected_node_id: Option<String>,
    pub reason: String,
    pub candidates_tried: Vec<AttemptRecord>,
    pub model_used: String,
    pub fallback_applied: bool,
}

impl RouteDecision {
    fn new(request_id: String, mode: RoutingMode, model: String) -> Self {
        Self {
            request_id,
            mode,
            selected_node_id: None,
            reason: String::new(),
            candidates_tried: Vec::new(),
            model_used: model,
            fallback_applied: false,
        }
    }

    fn record_failure(&mut self, node_id: &str, model: &str, kind: FailureKind, latency: Duration) {
        self.candidates_tried.push(AttemptRecord {
            node_id: node_id.to_owned(),
            model: model.to_owned(),
            outcome: AttemptOutcome::Failed { kind },
            latency_ms: latency.as_millis() as u64,
        });
    }

    fn record_success(&mut self, node_id: &str, model: &str, latency: Duration) {
        self.candidates_tried.push(AttemptRecord {
            node_id: node_id.to_owned(),
            model: model.to_owned(),
            outcome: AttemptOutcome::Success,
            latency_ms: latency.as_millis() as u64,
        });
        self.selected_node_id = Some(node_id.to_owned());
        self.model_used = model.to_owned();
    }
}

impl std::fmt::Display for RouteDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "mode={} model={}", self.mode, self.model_used)?;
        if let Some(node) = &self.selected_node_id {
            write!(f, " node={node}")?;
        }
        if self.fallback_applied {
            write!(f, " fallback=true")?;
        }
        if !self.candidates_tried.is_empty() {
            write!(f, " tried=[")?;
            for (i, attempt) in self.candidates_tried.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                match &attempt.outcome {
                    AttemptOutcome::Success => write!(f, "{}:ok", attempt.node_id)?,
                    AttemptOutcome::Failed { kind } => {
                        write!(f, "{}:{kind}", attempt.node_id)?
                    }
                }
            }
            write!(f, "]")?;
        }
        Ok(())
    }
}

/// Aggregate fleet telemetry.
#[derive(Debug, Serialize)]
pub struct ClusterStats {
    pub nodes_total: usize,
    pub nodes_healthy: usize,
    pub gpu_nodes: usize,
    pub cpu_nodes: usize,
    pub in_flight: usize,
    pub queued: usize,
    pub per_node_stats: Vec<NodeStatsView>,
}

#[derive(Debug, Serialize)]
pub struct NodeStatsView {
    pub node_id: String,
    pub healthy: bool,
    pub in_flight: usize,
    pub reliability: ReliabilityStats,
}

/// Live resource view of one node.
#[derive(Debug, Serialize)]
pub struct NodeResourceView {
    pub id: String,
    pub class: NodeClass,
    pub healthy: bool,
    pub vram_total_bytes: u64,
    pub vram_free_bytes: u64,
    pub ram_total_bytes: u64,
    pub ram_free_bytes: u64,
    pub loaded_models: Vec<LoadedModel>,
    pub available_models: Vec<String>,
    pub in_flight: usize,
    pub uptime_secs: u64,
    pub last_probe_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// The public routing surface. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct Router {
    registry: Arc<NodeRegistry>,
    scheduler: Scheduler,
    tracker: Arc<ReliabilityTracker>,
    catalog: Arc<ModelCatalog>,
    client: Arc<NodeClient>,
    request_cfg: RequestConfig,
    default_mode: RoutingMode,
}

/// What a finished attempt means for the candidate walk.
enum Verdict {
    /// Try the next candidate.
    Failover,
    /// Candidate walk is over for this model; maybe walk the fallback chain.
    Oom,
    /// Surface this error now.
    Terminal(RouteError),
}

impl Router {
    pub fn new(
        registry: Arc<NodeRegistry>,
        scheduler: Scheduler,
        tracker: Arc<ReliabilityTracker>,
        catalog: Arc<ModelCatalog>,
        client: Arc<NodeClient>,
        request_cfg: RequestConfig,
        default_mode: RoutingMode,
    ) -> Self {
        Self {
            registry,
            scheduler,
            tracker,
            catalog,
            client,
            request_cfg,
            default_mode,
        }
    }

    /// Unary generation.
    #[tracing::instrument(skip(self, req), fields(request = %req.id, model = %req.model))]
    pub async fn generate(&self, req: GenerateRequest) -> Result<(Value, RouteDecision), RouteError> {
        let route = self.prepare(&req)?;
        let permit = self.admit(&req, &route).await?;
        self.drive(req, route, permit, false).await.map(|(outcome, decision)| {
            match outcome {
                Dispatched::Unary(value) => (value, decision),
                Dispatched::Stream(_) => unreachable!("unary dispatch returned a stream"),
            }
        })
    }

    /// Streaming generation. The decision is finalized when the first chunk
    /// arrives; from then on failures are terminal and never retried.
    #[tracing::instrument(skip(self, req), fields(request = %req.id, model = %req.model))]
    pub async fn generate_stream(
        &self,
        req: GenerateRequest,
    ) -> Result<(RoutedStream, RouteDecision), RouteError> {
        let route = self.prepare(&req)?;
        let permit = self.admit(&req, &route).await?;
        self.drive(req, route, permit, true).await.map(|(outcome, decision)| {
            match outcome {
                Dispatched::Stream(s) => (s, decision),
                Dispatched::Unary(_) => unreachable!("stream dispatch returned a unary body"),
            }
        })
    }

    /// Live model listing per node. Idempotent and side-effect-free: nodes
    /// that fail to answer fall back to their cached tags listing.
    pub async fn list_models(&self) -> HashMap<String, Vec<ModelInfo>> {
        let snapshot = self.registry.snapshot();
        stream::iter(snapshot.iter().cloned())
            .map(|node| {
                let client = Arc::clone(&self.client);
                async move {
                    let models = match client.tags(&node).await {
                        Ok(models) => models,
                        Err(e) => {
                            debug!(node = %node.id, error = %e, "tags listing failed — serving cached names");
                            node.available_models
                                .iter()
                                .map(|name| ModelInfo { name: name.clone(), size: 0 })
                                .collect()
                        }
                    };
                    (node.id.clone(), models)
                }
            })
            .buffer_unordered(8)
            .collect()
            .await
    }

    pub fn cluster_stats(&self) -> ClusterStats {
        let snapshot = self.registry.snapshot();
        let ranked = self.tracker.most_reliable(0.0);
        let position = |id: &str| {
            ranked
                .iter()
                .position(|r| r == id)
                .unwrap_or(usize::MAX)
        };

        let mut nodes: Vec<&Arc<Node>> = snapshot.iter().collect();
        nodes.sort_by(|a, b| position(&a.id).cmp(&position(&b.id)).then(a.id.cmp(&b.id)));

        ClusterStats {
            nodes_total: snapshot.len(),
            nodes_healthy: snapshot.iter().filter(|n| n.healthy).count(),
            gpu_nodes: snapshot.iter().filter(|n| n.class == NodeClass::Gpu).count(),
            cpu_nodes: snapshot.iter().filter(|n| n.class == NodeClass::Cpu).count(),
            in_flight: self.scheduler.global_in_flight(),
            queued: self.scheduler.queue_len(),
            per_node_stats: nodes
                .into_iter()
                .map(|n| NodeStatsView {
                    node_id: n.id.clone(),
                    healthy: n.healthy,
                    in_flight: self.scheduler.node_in_flight(&n.id),
                    reliability: self.tracker.stats(&n.id),
                })
                .collect(),
        }
    }

    pub fn node_resources(&self) -> Vec<NodeResourceView> {
        self.registry
            .snapshot()
            .iter()
            .map(|n| NodeResourceView {
                id: n.id.clone(),
                class: n.class,
                healthy: n.healthy,
                vram_total_bytes: n.vram_total_bytes,
                vram_free_bytes: n.vram_free_bytes,
                ram_total_bytes: n.ram_total_bytes,
                ram_free_bytes: n.ram_free_bytes,
                loaded_models: n.loaded_models.clone(),
                available_models: n.available_models.clone(),
                in_flight: self.scheduler.node_in_flight(&n.id),
                uptime_secs: n.uptime().as_secs(),
                last_probe_at: n.last_probe_at,
            })
            .collect()
    }

    /// Admin-only: clear reliability history for one node or the whole fleet.
    pub fn reset_reliability(&self, node_id: Option<&str>) {
        match node_id {
            Some(id) => self.tracker.reset(id),
            None => self.tracker.reset_all(),
        }
    }

    // -- request lifecycle ---------------------------------------------------

    fn prepare(&self, req: &GenerateRequest) -> Result<RouteState, RouteError> {
        let mode = req.mode.unwrap_or(self.default_mode);
        let decision = RouteDecision::new(req.id.clone(), mode, req.model.clone());

        if self.registry.is_empty() {
            let mut decision = decision;
            decision.reason = "no nodes registered".into();
            return Err(RouteError::NodeUnreachable { decision });
        }

        let started = tokio::time::Instant::now();
        let deadline = started
            + req
                .deadline_ms
                .map(Duration::from_millis)
                .unwrap_or(NO_DEADLINE);
        let attempt_timeout = Duration::from_millis(
            req.attempt_timeout_ms.unwrap_or(self.request_cfg.timeout_ms),
        );

        Ok(RouteState { mode, decision, deadline, attempt_timeout })
    }

    async fn admit(&self, req: &GenerateRequest, route: &RouteState) -> Result<Permit, RouteError> {
        // A request canceled before admission must leave no trace anywhere.
        if req.cancel.is_cancelled() {
            return Err(RouteError::Canceled);
        }
        self.scheduler
            .acquire(
                req.priority.min(10),
                route.mode == RoutingMode::Async,
                route.deadline,
                &req.cancel,
            )
            .await
            .map_err(|e| match e {
                AdmissionError::Overloaded => RouteError::Overloaded,
                AdmissionError::Canceled => RouteError::Canceled,
                AdmissionError::DeadlineExceeded => RouteError::DeadlineExceeded,
            })
    }

    /// Candidate walk with failover and fallback-chain restarts. Shared by
    /// the unary and streaming paths.
    async fn drive(
        &self,
        req: GenerateRequest,
        mut route: RouteState,
        permit: Permit,
        streaming: bool,
    ) -> Result<(Dispatched, RouteDecision), RouteError> {
        let mut permit = Some(permit);
        let mut model = req.model.clone();

        loop {
            let candidates = self.candidates(&model, &req, &mut route)?;
            if candidates.is_empty() {
                if route.decision.candidates_tried.is_empty() {
                    route.decision.reason = format!("no eligible node for model {model}");
                    return Err(RouteError::NodeUnreachable { decision: route.decision });
                }
                return Err(self.exhausted(route.decision));
            }

            let mut oom_seen = false;
            for node_id in candidates {
                let Some(node) = self.registry.get(&node_id) else {
                    continue;
                };
                let Some(lease) = self.scheduler.try_lease(&node_id) else {
                    debug!(node = %node_id, "node at concurrency cap — skipping");
                    continue;
                };

                let now = tokio::time::Instant::now();
                if now >= route.deadline {
                    return Err(RouteError::DeadlineExceeded);
                }
                let remaining = route.deadline - now;
                let per_attempt = route.attempt_timeout.min(remaining);
                let truncated = remaining < route.attempt_timeout;

                let payload = rewrite_payload(&req.payload, &model, streaming);
                let t0 = std::time::Instant::now();

                let outcome = if streaming {
                    match self
                        .client
                        .generate_stream(&node, payload, per_attempt, route.deadline, &req.cancel)
                        .await
                    {
                        Ok(chunks) => self.await_first_chunk(chunks).await,
                        Err(e) => Err(e),
                    }
                } else {
                    self.client
                        .generate(&node, payload, per_attempt, &req.cancel)
                        .await
                        .and_then(|value| check_in_band_error(value, &self.catalog))
                        .map(Dispatched::Unary)
                };
                let latency = t0.elapsed();

                match outcome {
                    Ok(dispatched) => {
                        self.tracker.record_success(&node_id, latency);
                        route.decision.record_success(&node_id, &model, latency);
                        route.decision.reason = format!(
                            "{}: selected {} for {}",
                            route.mode, node_id, model
                        );
                        debug!(node = %node_id, model = %model, latency_ms = latency.as_millis() as u64, "dispatch succeeded");

                        let dispatched = match dispatched {
                            Dispatched::Stream(pending) => Dispatched::Stream(RoutedStream::commit(
                                pending,
                                node_id.clone(),
                                Arc::clone(&self.tracker),
                                permit.take().expect("permit consumed once"),
                                lease,
                            )),
                            unary => unary,
                        };
                        return Ok((dispatched, route.decision));
                    }
                    Err(err) => {
                        let kind = FailureKind::from(&err);
                        self.tracker.record_failure(&node_id, kind, Some(latency));
                        route.decision.record_failure(&node_id, &model, kind, latency);
                        warn!(node = %node_id, model = %model, error = %err, "attempt failed");
                        drop(lease);

                        match self.judge(&node_id, err, truncated, &route) {
                            Verdict::Failover => continue,
                            Verdict::Oom => {
                                oom_seen = true;
                                continue;
                            }
                            Verdict::Terminal(e) => return Err(e),
                        }
                    }
                }
            }

            // All candidates for this model are exhausted. An OOM anywhere in
            // the round lets the fallback chain restart the walk with the
            // next smaller model.
            if oom_seen {
                if let Some(task) = req.task_kind.as_deref() {
                    if let Some(next) = self.catalog.fallback_after(&model, task) {
                        debug!(from = %model, to = %next, "walking fallback chain");
                        route.decision.fallback_applied = true;
                        model = next.to_owned();
                        continue;
                    }
                }
                if route.decision.fallback_applied {
                    route.decision.reason = "fallback chain exhausted".into();
                    return Err(RouteError::FallbackExhausted { decision: route.decision });
                }
            }
            return Err(self.exhausted(route.decision));
        }
    }

    /// Resolve the candidate list for one model round, honoring pinning.
    fn candidates(
        &self,
        model: &str,
        req: &GenerateRequest,
        route: &mut RouteState,
    ) -> Result<Vec<String>, RouteError> {
        let snapshot = self.registry.snapshot();

        if let Some(pin) = &req.constraints.pin_node_id {
            let Some(node) = snapshot.iter().find(|n| &n.id == pin) else {
                route.decision.reason = format!("pinned node {pin} is not registered");
                return Err(RouteError::NodeUnreachable { decision: route.decision.clone() });
            };
            if !node.healthy || !self.catalog.fits(model, node) {
                route.decision.reason = format!("pinned node {pin} is unavailable");
                return Err(RouteError::NodeUnreachable { decision: route.decision.clone() });
            }
            return Ok(vec![pin.clone()]);
        }

        Ok(self.scheduler.plan(
            model,
            route.mode,
            &req.constraints,
            &snapshot,
            &self.tracker,
            &self.catalog,
        ))
    }

    /// Pull the first chunk so the stream either commits to this node or
    /// fails over like any request-start failure.
    async fn await_first_chunk(&self, mut chunks: ChunkStream) -> Result<Dispatched, ClientError> {
        match chunks.next().await {
            Some(Ok(first)) => Ok(Dispatched::Stream(PendingStream { first, rest: chunks })),
            Some(Err(e)) => Err(e),
            None => Err(ClientError::MalformedResponse(
                "stream closed before the first chunk".into(),
            )),
        }
    }

    /// Decide what a failed attempt means for the walk.
    fn judge(&self, node_id: &str, err: ClientError, truncated: bool, route: &RouteState) -> Verdict {
        match err {
            ClientError::Canceled => Verdict::Terminal(RouteError::Canceled),
            ClientError::Timeout if truncated => Verdict::Terminal(RouteError::DeadlineExceeded),
            ClientError::Timeout => Verdict::Failover,
            ClientError::Unreachable(_) => {
                // A node that cannot be contacted is out of rotation until
                // the monitor sees it answer again.
                self.registry.update(node_id, |n| n.healthy = false);
                Verdict::Failover
            }
            ClientError::HttpStatus { status, body } if (400..500).contains(&status) => {
                Verdict::Terminal(RouteError::BadRequest {
                    status,
                    body,
                    decision: route.decision.clone(),
                })
            }
            ClientError::HttpStatus { .. } | ClientError::MalformedResponse(_) => Verdict::Failover,
            ClientError::OomSuspected(_) => Verdict::Oom,
        }
    }

    /// Map an exhausted candidate walk onto the public error taxonomy.
    fn exhausted(&self, mut decision: RouteDecision) -> RouteError {
        let failed_kinds: Vec<FailureKind> = decision
            .candidates_tried
            .iter()
            .filter_map(|a| match &a.outcome {
                AttemptOutcome::Failed { kind } => Some(*kind),
                AttemptOutcome::Success => None,
            })
            .collect();

        if decision.reason.is_empty() {
            decision.reason = "all candidates failed".into();
        }

        if failed_kinds.is_empty() || failed_kinds.iter().all(|k| *k == FailureKind::Unreachable) {
            return RouteError::NodeUnreachable { decision };
        }
        if let [only] = failed_kinds.as_slice() {
            match only {
                FailureKind::Timeout => return RouteError::Timeout { decision },
                FailureKind::Malformed => return RouteError::MalformedResponse { decision },
                _ => {}
            }
        }
        RouteError::AllCandidatesFailed { decision }
    }
}

/// Per-request routing state threaded through the lifecycle.
struct RouteState {
    mode: RoutingMode,
    decision: RouteDecision,
    deadline: tokio::time::Instant,
    attempt_timeout: Duration,
}

/// A stream that produced its first chunk but is not wired up yet.
struct PendingStream {
    first: GenerateChunk,
    rest: ChunkStream,
}

enum Dispatched {
    Unary(Value),
    Stream(PendingStream),
}

/// Rewrite only the routing-owned fields of the pass-through payload.
fn rewrite_payload(payload: &Value, model: &str, streaming: bool) -> Value {
    let mut payload = payload.clone();
    if let Some(obj) = payload.as_object_mut() {
        obj.insert("model".into(), Value::String(model.to_owned()));
        obj.insert("stream".into(), Value::Bool(streaming));
    }
    payload
}

/// Backends sometimes report failures in-band with HTTP 200; surface them
/// through the same error taxonomy as status-level failures.
fn check_in_band_error(value: Value, catalog: &ModelCatalog) -> Result<Value, ClientError> {
    if let Some(message) = value.get("error").and_then(Value::as_str) {
        return Err(if catalog.looks_like_oom(message) {
            ClientError::OomSuspected(message.to_owned())
        } else {
            ClientError::MalformedResponse(format!("backend error: {message}"))
        });
    }
    Ok(value)
}

/// A committed generate stream.
///
/// Holds the scheduler permit and node lease for its whole lifetime and
/// records exactly one reliability outcome: success on the `done` marker or a
/// clean close, failure on a mid-stream error or on being dropped before the
/// terminal event. Mid-stream failures are terminal — the router never
/// silently retries a stream that already produced output.
pub struct RoutedStream {
    first: Option<GenerateChunk>,
    inner: ChunkStream,
    node_id: String,
    tracker: Arc<ReliabilityTracker>,
    started: std::time::Instant,
    settled: bool,
    failed: bool,
    _permit: Permit,
    _lease: NodeLease,
}

impl RoutedStream {
    fn commit(
        pending: PendingStream,
        node_id: String,
        tracker: Arc<ReliabilityTracker>,
        permit: Permit,
        lease: NodeLease,
    ) -> Self {
        Self {
            first: Some(pending.first),
            inner: pending.rest,
            node_id,
            tracker,
            started: std::time::Instant::now(),
            settled: false,
            failed: false,
            _permit: permit,
            _lease: lease,
        }
    }

    fn settle_success(&mut self) {
        if !self.settled {
            self.settled = true;
            self.tracker.record_success(&self.node_id, self.started.elapsed());
        }
    }

    fn settle_failure(&mut self, kind: FailureKind) {
        if !self.settled {
            self.settled = true;
            self.tracker
                .record_failure(&self.node_id, kind, Some(self.started.elapsed()));
        }
    }
}

impl Stream for RoutedStream {
    type Item = Result<GenerateChunk, ClientError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if let Some(first) = this.first.take() {
            if first.done {
                this.settle_success();
            }
            return Poll::Ready(Some(Ok(first)));
        }
        if this.failed {
            return Poll::Ready(None);
        }

        match this.inner.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if chunk.done {
                    this.settle_success();
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.settle_failure(FailureKind::from(&e));
                this.failed = true;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.settle_success();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for RoutedStream {
    fn drop(&mut self) {
        // Abandoned mid-stream: the backend connection is torn down by the
        // ChunkStream guard; the node wears the failure.
        self.settle_failure(FailureKind::Canceled);
    }
}
