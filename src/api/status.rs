//! Cluster telemetry endpoints.
//!
//! These expose the router's read-side operations: the per-node model
//! listing, aggregate cluster stats with per-node reliability, and the live
//! resource view. All of them are side-effect-free reads over registry
//! snapshots, so two concurrent calls always observe consistent node state.

use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, Json};
use serde::Deserialize;
use serde_json::json;

use super::AppState;

/// `GET /api/models` — map of node id to the models it can serve.
pub async fn models(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.router.list_models().await)
}

/// `GET /api/cluster/stats` — fleet health, scheduler load, and per-node
/// reliability, most reliable node first.
pub async fn cluster_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.router.cluster_stats();
    Json(json!({
        "status": "ok",
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "cluster": stats,
    }))
}

/// `GET /api/cluster/resources` — live memory and residency view per node.
pub async fn node_resources(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.router.node_resources())
}

#[derive(Debug, Default, Deserialize)]
pub struct ResetRequest {
    /// Reset a single node's counters; omit to reset the whole fleet.
    pub node_id: Option<String>,
}

/// `POST /api/cluster/reliability/reset` — explicit admin reset of
/// reliability counters. The only way counters change other than traffic.
pub async fn reset_reliability(
    State(state): State<Arc<AppState>>,
    body: Option<Json<ResetRequest>>,
) -> impl IntoResponse {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    state.router.reset_reliability(request.node_id.as_deref());
    Json(json!({
        "reset": request.node_id.as_deref().unwrap_or("all"),
    }))
}
