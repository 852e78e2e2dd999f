//! HTTP surface for the fleet router.
//!
//! One listener carries everything: the generate proxy, model listing,
//! cluster telemetry, the reliability reset, and the liveness probe. There is
//! no authentication — the listener is expected to sit on a trusted network
//! or behind a fronting proxy.

pub mod generate;
pub mod health;
pub mod request_id;
pub mod status;

use std::{sync::Arc, time::Instant};

use axum::routing::{get, post};

use crate::router::Router;

/// Shared state injected into every handler.
pub struct AppState {
    pub router: Router,
    /// Process start, for the uptime figure in cluster stats.
    pub started_at: Instant,
}

impl AppState {
    pub fn new(router: Router) -> Self {
        Self {
            router,
            started_at: Instant::now(),
        }
    }
}

/// Build the public API router.
pub fn router(state: Arc<AppState>) -> axum::Router {
    axum::Router::new()
        .route("/api/generate", post(generate::generate))
        .route("/api/models", get(status::models))
        .route("/api/cluster/stats", get(status::cluster_stats))
        .route("/api/cluster/resources", get(status::node_resources))
        .route("/api/cluster/reliability/reset", post(status::reset_reliability))
        .route("/healthz", get(health::healthz))
        .with_state(state)
}
