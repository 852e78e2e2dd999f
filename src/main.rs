use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Context;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

mod api;
mod catalog;
mod client;
mod config;
mod discovery;
mod error;
mod monitor;
mod registry;
mod reliability;
mod router;
mod scheduler;

pub use config::Config;
pub use error::RouteError;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // When invoked as a Docker HEALTHCHECK, hit /healthz and exit immediately.
    // This avoids needing any external tool (curl/wget) in the container image.
    if std::env::args().nth(1).as_deref() == Some("--healthcheck") {
        return healthcheck().await;
    }

    // Initialise tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "llm_fleet_rs=info,tower_http=warn".into()),
        )
        .init();

    // Load config
    let config_path = std::env::var("FLEET_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("fleet.toml"));

    let config = Config::load_or_default(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    info!(
        port = config.server.port,
        seeds = config.discovery.seeds.len() + config.discovery.nodes.len(),
        subnet_scan = config.discovery.scan_local_subnet,
        "llm-fleet starting"
    );

    // Assemble the components. Everything is injected explicitly; background
    // loops share state only through the registry and scheduler.
    let catalog = Arc::new(catalog::ModelCatalog::new(&config.catalog)?);
    let registry = Arc::new(registry::NodeRegistry::new());
    let tracker = Arc::new(reliability::ReliabilityTracker::new(
        config.reliability.latency_window,
        config.reliability.warm_requests,
    ));
    let node_client = Arc::new(client::NodeClient::new(&config.request, catalog.oom_matcher()));
    let fleet_scheduler = scheduler::Scheduler::new(
        &config.scheduler,
        config.routing.clone(),
        config.reliability.clone(),
    );
    let fleet_router = router::Router::new(
        Arc::clone(&registry),
        fleet_scheduler.clone(),
        Arc::clone(&tracker),
        Arc::clone(&catalog),
        Arc::clone(&node_client),
        config.request.clone(),
        config.routing.default_mode,
    );

    // Background loops: discovery (membership) and the monitor (health and
    // resources). Both stop when the shutdown token fires.
    let shutdown = CancellationToken::new();
    tokio::spawn(
        discovery::Discovery::new(
            Arc::clone(&registry),
            Arc::clone(&node_client),
            fleet_scheduler.clone(),
            config.discovery.clone(),
        )
        .run(shutdown.child_token()),
    );
    tokio::spawn(
        monitor::Monitor::new(
            Arc::clone(&registry),
            Arc::clone(&node_client),
            config.monitor.clone(),
        )
        .run(shutdown.child_token()),
    );

    let state = Arc::new(api::AppState::new(fleet_router));

    let trace_layer = tower_http::trace::TraceLayer::new_for_http()
        .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO))
        .on_response(tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO));

    let app = api::router(state)
        .layer(axum::middleware::from_fn(api::request_id::request_id_middleware))
        .layer(trace_layer);

    let addr: SocketAddr = format!("0.0.0.0:{}", config.server.port).parse()?;
    info!(%addr, "API listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tokio::select! {
        result = axum::serve(listener, app) => {
            result.context("API server error")?;
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
    }
    shutdown.cancel();

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Lightweight healthcheck: GET /healthz and exit 0 on 200, 1 otherwise.
/// Invoked via `llm-fleet --healthcheck` from Docker HEALTHCHECK.
async fn healthcheck() -> anyhow::Result<()> {
    let port = std::env::var("FLEET_PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(8080);

    let url = format!("http://127.0.0.1:{port}/healthz");
    let resp = reqwest::get(&url).await?;

    if resp.status().is_success() {
        std::process::exit(0);
    } else {
        std::process::exit(1);
    }
}
