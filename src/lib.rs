//! # modelswap
//!
//! Reverse proxy and orchestrator for heavyweight local inference backends.
//! Clients issue OpenAI-style requests naming a logical model; modelswap
//! routes each request to the right backend process, starting it on demand
//! and evicting group peers according to the configured exclusivity policy.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                        modelswap                           │
//! │  ┌──────────────────────────────────────────────────────┐  │
//! │  │ HTTP surface (axum)                                  │  │
//! │  │ - /v1/* proxy: model from body, ticket-guarded       │  │
//! │  │ - /api/*: unload, status, SSE event stream           │  │
//! │  └──────────────────────────────────────────────────────┘  │
//! │                          │                                 │
//! │  ┌──────────────────────────────────────────────────────┐  │
//! │  │ ProxyManager                                         │  │
//! │  │ - config snapshot + group table (atomic hot reload)  │  │
//! │  │ - event bus, log tails, token metrics                │  │
//! │  └──────────────────────────────────────────────────────┘  │
//! │                          │                                 │
//! │  ┌──────────────────────────────────────────────────────┐  │
//! │  │ ProcessGroup (exclusive / swap / persistent)         │  │
//! │  │ - reference-counted acquire tickets                  │  │
//! │  │ - drain-before-evict                                 │  │
//! │  └──────────────────────────────────────────────────────┘  │
//! │                          │                                 │
//! │      ┌───────────────────┼───────────────────┐             │
//! │      ▼                   ▼                   ▼             │
//! │  [backend:8001]     [backend:8002]      [backend:8003]     │
//! └────────────────────────────────────────────────────────────┘
//! ```

mod api;
mod config;
mod events;
mod group;
mod logger;
mod manager;
mod metrics;
mod process;
mod reconcile;
mod sweeper;
mod sync;
pub mod telemetry;

pub use config::{Config, DEFAULT_GROUP_ID, GroupConfig, ModelConfig};
pub use events::{
    ConfigFileChangedEvent, EventBus, ProcessStateChangeEvent, Subscription, TokenMetricsEvent,
};
pub use group::{AcquireTicket, GroupError, ProcessGroup};
pub use logger::RingLogger;
pub use manager::{ModelView, ProxyManager, RouteError};
pub use metrics::{MetricsMonitor, TokenMetrics};
pub use process::{ProcessRunner, ProcessState, RunnerError, StopMode};
pub use sweeper::{DockerSweeper, ExternalProcessSweeper};

use anyhow::Result;
use axum::Router;
use axum::routing::get;
use std::sync::Arc;
use tracing::info;

/// Build the complete modelswap stack.
///
/// Returns:
/// - the main axum router (API + proxy)
/// - an optional Prometheus metrics router (when `metricsPort` is set)
/// - the proxy manager, for reloads and shutdown
pub async fn build_app(
    config: Config,
    proxy_log: RingLogger,
) -> Result<(Router, Option<Router>, ProxyManager)> {
    info!(
        models = config.models.len(),
        groups = config.groups.len(),
        "building modelswap"
    );

    let metrics_handle = telemetry::install();
    let metrics_router = match (config.metrics_port, metrics_handle) {
        (Some(_), Some(handle)) => Some(Router::new().route(
            "/metrics",
            get(move || {
                let handle = handle.clone();
                async move { handle.render() }
            }),
        )),
        _ => None,
    };

    let sweeper: Option<Arc<dyn ExternalProcessSweeper>> = Some(Arc::new(DockerSweeper));
    let pm = ProxyManager::new(proxy_log, sweeper);
    pm.apply_config(config).await;

    let app = api::router(pm.clone());
    Ok((app, metrics_router, pm))
}
