//! Proxy manager - composition root for the model lifecycle engine.
//!
//! Owns the live config snapshot and the group table, and exposes the
//! operations the HTTP layer calls: acquire-for-dispatch, unload single/all,
//! status projection, and shutdown. Config replacement lives in `sync.rs`.

use crate::config::Config;
use crate::events::EventBus;
use crate::group::{AcquireTicket, GroupError, ProcessGroup};
use crate::logger::RingLogger;
use crate::metrics::MetricsMonitor;
use crate::process::{ProcessState, StopMode};
use crate::reconcile::{self, ProbeCandidate};
use crate::sweeper::ExternalProcessSweeper;
use axum::body::Body;
use futures_util::future::join_all;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub type HttpClient = Client<HttpConnector, Body>;

/// Errors surfaced to the HTTP layer for routing operations.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("no process group serves model {0}")]
    NoGroup(String),

    #[error(transparent)]
    Group(#[from] GroupError),
}

/// Status projection of one model, built on demand from the group table.
#[derive(Debug, Clone, Serialize)]
pub struct ModelView {
    pub id: String,
    pub name: String,
    pub description: String,
    pub state: String,
    pub unlisted: bool,
    #[serde(rename = "peerID")]
    pub peer_id: String,
}

pub(crate) struct ManagerState {
    pub(crate) config: Arc<Config>,
    pub(crate) groups: HashMap<String, Arc<ProcessGroup>>,
}

pub(crate) struct ManagerInner {
    pub(crate) state: RwLock<ManagerState>,
    pub(crate) bus: EventBus,
    pub(crate) proxy_log: RingLogger,
    pub(crate) upstream_log: RingLogger,
    pub(crate) metrics: MetricsMonitor,
    pub(crate) client: HttpClient,
    pub(crate) shutdown: CancellationToken,
    pub(crate) sweeper: Option<Arc<dyn ExternalProcessSweeper>>,
}

/// Cheaply cloneable handle, shared between the HTTP layer and background
/// tasks. The manager exclusively owns the group table; each group
/// exclusively owns its runners.
#[derive(Clone)]
pub struct ProxyManager {
    inner: Arc<ManagerInner>,
}

impl ProxyManager {
    pub fn new(proxy_log: RingLogger, sweeper: Option<Arc<dyn ExternalProcessSweeper>>) -> Self {
        let bus = EventBus::new();
        let metrics = MetricsMonitor::new(bus.clone());
        let client = Client::builder(TokioExecutor::new()).build_http();

        Self {
            inner: Arc::new(ManagerInner {
                state: RwLock::new(ManagerState {
                    config: Arc::new(Config::default()),
                    groups: HashMap::new(),
                }),
                bus,
                proxy_log,
                upstream_log: RingLogger::new(),
                metrics,
                client,
                shutdown: CancellationToken::new(),
                sweeper,
            }),
        }
    }

    pub(crate) fn inner(&self) -> &ManagerInner {
        &self.inner
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn proxy_log(&self) -> &RingLogger {
        &self.inner.proxy_log
    }

    pub fn upstream_log(&self) -> &RingLogger {
        &self.inner.upstream_log
    }

    pub fn metrics(&self) -> &MetricsMonitor {
        &self.inner.metrics
    }

    pub fn client(&self) -> &HttpClient {
        &self.inner.client
    }

    /// Cancelled when the proxy shuts down; SSE streams watch this.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// The live config snapshot.
    pub async fn config(&self) -> Arc<Config> {
        self.inner.state.read().await.config.clone()
    }

    /// Group serving a model, if the model is known.
    pub async fn group_for(&self, model_id: &str) -> Option<Arc<ProcessGroup>> {
        let state = self.inner.state.read().await;
        let (group_id, _) = state.config.group_for_model(model_id)?;
        state.groups.get(group_id).cloned()
    }

    /// Resolve a requested name and acquire a ready ticket for it, evicting
    /// group peers as policy allows. The returned ticket scopes one HTTP
    /// round-trip.
    pub async fn acquire(&self, requested: &str) -> Result<AcquireTicket, RouteError> {
        let (group, real_name) = {
            let state = self.inner.state.read().await;
            let (_, real_name) = state
                .config
                .find_config(requested)
                .ok_or_else(|| RouteError::UnknownModel(requested.to_string()))?;
            let (group_id, _) = state
                .config
                .group_for_model(&real_name)
                .ok_or_else(|| RouteError::NoGroup(real_name.clone()))?;
            let group = state
                .groups
                .get(group_id)
                .cloned()
                .ok_or_else(|| RouteError::NoGroup(real_name.clone()))?;
            (group, real_name)
        };

        Ok(group.acquire(&real_name).await?)
    }

    /// Stop every process immediately, then let the external sweeper catch
    /// backends that outlived their group (e.g. across a proxy restart).
    pub async fn unload_all(&self) {
        info!("unloading all models");
        let groups: Vec<Arc<ProcessGroup>> = {
            let state = self.inner.state.read().await;
            state.groups.values().cloned().collect()
        };
        join_all(groups.iter().map(|g| g.stop_all(StopMode::Immediate))).await;

        if let Some(sweeper) = &self.inner.sweeper {
            if let Err(e) = sweeper.sweep().await {
                warn!(error = %e, "external process sweep failed");
            }
        }
    }

    /// Stop a single model immediately.
    pub async fn unload_model(&self, requested: &str) -> Result<(), RouteError> {
        let (group, real_name) = {
            let state = self.inner.state.read().await;
            let real_name = state
                .config
                .real_model_name(requested)
                .ok_or_else(|| RouteError::UnknownModel(requested.to_string()))?;
            let (group_id, _) = state
                .config
                .group_for_model(&real_name)
                .ok_or_else(|| RouteError::NoGroup(real_name.clone()))?;
            let group = state
                .groups
                .get(group_id)
                .cloned()
                .ok_or_else(|| RouteError::NoGroup(real_name.clone()))?;
            (group, real_name)
        };

        group.stop_process(&real_name, StopMode::Immediate).await?;
        Ok(())
    }

    /// Build the status projection for every configured model. Models that
    /// look stopped are probed through their upstream URL so backends that
    /// survived a proxy restart show up as ready.
    pub async fn model_status(&self) -> Vec<ModelView> {
        let (config, groups) = {
            let state = self.inner.state.read().await;
            (state.config.clone(), state.groups.clone())
        };

        let mut model_ids: Vec<String> = config.models.keys().cloned().collect();
        model_ids.sort();

        let mut views = Vec::with_capacity(model_ids.len());
        let mut candidates = Vec::new();

        for model_id in model_ids {
            let model_cfg = &config.models[&model_id];

            let state = config
                .group_for_model(&model_id)
                .and_then(|(group_id, _)| groups.get(group_id))
                .and_then(|group| group.model_state(&model_id));
            let state_str = state
                .map(|s| s.as_str().to_string())
                .unwrap_or_else(|| "unknown".to_string());

            if state.is_none() || state == Some(ProcessState::Stopped) {
                candidates.push(ProbeCandidate {
                    index: views.len(),
                    proxy: model_cfg.proxy.clone(),
                    keys: vec![model_id.clone(), model_cfg.use_model_name.clone()],
                });
            }

            views.push(ModelView {
                id: model_id.clone(),
                name: model_cfg.name.clone(),
                description: model_cfg.description.clone(),
                state: state_str,
                unlisted: model_cfg.unlisted,
                peer_id: String::new(),
            });
        }

        reconcile::mark_externally_served(&self.inner.client, &mut views, candidates).await;
        views
    }

    /// Cancel the shutdown context and tear down every group.
    pub async fn shutdown(&self) {
        info!("shutting down proxy manager");
        self.inner.shutdown.cancel();
        let groups: Vec<Arc<ProcessGroup>> = {
            let state = self.inner.state.read().await;
            state.groups.values().cloned().collect()
        };
        join_all(groups.iter().map(|g| g.shutdown())).await;
    }
}
