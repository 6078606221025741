//! Process groups - scheduling domains for backend processes.
//!
//! A group owns the runners for its member models and enforces the
//! exclusive / swap / persistent policy between them. Acquire and stop
//! operations are serialised on the group's scheduling mutex, which is held
//! across the blocking parts of an acquire so concurrent calls observe a
//! total order. Bookkeeping lives behind a separate short-held lock so
//! status reads never wait on an in-flight start.

use crate::config::Config;
use crate::events::EventBus;
use crate::logger::RingLogger;
use crate::process::{ProcessRunner, ProcessState, RunnerError, StopMode};
use futures_util::future::join_all;
use metrics::counter;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Errors from group scheduling
#[derive(Debug, thiserror::Error)]
pub enum GroupError {
    #[error("model {model} is not a member of group {group}")]
    UnknownMember { group: String, model: String },

    #[error("group {0} is busy with another model")]
    Busy(String),

    #[error("group {0} has been shut down")]
    Shutdown(String),

    #[error(transparent)]
    Runner(#[from] RunnerError),
}

struct GroupState {
    config: Arc<Config>,
    swap: bool,
    exclusive: bool,
    persistent: bool,
    runners: HashMap<String, Arc<ProcessRunner>>,
    shut_down: bool,
}

pub struct ProcessGroup {
    id: String,
    bus: EventBus,
    upstream_log: RingLogger,
    /// Serialises acquire/stop operations; held across their blocking parts.
    sched: Mutex<()>,
    state: RwLock<GroupState>,
}

impl ProcessGroup {
    pub fn new(
        id: &str,
        config: Arc<Config>,
        bus: EventBus,
        upstream_log: RingLogger,
    ) -> Arc<Self> {
        let group_cfg = config.groups.get(id).cloned().unwrap_or_default();
        Arc::new(Self {
            id: id.to_string(),
            bus,
            upstream_log,
            sched: Mutex::new(()),
            state: RwLock::new(GroupState {
                config,
                swap: group_cfg.swap,
                exclusive: group_cfg.exclusive,
                persistent: group_cfg.persistent,
                runners: HashMap::new(),
                shut_down: false,
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Swap in a new config snapshot. Only valid when the caller has already
    /// established runtime compatibility; running processes are untouched.
    pub fn update_config(&self, config: Arc<Config>) {
        let mut state = self.state.write().expect("group state poisoned");
        if let Some(group_cfg) = config.groups.get(&self.id) {
            state.swap = group_cfg.swap;
            state.exclusive = group_cfg.exclusive;
            state.persistent = group_cfg.persistent;
        }
        state.config = config;
    }

    /// Current (swap, exclusive, persistent) flags.
    pub fn flags(&self) -> (bool, bool, bool) {
        let state = self.state.read().expect("group state poisoned");
        (state.swap, state.exclusive, state.persistent)
    }

    /// State of a member's runner; `stopped` when it was never started.
    /// Never blocks on in-flight scheduling.
    pub fn model_state(&self, model_id: &str) -> Option<ProcessState> {
        let state = self.state.read().expect("group state poisoned");
        if !member_of(&state, &self.id, model_id) {
            return None;
        }
        Some(
            state
                .runners
                .get(model_id)
                .map(|r| r.state())
                .unwrap_or(ProcessState::Stopped),
        )
    }

    /// Ensure the member's backend is ready and hand out a ticket scoped to
    /// one HTTP round-trip. Evicts peers according to the group policy.
    pub async fn acquire(&self, model_id: &str) -> Result<AcquireTicket, GroupError> {
        let _order = self.sched.lock().await;

        let (runner, swap, exclusive, persistent) = {
            let mut state = self.state.write().expect("group state poisoned");
            if state.shut_down {
                return Err(GroupError::Shutdown(self.id.clone()));
            }
            if !member_of(&state, &self.id, model_id) {
                return Err(GroupError::UnknownMember {
                    group: self.id.clone(),
                    model: model_id.to_string(),
                });
            }
            let runner = self.runner_entry(&mut state, model_id);
            (runner, state.swap, state.exclusive, state.persistent)
        };

        if runner.state() != ProcessState::Ready && exclusive {
            let peers: Vec<Arc<ProcessRunner>> = {
                let state = self.state.read().expect("group state poisoned");
                state
                    .runners
                    .values()
                    .filter(|r| r.model_id() != model_id && !r.state().is_settled())
                    .cloned()
                    .collect()
            };

            if !peers.is_empty() {
                if persistent || !swap {
                    return Err(GroupError::Busy(self.id.clone()));
                }
                for peer in peers {
                    info!(
                        group = %self.id,
                        from = %peer.model_id(),
                        to = %model_id,
                        "evicting peer to satisfy acquire"
                    );
                    counter!(
                        "modelswap_evictions_total",
                        "group" => self.id.clone(),
                        "from" => peer.model_id().to_string(),
                        "to" => model_id.to_string()
                    )
                    .increment(1);
                    // Outstanding tickets gate the eviction.
                    peer.wait_drained().await;
                    peer.stop(StopMode::Graceful).await?;
                }
            }
        }

        runner.ensure_ready().await?;
        runner.acquire_ref();
        Ok(AcquireTicket { runner })
    }

    /// Idempotent stop of a single member. Fails only when the model is not
    /// a member of this group.
    pub async fn stop_process(&self, model_id: &str, mode: StopMode) -> Result<(), GroupError> {
        let _order = self.sched.lock().await;
        let runner = {
            let state = self.state.read().expect("group state poisoned");
            if !member_of(&state, &self.id, model_id) {
                return Err(GroupError::UnknownMember {
                    group: self.id.clone(),
                    model: model_id.to_string(),
                });
            }
            state.runners.get(model_id).cloned()
        };
        if let Some(runner) = runner {
            runner.stop(mode).await?;
        }
        Ok(())
    }

    /// Stop members concurrently. Graceful mode leaves persistent groups
    /// alone; immediate mode stops everything.
    pub async fn stop_all(&self, mode: StopMode) {
        let _order = self.sched.lock().await;
        let runners: Vec<Arc<ProcessRunner>> = {
            let state = self.state.read().expect("group state poisoned");
            if state.persistent && mode == StopMode::Graceful {
                return;
            }
            state.runners.values().cloned().collect()
        };
        for result in join_all(runners.iter().map(|r| r.stop(mode))).await {
            if let Err(e) = result {
                warn!(group = %self.id, error = %e, "stop failed");
            }
        }
    }

    /// Terminal: stop every member (persistent included) and mark the group
    /// unusable. Later acquires fail with [`GroupError::Shutdown`].
    pub async fn shutdown(&self) {
        let _order = self.sched.lock().await;
        let runners: Vec<Arc<ProcessRunner>> = {
            let mut state = self.state.write().expect("group state poisoned");
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            state.runners.drain().map(|(_, r)| r).collect()
        };

        info!(group = %self.id, "shutting down process group");
        for result in join_all(runners.iter().map(|r| r.stop(StopMode::Immediate))).await {
            if let Err(e) = result {
                warn!(group = %self.id, error = %e, "stop during shutdown failed");
            }
        }
    }

    /// Lazily construct the runner for a member on first acquire.
    fn runner_entry(&self, state: &mut GroupState, model_id: &str) -> Arc<ProcessRunner> {
        if let Some(runner) = state.runners.get(model_id) {
            return Arc::clone(runner);
        }
        let model_cfg = state
            .config
            .models
            .get(model_id)
            .cloned()
            .unwrap_or_default();
        let runner = ProcessRunner::new(
            &self.id,
            model_id,
            model_cfg,
            state.config.start_timeout(),
            state.config.stop_timeout(),
            self.bus.clone(),
            self.upstream_log.clone(),
        );
        state
            .runners
            .insert(model_id.to_string(), Arc::clone(&runner));
        runner
    }
}

fn member_of(state: &GroupState, group_id: &str, model_id: &str) -> bool {
    state
        .config
        .groups
        .get(group_id)
        .is_some_and(|g| g.members.iter().any(|m| m == model_id))
}

/// Reference-counted ready ticket, scoped to one HTTP round-trip. Dropping
/// the ticket releases the runner for eviction.
pub struct AcquireTicket {
    runner: Arc<ProcessRunner>,
}

impl std::fmt::Debug for AcquireTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquireTicket")
            .field("model_id", &self.runner.model_id())
            .finish()
    }
}

impl AcquireTicket {
    pub fn model_id(&self) -> &str {
        self.runner.model_id()
    }

    /// Upstream base URL to forward the round-trip to.
    pub fn upstream(&self) -> String {
        self.runner.upstream().to_string()
    }

    /// Name to present to the upstream, when the config overrides it.
    pub fn upstream_model_name(&self) -> Option<String> {
        let alias = &self.runner.config().use_model_name;
        (!alias.is_empty()).then(|| alias.clone())
    }
}

impl Drop for AcquireTicket {
    fn drop(&mut self) {
        self.runner.release_ref();
    }
}
