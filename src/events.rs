//! Process-wide event bus.
//!
//! Publish/subscribe with typed handlers. Handlers run synchronously on the
//! publishing task and must not block; SSE subscribers forward into their own
//! bounded channels. Registration hands back a [`Subscription`] guard that
//! unregisters the handler on drop, so release happens on every exit path.

use crate::metrics::TokenMetrics;
use crate::process::ProcessState;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Published after a process runner changes state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessStateChangeEvent {
    pub group_id: String,
    pub model_id: String,
    pub from: ProcessState,
    pub to: ProcessState,
}

/// Published by the config loader after a successful reload was applied.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigFileChangedEvent;

/// Published for each request whose upstream response carried token usage.
#[derive(Debug, Clone)]
pub struct TokenMetricsEvent {
    pub metrics: TokenMetrics,
}

type Handler<E> = Box<dyn Fn(&E) + Send + Sync>;

#[derive(Default)]
struct BusInner {
    next_id: AtomicU64,
    process_state: DashMap<u64, Handler<ProcessStateChangeEvent>>,
    config_changed: DashMap<u64, Handler<ConfigFileChangedEvent>>,
    token_metrics: DashMap<u64, Handler<TokenMetricsEvent>>,
}

/// Cheaply cloneable handle to the shared bus.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_process_state(
        &self,
        handler: impl Fn(&ProcessStateChangeEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.process_state.insert(id, Box::new(handler));
        let inner = Arc::clone(&self.inner);
        Subscription::new(move || {
            inner.process_state.remove(&id);
        })
    }

    pub fn on_config_changed(
        &self,
        handler: impl Fn(&ConfigFileChangedEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.config_changed.insert(id, Box::new(handler));
        let inner = Arc::clone(&self.inner);
        Subscription::new(move || {
            inner.config_changed.remove(&id);
        })
    }

    pub fn on_token_metrics(
        &self,
        handler: impl Fn(&TokenMetricsEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.token_metrics.insert(id, Box::new(handler));
        let inner = Arc::clone(&self.inner);
        Subscription::new(move || {
            inner.token_metrics.remove(&id);
        })
    }

    pub fn publish_process_state(&self, event: ProcessStateChangeEvent) {
        for entry in self.inner.process_state.iter() {
            entry.value()(&event);
        }
    }

    pub fn publish_config_changed(&self, event: ConfigFileChangedEvent) {
        for entry in self.inner.config_changed.iter() {
            entry.value()(&event);
        }
    }

    pub fn publish_token_metrics(&self, event: TokenMetricsEvent) {
        for entry in self.inner.token_metrics.iter() {
            entry.value()(&event);
        }
    }
}

/// Unregisters its handler when dropped.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub(crate) fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn change(model: &str, from: ProcessState, to: ProcessState) -> ProcessStateChangeEvent {
        ProcessStateChangeEvent {
            group_id: "g".to_string(),
            model_id: model.to_string(),
            from,
            to,
        }
    }

    #[test]
    fn test_handler_receives_published_events() {
        let bus = EventBus::new();
        let seen: Arc<Mutex<Vec<String>>> = Arc::default();

        let seen_clone = Arc::clone(&seen);
        let _sub = bus.on_process_state(move |e| {
            seen_clone.lock().unwrap().push(e.model_id.clone());
        });

        bus.publish_process_state(change("a", ProcessState::Stopped, ProcessState::Starting));
        bus.publish_process_state(change("b", ProcessState::Starting, ProcessState::Ready));

        assert_eq!(*seen.lock().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_dropping_subscription_unregisters() {
        let bus = EventBus::new();
        let seen: Arc<Mutex<usize>> = Arc::default();

        let seen_clone = Arc::clone(&seen);
        let sub = bus.on_process_state(move |_| {
            *seen_clone.lock().unwrap() += 1;
        });

        bus.publish_process_state(change("a", ProcessState::Stopped, ProcessState::Starting));
        drop(sub);
        bus.publish_process_state(change("a", ProcessState::Starting, ProcessState::Ready));

        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[test]
    fn test_event_types_are_independent() {
        let bus = EventBus::new();
        let config_hits: Arc<Mutex<usize>> = Arc::default();

        let hits = Arc::clone(&config_hits);
        let _sub = bus.on_config_changed(move |_| {
            *hits.lock().unwrap() += 1;
        });

        bus.publish_process_state(change("a", ProcessState::Stopped, ProcessState::Starting));
        assert_eq!(*config_hits.lock().unwrap(), 0);

        bus.publish_config_changed(ConfigFileChangedEvent);
        assert_eq!(*config_hits.lock().unwrap(), 1);
    }
}
