//! Token metrics capture.
//!
//! Each proxied round-trip whose upstream response carries an OpenAI `usage`
//! object is recorded here: a bounded in-memory history backs the
//! `/api/metrics` snapshot, and every record is published on the bus for SSE
//! subscribers. Aggregate counters additionally feed the Prometheus exporter.

use crate::events::{EventBus, TokenMetricsEvent};
use metrics::counter;
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Keep this many recent records for the snapshot endpoint.
const MAX_HISTORY: usize = 1000;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenMetrics {
    pub id: u64,
    /// Unix epoch milliseconds
    pub timestamp: u64,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub duration_ms: u64,
    pub tokens_per_second: f64,
}

struct MonitorInner {
    bus: EventBus,
    next_id: AtomicU64,
    history: Mutex<VecDeque<TokenMetrics>>,
}

#[derive(Clone)]
pub struct MetricsMonitor {
    inner: Arc<MonitorInner>,
}

impl MetricsMonitor {
    pub fn new(bus: EventBus) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                bus,
                next_id: AtomicU64::new(1),
                history: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Record one completed round-trip and publish it on the bus.
    pub fn record(&self, model: &str, input_tokens: u64, output_tokens: u64, duration: Duration) {
        let secs = duration.as_secs_f64();
        let tokens_per_second = if secs > 0.0 {
            output_tokens as f64 / secs
        } else {
            0.0
        };

        let record = TokenMetrics {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
            model: model.to_string(),
            input_tokens,
            output_tokens,
            duration_ms: duration.as_millis() as u64,
            tokens_per_second,
        };

        counter!("modelswap_tokens_total", "model" => model.to_string(), "kind" => "input")
            .increment(input_tokens);
        counter!("modelswap_tokens_total", "model" => model.to_string(), "kind" => "output")
            .increment(output_tokens);

        {
            let mut history = self.inner.history.lock().expect("metrics history poisoned");
            if history.len() == MAX_HISTORY {
                history.pop_front();
            }
            history.push_back(record.clone());
        }

        self.inner
            .bus
            .publish_token_metrics(TokenMetricsEvent { metrics: record });
    }

    /// Snapshot of the recent history, oldest first.
    pub fn get_metrics(&self) -> Vec<TokenMetrics> {
        let history = self.inner.history.lock().expect("metrics history poisoned");
        history.iter().cloned().collect()
    }

    pub fn get_metrics_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.get_metrics())
    }
}

/// Pull `(prompt_tokens, completion_tokens)` out of a captured response body.
/// Handles both plain JSON bodies and SSE streams whose final frames carry a
/// `usage` object; the last usage seen wins.
pub fn extract_usage(body: &[u8]) -> Option<(u64, u64)> {
    if let Ok(value) = serde_json::from_slice::<Value>(body)
        && let Some(usage) = usage_of(&value)
    {
        return Some(usage);
    }

    let text = std::str::from_utf8(body).ok()?;
    let mut found = None;
    for line in text.lines() {
        let Some(payload) = line.strip_prefix("data:") else {
            continue;
        };
        let payload = payload.trim();
        if payload.is_empty() || payload == "[DONE]" {
            continue;
        }
        if let Ok(value) = serde_json::from_str::<Value>(payload)
            && let Some(usage) = usage_of(&value)
        {
            found = Some(usage);
        }
    }
    found
}

fn usage_of(value: &Value) -> Option<(u64, u64)> {
    let usage = value.get("usage")?.as_object()?;
    let prompt = usage.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0);
    let completion = usage
        .get("completion_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    Some((prompt, completion))
}
