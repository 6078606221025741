//! Prometheus metrics setup and descriptions.
//!
//! Metrics are recorded throughout the codebase using the `metrics` crate's
//! macros. This module installs the Prometheus exporter and registers
//! human-readable descriptions for each metric.

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::PrometheusHandle;

/// Install the Prometheus recorder and register metric descriptions.
///
/// Returns `None` if a recorder is already installed (e.g. in tests where
/// multiple `build_app` calls share a process). Metric recording still
/// works; the macros route to whichever recorder was installed first.
pub fn install() -> Option<PrometheusHandle> {
    let handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .ok()?;
    describe();
    Some(handle)
}

fn describe() {
    describe_counter!(
        "modelswap_requests_total",
        "Proxied requests, labelled by model and status class"
    );
    describe_histogram!(
        "modelswap_request_duration_seconds",
        "End-to-end proxied request duration"
    );
    describe_gauge!(
        "modelswap_model_in_flight",
        "Requests currently holding a ticket per model"
    );
    describe_counter!(
        "modelswap_process_starts_total",
        "Backend process start attempts"
    );
    describe_histogram!(
        "modelswap_process_start_seconds",
        "Time from spawn to ready per backend start"
    );
    describe_counter!(
        "modelswap_evictions_total",
        "Peer evictions performed to satisfy an acquire"
    );
    describe_counter!(
        "modelswap_config_applies_total",
        "Config snapshots applied"
    );
    describe_counter!(
        "modelswap_sse_dropped_total",
        "Events dropped because a client buffer was full"
    );
    describe_counter!(
        "modelswap_tokens_total",
        "Tokens reported by upstream usage objects"
    );
}
