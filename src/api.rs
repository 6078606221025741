//! HTTP surface: management API, live event stream, and the OpenAI-style
//! reverse proxy fallback.
//!
//! The proxy path collects the request body to identify the target model,
//! acquires a ready ticket from the manager (starting or swapping backends as
//! needed), forwards the round-trip upstream, and holds the ticket until the
//! response body - streamed or not - is fully consumed.

use crate::events::Subscription;
use crate::group::{AcquireTicket, GroupError};
use crate::manager::{HttpClient, ProxyManager, RouteError};
use crate::metrics::{MetricsMonitor, TokenMetrics, extract_usage};
use crate::process::RunnerError;
use axum::Json;
use axum::Router;
use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{HeaderName, StatusCode, Uri, header};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use bytes::Bytes;
use futures_util::StreamExt;
use http_body::Frame;
use http_body_util::BodyExt;
use metrics::{counter, histogram};
use serde::Serialize;
use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, warn};

/// Per-client SSE buffer; messages beyond this are dropped, never blocked on.
const SSE_BUFFER: usize = 25;

/// How much of a proxied response body is retained for usage extraction.
const USAGE_CAPTURE_LIMIT: usize = 512 * 1024;

/// Build the complete HTTP surface for a manager.
pub fn router(pm: ProxyManager) -> Router {
    Router::new()
        .route("/api/models/unload", post(unload_all_models))
        .route("/api/models/unload/{model}", post(unload_single_model))
        .route("/api/events", get(stream_events))
        .route("/api/metrics", get(get_metrics))
        .route("/api/version", get(get_version))
        .route("/v1/models", get(list_models))
        .fallback(openai_proxy)
        .layer(middleware::from_fn_with_state(pm.clone(), require_api_key))
        .with_state(pm)
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

/// Opaque key predicate: when the config carries an api_key, requests must
/// present it as a bearer token or x-api-key header.
async fn require_api_key(State(pm): State<ProxyManager>, req: Request, next: Next) -> Response {
    let Some(expected) = pm.config().await.api_key.clone() else {
        return next.run(req).await;
    };

    let bearer = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let api_key_header = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok());

    if bearer == Some(expected.as_str()) || api_key_header == Some(expected.as_str()) {
        next.run(req).await
    } else {
        error_response(StatusCode::UNAUTHORIZED, "invalid or missing API key")
    }
}

// ---------------------------------------------------------------------------
// Management endpoints
// ---------------------------------------------------------------------------

async fn unload_all_models(State(pm): State<ProxyManager>) -> impl IntoResponse {
    pm.unload_all().await;
    Json(serde_json::json!({"msg": "ok"}))
}

async fn unload_single_model(
    State(pm): State<ProxyManager>,
    Path(model): Path<String>,
) -> Response {
    match pm.unload_model(&model).await {
        Ok(()) => Json(serde_json::json!({"msg": "ok"})).into_response(),
        Err(RouteError::UnknownModel(_)) => {
            error_response(StatusCode::NOT_FOUND, "model not found")
        }
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("error stopping process: {e}"),
        ),
    }
}

async fn get_metrics(State(pm): State<ProxyManager>) -> Response {
    match pm.metrics().get_metrics_json() {
        Ok(json) => ([(header::CONTENT_TYPE, "application/json")], json).into_response(),
        Err(_) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "failed to serialize metrics",
        ),
    }
}

async fn get_version() -> impl IntoResponse {
    Json(serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "commit": option_env!("MODELSWAP_COMMIT").unwrap_or("unknown"),
        "build_date": option_env!("MODELSWAP_BUILD_DATE").unwrap_or("unknown"),
    }))
}

async fn list_models(State(pm): State<ProxyManager>) -> impl IntoResponse {
    let config = pm.config().await;
    let mut data: Vec<serde_json::Value> = config
        .models
        .iter()
        .filter(|(_, model)| !model.unlisted)
        .map(|(id, _)| {
            serde_json::json!({
                "id": id,
                "object": "model",
                "created": 0,
                "owned_by": "modelswap",
            })
        })
        .collect();
    data.sort_by(|a, b| a["id"].as_str().cmp(&b["id"].as_str()));
    Json(serde_json::json!({"object": "list", "data": data}))
}

// ---------------------------------------------------------------------------
// Live event stream
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
enum MessageType {
    ModelStatus,
    LogData,
    Metrics,
}

#[derive(Clone, Serialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: MessageType,
    data: String,
}

enum RawMessage {
    Status,
    Log { source: &'static str, data: Vec<u8> },
    Metrics(Vec<TokenMetrics>),
}

fn enqueue(tx: &mpsc::Sender<RawMessage>, msg: RawMessage) {
    // Full buffer drops the message; publication must never block.
    if tx.try_send(msg).is_err() {
        counter!("modelswap_sse_dropped_total").increment(1);
    }
}

fn log_envelope(source: &str, data: &[u8]) -> Envelope {
    let payload = serde_json::json!({
        "source": source,
        "data": String::from_utf8_lossy(data),
    });
    Envelope {
        kind: MessageType::LogData,
        data: payload.to_string(),
    }
}

fn metrics_envelope(records: &[TokenMetrics]) -> Envelope {
    Envelope {
        kind: MessageType::Metrics,
        data: serde_json::to_string(records).unwrap_or_else(|_| "[]".to_string()),
    }
}

async fn status_envelope(pm: &ProxyManager) -> Envelope {
    let status = pm.model_status().await;
    Envelope {
        kind: MessageType::ModelStatus,
        data: serde_json::to_string(&status).unwrap_or_else(|_| "[]".to_string()),
    }
}

async fn raw_to_envelope(pm: ProxyManager, msg: RawMessage) -> Envelope {
    match msg {
        RawMessage::Status => status_envelope(&pm).await,
        RawMessage::Log { source, data } => log_envelope(source, &data),
        RawMessage::Metrics(records) => metrics_envelope(&records),
    }
}

fn to_event(envelope: &Envelope) -> Event {
    let data = serde_json::to_string(envelope).unwrap_or_else(|_| "{}".to_string());
    Event::default().event("message").data(data)
}

/// SSE stream multiplexing model-state changes, log tails, and token metrics.
///
/// Each client gets its own bounded buffer; on overflow new messages are
/// dropped. All subscriptions are cancelled when the client disconnects or
/// the proxy shuts down. The initial payload (full status, both log
/// histories, metrics snapshot) is sent before any live message.
async fn stream_events(State(pm): State<ProxyManager>) -> Response {
    let (tx, rx) = mpsc::channel::<RawMessage>(SSE_BUFFER);

    let mut subscriptions: Vec<Subscription> = Vec::with_capacity(5);
    {
        let tx = tx.clone();
        subscriptions.push(
            pm.bus()
                .on_process_state(move |_| enqueue(&tx, RawMessage::Status)),
        );
    }
    {
        let tx = tx.clone();
        subscriptions.push(
            pm.bus()
                .on_config_changed(move |_| enqueue(&tx, RawMessage::Status)),
        );
    }
    {
        let tx = tx.clone();
        subscriptions.push(pm.proxy_log().on_log_data(move |data| {
            enqueue(
                &tx,
                RawMessage::Log {
                    source: "proxy",
                    data: data.to_vec(),
                },
            )
        }));
    }
    {
        let tx = tx.clone();
        subscriptions.push(pm.upstream_log().on_log_data(move |data| {
            enqueue(
                &tx,
                RawMessage::Log {
                    source: "upstream",
                    data: data.to_vec(),
                },
            )
        }));
    }
    {
        let tx = tx.clone();
        subscriptions.push(pm.bus().on_token_metrics(move |e| {
            enqueue(&tx, RawMessage::Metrics(vec![e.metrics.clone()]))
        }));
    }
    drop(tx);

    let initial = vec![
        log_envelope("proxy", &pm.proxy_log().get_history()),
        log_envelope("upstream", &pm.upstream_log().get_history()),
        status_envelope(&pm).await,
        metrics_envelope(&pm.metrics().get_metrics()),
    ];

    let shutdown = pm.shutdown_token();
    let pm_for_live = pm.clone();
    let live = ReceiverStream::new(rx).then(move |msg| {
        let pm = pm_for_live.clone();
        async move { raw_to_envelope(pm, msg).await }
    });

    let stream = futures_util::stream::iter(initial)
        .chain(live)
        .take_until(Box::pin(shutdown.cancelled_owned()))
        .map(move |envelope| {
            // Subscriptions unregister when the stream is dropped.
            let _ = &subscriptions;
            Ok::<Event, Infallible>(to_event(&envelope))
        });

    let sse = Sse::new(stream).keep_alive(KeepAlive::default());
    (
        [
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
            (HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        sse,
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Reverse proxy
// ---------------------------------------------------------------------------

/// Extract the target model name from a JSON request body.
fn extract_model(body: &Bytes) -> Option<String> {
    let json = serde_json::from_slice::<serde_json::Value>(body).ok()?;
    json.get("model")
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

/// Replace the `model` field so the upstream sees the name it expects.
fn rewrite_model(body: &Bytes, upstream_name: &str) -> Bytes {
    let Ok(mut json) = serde_json::from_slice::<serde_json::Value>(body) else {
        return body.clone();
    };
    let Some(obj) = json.as_object_mut() else {
        return body.clone();
    };
    obj.insert(
        "model".to_string(),
        serde_json::Value::String(upstream_name.to_string()),
    );
    Bytes::from(json.to_string())
}

/// Fallback handler for OpenAI-style request paths: the model is named in the
/// request body.
async fn openai_proxy(State(pm): State<ProxyManager>, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let body_bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            error!(error = %e, "failed to read request body");
            return error_response(StatusCode::BAD_REQUEST, "failed to read request body");
        }
    };

    let Some(requested) = extract_model(&body_bytes) else {
        return error_response(StatusCode::BAD_REQUEST, "no model specified in request");
    };

    dispatch(pm, parts, body_bytes, &requested).await
}

/// Acquire a ticket for the requested model and forward the round-trip.
async fn dispatch(
    pm: ProxyManager,
    parts: http::request::Parts,
    body_bytes: Bytes,
    requested: &str,
) -> Response {
    let started = Instant::now();

    let ticket = match pm.acquire(requested).await {
        Ok(ticket) => ticket,
        Err(e) => {
            warn!(model = %requested, error = %e, "dispatch failed");
            counter!("modelswap_requests_total", "model" => requested.to_string(), "status" => "error")
                .increment(1);
            return route_error_response(&e);
        }
    };

    let body_bytes = match ticket.upstream_model_name() {
        Some(upstream_name) => rewrite_model(&body_bytes, &upstream_name),
        None => body_bytes,
    };

    let model = ticket.model_id().to_string();
    match forward(pm.client().clone(), parts, body_bytes, &ticket.upstream()).await {
        Ok(response) => {
            counter!("modelswap_requests_total", "model" => model.clone(), "status" => "ok")
                .increment(1);
            let (resp_parts, body) = response.into_parts();
            let guarded = TicketBody::new(body, ticket, pm.metrics().clone(), model, started);
            Response::from_parts(resp_parts, Body::new(guarded))
        }
        Err(e) => {
            error!(model = %model, error = %e, "upstream request failed");
            counter!("modelswap_requests_total", "model" => model, "status" => "error")
                .increment(1);
            error_response(StatusCode::BAD_GATEWAY, &format!("backend error: {e}"))
        }
    }
}

async fn forward(
    client: HttpClient,
    parts: http::request::Parts,
    body: Bytes,
    upstream: &str,
) -> anyhow::Result<Response> {
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.to_string())
        .unwrap_or_else(|| "/".to_string());

    let uri: Uri = format!("{}{}", upstream.trim_end_matches('/'), path_and_query).parse()?;

    let mut req = Request::from_parts(parts, Body::from(body));
    *req.uri_mut() = uri;
    req.headers_mut().remove(header::HOST);

    let response = client.request(req).await?;
    let (resp_parts, body) = response.into_parts();
    Ok(Response::from_parts(resp_parts, Body::new(body)))
}

fn error_response(status: StatusCode, message: &str) -> Response {
    let body = serde_json::json!({
        "error": {
            "message": message,
            "type": "modelswap_error",
        }
    });
    (status, [(header::CONTENT_TYPE, "application/json")], body.to_string()).into_response()
}

fn route_error_response(err: &RouteError) -> Response {
    let (status, message) = match err {
        RouteError::UnknownModel(m) => (StatusCode::NOT_FOUND, format!("model not found: {m}")),
        RouteError::NoGroup(m) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("no process group serves model {m}"),
        ),
        RouteError::Group(group_err) => match group_err {
            GroupError::Busy(g) => (
                StatusCode::SERVICE_UNAVAILABLE,
                format!("group {g} is busy with another model"),
            ),
            GroupError::Shutdown(g) => (
                StatusCode::SERVICE_UNAVAILABLE,
                format!("group {g} has been shut down"),
            ),
            GroupError::UnknownMember { group, model } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("model {model} is not a member of group {group}"),
            ),
            GroupError::Runner(RunnerError::StartFailed { model, reason }) => (
                StatusCode::BAD_GATEWAY,
                format!("{model} failed to start: {reason}"),
            ),
            GroupError::Runner(RunnerError::StopFailed { model, reason }) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to stop {model}: {reason}"),
            ),
        },
    };
    error_response(status, &message)
}

/// Response body wrapper that holds the acquire ticket until the body -
/// including a streamed one - is fully consumed, and records token usage
/// from the captured prefix when the stream ends.
struct TicketBody {
    inner: Body,
    _ticket: Option<AcquireTicket>,
    monitor: MetricsMonitor,
    model: String,
    started: Instant,
    captured: Vec<u8>,
    recorded: bool,
}

impl TicketBody {
    fn new(
        inner: Body,
        ticket: AcquireTicket,
        monitor: MetricsMonitor,
        model: String,
        started: Instant,
    ) -> Self {
        Self {
            inner,
            _ticket: Some(ticket),
            monitor,
            model,
            started,
            captured: Vec::new(),
            recorded: false,
        }
    }

    fn record_usage(&mut self) {
        if self.recorded {
            return;
        }
        self.recorded = true;
        histogram!("modelswap_request_duration_seconds", "model" => self.model.clone())
            .record(self.started.elapsed().as_secs_f64());
        if let Some((input, output)) = extract_usage(&self.captured) {
            self.monitor
                .record(&self.model, input, output, self.started.elapsed());
        }
    }
}

impl http_body::Body for TicketBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    let room = USAGE_CAPTURE_LIMIT.saturating_sub(this.captured.len());
                    let take = room.min(data.len());
                    this.captured.extend_from_slice(&data[..take]);
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(None) => {
                this.record_usage();
                Poll::Ready(None)
            }
            other => other,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> http_body::SizeHint {
        self.inner.size_hint()
    }
}
