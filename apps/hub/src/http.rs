//! The Operations Hub's axum API (§4.2.6, §6): five route groups — public meta, admin
//! registry+supervisor, admin analytics, logs+telemetry — behind a single `Router`, with a
//! bearer-token middleware layer applied only to the admin group. Grounded on the reference
//! mock-bundler proxy's axum-router-construction idiom (`apps/e2e/src/bundler_proxy.rs`),
//! generalized to many more routes.

use crate::analytics::AnalyticsStore;
use crate::config::AppConfig;
use crate::errors::HubError;
use crate::logs::{LogQuery, LogStore};
use crate::registry::{InstancePolicy, Registry};
use crate::supervisor::{SpawnRequest, Supervisor};
use crate::telemetry::{SessionHeartbeat, TelemetryStore};
use alloy::primitives::{Address, U256};
use alloy::providers::{DynProvider, Provider};
use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use chain::abi::EntryPoint;
use chain::{LogEvent, LogIngestBody, Numeric, Severity};
use futures::stream::Stream;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<AppConfig>,
    pub registry: Arc<Registry>,
    pub supervisor: Arc<Supervisor>,
    pub logs: Arc<LogStore>,
    pub telemetry: Arc<TelemetryStore>,
    pub analytics: Arc<AnalyticsStore>,
    pub metrics: crate::metrics::HubTelemetry,
    pub provider: DynProvider,
    pub started_at_ms: u64,
}

pub async fn serve(state: AppState, shutdown: CancellationToken) -> Result<()> {
    let bind_addr = state.cfg.bind_addr.clone();

    let public = Router::new()
        .route("/health", get(health))
        .route("/bundlers", get(list_bundlers))
        .route("/deployments", get(deployments));

    // `GET /bundlers` is listed under both the public and admin groups in the route inventory;
    // since the registry already strips process handles for every caller (`list_public`), a
    // single unauthenticated route serves both without a duplicate-route conflict.
    let admin_registry = Router::new()
        .route("/bundlers/spawn", post(spawn_bundler))
        .route("/bundlers/register", post(register_bundler))
        .route("/bundlers/:id/stop", post(stop_bundler))
        .route("/bundlers/:id/unregister", post(unregister_bundler));

    let admin_analytics = Router::new()
        .route("/paymaster/status", get(paymaster_status))
        .route("/metrics/summary", get(metrics_summary))
        .route("/metrics/timeseries", get(metrics_timeseries))
        .route("/metrics/failures", get(metrics_failures))
        .route("/userops", get(list_userops))
        .route("/users", get(list_users));

    let admin = admin_registry
        .merge(admin_analytics)
        .route_layer(middleware::from_fn_with_state(state.clone(), admin_auth));

    let logs_and_telemetry = Router::new()
        .route("/logs/ingest", post(ingest_logs))
        .route("/logs", get(query_logs))
        .route("/logs/stream", get(stream_logs))
        .route("/telemetry/session", post(telemetry_session))
        .route("/telemetry/event", post(telemetry_event));

    let middleware = tower::ServiceBuilder::new()
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive());

    // `route_layer`, not `layer`: it wraps each already-registered route's service rather than
    // the whole router, so `MatchedPath` (inserted by the router at match time) is already in the
    // request's extensions by the time `track_http_ms` inspects it.
    let app = public
        .merge(admin)
        .merge(logs_and_telemetry)
        .route_layer(middleware::from_fn_with_state(state.clone(), track_http_ms))
        .layer(middleware)
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("bind http listener on {bind_addr}"))?;

    tracing::info!(%bind_addr, "http listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("http server")?;

    Ok(())
}

/// Compares `Authorization: Bearer <token>` against the configured admin token in constant time
/// (§4.2.6). Absence or mismatch both map to `Unauthorized`.
async fn admin_auth(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: axum::extract::Request,
    next: Next,
) -> Result<Response, HubError> {
    let header = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let presented = header.strip_prefix("Bearer ").unwrap_or("");
    if !constant_time_eq(presented.as_bytes(), state.cfg.admin_token.as_bytes()) {
        return Err(HubError::Unauthorized);
    }
    Ok(next.run(req).await)
}

/// Records `HubTelemetry::http_ms` per matched route. Uses the router's matched path pattern
/// (e.g. `/bundlers/:id/stop`), not the raw URI, so the metric's label cardinality stays bounded
/// regardless of how many distinct bundler ids get requested.
async fn track_http_ms(
    State(state): State<AppState>,
    matched_path: Option<axum::extract::MatchedPath>,
    req: axum::extract::Request,
    next: Next,
) -> Response {
    let route = route_label(matched_path.as_ref().map(|p| p.as_str()).unwrap_or("unmatched"));
    let started = std::time::Instant::now();
    let response = next.run(req).await;
    state.metrics.http_ms(route, started.elapsed().as_millis() as u64);
    response
}

/// `HubTelemetry::http_ms` takes a `&'static str`; map the finite set of route patterns this
/// router registers onto their own static labels instead of leaking a fresh string per request.
fn route_label(route: &str) -> &'static str {
    match route {
        "/health" => "/health",
        "/bundlers" => "/bundlers",
        "/deployments" => "/deployments",
        "/bundlers/spawn" => "/bundlers/spawn",
        "/bundlers/register" => "/bundlers/register",
        "/bundlers/:id/stop" => "/bundlers/:id/stop",
        "/bundlers/:id/unregister" => "/bundlers/:id/unregister",
        "/paymaster/status" => "/paymaster/status",
        "/metrics/summary" => "/metrics/summary",
        "/metrics/timeseries" => "/metrics/timeseries",
        "/metrics/failures" => "/metrics/failures",
        "/userops" => "/userops",
        "/users" => "/users",
        "/logs/ingest" => "/logs/ingest",
        "/logs" => "/logs",
        "/logs/stream" => "/logs/stream",
        "/telemetry/session" => "/telemetry/session",
        "/telemetry/event" => "/telemetry/event",
        _ => "other",
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs()
}

// ---- Public meta ----------------------------------------------------------

async fn health(State(state): State<AppState>) -> Json<Value> {
    let bundlers = state.registry.list_public();
    let up = bundlers.iter().filter(|b| b.status == crate::registry::BundlerStatus::Up).count();
    Json(json!({
        "ok": true,
        "startedAt": state.started_at_ms,
        "bundlersUp": up,
        "bundlersTotal": bundlers.len(),
        "logsCount": state.logs.len(),
    }))
}

async fn list_bundlers(State(state): State<AppState>) -> Json<Vec<crate::registry::BundlerInstance>> {
    Json(state.registry.list_public())
}

async fn deployments(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "entryPoint": format!("{:#x}", state.cfg.entry_point),
        "paymaster": format!("{:#x}", state.cfg.paymaster),
        "router": state.cfg.router.map(|a| format!("{a:#x}")),
        "token": state.cfg.token.map(|a| format!("{a:#x}")),
    }))
}

// ---- Admin: registry + supervisor -----------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpawnBody {
    id: String,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    wallet_private_key: Option<String>,
    #[serde(default)]
    policy: Option<InstancePolicy>,
}

async fn spawn_bundler(
    State(state): State<AppState>,
    Json(body): Json<SpawnBody>,
) -> Result<Json<crate::registry::BundlerInstance>, HubError> {
    if body.id.trim().is_empty() {
        return Err(HubError::Validation("id must not be empty".to_string()));
    }
    let req = SpawnRequest {
        id: body.id.clone(),
        label: body.label.unwrap_or_else(|| body.id.clone()),
        wallet_private_key: body.wallet_private_key,
        policy: body.policy.unwrap_or_default(),
    };
    state
        .supervisor
        .spawn(req)
        .await
        .map_err(|e| HubError::Internal(e.to_string()))?;
    state
        .registry
        .get(&body.id)
        .ok_or_else(|| HubError::Internal("spawned instance missing from registry".to_string()))
        .map(Json)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterBody {
    id: String,
    label: Option<String>,
    rpc_url: String,
    #[serde(default)]
    policy: Option<InstancePolicy>,
}

async fn register_bundler(
    State(state): State<AppState>,
    Json(body): Json<RegisterBody>,
) -> Result<Json<crate::registry::BundlerInstance>, HubError> {
    if body.id.trim().is_empty() || body.rpc_url.trim().is_empty() {
        return Err(HubError::Validation("id and rpcUrl must not be empty".to_string()));
    }
    state.supervisor.register(
        body.id.clone(),
        body.label.unwrap_or_else(|| body.id.clone()),
        body.rpc_url,
        body.policy.unwrap_or_default(),
    );
    state
        .registry
        .get(&body.id)
        .ok_or_else(|| HubError::Internal("registered instance missing from registry".to_string()))
        .map(Json)
}

async fn stop_bundler(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, HubError> {
    if state.registry.get(&id).is_none() {
        return Err(HubError::NotFound(format!("bundler {id}")));
    }
    state
        .supervisor
        .stop(&id)
        .await
        .map_err(|e| HubError::Internal(e.to_string()))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn unregister_bundler(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, HubError> {
    if !state.supervisor.unregister(&id) {
        return Err(HubError::NotFound(format!("bundler {id}")));
    }
    Ok(StatusCode::NO_CONTENT)
}

// ---- Admin: analytics ------------------------------------------------------

async fn paymaster_status(State(state): State<AppState>) -> Result<Json<Value>, HubError> {
    let entry_point = EntryPoint::new(state.cfg.entry_point, &state.provider);
    let deposit = entry_point
        .balanceOf(state.cfg.paymaster)
        .call()
        .await
        .map_err(|e| HubError::Transient(format!("balanceOf(paymaster) failed: {e}")))?;

    // Every numeric field here is funneled through `Numeric` before serialization (§8 S6):
    // regardless of how a given chain backend's client surfaces a quantity internally (bigint,
    // hex string, decimal string, or a toBigInt()-style wrapper object), the wire shape this
    // endpoint emits is always a plain decimal string.
    let mut balances = serde_json::Map::new();
    for (label, addr) in [
        ("paymaster", Some(state.cfg.paymaster)),
        ("router", state.cfg.router),
        ("token", state.cfg.token),
    ] {
        let Some(addr) = addr else { continue };
        let balance = native_balance(&state.provider, addr).await.unwrap_or(U256::ZERO);
        balances.insert(label.to_string(), json!(Numeric::from_u256(balance)));
    }

    let chain_id = state.provider.get_chain_id().await.unwrap_or(0);

    Ok(Json(json!({
        "chainId": chain_id,
        "addresses": {
            "entryPoint": format!("{:#x}", state.cfg.entry_point),
            "paymaster": format!("{:#x}", state.cfg.paymaster),
            "router": state.cfg.router.map(|a| format!("{a:#x}")),
            "token": state.cfg.token.map(|a| format!("{a:#x}")),
        },
        "deposit": Numeric::from_u256(deposit),
        "balances": Value::Object(balances),
        "policy": InstancePolicy::default(),
        "counters": state.telemetry.counters_snapshot(),
    })))
}

async fn native_balance(provider: &DynProvider, addr: Address) -> Result<U256> {
    provider.get_balance(addr).await.context("eth_getBalance")
}

async fn metrics_summary(State(state): State<AppState>) -> Json<Value> {
    let summary = state.analytics.summary();
    Json(json!({
        "sessions": state.telemetry.active_session_count(),
        "uniqueOwners": state.telemetry.owner_count(),
        "bundlers": state.registry.list_public().len(),
        "logsCount": state.logs.len(),
        "userOps": summary,
        "paidFallback": {
            "attempt": state.telemetry.counter("paid_fallback_attempt"),
            "success": state.telemetry.counter("paid_fallback_success"),
            "failure": state.telemetry.counter("paid_fallback_failure"),
        },
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TimeseriesParams {
    #[serde(default = "default_window_sec")]
    window_sec: u64,
    #[serde(default = "default_bucket_sec")]
    bucket_sec: u64,
}

fn default_window_sec() -> u64 {
    3600
}

fn default_bucket_sec() -> u64 {
    60
}

async fn metrics_timeseries(State(state): State<AppState>, Query(params): Query<TimeseriesParams>) -> Json<Value> {
    let series = state
        .analytics
        .timeseries(now_secs(), params.window_sec, params.bucket_sec.max(1));
    Json(json!({
        "bucketSec": params.bucket_sec.max(1),
        "buckets": series.into_iter().map(|(t, c)| json!({"ts": t, "count": c})).collect::<Vec<_>>(),
    }))
}

async fn metrics_failures(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.analytics.failure_reasons()))
}

#[derive(Debug, Deserialize)]
struct UserOpsParams {
    #[serde(default = "default_userops_limit")]
    limit: usize,
    sender: Option<String>,
    success: Option<bool>,
}

fn default_userops_limit() -> usize {
    100
}

async fn list_userops(State(state): State<AppState>, Query(params): Query<UserOpsParams>) -> Json<Value> {
    let sender = params.sender.as_deref().map(str::to_lowercase);
    let list = state.analytics.list(params.limit, sender.as_deref(), params.success);
    Json(json!(list))
}

async fn list_users(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "owners": state.telemetry.owners(),
        "senders": state.telemetry.senders(),
    }))
}

// ---- Logs + telemetry -------------------------------------------------------

async fn ingest_logs(State(state): State<AppState>, Json(body): Json<LogIngestBody>) -> StatusCode {
    let events = body.into_vec();
    let count = events.len() as u64;
    for event in events {
        state.logs.ingest(event);
    }
    state.metrics.logs_ingested(count);
    StatusCode::ACCEPTED
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogsParams {
    service: Option<String>,
    level: Option<Severity>,
    q: Option<String>,
    request_id: Option<String>,
    quote_id: Option<String>,
    intent_hash: Option<String>,
    sender: Option<String>,
    tx_hash: Option<String>,
    since: Option<u64>,
    until: Option<u64>,
    limit: Option<usize>,
}

impl From<LogsParams> for LogQuery {
    fn from(p: LogsParams) -> Self {
        LogQuery {
            service: p.service,
            level: p.level,
            q: p.q,
            request_id: p.request_id,
            quote_id: p.quote_id,
            intent_hash: p.intent_hash,
            sender: p.sender,
            tx_hash: p.tx_hash,
            since: p.since,
            until: p.until,
            limit: p.limit,
        }
    }
}

async fn query_logs(State(state): State<AppState>, Query(params): Query<LogsParams>) -> Json<Vec<LogEvent>> {
    Json(state.logs.query(&LogQuery::from(params)))
}

async fn stream_logs(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>> {
    let rx = state.logs.subscribe();
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let data = serde_json::to_string(&event).unwrap_or_default();
                    return Some((Ok(Event::default().event("log").data(data)), rx));
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

async fn telemetry_session(State(state): State<AppState>, Json(body): Json<SessionHeartbeat>) -> StatusCode {
    state.telemetry.record_session(body);
    StatusCode::NO_CONTENT
}

#[derive(Debug, Deserialize)]
struct TelemetryEventBody {
    name: String,
}

const RECOGNIZED_COUNTERS: &[&str] = &["paid_fallback_attempt", "paid_fallback_success", "paid_fallback_failure"];

async fn telemetry_event(
    State(state): State<AppState>,
    Json(body): Json<TelemetryEventBody>,
) -> Result<StatusCode, HubError> {
    if !RECOGNIZED_COUNTERS.contains(&body.name.as_str()) {
        return Err(HubError::Validation(format!("unrecognized counter name {}", body.name)));
    }
    state.telemetry.record_event(&body.name);
    state.metrics.telemetry_event(&body.name);
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_matches_equal_slices() {
        assert!(constant_time_eq(b"abc123", b"abc123"));
    }

    #[test]
    fn constant_time_eq_rejects_different_lengths() {
        assert!(!constant_time_eq(b"short", b"longerstring"));
    }

    #[test]
    fn constant_time_eq_rejects_mismatch() {
        assert!(!constant_time_eq(b"abc123", b"abc124"));
    }

    #[test]
    fn recognized_counters_reject_unknown_name() {
        assert!(!RECOGNIZED_COUNTERS.contains(&"made_up_counter"));
        assert!(RECOGNIZED_COUNTERS.contains(&"paid_fallback_success"));
    }

    #[test]
    fn paymaster_status_numeric_fields_render_as_decimal_strings_s6() {
        let deposit = Numeric::from_u256(U256::from(10u64));
        assert_eq!(json!(deposit), json!("10"));
    }
}
