//! HTTP surface: query endpoints over the persisted store, the analysis
//! endpoint, and the auth boundary.
//!
//! Every `/data/*` and `/analysis/*` route requires a valid bearer token;
//! `/auth/*` and `/health` are exempt, and CORS preflight is never
//! challenged.  Failures use a stable `{error, message}` envelope and
//! internal details never leak.  Handlers are short-lived and I/O-bound on
//! the store; the analysis runs on the handler task that received the
//! request.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::analysis;
use crate::auth::{bearer_token, AuthError, AuthService};
use crate::config::{AnalysisSettings, QualitySettings};
use crate::db::{Aggregate, Metric, ReadingStore, StoreError};
use crate::ingest::BUFFER_POLICY;
use crate::metrics::PipelineCounters;
use crate::reading::{parse_utc, MachineStatus, ReadingPayload, ReadingRejection};
use crate::state::SharedState;

const DEFAULT_LIMIT: i64 = 100;
const MAX_LIMIT: i64 = 1000;
/// Internal cap for the uncapped-looking per-machine listing.
const MACHINE_SCAN_CAP: i64 = 10_000;
const DEFAULT_WINDOW_HOURS: u32 = 24;

// ---------------------------------------------------------------------------
// App state
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ReadingStore>,
    pub auth: AuthService,
    pub quality: QualitySettings,
    pub analysis: AnalysisSettings,
    pub counters: Arc<PipelineCounters>,
    pub system: SharedState,
    pub request_timeout: Duration,
}

// ---------------------------------------------------------------------------
// Error envelope
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("missing or invalid bearer token")]
    Unauthorized,
    #[error("invalid token")]
    InvalidToken,
    #[error("expired token")]
    ExpiredToken,
    #[error("store unavailable")]
    StoreUnavailable,
    #[error("store rejected the reading")]
    StoreRejected,
    #[error("request deadline exceeded")]
    Timeout,
}

impl ApiError {
    fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::Unauthorized => "unauthorized",
            Self::InvalidToken => "invalid_token",
            Self::ExpiredToken => "expired_token",
            Self::StoreUnavailable => "store_unavailable",
            Self::StoreRejected => "store_rejected",
            Self::Timeout => "timeout",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::StoreRejected => StatusCode::BAD_REQUEST,
            Self::Unauthorized | Self::InvalidToken | Self::ExpiredToken => {
                StatusCode::UNAUTHORIZED
            }
            Self::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({ "error": self.code(), "message": self.to_string() });
        (self.status(), Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(_) => Self::StoreUnavailable,
            StoreError::Rejected(_) => Self::StoreRejected,
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::BadCredentials => Self::Unauthorized,
            AuthError::InvalidToken => Self::InvalidToken,
            AuthError::ExpiredToken => Self::ExpiredToken,
        }
    }
}

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

/// Authenticated subject, stashed on the request for handlers that care.
#[derive(Debug, Clone)]
pub struct Subject(pub String);

async fn require_bearer(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    // CORS preflight is never authenticated.
    if req.method() == Method::OPTIONS {
        return Ok(next.run(req).await);
    }
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token)
        .ok_or(ApiError::Unauthorized)?;
    let subject = state.auth.verify(token)?;
    debug!(subject = %subject, path = %req.uri().path(), "authenticated request");
    req.extensions_mut().insert(Subject(subject));
    Ok(next.run(req).await)
}

/// Hard per-request deadline; an exceeded budget yields 504 with no
/// partial body.
async fn deadline(State(state): State<AppState>, req: Request, next: Next) -> Response {
    match tokio::time::timeout(state.request_timeout, next.run(req)).await {
        Ok(resp) => resp,
        Err(_) => ApiError::Timeout.into_response(),
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/data", post(create_reading))
        .route("/data/recent", get(recent))
        .route("/data/machine/{id}", get(machine_all))
        .route("/data/machine/{id}/recent", get(machine_recent))
        .route("/data/machine/{id}/stats", get(machine_stats))
        .route("/data/range", get(range))
        .route("/data/status/{status}", get(by_status))
        .route("/data/alerts/temperature", get(temperature_alerts))
        .route("/data/alerts/vibration", get(vibration_alerts))
        .route("/analysis/machine/{id}", get(analyze_machine))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_bearer,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/auth/login", post(login))
        .route("/auth/validate", get(validate_token))
        .merge(protected)
        .layer(middleware::from_fn_with_state(state.clone(), deadline))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(state: AppState, bind: &str) -> anyhow::Result<()> {
    let addr: SocketAddr = bind
        .parse()
        .with_context(|| format!("bad http bind address: {bind}"))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "http listening");
    axum::serve(listener, router(state))
        .await
        .context("http server error")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Auth + health handlers
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

async fn login(
    State(state): State<AppState>,
    body: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(req) = body.map_err(|e| ApiError::Validation(e.body_text()))?;
    let issued = state.auth.issue(&req.username, &req.password)?;
    Ok(Json(issued).into_response())
}

async fn validate_token(
    State(state): State<AppState>,
    req: Request,
) -> Json<serde_json::Value> {
    let subject = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token)
        .and_then(|t| state.auth.verify(t).ok());
    match subject {
        Some(username) => Json(json!({ "valid": true, "username": username })),
        None => Json(json!({ "valid": false })),
    }
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let store_ok = state.store.health_check().await.is_ok();
    Json(json!({
        "status": if store_ok { "ok" } else { "degraded" },
        "uptimeSecs": state.system.uptime_secs(),
        "subscriber": state.system.connection().await,
        "bufferPolicy": BUFFER_POLICY,
        "store": if store_ok { "ok" } else { "unreachable" },
        "counters": state.counters.snapshot(),
    }))
}

// ---------------------------------------------------------------------------
// Data handlers
// ---------------------------------------------------------------------------

async fn create_reading(
    State(state): State<AppState>,
    Extension(Subject(subject)): Extension<Subject>,
    body: Result<Json<ReadingPayload>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(payload) = body.map_err(|e| ApiError::Validation(e.body_text()))?;
    debug!(subject = %subject, machine = %payload.machine_id, "direct reading submission");
    let reading = payload
        .validate(Utc::now(), &state.quality)
        .map_err(|e| match e {
            ReadingRejection::Invalid(field) => ApiError::Validation(field.to_string()),
            ReadingRejection::Quality(msg) => ApiError::Validation(msg),
        })?;
    state
        .store
        .append_batch(std::slice::from_ref(&reading))
        .await?;
    Ok((StatusCode::CREATED, Json(reading)).into_response())
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<i64>,
}

fn effective_limit(q: &LimitQuery) -> Result<i64, ApiError> {
    let limit = q.limit.unwrap_or(DEFAULT_LIMIT);
    if limit < 1 || limit > MAX_LIMIT {
        return Err(ApiError::Validation(format!(
            "limit: must be 1..={MAX_LIMIT}"
        )));
    }
    Ok(limit)
}

async fn recent(
    State(state): State<AppState>,
    Query(q): Query<LimitQuery>,
) -> Result<Response, ApiError> {
    let limit = effective_limit(&q)?;
    let rows = state.store.scan_range(None, None, limit).await?;
    Ok(Json(rows).into_response())
}

async fn machine_all(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let rows = state.store.scan_machine(&id, None, MACHINE_SCAN_CAP).await?;
    Ok(Json(rows).into_response())
}

#[derive(Debug, Deserialize)]
struct HoursQuery {
    hours: Option<u32>,
}

fn window_start(hours: Option<u32>) -> Result<DateTime<Utc>, ApiError> {
    let hours = hours.unwrap_or(DEFAULT_WINDOW_HOURS);
    if hours == 0 {
        return Err(ApiError::Validation("hours: must be at least 1".into()));
    }
    Ok(Utc::now() - ChronoDuration::hours(i64::from(hours)))
}

async fn machine_recent(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<HoursQuery>,
) -> Result<Response, ApiError> {
    let since = window_start(q.hours)?;
    let rows = state
        .store
        .scan_machine(&id, Some(since), MACHINE_SCAN_CAP)
        .await?;
    Ok(Json(rows).into_response())
}

#[derive(Debug, Deserialize)]
struct RangeQuery {
    start: Option<String>,
    end: Option<String>,
}

fn parse_window(q: &RangeQuery) -> Result<(DateTime<Utc>, DateTime<Utc>), ApiError> {
    let start = q
        .start
        .as_deref()
        .ok_or_else(|| ApiError::Validation("start: required".into()))?;
    let end = q
        .end
        .as_deref()
        .ok_or_else(|| ApiError::Validation("end: required".into()))?;
    let start = parse_utc(start).map_err(|e| ApiError::Validation(format!("start: {e}")))?;
    let end = parse_utc(end).map_err(|e| ApiError::Validation(format!("end: {e}")))?;
    if start >= end {
        return Err(ApiError::Validation("start: must be before end".into()));
    }
    Ok((start, end))
}

async fn range(
    State(state): State<AppState>,
    Query(q): Query<RangeQuery>,
) -> Result<Response, ApiError> {
    let (start, end) = parse_window(&q)?;
    let rows = state
        .store
        .scan_range(Some(start), Some(end), MAX_LIMIT)
        .await?;
    Ok(Json(rows).into_response())
}

async fn by_status(
    State(state): State<AppState>,
    Path(status): Path<String>,
) -> Result<Response, ApiError> {
    let status = MachineStatus::parse(&status)
        .ok_or_else(|| ApiError::Validation(format!("status: unknown status '{status}'")))?;
    let rows = state.store.scan_by_status(status, MAX_LIMIT).await?;
    Ok(Json(rows).into_response())
}

#[derive(Debug, Deserialize)]
struct AlertQuery {
    threshold: Option<f64>,
    hours: Option<u32>,
}

async fn alerts(
    state: &AppState,
    metric: Metric,
    default_threshold: f64,
    q: AlertQuery,
) -> Result<Response, ApiError> {
    let threshold = q.threshold.unwrap_or(default_threshold);
    let since = window_start(q.hours)?;
    let rows = state
        .store
        .scan_above_threshold(metric, threshold, since, MAX_LIMIT)
        .await?;
    Ok(Json(rows).into_response())
}

async fn temperature_alerts(
    State(state): State<AppState>,
    Query(q): Query<AlertQuery>,
) -> Result<Response, ApiError> {
    let default = state.analysis.temp_warn;
    alerts(&state, Metric::Temperature, default, q).await
}

async fn vibration_alerts(
    State(state): State<AppState>,
    Query(q): Query<AlertQuery>,
) -> Result<Response, ApiError> {
    let default = state.analysis.vib_warn;
    alerts(&state, Metric::Vibration, default, q).await
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MachineStatsResponse {
    machine_id: String,
    average_temperature: Option<f64>,
    total_readings: i64,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

async fn machine_stats(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<RangeQuery>,
) -> Result<Response, ApiError> {
    let (start, end) = if q.start.is_none() && q.end.is_none() {
        let end = Utc::now();
        (end - ChronoDuration::hours(i64::from(DEFAULT_WINDOW_HOURS)), end)
    } else {
        parse_window(&q)?
    };
    let average_temperature = state
        .store
        .aggregate(&id, Metric::Temperature, Aggregate::Avg, start, end)
        .await?;
    let total_readings = state.store.count_machine(&id, start, end).await?;
    Ok(Json(MachineStatsResponse {
        machine_id: id,
        average_temperature,
        total_readings,
        start,
        end,
    })
    .into_response())
}

// ---------------------------------------------------------------------------
// Analysis handler
// ---------------------------------------------------------------------------

async fn analyze_machine(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<HoursQuery>,
) -> Result<Response, ApiError> {
    let hours = q.hours.unwrap_or(DEFAULT_WINDOW_HOURS);
    if hours == 0 {
        return Err(ApiError::Validation("hours: must be at least 1".into()));
    }
    let report = analysis::run(&id, hours, &*state.store, &state.analysis).await?;
    Ok(Json(report).into_response())
}

// ===========================================================================
// Tests
// ===========================================================================
