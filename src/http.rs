//! HTTP transport for the counterpoint analysis service
//!
//! Axum router over [`AnalysisPipeline`]. Every route except `/health` passes
//! the request-rate limiter; quota and analysis failures map to JSON bodies
//! of the form `{code, message}`.

use std::cmp::Ordering;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};

use crate::error::CounterpointError;
use crate::models::{ContentVector, UserProfile};
use crate::pipeline::{AnalysisPipeline, AnalyzeRequest, Caller, InterveneRequest, PipelineError};
use crate::quota::{Rejection, request_identity};

pub const USER_ID_HEADER: &str = "x-user-id";
pub const UPSTREAM_KEY_HEADER: &str = "x-upstream-key";
pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const API_KEY_HEADER: &str = "x-api-key";
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";
pub const RATE_LIMIT_REMAINING_HEADER: &str = "x-ratelimit-remaining";

/// Shared state for HTTP server
#[derive(Clone)]
pub struct HttpState {
    pub pipeline: Arc<AnalysisPipeline>,
    pub metrics: Arc<Mutex<HttpMetrics>>,
}

impl HttpState {
    pub fn new(pipeline: Arc<AnalysisPipeline>) -> Self {
        Self {
            pipeline,
            metrics: Arc::new(Mutex::new(HttpMetrics::new())),
        }
    }
}

/// Metrics for HTTP server
#[derive(Debug, Clone)]
pub struct HttpMetrics {
    pub total_requests: u64,
    pub last_request_unix: i64,
    pub errors_total: u64,
    pub rate_limited_total: u64,
    pub latencies: Vec<f64>, // ring buffer for p95
}

impl HttpMetrics {
    fn new() -> Self {
        Self {
            total_requests: 0,
            last_request_unix: chrono::Utc::now().timestamp(),
            errors_total: 0,
            rate_limited_total: 0,
            latencies: Vec::with_capacity(256),
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|h| h.to_str().ok())
}

/// Caller identity as established by the fronting auth layer
pub fn caller_from_headers(headers: &HeaderMap) -> Caller {
    Caller {
        user_id: header_str(headers, USER_ID_HEADER).map(str::to_string),
        byok_key: header_str(headers, UPSTREAM_KEY_HEADER).map(str::to_string),
    }
}

fn json_error(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({ "code": code, "message": message.into() })),
    )
        .into_response()
}

fn rejection_response(rejection: &Rejection) -> Response {
    let mut resp = (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({
            "code": rejection.code.as_str(),
            "message": rejection.message,
            "retryAfter": rejection.retry_after_secs,
        })),
    )
        .into_response();
    if let Ok(v) = HeaderValue::from_str(&rejection.retry_after_secs.to_string()) {
        resp.headers_mut().insert(header::RETRY_AFTER, v);
    }
    resp
}

fn status_for(err: &CounterpointError) -> StatusCode {
    match err {
        CounterpointError::Validation { .. } => StatusCode::BAD_REQUEST,
        CounterpointError::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        CounterpointError::Upstream { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for CounterpointError {
    fn into_response(self) -> Response {
        json_error(status_for(&self), self.code(), self.to_string())
    }
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        match self {
            PipelineError::Rejected(rejection) => rejection_response(&rejection),
            PipelineError::Service(err) => err.into_response(),
        }
    }
}

/// Health check endpoint
pub async fn health_handler() -> impl IntoResponse {
    "ok"
}

pub async fn analyze_handler(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Json(body): Json<AnalyzeRequest>,
) -> Response {
    let caller = caller_from_headers(&headers);
    match state.pipeline.analyze(&body, &caller).await {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn intervene_handler(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Json(body): Json<InterveneRequest>,
) -> Response {
    let caller = caller_from_headers(&headers);
    match state.pipeline.should_intervene(&body, &caller).await {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn explain_handler(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Json(body): Json<InterveneRequest>,
) -> Response {
    let caller = caller_from_headers(&headers);
    match state.pipeline.explain(&body, &caller).await {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn quota_handler(State(state): State<HttpState>, headers: HeaderMap) -> Response {
    let caller = caller_from_headers(&headers);
    match state.pipeline.quota_status(&caller).await {
        Some(snapshot) => Json(snapshot).into_response(),
        None => json_error(
            StatusCode::BAD_REQUEST,
            "INVALID_REQUEST",
            format!("{} header is required", USER_ID_HEADER),
        ),
    }
}

#[derive(Debug, Deserialize)]
pub struct ProfileBody {
    pub vector: ContentVector,
}

pub async fn put_profile_handler(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Json(body): Json<ProfileBody>,
) -> Response {
    let Some(user_id) = header_str(&headers, USER_ID_HEADER) else {
        return json_error(
            StatusCode::BAD_REQUEST,
            "INVALID_REQUEST",
            format!("{} header is required", USER_ID_HEADER),
        );
    };
    match state
        .pipeline
        .put_profile(UserProfile::new(user_id, body.vector))
        .await
    {
        Ok(profile) => Json(profile).into_response(),
        Err(e) => e.into_response(),
    }
}

/// Cache counters plus request metrics
pub async fn stats_handler(State(state): State<HttpState>) -> impl IntoResponse {
    let metrics = state.metrics.lock().await.clone();

    let (avg_latency_ms, p95_latency_ms) = if metrics.latencies.is_empty() {
        (None, None)
    } else {
        let sum: f64 = metrics.latencies.iter().sum();
        let avg = sum / metrics.latencies.len() as f64;
        let mut sorted = metrics.latencies.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
        let p95_idx = ((sorted.len() as f64 * 0.95) as usize).min(sorted.len() - 1);
        (Some(avg), sorted.get(p95_idx).copied())
    };

    Json(json!({
        "cache": state.pipeline.stats(),
        "http": {
            "total_requests": metrics.total_requests,
            "last_request_unix": metrics.last_request_unix,
            "errors_total": metrics.errors_total,
            "rate_limited_total": metrics.rate_limited_total,
            "avg_latency_ms": avg_latency_ms,
            "p95_latency_ms": p95_latency_ms
        }
    }))
}

async fn request_id_layer(mut req: Request, next: Next) -> Response {
    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .cloned()
        .or_else(|| HeaderValue::from_str(&uuid::Uuid::new_v4().to_string()).ok());
    if let Some(id) = &request_id {
        req.headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), id.clone());
    }
    let mut resp = next.run(req).await;
    if let Some(id) = request_id {
        resp.headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), id);
    }
    resp
}

async fn rate_limit_layer(State(state): State<HttpState>, req: Request, next: Next) -> Response {
    if req.uri().path() == "/health" {
        return next.run(req).await;
    }
    let headers = req.headers();
    let identity = request_identity(
        header_str(headers, header::AUTHORIZATION.as_str()),
        header_str(headers, API_KEY_HEADER),
        header_str(headers, FORWARDED_FOR_HEADER),
    );
    match state.pipeline.rate_limiter().check(&identity) {
        Ok(status) => {
            let mut resp = next.run(req).await;
            if let Ok(v) = HeaderValue::from_str(&status.remaining.to_string()) {
                resp.headers_mut()
                    .insert(HeaderName::from_static(RATE_LIMIT_REMAINING_HEADER), v);
            }
            resp
        }
        Err(rejection) => {
            let mut m = state.metrics.lock().await;
            m.rate_limited_total = m.rate_limited_total.saturating_add(1);
            drop(m);
            rejection_response(&rejection)
        }
    }
}

async fn metrics_layer(State(state): State<HttpState>, req: Request, next: Next) -> Response {
    let start = std::time::Instant::now();
    let resp = next.run(req).await;
    let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
    let mut m = state.metrics.lock().await;
    if latency_ms > 0.0 {
        m.latencies.push(latency_ms);
        if m.latencies.len() > 256 {
            m.latencies.remove(0);
        }
    }
    if resp.status().is_server_error() {
        m.errors_total = m.errors_total.saturating_add(1);
    }
    m.total_requests = m.total_requests.saturating_add(1);
    m.last_request_unix = chrono::Utc::now().timestamp();
    resp
}

/// Full application router
pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/v1/analyze", post(analyze_handler))
        .route("/v1/intervene", post(intervene_handler))
        .route("/v1/explain", post(explain_handler))
        .route("/v1/quota", get(quota_handler))
        .route("/v1/profile", put(put_profile_handler))
        .route("/v1/stats", get(stats_handler))
        .layer(
            ServiceBuilder::new()
                .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
                .layer(middleware::from_fn(request_id_layer))
                .layer(middleware::from_fn_with_state(state.clone(), metrics_layer))
                .layer(middleware::from_fn_with_state(state.clone(), rate_limit_layer)),
        )
        .with_state(state)
}

/// Start the HTTP server
pub async fn start_http_server(pipeline: Arc<AnalysisPipeline>) -> anyhow::Result<()> {
    let bind = pipeline.config().server.http_bind;
    let app = router(HttpState::new(pipeline));

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind HTTP listener: {}", e))?;

    tracing::info!("Starting HTTP server on {}", bind);

    axum::serve(listener, app)
        .await
        .map_err(|e| anyhow::anyhow!("HTTP server error: {}", e))?;

    Ok(())
}
