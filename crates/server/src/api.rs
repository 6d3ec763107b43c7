//! REST handlers and router.
//!
//! A thin contract surface over the registry, admission controller, bus,
//! and playlist tree. Errors are returned as a stable envelope
//! `{"error": {"code", "message"}}`; capacity refusals carry Retry-After.

use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, RANGE};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use streamforge_config::Config;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;

use crate::bus::ProgressBus;
use crate::engine::select_family;
use crate::hardware::Capabilities;
use crate::jobs::{JobStatus, TranscodeMode, TranscodeRequest};
use crate::monitor::SharedSample;
use crate::playlist;
use crate::registry::{JobRegistry, RegistryError};
use crate::stats::SharedStats;
use crate::ws;

/// Request timeout applied to the API routes.
const API_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<JobRegistry>,
    pub bus: Arc<ProgressBus>,
    pub capabilities: Arc<Capabilities>,
    pub sample: SharedSample,
    pub stats: SharedStats,
    pub config: Arc<Config>,
}

/// API error with a stable code string.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "validation",
            message: message.into(),
        }
    }

    pub fn not_found() -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "not_found",
            message: "job not found".to_string(),
        }
    }

    pub fn capacity(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            code: "capacity",
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal",
            message: message.into(),
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound => ApiError::not_found(),
            RegistryError::Capacity(_) => ApiError::capacity(e.to_string()),
            RegistryError::InvalidState(_) => ApiError::validation(e.to_string()),
            RegistryError::QueueClosed => ApiError::internal(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": { "code": self.code, "message": self.message }
        });
        let mut response = (self.status, Json(body)).into_response();
        if self.status == StatusCode::SERVICE_UNAVAILABLE {
            response
                .headers_mut()
                .insert("Retry-After", HeaderValue::from_static("5"));
        }
        response
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_seconds: f64,
    current_jobs: usize,
    queued_jobs: usize,
}

#[derive(Serialize)]
struct StartResponse {
    job_id: String,
    status: JobStatus,
    progress: f32,
    stream_url: Option<String>,
    download_url: Option<String>,
    duration: f64,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let counts = state.registry.counts().await;
    let uptime = state.stats.read().await.uptime_seconds();
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: uptime,
        current_jobs: counts.processing,
        queued_jobs: counts.queued,
    })
}

async fn capabilities(State(state): State<AppState>) -> Json<Capabilities> {
    Json((*state.capabilities).clone())
}

async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.stats.read().await.clone();
    let counts = state.registry.counts().await;
    Json(serde_json::json!({
        "total_jobs_processed": snapshot.total_jobs_processed,
        "successful_jobs": snapshot.successful_jobs,
        "failed_jobs": snapshot.failed_jobs,
        "cancelled_jobs": snapshot.cancelled_jobs,
        "current_queue_length": counts.queued,
        "active_jobs": counts.processing,
        "total_transcode_time_s": snapshot.total_transcode_time_s,
        "hw_accel_usage": snapshot.hw_accel_usage,
        "uptime_seconds": snapshot.uptime_seconds(),
    }))
}

async fn composite_status(State(state): State<AppState>) -> impl IntoResponse {
    let realtime = state.sample.read().await.clone();
    let jobs = state.registry.snapshot().await;
    Json(serde_json::json!({
        "hardware": &*state.capabilities,
        "realtime": realtime,
        "jobs": jobs,
    }))
}

async fn start_transcode(
    State(state): State<AppState>,
    Json(request): Json<TranscodeRequest>,
) -> Result<Json<StartResponse>, ApiError> {
    if request.source.trim().is_empty() {
        return Err(ApiError::validation("source is required"));
    }
    if request.start_time < 0.0 {
        return Err(ApiError::validation("start_time must not be negative"));
    }
    if request.mode == TranscodeMode::Abr && !state.config.transcoding.enable_abr {
        return Err(ApiError::validation("abr mode is disabled on this server"));
    }
    // Known-unavailable explicit hardware is rejected up front; auto never
    // fails here.
    if let Err(e) = select_family(
        request.output.hw_accel,
        &state.capabilities,
        state.config.hardware.prefer_hw_accel,
    ) {
        return Err(ApiError::validation(e.to_string()));
    }
    for track in &request.subtitles {
        if track.lang.is_empty() || track.lang.contains('/') || track.lang.contains("..") {
            return Err(ApiError::validation("invalid subtitle language tag"));
        }
    }

    let job = state.registry.submit(request).await?;
    Ok(Json(StartResponse {
        job_id: job.id.clone(),
        status: job.status,
        progress: job.telemetry.progress,
        stream_url: job.stream_url.clone(),
        download_url: job.download_url.clone(),
        duration: job.telemetry.duration_s,
    }))
}

async fn job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Response, ApiError> {
    let job = state
        .registry
        .get_touch(&job_id)
        .await
        .ok_or_else(ApiError::not_found)?;
    Ok(Json(job).into_response())
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Response, ApiError> {
    state.registry.cancel(&job_id).await?;
    Ok(Json(serde_json::json!({
        "status": "cancelled",
        "job_id": job_id,
    }))
    .into_response())
}

async fn delete_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.registry.delete(&job_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Serve a file with single-range support.
async fn serve_file(path: &std::path::Path, range_header: Option<&str>) -> Result<Response, ApiError> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|_| ApiError::not_found())?;
    if !metadata.is_file() {
        return Err(ApiError::not_found());
    }
    let size = metadata.len();
    let content_type = playlist::content_type_for(&path.to_string_lossy());

    if let Some(spec) = range_header.and_then(|h| h.strip_prefix("bytes=")) {
        let mut parts = spec.splitn(2, '-');
        let start: u64 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        let end: u64 = parts
            .next()
            .and_then(|s| s.parse().ok())
            .unwrap_or(size.saturating_sub(1))
            .min(size.saturating_sub(1));

        if start >= size || start > end {
            return Err(ApiError {
                status: StatusCode::RANGE_NOT_SATISFIABLE,
                code: "validation",
                message: "range not satisfiable".to_string(),
            });
        }

        let len = end - start + 1;
        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|_| ApiError::not_found())?;
        file.seek(std::io::SeekFrom::Start(start))
            .await
            .map_err(|e| ApiError::internal(e.to_string()))?;
        let mut buf = vec![0u8; len as usize];
        file.read_exact(&mut buf)
            .await
            .map_err(|e| ApiError::internal(e.to_string()))?;

        let mut response = Response::builder()
            .status(StatusCode::PARTIAL_CONTENT)
            .body(Body::from(buf))
            .map_err(|e| ApiError::internal(e.to_string()))?;
        let headers = response.headers_mut();
        headers.insert(
            CONTENT_RANGE,
            HeaderValue::from_str(&format!("bytes {}-{}/{}", start, end, size))
                .map_err(|e| ApiError::internal(e.to_string()))?,
        );
        headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        return Ok(response);
    }

    let bytes = tokio::fs::read(path)
        .await
        .map_err(|_| ApiError::not_found())?;
    let mut response = Response::builder()
        .status(StatusCode::OK)
        .body(Body::from(bytes))
        .map_err(|e| ApiError::internal(e.to_string()))?;
    let headers = response.headers_mut();
    headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(size));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    Ok(response)
}

/// Serve the growing segment tree. Reading the playlist before its
/// segments is the client's side of the ordering contract; a request for a
/// segment the encoder has not produced yet is a plain 404.
async fn stream_file(
    State(state): State<AppState>,
    Path((job_id, rest)): Path<(String, String)>,
    request: Request,
) -> Result<Response, ApiError> {
    // Keep the janitor away from jobs with active viewers.
    state.registry.touch(&job_id).await;

    let path = playlist::resolve_stream_path(state.registry.temp_root(), &job_id, &rest)
        .ok_or_else(ApiError::not_found)?;
    let range = request
        .headers()
        .get(RANGE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    serve_file(&path, range.as_deref()).await
}

async fn download_file(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    request: Request,
) -> Result<Response, ApiError> {
    let job = state
        .registry
        .get_touch(&job_id)
        .await
        .ok_or_else(ApiError::not_found)?;
    if job.status != JobStatus::Ready {
        return Err(ApiError::validation(format!(
            "job is not ready for download: {}",
            job.status
        )));
    }
    let format = job.request.output.format;
    let path = job.working_dir.join(format!("output.{}", format.extension()));
    let range = request
        .headers()
        .get(RANGE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    serve_file(&path, range.as_deref()).await
}

/// Shared-token check on everything except the health probe.
async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.config.security.api_key.clone() else {
        return next.run(request).await;
    };
    if request.uri().path() == "/api/health" {
        return next.run(request).await;
    }

    let header_key = request
        .headers()
        .get("X-API-Key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    let query_key = request.uri().query().and_then(|q| {
        q.split('&')
            .find_map(|pair| pair.strip_prefix("api_key=").map(|v| v.to_string()))
    });

    if header_key.as_deref() == Some(expected.as_str())
        || query_key.as_deref() == Some(expected.as_str())
    {
        next.run(request).await
    } else {
        let body = serde_json::json!({
            "error": { "code": "validation", "message": "invalid or missing API key" }
        });
        (StatusCode::UNAUTHORIZED, Json(body)).into_response()
    }
}

/// Build the full application router.
pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/api/health", get(health))
        .route("/api/capabilities", get(capabilities))
        .route("/api/stats", get(stats))
        .route("/api/status", get(composite_status))
        .route("/api/transcode/start", post(start_transcode))
        .route("/api/transcode/{job_id}/status", get(job_status))
        .route("/api/transcode/{job_id}/cancel", post(cancel_job))
        .route("/api/transcode/{job_id}", delete(delete_job))
        .layer(TimeoutLayer::new(API_TIMEOUT));

    Router::new()
        .merge(api)
        .route("/stream/{job_id}/{*rest}", get(stream_file))
        .route("/download/{job_id}", get(download_file))
        .route("/ws/progress", get(ws::ws_handler))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
