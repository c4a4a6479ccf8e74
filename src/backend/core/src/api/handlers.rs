//! API request handlers.
//!
//! Handlers return `Result<impl IntoResponse, SutraError>` so rejections are
//! rendered through the `IntoResponse` implementation on `SutraError`.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{ApiResponse, AppState, API_KEY_HEADER};
use crate::error::SutraError;
use crate::jobs::{HistoryEntry, Job, JobId, JobStatus, RenderPayload, SchedulerSnapshot};
use crate::telemetry::SERVICE_NAME;

fn api_key(headers: &HeaderMap) -> Option<&str> {
    headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok())
}

// ═══════════════════════════════════════════════════════════════════════════════
// Health
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Serialize)]
pub struct LivenessResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
}

impl LivenessResponse {
    fn ok() -> Self {
        Self {
            status: "ok",
            service: SERVICE_NAME,
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    #[serde(flatten)]
    pub liveness: LivenessResponse,
    pub store: &'static str,
    pub scheduler: SchedulerSnapshot,
    pub timestamp: DateTime<Utc>,
}

pub async fn liveness() -> impl IntoResponse {
    Json(LivenessResponse::ok())
}

pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        liveness: LivenessResponse::ok(),
        store: state.scheduler.store().backend_name(),
        scheduler: state.scheduler.snapshot(),
        timestamp: Utc::now(),
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// Jobs
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn create_video(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, SutraError> {
    let admission = state.gateway.submit(api_key(&headers), &body).await?;
    Ok((StatusCode::ACCEPTED, Json(admission)))
}

/// Job record as exposed over HTTP. The worker lease stays internal.
#[derive(Debug, Serialize)]
pub struct JobView {
    pub id: JobId,
    pub status: JobStatus,
    pub attempt: u32,
    pub cancel_requested: bool,
    pub notified: bool,
    pub version: u64,
    pub payload: RenderPayload,
    pub history: Vec<HistoryEntry>,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            status: job.status,
            attempt: job.attempt,
            cancel_requested: job.cancel_requested,
            notified: job.notified,
            version: job.version,
            payload: job.payload,
            history: job.history,
            submitted_at: job.submitted_at,
            updated_at: job.updated_at,
        }
    }
}

pub async fn get_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, SutraError> {
    state.gateway.authorize(api_key(&headers)).await?;
    let id = JobId::parse(&id)?;
    let job = state.scheduler.store().get(&id).await?;
    Ok(Json(ApiResponse::success(JobView::from(job))))
}

pub async fn cancel_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, SutraError> {
    state.gateway.authorize(api_key(&headers)).await?;
    let id = JobId::parse(&id)?;
    let job = state.scheduler.cancel(&id).await?;
    Ok((StatusCode::ACCEPTED, Json(ApiResponse::success(JobView::from(job)))))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Metrics
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.metrics.render(),
    )
}
