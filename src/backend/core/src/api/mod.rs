//! HTTP surface for Sutra.
//!
//! | Method | Path               | Auth | Description                         |
//! |--------|--------------------|------|-------------------------------------|
//! | GET    | `/`                | no   | Static liveness payload             |
//! | GET    | `/health`          | no   | Liveness plus scheduler statistics  |
//! | POST   | `/create-video`    | yes  | Submit a render job                 |
//! | GET    | `/jobs/:id`        | yes  | Job record with step history        |
//! | POST   | `/jobs/:id/cancel` | yes  | Request cancellation                |
//! | GET    | `/metrics`         | no   | Prometheus exposition               |
//!
//! Authenticated routes read the `x-api-key` header.

mod handlers;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    limit::RequestBodyLimitLayer,
    trace::TraceLayer,
};

use crate::jobs::{Scheduler, SubmissionGateway};
use crate::telemetry::MetricsRegistry;

pub use handlers::{HealthResponse, LivenessResponse};

/// Header carrying the caller's API key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Default cap on request bodies.
pub const DEFAULT_BODY_LIMIT: usize = 256 * 1024;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub gateway: SubmissionGateway,
    pub scheduler: Scheduler,
    pub metrics: MetricsRegistry,
}

impl AppState {
    pub fn new(gateway: SubmissionGateway, metrics: MetricsRegistry) -> Self {
        let scheduler = gateway.scheduler().clone();
        Self {
            gateway,
            scheduler,
            metrics,
        }
    }
}

/// Build the router with the default body limit.
pub fn build_router(state: AppState) -> Router {
    build_router_with_limit(state, DEFAULT_BODY_LIMIT)
}

/// Build the router, rejecting bodies over `body_limit` bytes with `413`.
///
/// # Example
///
/// ```rust,ignore
/// let state = AppState::new(gateway, telemetry.metrics);
/// let app = build_router_with_limit(state, config.server.body_limit_bytes);
/// ```
pub fn build_router_with_limit(state: AppState, body_limit: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(handlers::liveness))
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::prometheus_metrics))
        .route("/create-video", post(handlers::create_video))
        .route("/jobs/:id", get(handlers::get_job))
        .route("/jobs/:id/cancel", post(handlers::cancel_job))
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// API response wrapper.
#[derive(Debug, serde::Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
        }
    }
}
