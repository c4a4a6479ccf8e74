#![allow(clippy::result_large_err)]
//! # Sutra Core
//!
//! Background job engine for video render jobs.
//!
//! ## Architecture
//!
//! - **Jobs**: submission gateway, bounded scheduler, step pipeline with retries and resume
//! - **Store**: versioned job records (in-memory or Redis) with compare-and-swap writes
//! - **API**: axum HTTP surface for submission, status, cancellation and health
//! - **Telemetry**: structured logging and Prometheus metrics
//! - **Config**: layered file and environment configuration

pub mod api;
pub mod config;
pub mod error;
pub mod jobs;
pub mod telemetry;

pub use error::{ErrorCode, ErrorDetails, ErrorSeverity, Result, SutraError};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{ErrorCode, Result, SutraError};
    pub use crate::jobs::{
        Admission, ApiKeyAuthorizer, Job, JobId, JobPipeline, JobStatus, JobStore, Notifier,
        PipelineConfig, ResumeMode, RetryPolicy, Scheduler, SchedulerConfig, Step, StepExecutor,
        SubmissionGateway,
    };
}
