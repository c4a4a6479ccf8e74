//! Render job engine.
//!
//! - **Gateway**: authorizes and validates submissions, applies backpressure
//! - **Scheduler**: bounded FIFO queue feeding a fixed worker pool
//! - **Pipeline**: drives one job through its steps with retries and resume
//! - **Executor**: runs a single step under a timeout and classifies failures
//! - **Store**: versioned job records with compare-and-swap updates
//! - **Notifier**: at-least-once delivery of terminal transitions
//!
//! # Architecture
//!
//! ```text
//! ┌───────────┐    ┌─────────────┐    ┌─────────────┐    ┌─────────────┐
//! │  Gateway  │───▶│  Scheduler  │───▶│  Pipeline   │───▶│  Executor   │
//! │ (admit)   │    │ (queue +    │    │ (download → │    │ (command /  │
//! │           │    │  workers)   │    │  finalize)  │    │  simulated) │
//! └───────────┘    └─────────────┘    └─────────────┘    └─────────────┘
//!       │                 │                  │
//!       ▼                 ▼                  ▼
//! ┌──────────────────────────────────────────────┐   ┌──────────────┐
//! │          JobStore (memory / redis)           │   │   Notifier   │
//! └──────────────────────────────────────────────┘   └──────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use sutra_core::jobs::*;
//!
//! let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
//! let pipeline = JobPipeline::new(store.clone(), executor, PipelineConfig::default());
//! let scheduler = Scheduler::new(store, pipeline, Arc::new(LogNotifier), SchedulerConfig::default());
//!
//! scheduler.recover().await?;
//! let handle = scheduler.start();
//!
//! let gateway = SubmissionGateway::new(Arc::new(ApiKeyAuthorizer::new(keys)), scheduler);
//! let admission = gateway.submit(Some("key"), br#"{"sutra_id":"abc123"}"#).await?;
//! ```

pub mod executor;
pub mod gateway;
pub mod job;
pub mod notifier;
pub mod pipeline;
pub mod retry;
pub mod scheduler;
pub mod store;

pub use executor::{
    execute_with_timeout, CommandStepExecutor, SimulatedStepExecutor, StepContext, StepError,
    StepErrorKind, StepExecutor, StepOutput,
};
pub use gateway::{
    parse_submission, Admission, ApiKeyAuthorizer, Authorizer, SubmissionGateway, JOB_ID_FIELD,
};
pub use job::{
    FailureReason, HistoryEntry, Job, JobId, JobStatus, RenderPayload, Step, StepOutcome,
};
pub use notifier::{
    build_notifier, deliver, LogNotifier, Notifier, NotifyError, TerminalEvent, WebhookNotifier,
};
pub use pipeline::{JobPipeline, PipelineConfig, ResumeMode};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerHandle, SchedulerSnapshot, SchedulerStats};
pub use store::{open_store, InMemoryJobStore, JobStore, JobUpdate, RedisJobStore};
