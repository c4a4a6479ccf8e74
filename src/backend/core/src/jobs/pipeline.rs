//! Job pipeline: drives one job through its steps.
//!
//! ```text
//! Pending ─▶ Running(download) ─▶ Running(transcode) ─▶ Running(upload) ─▶ Running(finalize) ─▶ Succeeded
//!    │              │                     │                    │                   │
//!    └──────────────┴─────────────────────┴────────────────────┴───────────────────┴──────▶ Failed
//! ```
//!
//! State is persisted after every attempt, so a job left behind by a crashed
//! worker resumes at its first step without a successful history entry.
//!
//! A drive owns the job through a lease that expires after `lease_ttl` unless
//! renewed. Renewal happens every third of the TTL while a step runs or a
//! retry backs off; a live lease held by someone else is never taken over.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use uuid::Uuid;

use super::executor::{execute_with_timeout, StepContext, StepError, StepExecutor, StepOutput};
use super::job::{FailureReason, HistoryEntry, Job, JobId, JobStatus, Step};
use super::retry::RetryPolicy;
use super::store::{JobStore, JobUpdate};
use crate::config::EngineConfig;
use crate::error::{ErrorCode, Result, SutraError};
use crate::telemetry::JobMetrics;

/// How often a conflicting write is re-applied before giving up.
const MAX_CONFLICT_RETRIES: usize = 5;

/// How often a retry backoff checks for cancellation.
const BACKOFF_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Where a drive starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResumeMode {
    /// Continue at the first step without a successful history entry
    #[default]
    Resume,
    /// Run every step again from `download`
    Restart,
}

/// Retry and timeout settings for the pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub retry: RetryPolicy,
    pub step_timeout: Duration,
    pub step_timeouts: HashMap<Step, Duration>,
    /// How long a lease survives without renewal
    pub lease_ttl: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            step_timeout: Duration::from_secs(600),
            step_timeouts: HashMap::new(),
            lease_ttl: Duration::from_secs(30),
        }
    }
}

impl PipelineConfig {
    pub fn from_engine(engine: &EngineConfig) -> Result<Self> {
        let mut step_timeouts = HashMap::new();
        for step in Step::ALL {
            if engine.step_timeouts.contains_key(step.as_str()) {
                step_timeouts.insert(step, engine.step_timeout_for(step));
            }
        }
        for name in engine.step_timeouts.keys() {
            name.parse::<Step>()?;
        }
        Ok(Self {
            retry: engine.retry_policy(),
            step_timeout: engine.step_timeout,
            step_timeouts,
            lease_ttl: engine.lease_ttl,
        })
    }

    pub fn timeout_for(&self, step: Step) -> Duration {
        self.step_timeouts.get(&step).copied().unwrap_or(self.step_timeout)
    }

    /// Interval between lease renewals.
    pub fn renew_interval(&self) -> Duration {
        (self.lease_ttl / 3).max(Duration::from_millis(10))
    }

    fn lease_deadline(&self) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::from_std(self.lease_ttl).unwrap_or(chrono::Duration::seconds(30))
    }
}

/// Drives jobs through the fixed step order.
#[derive(Clone)]
pub struct JobPipeline {
    store: Arc<dyn JobStore>,
    executor: Arc<dyn StepExecutor>,
    config: PipelineConfig,
}

impl JobPipeline {
    pub fn new(
        store: Arc<dyn JobStore>,
        executor: Arc<dyn StepExecutor>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            executor,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Run the job until it reaches a terminal status under a fresh lease.
    ///
    /// Returns the terminal job. Fails with `LeaseHeld` when a live lease
    /// already owns the job and with `LeaseLost` when another worker takes
    /// the job over mid-drive.
    pub async fn drive(&self, id: &JobId, mode: ResumeMode) -> Result<Job> {
        let lease = Uuid::new_v4().to_string();
        self.drive_as(id, mode, &lease, None).await
    }

    /// Run the job under `lease`, taking over `inherit` even while it is live.
    ///
    /// `inherit` names the lease of an earlier drive known to be dead.
    pub async fn drive_as(
        &self,
        id: &JobId,
        mode: ResumeMode,
        lease: &str,
        inherit: Option<&str>,
    ) -> Result<Job> {
        let lease = lease.to_string();
        let mut job = self.claim(id, &lease, mode, inherit).await?;
        let mut step = match &job.status {
            JobStatus::Running { step } => *step,
            _ => return Ok(job),
        };

        tracing::info!(
            job_id = %id,
            step = %step,
            attempt = job.attempt + 1,
            mode = ?mode,
            "Driving job"
        );

        loop {
            job = self.store.get(id).await?;
            if job.owner.as_deref() != Some(lease.as_str()) {
                return Err(SutraError::lease_lost(id.as_str()));
            }
            if job.cancel_requested {
                tracing::info!(job_id = %id, step = %step, "Job cancelled");
                return self
                    .write(
                        &job,
                        &lease,
                        JobUpdate::new()
                            .status(JobStatus::Failed {
                                reason: FailureReason::Cancelled,
                            })
                            .release(),
                    )
                    .await;
            }

            let attempt = job.attempt + 1;
            let ctx = StepContext {
                job_id: id.clone(),
                payload: job.payload.clone(),
                attempt,
                timeout: self.config.timeout_for(step),
            };

            let started = Instant::now();
            let result = self.run_step(step, &ctx, &lease).await?;
            let elapsed = started.elapsed().as_secs_f64();

            match result {
                Ok(_) => {
                    JobMetrics::step_finished(step.as_str(), "succeeded", elapsed);
                    tracing::info!(job_id = %id, step = %step, attempt, "Step succeeded");

                    let entry = HistoryEntry::succeeded(step, attempt);
                    match step.next() {
                        Some(next) => {
                            self.write(
                                &job,
                                &lease,
                                JobUpdate::new()
                                    .push(entry)
                                    .attempt(0)
                                    .status(JobStatus::Running { step: next }),
                            )
                            .await?;
                            step = next;
                        }
                        None => {
                            return self
                                .write(
                                    &job,
                                    &lease,
                                    JobUpdate::new()
                                        .push(entry)
                                        .attempt(0)
                                        .status(JobStatus::Succeeded)
                                        .release(),
                                )
                                .await;
                        }
                    }
                }
                Err(err) => {
                    JobMetrics::step_finished(step.as_str(), err.kind.as_str(), elapsed);
                    let entry = HistoryEntry::failed(step, attempt, err.kind, &err.message, err.retryable);

                    if self.config.retry.should_retry(attempt, err.retryable) {
                        let delay = self.config.retry.delay_for(attempt);
                        tracing::warn!(
                            job_id = %id,
                            step = %step,
                            attempt,
                            error = %err,
                            delay_ms = delay.as_millis() as u64,
                            "Step failed, retrying"
                        );
                        JobMetrics::step_retry(step.as_str());

                        let updated = self
                            .write(&job, &lease, JobUpdate::new().push(entry).attempt(attempt))
                            .await?;
                        if !updated.cancel_requested {
                            self.back_off(id, &lease, delay).await?;
                        }
                        continue;
                    }

                    let reason = if err.retryable {
                        FailureReason::RetriesExhausted {
                            step,
                            attempts: attempt,
                            message: err.message.clone(),
                        }
                    } else {
                        FailureReason::StepFailed {
                            step,
                            kind: err.kind,
                            message: err.message.clone(),
                        }
                    };
                    tracing::warn!(job_id = %id, step = %step, attempt, error = %err, "Job failed");

                    return self
                        .write(
                            &job,
                            &lease,
                            JobUpdate::new()
                                .push(entry)
                                .attempt(attempt)
                                .status(JobStatus::Failed { reason })
                                .release(),
                        )
                        .await;
                }
            }
        }
    }

    /// Give up on a job whose drives keep aborting and record why.
    ///
    /// Takes over `inherit` like `drive_as`. A job that already finished is
    /// returned unchanged.
    pub async fn abandon(&self, id: &JobId, inherit: &str, drives: u32, message: &str) -> Result<Job> {
        for _ in 0..MAX_CONFLICT_RETRIES {
            let job = self.store.get(id).await?;
            if job.is_terminal() {
                return Ok(job);
            }
            if let Some(remaining) = job.lease_held_by_other(Some(inherit), Utc::now()) {
                return Err(SutraError::lease_held(id.as_str(), remaining));
            }

            let update = JobUpdate::new()
                .status(JobStatus::Failed {
                    reason: FailureReason::Aborted {
                        drives,
                        message: message.to_string(),
                    },
                })
                .release();
            match self.store.update_status(id, job.version, update).await {
                Ok(failed) => {
                    tracing::warn!(job_id = %id, drives, error = message, "Job abandoned");
                    return Ok(failed);
                }
                Err(e) if e.code() == ErrorCode::PersistenceConflict => continue,
                Err(e) if e.code() == ErrorCode::InvalidStateTransition => {
                    return self.store.get(id).await
                }
                Err(e) => return Err(e),
            }
        }
        Err(SutraError::new(
            ErrorCode::PersistenceConflict,
            format!("Could not abandon job {}", id),
        ))
    }

    /// Execute one attempt, renewing the lease while it runs.
    ///
    /// Dropping the attempt on a lost lease kills any child process.
    async fn run_step(
        &self,
        step: Step,
        ctx: &StepContext,
        lease: &str,
    ) -> Result<std::result::Result<StepOutput, StepError>> {
        let period = self.config.renew_interval();
        let mut renewals = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        renewals.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let attempt = execute_with_timeout(self.executor.as_ref(), step, ctx);
        tokio::pin!(attempt);

        loop {
            tokio::select! {
                result = &mut attempt => return Ok(result),
                _ = renewals.tick() => {
                    self.renew(&ctx.job_id, lease).await?;
                }
            }
        }
    }

    /// Sleep out a retry delay, returning early once cancellation lands.
    async fn back_off(&self, id: &JobId, lease: &str, delay: Duration) -> Result<()> {
        let until = tokio::time::Instant::now() + delay;
        let mut next_renewal = tokio::time::Instant::now() + self.config.renew_interval();

        loop {
            let now = tokio::time::Instant::now();
            if now >= until {
                return Ok(());
            }
            tokio::time::sleep((until - now).min(BACKOFF_POLL_INTERVAL)).await;

            let job = self.store.get(id).await?;
            if job.owner.as_deref() != Some(lease) {
                return Err(SutraError::lease_lost(id.as_str()));
            }
            if job.cancel_requested {
                tracing::debug!(job_id = %id, "Cancellation cut the retry delay short");
                return Ok(());
            }
            if tokio::time::Instant::now() >= next_renewal {
                self.write(&job, lease, JobUpdate::new().lease_until(self.config.lease_deadline()))
                    .await?;
                next_renewal = tokio::time::Instant::now() + self.config.renew_interval();
            }
        }
    }

    /// Push the lease expiry out by another TTL.
    async fn renew(&self, id: &JobId, lease: &str) -> Result<Job> {
        let job = self.store.get(id).await?;
        if job.owner.as_deref() != Some(lease) {
            return Err(SutraError::lease_lost(id.as_str()));
        }
        let renewed = self
            .write(&job, lease, JobUpdate::new().lease_until(self.config.lease_deadline()))
            .await?;
        tracing::trace!(job_id = %id, expires_at = ?renewed.lease_expires_at, "Lease renewed");
        Ok(renewed)
    }

    /// Take the lease and move the job to its starting step.
    async fn claim(&self, id: &JobId, lease: &str, mode: ResumeMode, inherit: Option<&str>) -> Result<Job> {
        for _ in 0..MAX_CONFLICT_RETRIES {
            let job = self.store.get(id).await?;
            if job.is_terminal() {
                return Ok(job);
            }
            if let Some(remaining) = job.lease_held_by_other(inherit, Utc::now()) {
                return Err(SutraError::lease_held(id.as_str(), remaining));
            }

            let start = match mode {
                ResumeMode::Resume => job.resume_step(),
                ResumeMode::Restart => Some(Step::first()),
            };

            let update = match start {
                Some(step) => {
                    let same_step = job.status == JobStatus::Running { step };
                    let attempt = if mode == ResumeMode::Resume && same_step {
                        job.attempt
                    } else {
                        0
                    };
                    JobUpdate::new()
                        .claim(lease)
                        .lease_until(self.config.lease_deadline())
                        .status(JobStatus::Running { step })
                        .attempt(attempt)
                }
                // Every step already succeeded; only the terminal write was lost.
                None => JobUpdate::new().status(JobStatus::Succeeded).release(),
            };

            match self.store.update_status(id, job.version, update).await {
                Ok(claimed) => {
                    if let Some(previous) = job.owner.as_deref() {
                        tracing::info!(job_id = %id, previous_owner = previous, "Took over job lease");
                    }
                    return Ok(claimed);
                }
                Err(e) if e.code() == ErrorCode::PersistenceConflict => continue,
                Err(e) if e.code() == ErrorCode::InvalidStateTransition => {
                    return self.store.get(id).await
                }
                Err(e) => return Err(e),
            }
        }
        Err(SutraError::new(
            ErrorCode::PersistenceConflict,
            format!("Could not claim job {}", id),
        ))
    }

    /// Write as the lease holder, re-applying after a concurrent change.
    async fn write(&self, job: &Job, lease: &str, update: JobUpdate) -> Result<Job> {
        let mut expected = job.version;
        for _ in 0..MAX_CONFLICT_RETRIES {
            match self.store.update_status(&job.id, expected, update.clone()).await {
                Ok(updated) => return Ok(updated),
                Err(e) if e.code() == ErrorCode::PersistenceConflict => {
                    let current = self.store.get(&job.id).await?;
                    if current.owner.as_deref() != Some(lease) {
                        return Err(SutraError::lease_lost(job.id.as_str()));
                    }
                    tracing::debug!(
                        job_id = %job.id,
                        expected,
                        actual = current.version,
                        "Re-applying job update after concurrent change"
                    );
                    expected = current.version;
                }
                Err(e) => return Err(e),
            }
        }
        Err(SutraError::conflict(job.id.as_str(), expected, expected + 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::executor::SimulatedStepExecutor;
    use crate::jobs::job::RenderPayload;
    use crate::jobs::store::InMemoryJobStore;
    use async_trait::async_trait;

    struct AlwaysFails(StepError);

    #[async_trait]
    impl StepExecutor for AlwaysFails {
        async fn run(&self, _step: Step, _ctx: &StepContext) -> std::result::Result<StepOutput, StepError> {
            Err(self.0.clone())
        }
    }

    fn pipeline(executor: Arc<dyn StepExecutor>) -> (Arc<InMemoryJobStore>, JobPipeline) {
        let store = Arc::new(InMemoryJobStore::new());
        let config = PipelineConfig {
            retry: RetryPolicy::immediate(3),
            ..Default::default()
        };
        (store.clone(), JobPipeline::new(store, executor, config))
    }

    async fn submit(store: &InMemoryJobStore, id: &str) -> JobId {
        let id = JobId::parse(id).unwrap();
        store.put(Job::new(id.clone(), RenderPayload::default())).await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_drive_runs_every_step() {
        let (store, pipeline) = pipeline(Arc::new(SimulatedStepExecutor::new(Duration::ZERO)));
        let id = submit(&store, "abc123").await;

        let job = pipeline.drive(&id, ResumeMode::Resume).await.unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.history_steps(), Step::ALL.to_vec());
        assert!(job.owner.is_none());
    }

    #[tokio::test]
    async fn test_non_retryable_error_fails_immediately() {
        let (store, pipeline) = pipeline(Arc::new(AlwaysFails(StepError::invalid_input("bad url"))));
        let id = submit(&store, "abc123").await;

        let job = pipeline.drive(&id, ResumeMode::Resume).await.unwrap();
        assert!(matches!(
            job.status,
            JobStatus::Failed {
                reason: FailureReason::StepFailed { step: Step::Download, .. }
            }
        ));
        assert_eq!(job.history.len(), 1);
    }

    #[tokio::test]
    async fn test_retryable_error_exhausts_attempts() {
        let (store, pipeline) = pipeline(Arc::new(AlwaysFails(StepError::transient("reset"))));
        let id = submit(&store, "abc123").await;

        let job = pipeline.drive(&id, ResumeMode::Resume).await.unwrap();
        assert!(matches!(
            job.status,
            JobStatus::Failed {
                reason: FailureReason::RetriesExhausted { step: Step::Download, attempts: 3, .. }
            }
        ));
        assert_eq!(job.attempts_for(Step::Download), 3);
        let attempts: Vec<u32> = job.history.iter().map(|e| e.attempt).collect();
        assert_eq!(attempts, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let (store, pipeline) = pipeline(Arc::new(SimulatedStepExecutor::new(Duration::ZERO)));
        let id = submit(&store, "abc123").await;
        store.request_cancel(&id).await.unwrap();

        let job = pipeline.drive(&id, ResumeMode::Resume).await.unwrap();
        assert_eq!(
            job.status,
            JobStatus::Failed {
                reason: FailureReason::Cancelled
            }
        );
        assert!(job.history.is_empty());
    }

    #[tokio::test]
    async fn test_drive_terminal_job_is_noop() {
        let (store, pipeline) = pipeline(Arc::new(SimulatedStepExecutor::new(Duration::ZERO)));
        let id = submit(&store, "abc123").await;
        let first = pipeline.drive(&id, ResumeMode::Resume).await.unwrap();

        let second = pipeline.drive(&id, ResumeMode::Resume).await.unwrap();
        assert_eq!(first, second);
    }

    /// Leave the job owned by `holder` with a lease lapsing after `ttl`.
    async fn hold(store: &InMemoryJobStore, id: &JobId, holder: &str, ttl: chrono::Duration) {
        let job = store.get(id).await.unwrap();
        store
            .update_status(
                id,
                job.version,
                JobUpdate::new()
                    .claim(holder)
                    .lease_until(Utc::now() + ttl)
                    .status(JobStatus::Running { step: Step::Download }),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_live_lease_is_not_taken_over() {
        let (store, pipeline) = pipeline(Arc::new(SimulatedStepExecutor::new(Duration::ZERO)));
        let id = submit(&store, "abc123").await;
        hold(&store, &id, "other-worker", chrono::Duration::seconds(30)).await;

        let err = pipeline.drive(&id, ResumeMode::Resume).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::LeaseHeld);

        let stored = store.get(&id).await.unwrap();
        assert_eq!(stored.owner.as_deref(), Some("other-worker"));
        assert!(stored.history.is_empty());
    }

    #[tokio::test]
    async fn test_expired_lease_is_taken_over() {
        let (store, pipeline) = pipeline(Arc::new(SimulatedStepExecutor::new(Duration::ZERO)));
        let id = submit(&store, "abc123").await;
        hold(&store, &id, "crashed-worker", chrono::Duration::seconds(-1)).await;

        let job = pipeline.drive(&id, ResumeMode::Resume).await.unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_inherited_lease_is_taken_over() {
        let (store, pipeline) = pipeline(Arc::new(SimulatedStepExecutor::new(Duration::ZERO)));
        let id = submit(&store, "abc123").await;
        hold(&store, &id, "aborted-drive", chrono::Duration::seconds(30)).await;

        let job = pipeline
            .drive_as(&id, ResumeMode::Resume, "next-drive", Some("aborted-drive"))
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.lease_expires_at, None);
    }

    #[tokio::test]
    async fn test_claim_sets_lease_expiry() {
        let (store, pipeline) = pipeline(Arc::new(AlwaysFails(StepError::invalid_input("bad url"))));
        let id = submit(&store, "abc123").await;
        pipeline.claim(&id, "lease-1", ResumeMode::Resume, None).await.unwrap();

        let stored = store.get(&id).await.unwrap();
        assert_eq!(stored.owner.as_deref(), Some("lease-1"));
        assert!(stored.lease_expires_at.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn test_abandon_records_aborted_failure() {
        let (store, pipeline) = pipeline(Arc::new(SimulatedStepExecutor::new(Duration::ZERO)));
        let id = submit(&store, "abc123").await;
        hold(&store, &id, "aborted-drive", chrono::Duration::seconds(30)).await;

        let err = pipeline.abandon(&id, "someone-else", 3, "store down").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::LeaseHeld);

        let failed = pipeline.abandon(&id, "aborted-drive", 3, "store down").await.unwrap();
        assert_eq!(
            failed.status,
            JobStatus::Failed {
                reason: FailureReason::Aborted {
                    drives: 3,
                    message: "store down".to_string()
                }
            }
        );
        assert!(failed.owner.is_none());
    }

    #[test]
    fn test_renew_interval() {
        let config = PipelineConfig {
            lease_ttl: Duration::from_secs(30),
            ..Default::default()
        };
        assert_eq!(config.renew_interval(), Duration::from_secs(10));

        let tiny = PipelineConfig {
            lease_ttl: Duration::from_millis(3),
            ..Default::default()
        };
        assert_eq!(tiny.renew_interval(), Duration::from_millis(10));
    }

    #[test]
    fn test_config_from_engine() {
        let mut engine = EngineConfig::default();
        engine
            .step_timeouts
            .insert("transcode".to_string(), Duration::from_secs(7200).into());

        let config = PipelineConfig::from_engine(&engine).unwrap();
        assert_eq!(config.timeout_for(Step::Transcode), Duration::from_secs(7200));
        assert_eq!(config.timeout_for(Step::Download), engine.step_timeout);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.lease_ttl, engine.lease_ttl);
    }
}
