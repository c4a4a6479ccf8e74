//! Scheduler and worker pool.
//!
//! Admitted jobs wait in one FIFO queue bounded by `queue_capacity`; a fixed
//! pool of `max_concurrency` workers drains it. Each worker loops
//! dequeue → drive → notify → idle.
//!
//! A drive that aborts (store error, panic) is queued again with backoff and
//! inherits the dead drive's lease. Once `redrive_policy` runs out the job is
//! failed as aborted.

use chrono::Utc;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::job::{Job, JobId, JobStatus};
use super::notifier::{deliver, Notifier, TerminalEvent};
use super::pipeline::{JobPipeline, ResumeMode};
use super::retry::RetryPolicy;
use super::store::JobStore;
use crate::config::Config;
use crate::error::{ErrorCode, Result, SutraError};
use crate::telemetry::JobMetrics;

/// Slack added before re-checking a job whose lease is about to lapse.
const LEASE_GRACE: Duration = Duration::from_millis(50);

/// Configuration for the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Jobs driven at the same time
    pub max_concurrency: usize,
    /// Admitted jobs allowed to wait for a worker
    pub queue_capacity: usize,
    /// Retry policy for terminal notifications
    pub notify_policy: RetryPolicy,
    /// Drives per job and the delay before driving an aborted job again
    pub redrive_policy: RetryPolicy,
    /// Worker name prefix used in logs
    pub name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            queue_capacity: 1024,
            notify_policy: RetryPolicy::default(),
            redrive_policy: RetryPolicy::default(),
            name: "sutra-worker".to_string(),
        }
    }
}

impl SchedulerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_concurrency: config.engine.max_concurrency,
            queue_capacity: config.engine.queue_capacity,
            notify_policy: config.notification_policy(),
            redrive_policy: config.engine.redrive_policy(),
            ..Default::default()
        }
    }
}

/// Counters for the worker pool.
#[derive(Debug, Clone, Default)]
pub struct SchedulerStats {
    /// Drives that ended (terminal or aborted)
    pub processed: Arc<AtomicU64>,
    /// Jobs that ended in `Succeeded`
    pub succeeded: Arc<AtomicU64>,
    /// Jobs that ended in `Failed`
    pub failed: Arc<AtomicU64>,
    /// Drives that stopped without a terminal status
    pub aborted: Arc<AtomicU64>,
    /// Jobs currently being driven
    pub active: Arc<AtomicU64>,
}

impl SchedulerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Acquire)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn aborted(&self) -> u64 {
        self.aborted.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }
}

/// Point-in-time view of the scheduler for health output.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SchedulerSnapshot {
    pub pending: usize,
    pub queue_capacity: usize,
    pub max_concurrency: usize,
    pub active: u64,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub aborted: u64,
}

/// A job waiting for a worker. Holds its queue slot until dequeued.
struct QueuedJob {
    id: JobId,
    mode: ResumeMode,
    /// Lease of an aborted drive this entry takes over
    inherit: Option<String>,
    /// Drives of this job that aborted so far
    aborts: u32,
    /// Wait out a live lease held elsewhere instead of dropping the entry
    await_lease: bool,
    _slot: Option<OwnedSemaphorePermit>,
}

impl QueuedJob {
    fn new(id: JobId, mode: ResumeMode, slot: Option<OwnedSemaphorePermit>) -> Self {
        Self {
            id,
            mode,
            inherit: None,
            aborts: 0,
            await_lease: false,
            _slot: slot,
        }
    }
}

struct Inner {
    store: Arc<dyn JobStore>,
    pipeline: JobPipeline,
    notifier: Arc<dyn Notifier>,
    config: SchedulerConfig,
    queue: parking_lot::Mutex<VecDeque<QueuedJob>>,
    slots: Arc<Semaphore>,
    wake: Notify,
    stats: SchedulerStats,
}

/// Bounded FIFO scheduler feeding a fixed worker pool.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        pipeline: JobPipeline,
        notifier: Arc<dyn Notifier>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                pipeline,
                notifier,
                slots: Arc::new(Semaphore::new(config.queue_capacity)),
                config,
                queue: parking_lot::Mutex::new(VecDeque::new()),
                wake: Notify::new(),
                stats: SchedulerStats::new(),
            }),
        }
    }

    /// Admit a new job without blocking.
    ///
    /// Fails with `QueueFull` before touching the store when every queue slot
    /// is taken, and with `DuplicateJob` when the id already exists.
    pub async fn enqueue(&self, job: Job) -> Result<JobId> {
        let slot = self
            .inner
            .slots
            .clone()
            .try_acquire_owned()
            .map_err(|_| SutraError::queue_full(self.inner.config.queue_capacity))?;

        let id = job.id.clone();
        self.inner.store.put(job).await?;
        self.push(QueuedJob::new(id.clone(), ResumeMode::Resume, Some(slot)));

        tracing::debug!(job_id = %id, pending = self.pending(), "Job enqueued");
        Ok(id)
    }

    /// Queue an existing unfinished job again, taking a queue slot.
    ///
    /// Fails with `LeaseHeld` while a live worker owns the job.
    pub async fn requeue(&self, id: &JobId, mode: ResumeMode) -> Result<()> {
        let job = self.inner.store.get(id).await?;
        if job.is_terminal() {
            return Err(SutraError::invalid_transition(id.as_str(), &job.status));
        }
        if let Some(remaining) = job.lease_held_by_other(None, Utc::now()) {
            return Err(SutraError::lease_held(id.as_str(), remaining));
        }
        let slot = self
            .inner
            .slots
            .clone()
            .try_acquire_owned()
            .map_err(|_| SutraError::queue_full(self.inner.config.queue_capacity))?;

        self.push(QueuedJob::new(id.clone(), mode, Some(slot)));
        tracing::info!(job_id = %id, mode = ?mode, "Job requeued");
        Ok(())
    }

    /// Startup sweep: queue every unfinished job in submission order and
    /// re-deliver terminal events that were never acknowledged.
    ///
    /// Recovered jobs were admitted before and do not take queue slots. A job
    /// still leased by a live worker elsewhere is picked up once the lease
    /// lapses.
    pub async fn recover(&self) -> Result<usize> {
        let unfinished = self.inner.store.list_unfinished().await?;
        let count = unfinished.len();

        for job in unfinished {
            tracing::info!(
                job_id = %job.id,
                status = %job.status,
                history_len = job.history.len(),
                "Recovering unfinished job"
            );
            self.push(QueuedJob {
                await_lease: true,
                ..QueuedJob::new(job.id, ResumeMode::Resume, None)
            });
        }

        if count > 0 {
            JobMetrics::jobs_recovered(count as u64);
            tracing::info!(count, "Recovery sweep queued unfinished jobs");
        }

        let undelivered = self.inner.store.list_unnotified().await?;
        if !undelivered.is_empty() {
            tracing::info!(count = undelivered.len(), "Re-delivering unacknowledged notifications");
            let scheduler = self.clone();
            tokio::spawn(async move {
                for job in undelivered {
                    scheduler.notify(&job).await;
                }
            });
        }
        Ok(count)
    }

    /// Request cancellation; takes effect at the next step boundary.
    pub async fn cancel(&self, id: &JobId) -> Result<Job> {
        let job = self.inner.store.request_cancel(id).await?;
        tracing::info!(job_id = %id, status = %job.status, "Cancellation requested");
        Ok(job)
    }

    /// Jobs waiting for a worker.
    pub fn pending(&self) -> usize {
        self.inner.queue.lock().len()
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.inner.stats
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        let stats = &self.inner.stats;
        SchedulerSnapshot {
            pending: self.pending(),
            queue_capacity: self.inner.config.queue_capacity,
            max_concurrency: self.inner.config.max_concurrency,
            active: stats.active(),
            processed: stats.processed(),
            succeeded: stats.succeeded(),
            failed: stats.failed(),
            aborted: stats.aborted(),
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.inner.store
    }

    /// Spawn the worker pool.
    pub fn start(&self) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let workers = (0..self.inner.config.max_concurrency)
            .map(|index| {
                let scheduler = self.clone();
                let shutdown_rx = shutdown_rx.clone();
                tokio::spawn(async move { scheduler.worker_loop(index, shutdown_rx).await })
            })
            .collect();

        tracing::info!(
            worker = %self.inner.config.name,
            concurrency = self.inner.config.max_concurrency,
            queue_capacity = self.inner.config.queue_capacity,
            "Worker pool started"
        );

        SchedulerHandle {
            shutdown: shutdown_tx,
            workers,
        }
    }

    /// Push `entry` after `delay` without holding up the caller.
    fn push_later(&self, entry: QueuedJob, delay: Duration) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            scheduler.push(entry);
        });
    }

    fn push(&self, job: QueuedJob) {
        let depth = {
            let mut queue = self.inner.queue.lock();
            queue.push_back(job);
            queue.len()
        };
        JobMetrics::queue_depth(depth);
        self.inner.wake.notify_one();
    }

    fn pop(&self) -> Option<QueuedJob> {
        let (job, depth) = {
            let mut queue = self.inner.queue.lock();
            (queue.pop_front(), queue.len())
        };
        JobMetrics::queue_depth(depth);
        job
    }

    async fn worker_loop(self, index: usize, mut shutdown_rx: watch::Receiver<bool>) {
        let name = format!("{}-{}", self.inner.config.name, index);
        tracing::debug!(worker = %name, "Worker started");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            if let Some(job) = self.pop() {
                self.process(&name, job).await;
                continue;
            }

            let notified = self.inner.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(job) = self.pop() {
                self.process(&name, job).await;
                continue;
            }

            tokio::select! {
                _ = &mut notified => {}
                changed = shutdown_rx.changed() => {
                    // Handle dropped without an explicit shutdown.
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::debug!(worker = %name, "Worker stopped");
    }

    async fn process(&self, worker: &str, job: QueuedJob) {
        let QueuedJob {
            id,
            mode,
            inherit,
            aborts,
            await_lease,
            _slot,
        } = job;
        drop(_slot);

        let stats = &self.inner.stats;
        let active = stats.active.fetch_add(1, Ordering::Relaxed) + 1;
        JobMetrics::running(active);

        // The drive runs in its own task so a panic stays contained.
        let lease = Uuid::new_v4().to_string();
        let pipeline = self.inner.pipeline.clone();
        let drive_id = id.clone();
        let drive_lease = lease.clone();
        let outcome = tokio::spawn(async move {
            pipeline
                .drive_as(&drive_id, mode, &drive_lease, inherit.as_deref())
                .await
        })
        .await;

        match outcome {
            Ok(Ok(finished)) => self.finish(worker, &finished).await,
            Ok(Err(e)) if e.code() == ErrorCode::LeaseLost => {
                stats.aborted.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(worker = %worker, job_id = %id, "Job taken over by another worker");
            }
            Ok(Err(e)) if e.code() == ErrorCode::LeaseHeld => {
                if await_lease {
                    self.await_lease(id, mode).await;
                } else {
                    tracing::debug!(worker = %worker, job_id = %id, "Job is driven by another worker, entry dropped");
                }
            }
            Ok(Err(e)) => {
                stats.aborted.fetch_add(1, Ordering::Relaxed);
                e.log();
                let cause = e.to_string();
                self.redrive(worker, id, mode, lease, aborts + 1, cause).await;
            }
            Err(join_error) => {
                stats.aborted.fetch_add(1, Ordering::Relaxed);
                tracing::error!(worker = %worker, job_id = %id, error = %join_error, "Job drive panicked");
                let cause = format!("drive panicked: {}", join_error);
                self.redrive(worker, id, mode, lease, aborts + 1, cause).await;
            }
        }

        // Published after the outcome counters so readers never see it ahead of them.
        stats.processed.fetch_add(1, Ordering::Release);
        let active = stats.active.fetch_sub(1, Ordering::Relaxed) - 1;
        JobMetrics::running(active);
    }

    async fn finish(&self, worker: &str, finished: &Job) {
        let stats = &self.inner.stats;
        match finished.status {
            JobStatus::Succeeded => stats.succeeded.fetch_add(1, Ordering::Relaxed),
            _ => stats.failed.fetch_add(1, Ordering::Relaxed),
        };
        JobMetrics::job_finished(finished.status.label());
        tracing::info!(worker = %worker, job_id = %finished.id, status = %finished.status, "Job finished");

        self.notify(finished).await;
    }

    /// Deliver the terminal event and record the acknowledgement.
    async fn notify(&self, job: &Job) {
        if job.notified {
            return;
        }
        if let Some(event) = TerminalEvent::from_job(job) {
            let delivered = deliver(
                self.inner.notifier.as_ref(),
                &event,
                &self.inner.config.notify_policy,
            )
            .await;
            if delivered {
                if let Err(e) = self.inner.store.mark_notified(&job.id).await {
                    e.log();
                }
            }
        }
    }

    /// Queue an aborted job again, or fail it once its drives run out.
    async fn redrive(
        &self,
        worker: &str,
        id: JobId,
        mode: ResumeMode,
        lease: String,
        aborts: u32,
        cause: String,
    ) {
        let policy = &self.inner.config.redrive_policy;
        if policy.should_retry(aborts, true) {
            let delay = policy.delay_for(aborts);
            tracing::warn!(
                worker = %worker,
                job_id = %id,
                aborts,
                delay_ms = delay.as_millis() as u64,
                error = %cause,
                "Job drive aborted, driving it again"
            );
            let entry = QueuedJob {
                inherit: Some(lease),
                aborts,
                ..QueuedJob::new(id, mode, None)
            };
            self.push_later(entry, delay);
            return;
        }

        match self.inner.pipeline.abandon(&id, &lease, aborts, &cause).await {
            Ok(failed) => self.finish(worker, &failed).await,
            Err(e) => {
                e.log();
                tracing::error!(
                    worker = %worker,
                    job_id = %id,
                    aborts,
                    "Could not fail aborted job, left for the recovery sweep"
                );
            }
        }
    }

    /// Check a recovered job again once the live lease on it lapses.
    async fn await_lease(&self, id: JobId, mode: ResumeMode) {
        let remaining = match self.inner.store.get(&id).await {
            Ok(job) => job.lease_held_by_other(None, Utc::now()).unwrap_or_default(),
            Err(e) => {
                e.log();
                return;
            }
        };
        let delay = remaining + LEASE_GRACE;
        tracing::info!(
            job_id = %id,
            delay_ms = delay.as_millis() as u64,
            "Recovered job is leased by a live worker, checking again when the lease lapses"
        );
        let entry = QueuedJob {
            await_lease: true,
            ..QueuedJob::new(id, mode, None)
        };
        self.push_later(entry, delay);
    }
}

/// Handle for controlling a running worker pool.
///
/// Dropping the handle stops workers once they are idle.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Stop taking jobs. Workers finish their current job first.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Wait for every worker to exit.
    pub async fn join(self) {
        for result in futures::future::join_all(self.workers).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Worker task failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::executor::SimulatedStepExecutor;
    use crate::jobs::job::RenderPayload;
    use crate::jobs::notifier::LogNotifier;
    use crate::jobs::pipeline::PipelineConfig;
    use crate::jobs::store::InMemoryJobStore;
    use std::time::Duration;

    fn scheduler(capacity: usize) -> (Arc<InMemoryJobStore>, Scheduler) {
        let store = Arc::new(InMemoryJobStore::new());
        let pipeline = JobPipeline::new(
            store.clone(),
            Arc::new(SimulatedStepExecutor::new(Duration::ZERO)),
            PipelineConfig::default(),
        );
        let scheduler = Scheduler::new(
            store.clone(),
            pipeline,
            Arc::new(LogNotifier),
            SchedulerConfig {
                max_concurrency: 2,
                queue_capacity: capacity,
                ..Default::default()
            },
        );
        (store, scheduler)
    }

    fn job(id: &str) -> Job {
        Job::new(JobId::parse(id).unwrap(), RenderPayload::default())
    }

    #[test]
    fn test_scheduler_config_default() {
        let config = SchedulerConfig::default();
        assert_eq!(config.max_concurrency, 4);
        assert_eq!(config.queue_capacity, 1024);
    }

    #[test]
    fn test_scheduler_stats() {
        let stats = SchedulerStats::new();
        assert_eq!(stats.processed(), 0);
        assert_eq!(stats.active(), 0);

        stats.processed.fetch_add(1, Ordering::Relaxed);
        assert_eq!(stats.processed(), 1);
    }

    #[tokio::test]
    async fn test_enqueue_respects_capacity() {
        let (store, scheduler) = scheduler(2);
        scheduler.enqueue(job("a")).await.unwrap();
        scheduler.enqueue(job("b")).await.unwrap();

        let err = scheduler.enqueue(job("c")).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::QueueFull);
        assert_eq!(store.len().await.unwrap(), 2);
        assert_eq!(scheduler.pending(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_releases_slot() {
        let (_store, scheduler) = scheduler(1);
        scheduler.enqueue(job("a")).await.unwrap();
        let _ = scheduler.pop();

        let err = scheduler.enqueue(job("a")).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::DuplicateJob);
        scheduler.enqueue(job("b")).await.unwrap();
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let (_store, scheduler) = scheduler(8);
        for id in ["first", "second", "third"] {
            scheduler.enqueue(job(id)).await.unwrap();
        }

        let order: Vec<String> = std::iter::from_fn(|| scheduler.pop())
            .map(|queued| queued.id.to_string())
            .collect();
        assert_eq!(order, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_recover_bypasses_capacity() {
        let (store, scheduler) = scheduler(1);
        store.put(job("a")).await.unwrap();
        store.put(job("b")).await.unwrap();

        assert_eq!(scheduler.recover().await.unwrap(), 2);
        assert_eq!(scheduler.pending(), 2);
        scheduler.enqueue(job("c")).await.unwrap();
    }
}
