//! Job store: the single source of truth for job state.
//!
//! Every mutation goes through `put` or the compare-and-swap `update_status`;
//! workers never share a `Job` by reference.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;

use super::job::{HistoryEntry, Job, JobId, JobStatus};
use crate::config::{StoreBackend, StoreConfig};
use crate::error::{ErrorCode, Result, SutraError};

/// CAS attempts flag writes make before giving up.
const FLAG_CAS_ATTEMPTS: usize = 16;

// ═══════════════════════════════════════════════════════════════════════════════
// Updates
// ═══════════════════════════════════════════════════════════════════════════════

/// One atomic change to a job. Fields left `None` are kept.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    /// Appended to the history; history is never rewritten
    pub history: Option<HistoryEntry>,
    pub attempt: Option<u32>,
    /// `Some(None)` releases the lease
    pub owner: Option<Option<String>>,
    pub lease_expires_at: Option<Option<DateTime<Utc>>>,
    pub cancel_requested: bool,
    pub notified: bool,
}

impl JobUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn push(mut self, entry: HistoryEntry) -> Self {
        self.history = Some(entry);
        self
    }

    pub fn attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    /// Take the lease for `token`.
    pub fn claim(mut self, token: impl Into<String>) -> Self {
        self.owner = Some(Some(token.into()));
        self
    }

    /// Extend the current lease until `deadline`.
    pub fn lease_until(mut self, deadline: DateTime<Utc>) -> Self {
        self.lease_expires_at = Some(Some(deadline));
        self
    }

    pub fn release(mut self) -> Self {
        self.owner = Some(None);
        self.lease_expires_at = Some(None);
        self
    }

    pub fn notified(mut self) -> Self {
        self.notified = true;
        self
    }

    pub fn cancel() -> Self {
        Self {
            cancel_requested: true,
            ..Self::default()
        }
    }

    /// Apply to `job` and bump its version.
    pub fn apply(&self, job: &mut Job) {
        if let Some(status) = &self.status {
            job.status = status.clone();
        }
        if let Some(entry) = &self.history {
            job.history.push(entry.clone());
        }
        if let Some(attempt) = self.attempt {
            job.attempt = attempt;
        }
        if let Some(owner) = &self.owner {
            job.owner = owner.clone();
        }
        if let Some(expires) = self.lease_expires_at {
            job.lease_expires_at = expires;
        }
        if self.cancel_requested {
            job.cancel_requested = true;
        }
        if self.notified {
            job.notified = true;
        }
        job.version += 1;
        job.updated_at = Utc::now();
    }
}

/// Only terminal jobs carry an event to acknowledge.
fn check_notifiable(job: &Job) -> Result<()> {
    if !job.is_terminal() {
        return Err(SutraError::new(
            ErrorCode::InvalidStateTransition,
            format!("Job {} has not finished yet", job.id),
        ));
    }
    Ok(())
}

/// Reject writes to terminal jobs and stale versions.
fn check_writable(job: &Job, expected_version: u64) -> Result<()> {
    if job.is_terminal() {
        return Err(SutraError::invalid_transition(job.id.as_str(), &job.status));
    }
    if job.version != expected_version {
        return Err(SutraError::conflict(job.id.as_str(), expected_version, job.version));
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
// Store Contract
// ═══════════════════════════════════════════════════════════════════════════════

/// Persistence contract for jobs.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job. Fails with `DuplicateJob` if the id exists.
    async fn put(&self, job: Job) -> Result<()>;

    /// Fetch a copy of a job. Fails with `JobNotFound`.
    async fn get(&self, id: &JobId) -> Result<Job>;

    /// Apply `update` if the stored version equals `expected_version`.
    ///
    /// Fails with `PersistenceConflict` on a version mismatch and with
    /// `InvalidStateTransition` when the job is already terminal. Returns the
    /// updated job.
    async fn update_status(&self, id: &JobId, expected_version: u64, update: JobUpdate)
        -> Result<Job>;

    /// Non-terminal jobs ordered by submission time.
    async fn list_unfinished(&self) -> Result<Vec<Job>>;

    /// Terminal jobs whose event was never acknowledged, oldest first.
    async fn list_unnotified(&self) -> Result<Vec<Job>>;

    /// Record that a terminal job's event was delivered.
    ///
    /// The only write a terminal job accepts.
    async fn mark_notified(&self, id: &JobId) -> Result<Job>;

    /// Number of stored jobs.
    async fn len(&self) -> Result<usize>;

    /// Store backend name for logs and health output.
    fn backend_name(&self) -> &'static str;

    /// Flag a job for cancellation. Terminal jobs are returned unchanged.
    async fn request_cancel(&self, id: &JobId) -> Result<Job> {
        for _ in 0..FLAG_CAS_ATTEMPTS {
            let job = self.get(id).await?;
            if job.is_terminal() || job.cancel_requested {
                return Ok(job);
            }
            match self.update_status(id, job.version, JobUpdate::cancel()).await {
                Ok(updated) => return Ok(updated),
                Err(e) if e.code() == ErrorCode::PersistenceConflict => continue,
                Err(e) if e.code() == ErrorCode::InvalidStateTransition => {
                    return self.get(id).await
                }
                Err(e) => return Err(e),
            }
        }
        Err(SutraError::new(
            ErrorCode::PersistenceConflict,
            format!("Job {} is changing too quickly to cancel, retry later", id),
        ))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-Memory Store
// ═══════════════════════════════════════════════════════════════════════════════

/// In-memory store for single-process deployments and tests.
///
/// Per-job atomicity comes from the map's shard lock, which is never held
/// across an `.await`.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: DashMap<JobId, Job>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn put(&self, job: Job) -> Result<()> {
        match self.jobs.entry(job.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(SutraError::duplicate_job(job.id.as_str())),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                tracing::debug!(job_id = %job.id, "Job stored");
                slot.insert(job);
                Ok(())
            }
        }
    }

    async fn get(&self, id: &JobId) -> Result<Job> {
        self.jobs
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SutraError::job_not_found(id.as_str()))
    }

    async fn update_status(
        &self,
        id: &JobId,
        expected_version: u64,
        update: JobUpdate,
    ) -> Result<Job> {
        let mut entry = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| SutraError::job_not_found(id.as_str()))?;

        check_writable(&entry, expected_version)?;
        update.apply(&mut entry);

        tracing::debug!(job_id = %id, version = entry.version, status = %entry.status, "Job updated");
        Ok(entry.value().clone())
    }

    async fn list_unfinished(&self) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .jobs
            .iter()
            .filter(|entry| !entry.is_terminal())
            .map(|entry| entry.value().clone())
            .collect();
        jobs.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at).then_with(|| a.id.cmp(&b.id)));
        Ok(jobs)
    }

    async fn list_unnotified(&self) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .jobs
            .iter()
            .filter(|entry| entry.is_terminal() && !entry.notified)
            .map(|entry| entry.value().clone())
            .collect();
        jobs.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at).then_with(|| a.id.cmp(&b.id)));
        Ok(jobs)
    }

    async fn mark_notified(&self, id: &JobId) -> Result<Job> {
        let mut entry = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| SutraError::job_not_found(id.as_str()))?;

        check_notifiable(&entry)?;
        if !entry.notified {
            JobUpdate::new().notified().apply(&mut entry);
        }
        Ok(entry.value().clone())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.jobs.len())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Redis Store
// ═══════════════════════════════════════════════════════════════════════════════

/// Insert a job document unless it exists and index it as unfinished.
const PUT_SCRIPT: &str = r#"
if redis.call('SET', KEYS[1], ARGV[1], 'NX') then
    redis.call('ZADD', KEYS[2], ARGV[2], ARGV[3])
    redis.call('INCR', KEYS[3])
    return 1
end
return 0
"#;

/// Replace a job document if its stored version matches and move its id
/// between the `unfinished` and `undelivered` indexes.
const CAS_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
    return -1
end
local doc = cjson.decode(current)
if tonumber(doc['version']) ~= tonumber(ARGV[1]) then
    return 0
end
redis.call('SET', KEYS[1], ARGV[2])
if ARGV[3] == 'finished' then
    redis.call('ZREM', KEYS[2], ARGV[4])
    redis.call('ZADD', KEYS[3], ARGV[5], ARGV[4])
elseif ARGV[3] == 'notified' then
    redis.call('ZREM', KEYS[2], ARGV[4])
    redis.call('ZREM', KEYS[3], ARGV[4])
end
return 1
"#;

/// Index a job document belongs to after a write.
fn index_state(job: &Job) -> &'static str {
    match (job.is_terminal(), job.notified) {
        (false, _) => "open",
        (true, false) => "finished",
        (true, true) => "notified",
    }
}

/// Durable store for multi-process deployments.
///
/// Layout: `{prefix}:job:{id}` holds the JSON document, `{prefix}:unfinished`
/// is a sorted set of non-terminal ids scored by submission time,
/// `{prefix}:undelivered` holds terminal ids not yet notified and
/// `{prefix}:count` counts stored jobs.
#[derive(Clone)]
pub struct RedisJobStore {
    client: redis::Client,
    prefix: String,
    put_script: Arc<redis::Script>,
    cas_script: Arc<redis::Script>,
}

impl RedisJobStore {
    /// Connect to Redis and check the server answers.
    pub async fn connect(url: &str, prefix: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|e| {
            SutraError::with_internal(
                ErrorCode::StoreConnectionFailed,
                "Invalid job store URL",
                e.to_string(),
            )
        })?;

        let store = Self {
            client,
            prefix: prefix.into(),
            put_script: Arc::new(redis::Script::new(PUT_SCRIPT)),
            cas_script: Arc::new(redis::Script::new(CAS_SCRIPT)),
        };
        let mut conn = store.get_conn().await?;
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(SutraError::from)?;
        Ok(store)
    }

    /// Obtain an async multiplexed connection from the Redis client.
    async fn get_conn(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client.get_multiplexed_async_connection().await.map_err(|e| {
            SutraError::with_internal(
                ErrorCode::StoreConnectionFailed,
                "Failed to connect to the job store",
                e.to_string(),
            )
        })
    }

    fn job_key(&self, id: &JobId) -> String {
        job_key(&self.prefix, id)
    }

    fn unfinished_key(&self) -> String {
        format!("{}:unfinished", self.prefix)
    }

    fn undelivered_key(&self) -> String {
        format!("{}:undelivered", self.prefix)
    }

    fn count_key(&self) -> String {
        format!("{}:count", self.prefix)
    }

    async fn load(&self, id: &JobId) -> Result<Option<Job>> {
        let mut conn = self.get_conn().await?;
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.job_key(id))
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                SutraError::with_internal(ErrorCode::StoreError, "Failed to read job", e.to_string())
            })?;

        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Run the CAS script for an already updated document.
    async fn swap(&self, job: &Job, expected_version: u64) -> Result<i64> {
        let document = serde_json::to_string(job)?;
        let mut conn = self.get_conn().await?;
        self.cas_script
            .key(self.job_key(&job.id))
            .key(self.unfinished_key())
            .key(self.undelivered_key())
            .arg(expected_version)
            .arg(document)
            .arg(index_state(job))
            .arg(job.id.as_str())
            .arg(job.submitted_at.timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| {
                SutraError::with_internal(ErrorCode::StoreError, "Failed to update job", e.to_string())
            })
    }

    /// Load every job listed in a sorted-set index, in score order.
    async fn load_index(&self, key: String) -> Result<Vec<Job>> {
        let mut conn = self.get_conn().await?;
        let ids: Vec<String> = redis::cmd("ZRANGE")
            .arg(&key)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                SutraError::with_internal(ErrorCode::StoreError, "Failed to list jobs", e.to_string())
            })?;

        let mut jobs = Vec::with_capacity(ids.len());
        for raw in ids {
            let id = JobId::parse(&raw)?;
            if let Some(job) = self.load(&id).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }
}

fn job_key(prefix: &str, id: &JobId) -> String {
    format!("{}:job:{}", prefix, id)
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn put(&self, job: Job) -> Result<()> {
        let document = serde_json::to_string(&job)?;
        let mut conn = self.get_conn().await?;
        let inserted: i64 = self
            .put_script
            .key(self.job_key(&job.id))
            .key(self.unfinished_key())
            .key(self.count_key())
            .arg(document)
            .arg(job.submitted_at.timestamp_millis())
            .arg(job.id.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| {
                SutraError::with_internal(ErrorCode::StoreError, "Failed to store job", e.to_string())
            })?;

        if inserted == 0 {
            return Err(SutraError::duplicate_job(job.id.as_str()));
        }
        tracing::debug!(job_id = %job.id, "Job stored");
        Ok(())
    }

    async fn get(&self, id: &JobId) -> Result<Job> {
        self.load(id)
            .await?
            .ok_or_else(|| SutraError::job_not_found(id.as_str()))
    }

    async fn update_status(
        &self,
        id: &JobId,
        expected_version: u64,
        update: JobUpdate,
    ) -> Result<Job> {
        let mut job = self.get(id).await?;
        check_writable(&job, expected_version)?;
        update.apply(&mut job);

        match self.swap(&job, expected_version).await? {
            1 => {
                tracing::debug!(job_id = %id, version = job.version, status = %job.status, "Job updated");
                Ok(job)
            }
            0 => {
                let current = self.get(id).await?;
                check_writable(&current, expected_version)?;
                Err(SutraError::conflict(id.as_str(), expected_version, current.version))
            }
            _ => Err(SutraError::job_not_found(id.as_str())),
        }
    }

    async fn list_unfinished(&self) -> Result<Vec<Job>> {
        let mut jobs = self.load_index(self.unfinished_key()).await?;
        jobs.retain(|job| !job.is_terminal());
        Ok(jobs)
    }

    async fn list_unnotified(&self) -> Result<Vec<Job>> {
        let mut jobs = self.load_index(self.undelivered_key()).await?;
        jobs.retain(|job| job.is_terminal() && !job.notified);
        Ok(jobs)
    }

    async fn mark_notified(&self, id: &JobId) -> Result<Job> {
        for _ in 0..FLAG_CAS_ATTEMPTS {
            let mut job = self.get(id).await?;
            check_notifiable(&job)?;
            if job.notified {
                return Ok(job);
            }

            let expected = job.version;
            JobUpdate::new().notified().apply(&mut job);
            match self.swap(&job, expected).await? {
                1 => return Ok(job),
                0 => continue,
                _ => return Err(SutraError::job_not_found(id.as_str())),
            }
        }
        Err(SutraError::new(
            ErrorCode::PersistenceConflict,
            format!("Job {} could not be marked notified, retry later", id),
        ))
    }

    async fn len(&self) -> Result<usize> {
        let mut conn = self.get_conn().await?;
        let count: Option<usize> = redis::cmd("GET")
            .arg(self.count_key())
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                SutraError::with_internal(ErrorCode::StoreError, "Failed to count jobs", e.to_string())
            })?;
        Ok(count.unwrap_or(0))
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}

/// Open the configured store backend.
pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn JobStore>> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(InMemoryJobStore::new())),
        StoreBackend::Redis => {
            let store = RedisJobStore::connect(&config.redis_url, config.key_prefix.clone()).await?;
            tracing::info!(prefix = %config.key_prefix, "Connected to Redis job store");
            Ok(Arc::new(store))
        }
    }
}
