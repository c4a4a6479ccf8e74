//! Admission control for new render jobs.
//!
//! A submission is authorized, decoded into a [`RenderPayload`], and handed
//! to the [`Scheduler`]. Every rejection happens before the job is stored.

use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;

use super::job::{Job, JobId, RenderPayload};
use super::scheduler::Scheduler;
use crate::error::{ErrorCode, Result, SutraError};
use crate::telemetry::{mask_secret, JobMetrics};

/// Body field callers may use to choose their own job id.
pub const JOB_ID_FIELD: &str = "sutra_id";

/// Upper bound on an encoded submission body.
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 256 * 1024;

// ═══════════════════════════════════════════════════════════════════════════════
// Authorization
// ═══════════════════════════════════════════════════════════════════════════════

/// Decides whether a caller may submit work.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, api_key: Option<&str>) -> Result<()>;
}

/// Static API keys, kept only as SHA-256 digests.
#[derive(Debug, Clone, Default)]
pub struct ApiKeyAuthorizer {
    digests: HashSet<String>,
}

impl ApiKeyAuthorizer {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let digests: HashSet<String> = keys
            .into_iter()
            .map(|key| key.as_ref().trim().to_string())
            .filter(|key| !key.is_empty())
            .inspect(|key| tracing::debug!(key = %mask_secret(key), "Registered API key"))
            .map(|key| Self::hash(&key))
            .collect();

        if digests.is_empty() {
            tracing::warn!("No API keys configured, submissions are not authenticated");
        }
        Self { digests }
    }

    /// An authorizer with no keys accepts every caller.
    pub fn is_enforcing(&self) -> bool {
        !self.digests.is_empty()
    }

    fn hash(key: &str) -> String {
        let mut h = Sha256::new();
        h.update(key.as_bytes());
        hex::encode(h.finalize())
    }
}

#[async_trait]
impl Authorizer for ApiKeyAuthorizer {
    async fn authorize(&self, api_key: Option<&str>) -> Result<()> {
        if !self.is_enforcing() {
            return Ok(());
        }

        let key = match api_key.map(str::trim) {
            Some(key) if !key.is_empty() => key,
            _ => return Err(SutraError::unauthorized("Missing x-api-key header")),
        };

        if self.digests.contains(&Self::hash(key)) {
            Ok(())
        } else {
            tracing::debug!(key = %mask_secret(key), "Rejected unknown API key");
            Err(SutraError::unauthorized("Invalid API key"))
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Submission
// ═══════════════════════════════════════════════════════════════════════════════

/// Acknowledgement returned for an accepted job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Admission {
    pub status: &'static str,
    pub job_id: JobId,
}

impl Admission {
    fn accepted(job_id: JobId) -> Self {
        Self {
            status: "Accepted",
            job_id,
        }
    }
}

/// Front door for `POST /create-video`.
#[derive(Clone)]
pub struct SubmissionGateway {
    authorizer: Arc<dyn Authorizer>,
    scheduler: Scheduler,
    max_payload_bytes: usize,
}

impl SubmissionGateway {
    pub fn new(authorizer: Arc<dyn Authorizer>, scheduler: Scheduler) -> Self {
        Self {
            authorizer,
            scheduler,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }

    pub fn with_max_payload_bytes(mut self, max: usize) -> Self {
        self.max_payload_bytes = max;
        self
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Check a caller's key without submitting anything.
    pub async fn authorize(&self, api_key: Option<&str>) -> Result<()> {
        self.authorizer.authorize(api_key).await
    }

    /// Authorize, validate and enqueue one submission body.
    pub async fn submit(&self, api_key: Option<&str>, body: &[u8]) -> Result<Admission> {
        match self.admit(api_key, body).await {
            Ok(admission) => {
                JobMetrics::job_admitted();
                tracing::info!(job_id = %admission.job_id, "Job accepted");
                Ok(admission)
            }
            Err(e) => {
                JobMetrics::job_rejected(rejection_label(e.code()));
                Err(e)
            }
        }
    }

    async fn admit(&self, api_key: Option<&str>, body: &[u8]) -> Result<Admission> {
        self.authorizer.authorize(api_key).await?;

        if body.len() > self.max_payload_bytes {
            return Err(SutraError::invalid_payload(format!(
                "Payload is {} bytes, limit is {}",
                body.len(),
                self.max_payload_bytes
            )));
        }

        let value: serde_json::Value =
            serde_json::from_slice(body).map_err(|e| SutraError::malformed_body(e.to_string()))?;
        let (id, payload) = parse_submission(value)?;

        let id = self.scheduler.enqueue(Job::new(id, payload)).await?;
        Ok(Admission::accepted(id))
    }
}

/// Split a submission into its job id and render payload.
///
/// The body must be a JSON object. A string `sutra_id` names the job; when it
/// is absent or null a fresh id is generated.
pub fn parse_submission(value: serde_json::Value) -> Result<(JobId, RenderPayload)> {
    let mut fields = match value {
        serde_json::Value::Object(fields) => fields,
        other => {
            return Err(SutraError::invalid_payload(format!(
                "Expected a JSON object, got {}",
                json_kind(&other)
            )))
        }
    };

    let id = match fields.remove(JOB_ID_FIELD) {
        None | Some(serde_json::Value::Null) => JobId::new(),
        Some(serde_json::Value::String(raw)) => JobId::parse(&raw)?,
        Some(other) => {
            return Err(SutraError::invalid_payload(format!(
                "{} must be a string, got {}",
                JOB_ID_FIELD,
                json_kind(&other)
            )))
        }
    };

    Ok((id, RenderPayload::new(fields)))
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

fn rejection_label(code: ErrorCode) -> &'static str {
    match code {
        ErrorCode::Unauthorized => "unauthorized",
        ErrorCode::InvalidPayload | ErrorCode::MalformedBody => "invalid_payload",
        ErrorCode::QueueFull => "queue_full",
        ErrorCode::DuplicateJob => "duplicate",
        _ => "error",
    }
}
