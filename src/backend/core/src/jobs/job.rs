//! The render job record.
//!
//! - **JobId**: submitted `sutra_id` or a generated identifier
//! - **Step**: the fixed pipeline order `download → transcode → upload → finalize`
//! - **JobStatus**: `Pending`, `Running { step }`, `Succeeded`, `Failed { reason }`
//! - **HistoryEntry**: one line of the append-only audit trail per step attempt

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use uuid::Uuid;

use super::executor::StepErrorKind;
use crate::error::{Result, SutraError};

// ═══════════════════════════════════════════════════════════════════════════════
// Job Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Longest accepted job id.
pub const MAX_JOB_ID_LEN: usize = 128;

/// Allowed job id characters.
static JOB_ID_REGEX: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"^[A-Za-z0-9_.\-]+$").expect("Invalid job id regex"));

/// Unique identifier for a render job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Generate a new random job id.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Validate a caller-supplied id.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.is_empty() || raw.len() > MAX_JOB_ID_LEN {
            return Err(SutraError::invalid_payload(format!(
                "sutra_id must be 1 to {} characters",
                MAX_JOB_ID_LEN
            )));
        }
        if !JOB_ID_REGEX.is_match(raw) {
            return Err(SutraError::invalid_payload(
                "sutra_id may only contain letters, digits, '_', '-' and '.'",
            ));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for JobId {
    type Err = SutraError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl AsRef<str> for JobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Steps
// ═══════════════════════════════════════════════════════════════════════════════

/// One named unit of work in the render pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Download,
    Transcode,
    Upload,
    Finalize,
}

impl Step {
    /// Every step in pipeline order.
    pub const ALL: [Step; 4] = [Step::Download, Step::Transcode, Step::Upload, Step::Finalize];

    pub const fn first() -> Self {
        Step::Download
    }

    /// The step that follows this one, if any.
    pub const fn next(self) -> Option<Step> {
        match self {
            Step::Download => Some(Step::Transcode),
            Step::Transcode => Some(Step::Upload),
            Step::Upload => Some(Step::Finalize),
            Step::Finalize => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Step::Download => "download",
            Step::Transcode => "transcode",
            Step::Upload => "upload",
            Step::Finalize => "finalize",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Step {
    type Err = SutraError;

    fn from_str(s: &str) -> Result<Self> {
        Step::ALL
            .into_iter()
            .find(|step| step.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| SutraError::invalid_payload(format!("Unknown step: {}", s)))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Status
// ═══════════════════════════════════════════════════════════════════════════════

/// Why a job ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailureReason {
    /// A step failed with an error that is not worth retrying
    StepFailed {
        step: Step,
        kind: StepErrorKind,
        message: String,
    },
    /// A step kept failing until the attempt budget ran out
    RetriesExhausted {
        step: Step,
        attempts: u32,
        message: String,
    },
    /// Cancellation was requested
    Cancelled,
    /// Drives kept stopping without reaching a verdict
    Aborted { drives: u32, message: String },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StepFailed { step, kind, message } => {
                write!(f, "{} failed ({}): {}", step, kind, message)
            }
            Self::RetriesExhausted {
                step,
                attempts,
                message,
            } => write!(f, "{} failed after {} attempts: {}", step, attempts, message),
            Self::Cancelled => f.write_str("cancelled"),
            Self::Aborted { drives, message } => {
                write!(f, "aborted after {} drives: {}", drives, message)
            }
        }
    }
}

/// Status of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobStatus {
    /// Admitted, waiting for a worker
    Pending,
    /// A worker is executing (or about to execute) `step`
    Running { step: Step },
    /// Every step succeeded
    Succeeded,
    /// The job stopped for good
    Failed { reason: FailureReason },
}

impl JobStatus {
    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed { .. })
    }

    /// Short label used in logs, metrics and idempotency keys.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running { .. } => "running",
            Self::Succeeded => "succeeded",
            Self::Failed { .. } => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running { step } => write!(f, "running({})", step),
            Self::Failed { reason } => write!(f, "failed({})", reason),
            other => f.write_str(other.label()),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// History
// ═══════════════════════════════════════════════════════════════════════════════

/// Result of one step attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum StepOutcome {
    Succeeded,
    Failed {
        kind: StepErrorKind,
        message: String,
        retryable: bool,
    },
}

impl StepOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

/// One entry of a job's append-only audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub step: Step,
    pub outcome: StepOutcome,
    /// 1-based attempt number within the step
    pub attempt: u32,
    pub at: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn succeeded(step: Step, attempt: u32) -> Self {
        Self {
            step,
            outcome: StepOutcome::Succeeded,
            attempt,
            at: Utc::now(),
        }
    }

    pub fn failed(
        step: Step,
        attempt: u32,
        kind: StepErrorKind,
        message: impl Into<String>,
        retryable: bool,
    ) -> Self {
        Self {
            step,
            outcome: StepOutcome::Failed {
                kind,
                message: message.into(),
                retryable,
            },
            attempt,
            at: Utc::now(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Payload
// ═══════════════════════════════════════════════════════════════════════════════

/// Opaque render input: everything submitted besides `sutra_id`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RenderPayload(serde_json::Map<String, serde_json::Value>);

impl RenderPayload {
    pub fn new(fields: serde_json::Map<String, serde_json::Value>) -> Self {
        Self(fields)
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Compact JSON rendering handed to external tools.
    pub fn to_json(&self) -> String {
        serde_json::Value::Object(self.0.clone()).to_string()
    }
}

impl From<serde_json::Map<String, serde_json::Value>> for RenderPayload {
    fn from(fields: serde_json::Map<String, serde_json::Value>) -> Self {
        Self(fields)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Record
// ═══════════════════════════════════════════════════════════════════════════════

/// A render job as persisted in the job store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    pub payload: RenderPayload,
    /// Failed attempts on the current step
    pub attempt: u32,
    pub history: Vec<HistoryEntry>,
    /// Compare-and-swap sequence, bumped by every store write
    pub version: u64,
    /// Lease token of the worker driving the job
    pub owner: Option<String>,
    /// The owner's lease lapses at this point unless renewed
    #[serde(default)]
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
    /// The terminal event reached the notifier
    #[serde(default)]
    pub notified: bool,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a pending job.
    pub fn new(id: JobId, payload: RenderPayload) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: JobStatus::Pending,
            payload,
            attempt: 0,
            history: Vec::new(),
            version: 0,
            owner: None,
            lease_expires_at: None,
            cancel_requested: false,
            notified: false,
            submitted_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Time left on a live lease held by anyone but `lease`.
    ///
    /// A lease without an expiry counts as lapsed.
    pub fn lease_held_by_other(&self, lease: Option<&str>, now: DateTime<Utc>) -> Option<std::time::Duration> {
        let holder = self.owner.as_deref()?;
        if Some(holder) == lease {
            return None;
        }
        let remaining = (self.lease_expires_at? - now).to_std().ok()?;
        (!remaining.is_zero()).then_some(remaining)
    }

    /// First step in pipeline order without a successful history entry.
    pub fn resume_step(&self) -> Option<Step> {
        Step::ALL.into_iter().find(|step| {
            !self
                .history
                .iter()
                .any(|entry| entry.step == *step && entry.outcome.is_success())
        })
    }

    /// Number of history entries recorded for `step`.
    pub fn attempts_for(&self, step: Step) -> usize {
        self.history.iter().filter(|entry| entry.step == step).count()
    }

    /// Steps of the history in recorded order.
    pub fn history_steps(&self) -> Vec<Step> {
        self.history.iter().map(|entry| entry.step).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_id() {
        let id1 = JobId::new();
        let id2 = JobId::new();
        assert_ne!(id1, id2);

        let id = JobId::parse("abc123").unwrap();
        assert_eq!(id.as_str(), "abc123");
        assert_eq!(id.to_string(), "abc123");
    }

    #[test]
    fn test_job_id_rejects_bad_input() {
        assert!(JobId::parse("").is_err());
        assert!(JobId::parse("has space").is_err());
        assert!(JobId::parse("../etc").is_err());
        assert!(JobId::parse(&"a".repeat(MAX_JOB_ID_LEN + 1)).is_err());
        assert!(JobId::parse("render_2024-01.final").is_ok());
    }

    #[test]
    fn test_step_order() {
        assert_eq!(Step::first(), Step::Download);
        assert_eq!(Step::Download.next(), Some(Step::Transcode));
        assert_eq!(Step::Finalize.next(), None);
        assert!(Step::Download < Step::Finalize);
        assert_eq!("UPLOAD".parse::<Step>().unwrap(), Step::Upload);
        assert!("encode".parse::<Step>().is_err());
    }

    #[test]
    fn test_job_status() {
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(JobStatus::Failed {
            reason: FailureReason::Cancelled
        }
        .is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running { step: Step::Upload }.is_terminal());
    }

    #[test]
    fn test_status_serialization() {
        let status = JobStatus::Running {
            step: Step::Transcode,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json, serde_json::json!({"state": "running", "step": "transcode"}));

        let failed = JobStatus::Failed {
            reason: FailureReason::Cancelled,
        };
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["state"], "failed");
        assert_eq!(json["reason"]["reason"], "cancelled");
    }

    #[test]
    fn test_resume_step() {
        let mut job = Job::new(JobId::new(), RenderPayload::default());
        assert_eq!(job.resume_step(), Some(Step::Download));

        job.history.push(HistoryEntry::succeeded(Step::Download, 1));
        job.history.push(HistoryEntry::failed(
            Step::Transcode,
            1,
            StepErrorKind::Timeout,
            "slow",
            true,
        ));
        assert_eq!(job.resume_step(), Some(Step::Transcode));
        assert_eq!(job.attempts_for(Step::Transcode), 1);

        for step in [Step::Transcode, Step::Upload, Step::Finalize] {
            job.history.push(HistoryEntry::succeeded(step, 1));
        }
        assert_eq!(job.resume_step(), None);
    }

    #[test]
    fn test_lease_held_by_other() {
        let now = Utc::now();
        let mut job = Job::new(JobId::new(), RenderPayload::default());
        assert_eq!(job.lease_held_by_other(None, now), None);

        job.owner = Some("worker-a".to_string());
        assert_eq!(job.lease_held_by_other(None, now), None, "no expiry means lapsed");

        job.lease_expires_at = Some(now + chrono::Duration::seconds(10));
        assert!(job.lease_held_by_other(None, now).is_some());
        assert!(job.lease_held_by_other(Some("worker-b"), now).is_some());
        assert_eq!(job.lease_held_by_other(Some("worker-a"), now), None);

        job.lease_expires_at = Some(now - chrono::Duration::seconds(1));
        assert_eq!(job.lease_held_by_other(None, now), None);
    }

    #[test]
    fn test_records_without_lease_fields_still_load() {
        let job = Job::new(JobId::parse("legacy").unwrap(), RenderPayload::default());
        let mut json = serde_json::to_value(&job).unwrap();
        let fields = json.as_object_mut().unwrap();
        fields.remove("lease_expires_at");
        fields.remove("notified");

        let back: Job = serde_json::from_value(json).unwrap();
        assert_eq!(back.lease_expires_at, None);
        assert!(!back.notified);
    }

    #[test]
    fn test_job_round_trips_through_json() {
        let mut fields = serde_json::Map::new();
        fields.insert("template".into(), serde_json::json!("intro"));
        let job = Job::new(JobId::parse("abc123").unwrap(), fields.into());

        let json = serde_json::to_string(&job).unwrap();
        let back: Job = serde_json::from_str(&json).unwrap();
        assert_eq!(back, job);
        assert_eq!(back.payload.get("template"), Some(&serde_json::json!("intro")));
    }
}
