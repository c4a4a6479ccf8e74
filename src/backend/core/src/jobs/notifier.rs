//! Terminal notifications.
//!
//! Delivery is at-least-once: failures are retried with the shared backoff and
//! receivers de-duplicate on the idempotency key (`{job_id}:{status}`).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::job::{Job, JobId, JobStatus};
use super::retry::RetryPolicy;
use crate::config::NotifierConfig;
use crate::error::{ErrorCode, Result, SutraError};
use crate::telemetry::JobMetrics;

/// Header carrying the idempotency key on webhook requests.
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

// ═══════════════════════════════════════════════════════════════════════════════
// Events
// ═══════════════════════════════════════════════════════════════════════════════

/// A job reached `Succeeded` or `Failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalEvent {
    pub job_id: JobId,
    pub status: JobStatus,
    pub idempotency_key: String,
    pub history_len: usize,
    pub at: DateTime<Utc>,
}

impl TerminalEvent {
    /// Build the event for a terminal job; `None` while the job is still live.
    pub fn from_job(job: &Job) -> Option<Self> {
        if !job.is_terminal() {
            return None;
        }
        Some(Self {
            job_id: job.id.clone(),
            status: job.status.clone(),
            idempotency_key: idempotency_key(&job.id, &job.status),
            history_len: job.history.len(),
            at: job.updated_at,
        })
    }
}

/// Key identifying one terminal transition of one job.
pub fn idempotency_key(id: &JobId, status: &JobStatus) -> String {
    format!("{}:{}", id, status.label())
}

// ═══════════════════════════════════════════════════════════════════════════════
// Notifier Contract
// ═══════════════════════════════════════════════════════════════════════════════

/// Why a delivery attempt failed.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification sink unreachable: {0}")]
    Transport(String),

    #[error("notification sink answered {status}")]
    Rejected { status: u16 },
}

impl NotifyError {
    /// Transport errors, 408, 429 and 5xx are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Rejected { status } => *status == 408 || *status == 429 || *status >= 500,
        }
    }
}

/// External sink for terminal events.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &TerminalEvent) -> std::result::Result<(), NotifyError>;

    fn name(&self) -> &'static str;
}

/// Writes terminal events to the log.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &TerminalEvent) -> std::result::Result<(), NotifyError> {
        tracing::info!(
            job_id = %event.job_id,
            status = %event.status,
            idempotency_key = %event.idempotency_key,
            history_len = event.history_len,
            "Job finished"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

/// POSTs terminal events as JSON to a webhook.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("sutra-core/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, event: &TerminalEvent) -> std::result::Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .header(IDEMPOTENCY_HEADER, &event.idempotency_key)
            .json(event)
            .send()
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(NotifyError::Rejected {
                status: status.as_u16(),
            })
        }
    }

    fn name(&self) -> &'static str {
        "webhook"
    }
}

/// Pick the sink from configuration.
pub fn build_notifier(config: &NotifierConfig) -> Result<Arc<dyn Notifier>> {
    match &config.webhook_url {
        Some(url) if !url.trim().is_empty() => {
            Ok(Arc::new(WebhookNotifier::new(url.clone(), config.timeout)?))
        }
        _ => Ok(Arc::new(LogNotifier)),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Delivery
// ═══════════════════════════════════════════════════════════════════════════════

/// Deliver `event`, retrying per `policy`. Returns whether it was delivered.
///
/// Undeliverable events are logged and dropped.
pub async fn deliver(notifier: &dyn Notifier, event: &TerminalEvent, policy: &RetryPolicy) -> bool {
    let mut attempt = 1u32;
    loop {
        match notifier.notify(event).await {
            Ok(()) => {
                tracing::debug!(
                    job_id = %event.job_id,
                    sink = notifier.name(),
                    attempt,
                    "Notification delivered"
                );
                JobMetrics::notification("delivered");
                return true;
            }
            Err(e) if policy.should_retry(attempt, e.is_retryable()) => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    job_id = %event.job_id,
                    sink = notifier.name(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Notification failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                SutraError::with_internal(
                    ErrorCode::NotificationDeliveryFailed,
                    format!("Dropped notification for job {}", event.job_id),
                    format!("{} after {} attempt(s) via {}", e, attempt, notifier.name()),
                )
                .log();
                JobMetrics::notification("dropped");
                return false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::job::{FailureReason, RenderPayload};
    use parking_lot::Mutex;

    struct FlakyNotifier {
        failures_left: Mutex<u32>,
        calls: Mutex<Vec<String>>,
        status: u16,
    }

    impl FlakyNotifier {
        fn new(failures: u32, status: u16) -> Self {
            Self {
                failures_left: Mutex::new(failures),
                calls: Mutex::new(Vec::new()),
                status,
            }
        }
    }

    #[async_trait]
    impl Notifier for FlakyNotifier {
        async fn notify(&self, event: &TerminalEvent) -> std::result::Result<(), NotifyError> {
            self.calls.lock().push(event.idempotency_key.clone());
            let mut left = self.failures_left.lock();
            if *left > 0 {
                *left -= 1;
                return Err(NotifyError::Rejected { status: self.status });
            }
            Ok(())
        }

        fn name(&self) -> &'static str {
            "flaky"
        }
    }

    fn finished_job(status: JobStatus) -> Job {
        let mut job = Job::new(JobId::parse("abc123").unwrap(), RenderPayload::default());
        job.status = status;
        job
    }

    #[test]
    fn test_event_only_for_terminal_jobs() {
        assert!(TerminalEvent::from_job(&finished_job(JobStatus::Pending)).is_none());

        let event = TerminalEvent::from_job(&finished_job(JobStatus::Succeeded)).unwrap();
        assert_eq!(event.idempotency_key, "abc123:succeeded");

        let failed = finished_job(JobStatus::Failed {
            reason: FailureReason::Cancelled,
        });
        assert_eq!(TerminalEvent::from_job(&failed).unwrap().idempotency_key, "abc123:failed");
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(NotifyError::Transport("reset".into()).is_retryable());
        assert!(NotifyError::Rejected { status: 503 }.is_retryable());
        assert!(NotifyError::Rejected { status: 429 }.is_retryable());
        assert!(!NotifyError::Rejected { status: 400 }.is_retryable());
    }

    #[tokio::test]
    async fn test_deliver_retries_until_success() {
        let notifier = FlakyNotifier::new(2, 503);
        let event = TerminalEvent::from_job(&finished_job(JobStatus::Succeeded)).unwrap();

        assert!(deliver(&notifier, &event, &RetryPolicy::immediate(3)).await);
        let calls = notifier.calls.lock();
        assert_eq!(calls.len(), 3);
        assert!(calls.iter().all(|key| key == "abc123:succeeded"));
    }

    #[tokio::test]
    async fn test_deliver_drops_after_bound() {
        let notifier = FlakyNotifier::new(10, 503);
        let event = TerminalEvent::from_job(&finished_job(JobStatus::Succeeded)).unwrap();

        assert!(!deliver(&notifier, &event, &RetryPolicy::immediate(4)).await);
        assert_eq!(notifier.calls.lock().len(), 4);
    }

    #[tokio::test]
    async fn test_deliver_does_not_retry_client_errors() {
        let notifier = FlakyNotifier::new(10, 400);
        let event = TerminalEvent::from_job(&finished_job(JobStatus::Succeeded)).unwrap();

        assert!(!deliver(&notifier, &event, &RetryPolicy::immediate(4)).await);
        assert_eq!(notifier.calls.lock().len(), 1);
    }

    #[test]
    fn test_build_notifier_defaults_to_log() {
        let notifier = build_notifier(&NotifierConfig::default()).unwrap();
        assert_eq!(notifier.name(), "log");

        let config = NotifierConfig {
            webhook_url: Some("http://localhost:9/hook".to_string()),
            ..Default::default()
        };
        assert_eq!(build_notifier(&config).unwrap().name(), "webhook");
    }
}
