//! Render job commands.
//!
//! Provides submit, status, and cancel operations for render jobs.

use anyhow::{Context, Result};
use clap::Subcommand;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tabled::Tabled;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum JobCommands {
    /// Submit a render job
    Submit {
        /// Job id (generated by the server when omitted)
        #[arg(long)]
        id: Option<String>,

        /// Path to a JSON or YAML payload file
        #[arg(short, long)]
        payload: Option<String>,

        /// Payload field as key=value; values parse as JSON when possible
        #[arg(short, long = "set", value_name = "KEY=VALUE")]
        fields: Vec<String>,

        /// Wait until the job finishes
        #[arg(short, long)]
        wait: bool,

        /// Poll interval while waiting, in milliseconds
        #[arg(long, default_value = "1000")]
        interval_ms: u64,
    },

    /// Show a job's status and step history
    Status {
        /// Job ID
        job_id: String,
    },

    /// Request cancellation of a job
    Cancel {
        /// Job ID
        job_id: String,
    },
}

// ── API types ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, Serialize)]
struct Admission {
    status: String,
    job_id: String,
}

#[derive(Debug, Deserialize, Serialize)]
struct JobView {
    id: String,
    status: serde_json::Value,
    attempt: u32,
    cancel_requested: bool,
    #[serde(default)]
    history: Vec<HistoryEntry>,
    submitted_at: String,
    updated_at: String,
}

impl JobView {
    fn state(&self) -> &str {
        self.status.get("state").and_then(|v| v.as_str()).unwrap_or("unknown")
    }

    fn is_terminal(&self) -> bool {
        matches!(self.state(), "succeeded" | "failed")
    }

    fn summary(&self) -> String {
        match self.state() {
            "running" => format!(
                "running ({})",
                self.status.get("step").and_then(|v| v.as_str()).unwrap_or("?")
            ),
            "failed" => {
                let reason = &self.status["reason"];
                let kind = reason.get("reason").and_then(|v| v.as_str()).unwrap_or("?");
                match reason.get("message").and_then(|v| v.as_str()) {
                    Some(message) => format!("failed: {} ({})", kind, message),
                    None => format!("failed: {}", kind),
                }
            }
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
struct HistoryEntry {
    step: String,
    outcome: serde_json::Value,
    attempt: u32,
    at: String,
}

#[derive(Tabled)]
struct HistoryRow {
    #[tabled(rename = "Step")]
    step: String,
    #[tabled(rename = "Attempt")]
    attempt: u32,
    #[tabled(rename = "Result")]
    result: String,
    #[tabled(rename = "Detail")]
    detail: String,
    #[tabled(rename = "At")]
    at: String,
}

impl From<&HistoryEntry> for HistoryRow {
    fn from(entry: &HistoryEntry) -> Self {
        let field = |name: &str| {
            entry
                .outcome
                .get(name)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };
        let detail = match (field("kind"), field("message")) {
            (kind, _) if kind.is_empty() => String::new(),
            (kind, message) => format!("{}: {}", kind, message),
        };
        Self {
            step: entry.step.clone(),
            attempt: entry.attempt,
            result: field("result"),
            detail,
            at: entry.at.clone(),
        }
    }
}

// ── Execution ───────────────────────────────────────────────────────────────

pub async fn execute(cmd: JobCommands, client: &ApiClient, format: OutputFormat) -> Result<()> {
    match cmd {
        JobCommands::Submit {
            id,
            payload,
            fields,
            wait,
            interval_ms,
        } => {
            let body = build_body(id, payload.as_deref(), &fields)?;
            let admission: Admission = client.post_json("/create-video", &body).await?;

            match format {
                OutputFormat::Table => {
                    output::print_success("Render job accepted");
                    output::print_detail("Job ID", &admission.job_id);
                    output::print_detail("Status", &admission.status);
                }
                _ => output::print_item(&admission, format)?,
            }

            if wait {
                let job = wait_for(client, &admission.job_id, Duration::from_millis(interval_ms)).await?;
                print_job(&job, format)?;
            }
        }

        JobCommands::Status { job_id } => {
            let job: JobView = client.get(&format!("/jobs/{}", job_id)).await?;
            print_job(&job, format)?;
        }

        JobCommands::Cancel { job_id } => {
            let job: JobView = client.post_empty(&format!("/jobs/{}/cancel", job_id)).await?;
            match format {
                OutputFormat::Table => {
                    if job.is_terminal() {
                        output::print_info(&format!("Job {} already finished: {}", job.id, job.summary()));
                    } else {
                        output::print_success(&format!(
                            "Cancellation requested for {}; it stops at the next step boundary",
                            job.id
                        ));
                    }
                }
                _ => output::print_item(&job, format)?,
            }
        }
    }

    Ok(())
}

/// Merge the payload file, `--set` fields and the job id into one request body.
fn build_body(
    id: Option<String>,
    payload: Option<&str>,
    fields: &[String],
) -> Result<serde_json::Map<String, serde_json::Value>> {
    let mut body = match payload {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read payload file: {}", path))?;
            let value: serde_json::Value = if path.ends_with(".yaml") || path.ends_with(".yml") {
                serde_yaml::from_str(&content).context("Failed to parse payload YAML")?
            } else {
                serde_json::from_str(&content).context("Failed to parse payload JSON")?
            };
            match value {
                serde_json::Value::Object(map) => map,
                _ => anyhow::bail!("Payload file must contain an object"),
            }
        }
        None => serde_json::Map::new(),
    };

    for field in fields {
        let (key, raw) = field
            .split_once('=')
            .with_context(|| format!("Expected KEY=VALUE, got '{}'", field))?;
        let value = serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
        body.insert(key.to_string(), value);
    }

    if let Some(id) = id {
        body.insert("sutra_id".to_string(), serde_json::Value::String(id));
    }
    Ok(body)
}

async fn wait_for(client: &ApiClient, job_id: &str, interval: Duration) -> Result<JobView> {
    let mut last_state = String::new();
    loop {
        let job: JobView = client.get(&format!("/jobs/{}", job_id)).await?;
        let summary = job.summary();
        if summary != last_state {
            output::print_info(&format!("{}: {}", job_id, summary));
            last_state = summary;
        }
        if job.is_terminal() {
            return Ok(job);
        }
        tokio::time::sleep(interval).await;
    }
}

fn print_job(job: &JobView, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Table => {
            output::print_header(&format!("Job {}", job.id));
            output::print_detail("Status", &output::state_label(job.state()));
            output::print_detail("Summary", &job.summary());
            output::print_detail("Attempt", &job.attempt.to_string());
            if job.cancel_requested {
                output::print_detail("Cancel", "requested");
            }
            output::print_detail("Submitted", &job.submitted_at);
            output::print_detail("Updated", &job.updated_at);
            println!();
            let rows: Vec<HistoryRow> = job.history.iter().map(HistoryRow::from).collect();
            output::print_table(&rows);
            Ok(())
        }
        _ => output::print_item(job, format),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_build_body_merges_fields() {
        let fields = vec!["resolution=\"1080p\"".to_string(), "fps=30".to_string(), "title=demo".to_string()];
        let body = build_body(Some("abc123".to_string()), None, &fields).unwrap();

        assert_eq!(body["sutra_id"], json!("abc123"));
        assert_eq!(body["resolution"], json!("1080p"));
        assert_eq!(body["fps"], json!(30));
        assert_eq!(body["title"], json!("demo"));
    }

    #[test]
    fn test_build_body_rejects_bad_field() {
        assert!(build_body(None, None, &["novalue".to_string()]).is_err());
    }

    #[test]
    fn test_job_view_summary() {
        let view: JobView = serde_json::from_value(json!({
            "id": "abc123",
            "status": {"state": "failed", "reason": {"reason": "retries_exhausted", "step": "transcode", "attempts": 3, "message": "ffmpeg exited 1"}},
            "attempt": 3,
            "cancel_requested": false,
            "history": [],
            "submitted_at": "2024-01-01T00:00:00Z",
            "updated_at": "2024-01-01T00:00:05Z"
        }))
        .unwrap();

        assert!(view.is_terminal());
        assert_eq!(view.summary(), "failed: retries_exhausted (ffmpeg exited 1)");
    }

    #[test]
    fn test_history_row_detail() {
        let entry = HistoryEntry {
            step: "upload".to_string(),
            outcome: json!({"result": "failed", "kind": "timeout", "message": "step timed out", "retryable": true}),
            attempt: 2,
            at: "2024-01-01T00:00:00Z".to_string(),
        };
        let row = HistoryRow::from(&entry);
        assert_eq!(row.result, "failed");
        assert_eq!(row.detail, "timeout: step timed out");
    }
}
