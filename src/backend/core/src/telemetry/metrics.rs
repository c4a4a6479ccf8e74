//! Prometheus metrics for admission, step execution and delivery.
//!
//! # Example
//!
//! ```rust,no_run
//! use sutra_core::telemetry::metrics::JobMetrics;
//!
//! JobMetrics::job_admitted();
//! JobMetrics::step_finished("transcode", "succeeded", 4.2);
//! ```

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Deserialize;
use std::collections::HashMap;

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics collection is enabled
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,

    /// Histogram buckets for step durations (in seconds)
    #[serde(default = "default_duration_buckets")]
    pub duration_buckets: Vec<f64>,

    /// Global labels to add to all metrics
    #[serde(default)]
    pub global_labels: HashMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            duration_buckets: default_duration_buckets(),
            global_labels: HashMap::new(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_duration_buckets() -> Vec<f64> {
    vec![0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0]
}

/// Handle onto the installed Prometheus recorder.
#[derive(Clone, Default)]
pub struct MetricsRegistry {
    prometheus_handle: Option<PrometheusHandle>,
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("prometheus_handle", &self.prometheus_handle.is_some())
            .finish()
    }
}

impl MetricsRegistry {
    /// A registry with no recorder behind it. Renders as an empty string.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Whether a recorder is installed.
    pub fn is_enabled(&self) -> bool {
        self.prometheus_handle.is_some()
    }

    /// Render all metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.prometheus_handle
            .as_ref()
            .map(|h| h.render())
            .unwrap_or_default()
    }
}

/// Initialize the metrics subsystem.
///
/// # Errors
///
/// Returns an error if the bucket list is empty or a recorder is already
/// installed.
pub fn init_metrics(config: &MetricsConfig, service_name: &str) -> anyhow::Result<MetricsRegistry> {
    if !config.enabled {
        return Ok(MetricsRegistry::disabled());
    }

    let mut builder = PrometheusBuilder::new();

    for (key, value) in &config.global_labels {
        builder = builder.add_global_label(key, value);
    }

    builder = builder.set_buckets(&config.duration_buckets)?;

    let handle = builder.install_recorder()?;

    register_metric_descriptions();

    tracing::info!(service_name = %service_name, "Metrics initialized");

    Ok(MetricsRegistry {
        prometheus_handle: Some(handle),
    })
}

fn register_metric_descriptions() {
    describe_counter!("sutra_errors_total", "Total number of errors by code");

    describe_counter!("sutra_jobs_admitted_total", "Jobs accepted by the gateway");
    describe_counter!(
        "sutra_jobs_rejected_total",
        "Submissions rejected by the gateway, by reason"
    );
    describe_counter!(
        "sutra_jobs_finished_total",
        "Jobs that reached a terminal status"
    );
    describe_counter!("sutra_jobs_recovered_total", "Jobs re-queued by the recovery sweep");

    describe_counter!("sutra_step_attempts_total", "Step attempts by step and outcome");
    describe_histogram!(
        "sutra_step_duration_seconds",
        "Wall-clock duration of one step attempt"
    );
    describe_counter!("sutra_step_retries_total", "Step attempts scheduled for retry");

    describe_gauge!("sutra_queue_depth", "Jobs admitted but not yet picked up");
    describe_gauge!("sutra_jobs_running", "Jobs currently owned by a worker");

    describe_counter!(
        "sutra_notifications_total",
        "Terminal notifications by delivery outcome"
    );
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Metrics
// ═══════════════════════════════════════════════════════════════════════════════

/// Job lifecycle metrics. Calls are no-ops when no recorder is installed.
pub struct JobMetrics;

impl JobMetrics {
    pub fn job_admitted() {
        counter!("sutra_jobs_admitted_total").increment(1);
    }

    pub fn job_rejected(reason: &'static str) {
        counter!("sutra_jobs_rejected_total", "reason" => reason).increment(1);
    }

    pub fn job_finished(status: &'static str) {
        counter!("sutra_jobs_finished_total", "status" => status).increment(1);
    }

    pub fn jobs_recovered(count: u64) {
        counter!("sutra_jobs_recovered_total").increment(count);
    }

    pub fn step_finished(step: &'static str, outcome: &'static str, duration_seconds: f64) {
        counter!("sutra_step_attempts_total", "step" => step, "outcome" => outcome).increment(1);
        histogram!("sutra_step_duration_seconds", "step" => step).record(duration_seconds);
    }

    pub fn step_retry(step: &'static str) {
        counter!("sutra_step_retries_total", "step" => step).increment(1);
    }

    pub fn queue_depth(depth: usize) {
        gauge!("sutra_queue_depth").set(depth as f64);
    }

    pub fn running(count: u64) {
        gauge!("sutra_jobs_running").set(count as f64);
    }

    pub fn notification(outcome: &'static str) {
        counter!("sutra_notifications_total", "outcome" => outcome).increment(1);
    }
}
