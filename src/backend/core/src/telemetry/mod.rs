//! Telemetry: structured logging and Prometheus metrics.
//!
//! ```rust,no_run
//! use sutra_core::telemetry::{init_telemetry, TelemetryConfig};
//!
//! let handle = init_telemetry(&TelemetryConfig::default()).expect("telemetry");
//! println!("{}", handle.metrics.render());
//! ```

pub mod logging;
pub mod metrics;

pub use self::logging::{init_logging, mask_secret, LogFormat, LoggingConfig};
pub use self::metrics::{init_metrics, JobMetrics, MetricsConfig, MetricsRegistry};

use serde::Deserialize;

/// Unified telemetry configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelemetryConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Service name reported in logs, metrics and the liveness endpoint.
pub const SERVICE_NAME: &str = "sutra-core";

/// Initialize logging and metrics. Call once at startup.
///
/// # Errors
///
/// Returns an error if either component fails to initialize.
pub fn init_telemetry(config: &TelemetryConfig) -> anyhow::Result<TelemetryHandle> {
    let metrics = init_metrics(&config.metrics, SERVICE_NAME)?;
    init_logging(&config.logging)?;

    Ok(TelemetryHandle { metrics })
}

/// Handle for the initialized telemetry stack.
#[derive(Debug, Clone)]
pub struct TelemetryHandle {
    pub metrics: MetricsRegistry,
}
