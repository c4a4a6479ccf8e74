//! Configuration management.
//!
//! Values come from an optional file (`SUTRA_CONFIG`, else `config/sutra.*`)
//! overlaid by `SUTRA__`-prefixed environment variables, e.g.
//! `SUTRA__ENGINE__MAX_CONCURRENCY=8` or `SUTRA__AUTH__API_KEYS=k1,k2`.

use crate::error::{Result, SutraError};
use crate::jobs::retry::{BackoffStrategy, RetryPolicy};
use crate::jobs::Step;
use crate::telemetry::{LoggingConfig, MetricsConfig, TelemetryConfig};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Worker pool, retry and timeout configuration
    #[serde(default)]
    pub engine: EngineConfig,

    /// Step executor configuration
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Job store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Submission authorization
    #[serde(default)]
    pub auth: AuthConfig,

    /// Terminal notification sink
    #[serde(default)]
    pub notifier: NotifierConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// HTTP server host
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Maximum accepted request body
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            body_limit_bytes: default_body_limit(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Number of jobs driven concurrently
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Attempts per step, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Admitted jobs allowed to wait for a worker
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Timeout applied to every step without an override
    #[serde(default = "default_step_timeout", with = "humantime_serde")]
    pub step_timeout: Duration,

    /// Per-step timeout overrides keyed by step name
    #[serde(default)]
    pub step_timeouts: HashMap<String, humantime_serde::Serde<Duration>>,

    /// First retry delay
    #[serde(default = "default_backoff_base", with = "humantime_serde")]
    pub backoff_base: Duration,

    /// Upper bound on any retry delay
    #[serde(default = "default_backoff_max", with = "humantime_serde")]
    pub backoff_max: Duration,

    /// How long a worker's lease on a job survives without renewal
    #[serde(default = "default_lease_ttl", with = "humantime_serde")]
    pub lease_ttl: Duration,

    /// Drives a job gets before repeated aborts fail it
    #[serde(default = "default_drive_attempts")]
    pub drive_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            max_attempts: default_max_attempts(),
            queue_capacity: default_queue_capacity(),
            step_timeout: default_step_timeout(),
            step_timeouts: HashMap::new(),
            backoff_base: default_backoff_base(),
            backoff_max: default_backoff_max(),
            lease_ttl: default_lease_ttl(),
            drive_attempts: default_drive_attempts(),
        }
    }
}

impl EngineConfig {
    /// Timeout for one attempt of `step`.
    pub fn step_timeout_for(&self, step: Step) -> Duration {
        self.step_timeouts
            .get(step.as_str())
            .map(|d| **d)
            .unwrap_or(self.step_timeout)
    }

    /// Retry policy shared by steps and notifications.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: BackoffStrategy::Exponential {
                initial_ms: self.backoff_base.as_millis() as u64,
                max_ms: self.backoff_max.as_millis() as u64,
                multiplier: 2.0,
            },
        }
    }

    /// Policy for driving a job again after a drive aborted.
    pub fn redrive_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.drive_attempts,
            ..self.retry_policy()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
    /// External program per step; steps without one are simulated
    #[serde(default)]
    pub commands: HashMap<String, CommandSpec>,

    /// Working directory for external programs
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Sleep per simulated step
    #[serde(default = "default_simulated_delay", with = "humantime_serde")]
    pub simulated_delay: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            commands: HashMap::new(),
            working_dir: None,
            simulated_delay: default_simulated_delay(),
        }
    }
}

/// An external program invocation.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Prefix for every Redis key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            key_prefix: default_key_prefix(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// Accepted `x-api-key` values. Empty disables authorization.
    #[serde(default)]
    pub api_keys: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotifierConfig {
    /// Webhook receiving terminal events. Unset logs them instead.
    #[serde(default)]
    pub webhook_url: Option<String>,

    /// Per-request timeout
    #[serde(default = "default_notifier_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Delivery attempts before an event is dropped
    #[serde(default = "default_notifier_attempts")]
    pub max_attempts: u32,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout: default_notifier_timeout(),
            max_attempts: default_notifier_attempts(),
        }
    }
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_body_limit() -> usize { 256 * 1024 }
fn default_max_concurrency() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}
fn default_max_attempts() -> u32 { 3 }
fn default_queue_capacity() -> usize { 1024 }
fn default_step_timeout() -> Duration { Duration::from_secs(600) }
fn default_backoff_base() -> Duration { Duration::from_secs(1) }
fn default_backoff_max() -> Duration { Duration::from_secs(30) }
fn default_lease_ttl() -> Duration { Duration::from_secs(30) }
fn default_drive_attempts() -> u32 { 3 }
fn default_simulated_delay() -> Duration { Duration::from_secs(1) }
fn default_redis_url() -> String { "redis://localhost:6379".to_string() }
fn default_key_prefix() -> String { "sutra".to_string() }
fn default_notifier_timeout() -> Duration { Duration::from_secs(10) }
fn default_notifier_attempts() -> u32 { 5 }

const ENV_PREFIX: &str = "SUTRA";
const DEFAULT_CONFIG_FILE: &str = "config/sutra";

impl Config {
    /// Load configuration from the environment and an optional config file.
    pub fn load() -> Result<Self> {
        match std::env::var("SUTRA_CONFIG") {
            Ok(path) => Self::from_file(&path),
            Err(_) => Self::build(
                config::Config::builder()
                    .add_source(config::File::with_name(DEFAULT_CONFIG_FILE).required(false)),
            ),
        }
    }

    /// Load from a specific file path, still overlaid by the environment.
    pub fn from_file(path: &str) -> Result<Self> {
        Self::build(config::Config::builder().add_source(config::File::with_name(path)))
    }

    fn build(builder: config::ConfigBuilder<config::builder::DefaultState>) -> Result<Self> {
        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("auth.api_keys")
                    .try_parsing(true),
            )
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.engine.max_concurrency == 0 {
            return Err(SutraError::invalid_config("engine.max_concurrency must be at least 1"));
        }
        if self.engine.max_attempts == 0 {
            return Err(SutraError::invalid_config("engine.max_attempts must be at least 1"));
        }
        if self.engine.queue_capacity == 0 {
            return Err(SutraError::invalid_config("engine.queue_capacity must be at least 1"));
        }
        if self.engine.backoff_base > self.engine.backoff_max {
            return Err(SutraError::invalid_config(
                "engine.backoff_base must not exceed engine.backoff_max",
            ));
        }
        if self.engine.lease_ttl < Duration::from_secs(1) {
            return Err(SutraError::invalid_config("engine.lease_ttl must be at least 1s"));
        }
        if self.engine.drive_attempts == 0 {
            return Err(SutraError::invalid_config("engine.drive_attempts must be at least 1"));
        }
        if self.notifier.max_attempts == 0 {
            return Err(SutraError::invalid_config("notifier.max_attempts must be at least 1"));
        }
        for name in self.engine.step_timeouts.keys() {
            Step::from_str(name).map_err(|_| {
                SutraError::invalid_config(format!("engine.step_timeouts has unknown step '{}'", name))
            })?;
        }
        for (name, spec) in &self.executor.commands {
            Step::from_str(name).map_err(|_| {
                SutraError::invalid_config(format!("executor.commands has unknown step '{}'", name))
            })?;
            if spec.program.trim().is_empty() {
                return Err(SutraError::invalid_config(format!(
                    "executor.commands.{}.program is empty",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Logging and metrics settings as one unit.
    pub fn telemetry(&self) -> TelemetryConfig {
        TelemetryConfig {
            logging: self.logging.clone(),
            metrics: self.metrics.clone(),
        }
    }

    /// Retry policy for terminal notification delivery.
    pub fn notification_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.notifier.max_attempts,
            ..self.engine.retry_policy()
        }
    }
}
