//! Step execution: run one pipeline step against a job's payload.
//!
//! An executor only manages timeouts, exit status and error classification.
//! The media work itself happens in external programs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::job::{JobId, RenderPayload, Step};
use crate::config::{CommandSpec, ExecutorConfig};
use crate::error::Result;

/// Exit code asking the engine to fail the job without retrying (`EX_DATAERR`).
pub const EXIT_INVALID_INPUT: i32 = 65;

/// Exit code asking the engine to retry the step (`EX_TEMPFAIL`).
pub const EXIT_TEMPORARY_FAILURE: i32 = 75;

/// Bytes of stderr kept in a failure message.
const STDERR_TAIL_BYTES: usize = 2048;

// ═══════════════════════════════════════════════════════════════════════════════
// Step Errors
// ═══════════════════════════════════════════════════════════════════════════════

/// Classification of a failed step attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepErrorKind {
    /// The attempt exceeded its timeout
    Timeout,
    /// The external tool ran and reported failure
    ExternalToolFailure,
    /// A transient I/O problem (network, disk, temporary tool failure)
    TransientIo,
    /// The payload can never succeed
    InvalidInput,
}

impl StepErrorKind {
    /// Whether an error of this kind is retried unless stated otherwise.
    pub const fn default_retryable(self) -> bool {
        !matches!(self, Self::InvalidInput)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::ExternalToolFailure => "external_tool_failure",
            Self::TransientIo => "transient_io",
            Self::InvalidInput => "invalid_input",
        }
    }
}

impl fmt::Display for StepErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by a step attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct StepError {
    pub kind: StepErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl StepError {
    /// Create an error with the kind's default retryability.
    pub fn new(kind: StepErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: kind.default_retryable(),
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(StepErrorKind::Timeout, format!("step timed out after {:?}", after))
    }

    pub fn tool_failure(message: impl Into<String>) -> Self {
        Self::new(StepErrorKind::ExternalToolFailure, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(StepErrorKind::TransientIo, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(StepErrorKind::InvalidInput, message)
    }

    /// Override retryability.
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Executor Contract
// ═══════════════════════════════════════════════════════════════════════════════

/// Everything an executor gets to know about the attempt.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub job_id: JobId,
    pub payload: RenderPayload,
    /// 1-based attempt number within the step
    pub attempt: u32,
    pub timeout: Duration,
}

/// Successful step result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepOutput {
    /// Tool output or a short progress note
    pub output: String,
}

impl StepOutput {
    pub fn new(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
        }
    }
}

/// Executes exactly one named step.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn run(&self, step: Step, ctx: &StepContext) -> std::result::Result<StepOutput, StepError>;
}

/// Run a step bounded by `ctx.timeout`.
///
/// The step future is dropped on elapse, which kills any child process spawned
/// with `kill_on_drop`.
pub async fn execute_with_timeout(
    executor: &dyn StepExecutor,
    step: Step,
    ctx: &StepContext,
) -> std::result::Result<StepOutput, StepError> {
    match tokio::time::timeout(ctx.timeout, executor.run(step, ctx)).await {
        Ok(result) => result,
        Err(_) => {
            warn!(
                job_id = %ctx.job_id,
                step = %step,
                attempt = ctx.attempt,
                timeout_ms = ctx.timeout.as_millis() as u64,
                "Step timed out"
            );
            Err(StepError::timeout(ctx.timeout))
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Simulated Executor
// ═══════════════════════════════════════════════════════════════════════════════

/// Stand-in executor that only waits and logs progress.
#[derive(Debug, Clone)]
pub struct SimulatedStepExecutor {
    delay: Duration,
}

impl SimulatedStepExecutor {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    fn progress_message(step: Step) -> &'static str {
        match step {
            Step::Download => "Downloading assets...",
            Step::Transcode => "Running ffmpeg...",
            Step::Upload => "Uploading result...",
            Step::Finalize => "Updating database...",
        }
    }
}

impl Default for SimulatedStepExecutor {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

#[async_trait]
impl StepExecutor for SimulatedStepExecutor {
    async fn run(&self, step: Step, ctx: &StepContext) -> std::result::Result<StepOutput, StepError> {
        let message = Self::progress_message(step);
        info!(job_id = %ctx.job_id, step = %step, attempt = ctx.attempt, "{}", message);
        tokio::time::sleep(self.delay).await;
        Ok(StepOutput::new(message))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Command Executor
// ═══════════════════════════════════════════════════════════════════════════════

/// Runs a configured external program per step.
///
/// The program receives the payload as JSON on stdin and in `SUTRA_PAYLOAD`,
/// plus `SUTRA_JOB_ID`, `SUTRA_STEP` and `SUTRA_ATTEMPT`. Exit code 0 is
/// success, 65 means invalid input and 75 a temporary failure. Steps without
/// a program go to the fallback executor.
pub struct CommandStepExecutor {
    commands: HashMap<Step, CommandSpec>,
    working_dir: Option<PathBuf>,
    fallback: Arc<dyn StepExecutor>,
}

impl CommandStepExecutor {
    pub fn new(commands: HashMap<Step, CommandSpec>, fallback: Arc<dyn StepExecutor>) -> Self {
        Self {
            commands,
            working_dir: None,
            fallback,
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Build from configuration; unconfigured steps are simulated.
    pub fn from_config(config: &ExecutorConfig) -> Result<Self> {
        let mut commands = HashMap::new();
        for (name, spec) in &config.commands {
            commands.insert(name.parse::<Step>()?, spec.clone());
        }

        let fallback = Arc::new(SimulatedStepExecutor::new(config.simulated_delay));
        let executor = Self::new(commands, fallback);
        Ok(match &config.working_dir {
            Some(dir) => executor.with_working_dir(dir),
            None => executor,
        })
    }

    /// Whether any step runs an external program.
    pub fn has_commands(&self) -> bool {
        !self.commands.is_empty()
    }

    async fn run_command(
        &self,
        spec: &CommandSpec,
        step: Step,
        ctx: &StepContext,
    ) -> std::result::Result<StepOutput, StepError> {
        let payload = ctx.payload.to_json();

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .env("SUTRA_JOB_ID", ctx.job_id.as_str())
            .env("SUTRA_STEP", step.as_str())
            .env("SUTRA_ATTEMPT", ctx.attempt.to_string())
            .env("SUTRA_PAYLOAD", &payload)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        debug!(
            job_id = %ctx.job_id,
            step = %step,
            program = %spec.program,
            args = ?spec.args,
            "Spawning step command"
        );

        let mut child = command.spawn().map_err(|e| classify_spawn_error(&spec.program, e))?;

        if let Some(mut stdin) = child.stdin.take() {
            // Programs that ignore stdin close the pipe early.
            if let Err(e) = stdin.write_all(payload.as_bytes()).await {
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(StepError::transient(format!("failed to write payload: {}", e)));
                }
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| StepError::transient(format!("failed to wait for {}: {}", spec.program, e)))?;

        if output.status.success() {
            return Ok(StepOutput::new(String::from_utf8_lossy(&output.stdout).trim().to_string()));
        }

        let stderr = stderr_tail(&output.stderr);
        Err(classify_exit(&spec.program, output.status.code(), &stderr))
    }
}

#[async_trait]
impl StepExecutor for CommandStepExecutor {
    async fn run(&self, step: Step, ctx: &StepContext) -> std::result::Result<StepOutput, StepError> {
        match self.commands.get(&step) {
            Some(spec) => self.run_command(spec, step, ctx).await,
            None => self.fallback.run(step, ctx).await,
        }
    }
}

/// Map a process exit to a step error.
pub fn classify_exit(program: &str, code: Option<i32>, stderr: &str) -> StepError {
    let detail = if stderr.is_empty() {
        String::new()
    } else {
        format!(": {}", stderr)
    };

    match code {
        Some(EXIT_INVALID_INPUT) => {
            StepError::invalid_input(format!("{} rejected the payload{}", program, detail))
        }
        Some(EXIT_TEMPORARY_FAILURE) => {
            StepError::transient(format!("{} reported a temporary failure{}", program, detail))
        }
        Some(code) => StepError::tool_failure(format!("{} exited with {}{}", program, code, detail)),
        None => StepError::tool_failure(format!("{} was terminated by a signal{}", program, detail)),
    }
}

fn classify_spawn_error(program: &str, error: std::io::Error) -> StepError {
    match error.kind() {
        std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
            StepError::tool_failure(format!("cannot run {}: {}", program, error)).with_retryable(false)
        }
        _ => StepError::transient(format!("failed to spawn {}: {}", program, error)),
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    if text.len() <= STDERR_TAIL_BYTES {
        return text.to_string();
    }
    let mut start = text.len() - STDERR_TAIL_BYTES;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &text[start..])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(timeout: Duration) -> StepContext {
        let mut fields = serde_json::Map::new();
        fields.insert("template".into(), serde_json::json!("intro"));
        StepContext {
            job_id: JobId::parse("abc123").unwrap(),
            payload: fields.into(),
            attempt: 1,
            timeout,
        }
    }

    fn sh(script: &str) -> CommandSpec {
        CommandSpec {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
        }
    }

    fn executor_for(step: Step, spec: CommandSpec) -> CommandStepExecutor {
        let mut commands = HashMap::new();
        commands.insert(step, spec);
        CommandStepExecutor::new(commands, Arc::new(SimulatedStepExecutor::new(Duration::ZERO)))
    }

    #[test]
    fn test_default_retryability() {
        assert!(StepErrorKind::Timeout.default_retryable());
        assert!(StepErrorKind::TransientIo.default_retryable());
        assert!(StepErrorKind::ExternalToolFailure.default_retryable());
        assert!(!StepErrorKind::InvalidInput.default_retryable());
    }

    #[test]
    fn test_classify_exit() {
        assert_eq!(classify_exit("ffmpeg", Some(65), "").kind, StepErrorKind::InvalidInput);
        assert!(!classify_exit("ffmpeg", Some(65), "").retryable);
        assert_eq!(classify_exit("ffmpeg", Some(75), "").kind, StepErrorKind::TransientIo);
        assert_eq!(
            classify_exit("ffmpeg", Some(1), "boom").kind,
            StepErrorKind::ExternalToolFailure
        );
        assert!(classify_exit("ffmpeg", None, "").message.contains("signal"));
    }

    #[test]
    fn test_stderr_tail_truncates() {
        let long = "x".repeat(STDERR_TAIL_BYTES * 2);
        let tail = stderr_tail(long.as_bytes());
        assert!(tail.starts_with("..."));
        assert_eq!(tail.len(), STDERR_TAIL_BYTES + 3);
    }

    #[tokio::test]
    async fn test_simulated_executor_succeeds() {
        let executor = SimulatedStepExecutor::new(Duration::ZERO);
        let output = executor.run(Step::Transcode, &ctx(Duration::from_secs(1))).await.unwrap();
        assert_eq!(output.output, "Running ffmpeg...");
    }

    #[tokio::test]
    async fn test_timeout_is_classified() {
        let executor = SimulatedStepExecutor::new(Duration::from_secs(5));
        let err = execute_with_timeout(&executor, Step::Download, &ctx(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert_eq!(err.kind, StepErrorKind::Timeout);
        assert!(err.retryable);
    }

    #[tokio::test]
    async fn test_command_receives_job_environment() {
        let executor = executor_for(
            Step::Upload,
            sh(r#"cat >/dev/null; printf '%s/%s/%s' "$SUTRA_JOB_ID" "$SUTRA_STEP" "$SUTRA_ATTEMPT""#),
        );
        let output = executor.run(Step::Upload, &ctx(Duration::from_secs(5))).await.unwrap();
        assert_eq!(output.output, "abc123/upload/1");
    }

    #[tokio::test]
    async fn test_command_reads_payload_from_stdin() {
        let executor = executor_for(Step::Download, sh("cat"));
        let output = executor.run(Step::Download, &ctx(Duration::from_secs(5))).await.unwrap();
        let echoed: serde_json::Value = serde_json::from_str(&output.output).unwrap();
        assert_eq!(echoed["template"], "intro");
    }

    #[tokio::test]
    async fn test_command_exit_codes() {
        let invalid = executor_for(Step::Transcode, sh("echo 'bad codec' >&2; exit 65"));
        let err = invalid.run(Step::Transcode, &ctx(Duration::from_secs(5))).await.unwrap_err();
        assert_eq!(err.kind, StepErrorKind::InvalidInput);
        assert!(!err.retryable);
        assert!(err.message.contains("bad codec"));

        let transient = executor_for(Step::Transcode, sh("exit 75"));
        let err = transient.run(Step::Transcode, &ctx(Duration::from_secs(5))).await.unwrap_err();
        assert_eq!(err.kind, StepErrorKind::TransientIo);
        assert!(err.retryable);

        let failed = executor_for(Step::Transcode, sh("exit 3"));
        let err = failed.run(Step::Transcode, &ctx(Duration::from_secs(5))).await.unwrap_err();
        assert_eq!(err.kind, StepErrorKind::ExternalToolFailure);
    }

    #[tokio::test]
    async fn test_missing_program_is_not_retryable() {
        let executor = executor_for(
            Step::Finalize,
            CommandSpec {
                program: "/nonexistent/sutra-finalize".to_string(),
                args: vec![],
            },
        );
        let err = executor.run(Step::Finalize, &ctx(Duration::from_secs(5))).await.unwrap_err();
        assert_eq!(err.kind, StepErrorKind::ExternalToolFailure);
        assert!(!err.retryable);
    }

    #[tokio::test]
    async fn test_unconfigured_step_uses_fallback() {
        let executor = executor_for(Step::Transcode, sh("exit 1"));
        let output = executor.run(Step::Download, &ctx(Duration::from_secs(5))).await.unwrap();
        assert_eq!(output.output, "Downloading assets...");
    }

    #[tokio::test]
    async fn test_from_config_runs_in_working_dir() {
        let dir = std::env::temp_dir();
        let mut config = ExecutorConfig {
            working_dir: Some(dir.clone()),
            ..Default::default()
        };
        config.commands.insert("upload".to_string(), sh("cat >/dev/null; pwd"));

        let executor = CommandStepExecutor::from_config(&config).unwrap();
        assert!(executor.has_commands());
        let output = executor.run(Step::Upload, &ctx(Duration::from_secs(5))).await.unwrap();
        assert_eq!(
            std::fs::canonicalize(&output.output).unwrap(),
            std::fs::canonicalize(&dir).unwrap()
        );
    }

    #[test]
    fn test_from_config_rejects_unknown_step() {
        let mut config = ExecutorConfig::default();
        config.commands.insert(
            "render".to_string(),
            CommandSpec {
                program: "ffmpeg".to_string(),
                args: vec![],
            },
        );
        assert!(CommandStepExecutor::from_config(&config).is_err());
    }
}
