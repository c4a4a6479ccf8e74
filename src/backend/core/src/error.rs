//! Error handling for Sutra Core.
//!
//! This module provides:
//! - One error type (`SutraError`) with a machine-readable `ErrorCode`
//! - HTTP status code mapping for the submission API
//! - User-friendly messages vs detailed internal messages
//! - Error logging with tracing integration
//! - Metrics integration for error tracking
//!
//! Errors that live *inside* a job's pipeline (step failures, notification
//! delivery failures) are plain values defined next to the code that handles
//! them; `SutraError` is what crosses API and store boundaries.
//!
//! # Usage
//!
//! ```rust,ignore
//! use sutra_core::error::{Result, SutraError};
//!
//! fn find(id: &str) -> Result<()> {
//!     Err(SutraError::job_not_found(id))
//! }
//! ```

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for Sutra operations.
pub type Result<T> = std::result::Result<T, SutraError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes for API responses.
///
/// These codes are stable and can be used by clients for programmatic error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Admission Errors (1000-1099)
    Unauthorized,
    InvalidPayload,
    QueueFull,
    DuplicateJob,
    MalformedBody,

    // Job Errors (1100-1199)
    JobNotFound,
    InvalidStateTransition,
    LeaseLost,
    LeaseHeld,

    // Persistence Errors (2000-2099)
    PersistenceConflict,
    StoreError,
    StoreConnectionFailed,

    // Serialization Errors (2200-2299)
    SerializationError,
    DeserializationError,

    // External Service Errors (3000-3099)
    NotificationDeliveryFailed,
    ExternalServiceError,
    NetworkError,

    // Configuration Errors (5000-5099)
    ConfigurationError,
    InvalidConfiguration,

    // Internal Errors (9000-9099)
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::Unauthorized => 1000,
            Self::InvalidPayload => 1001,
            Self::QueueFull => 1002,
            Self::DuplicateJob => 1003,
            Self::MalformedBody => 1004,

            Self::JobNotFound => 1100,
            Self::InvalidStateTransition => 1101,
            Self::LeaseLost => 1102,
            Self::LeaseHeld => 1103,

            Self::PersistenceConflict => 2000,
            Self::StoreError => 2001,
            Self::StoreConnectionFailed => 2002,

            Self::SerializationError => 2200,
            Self::DeserializationError => 2201,

            Self::NotificationDeliveryFailed => 3000,
            Self::ExternalServiceError => 3001,
            Self::NetworkError => 3002,

            Self::ConfigurationError => 5000,
            Self::InvalidConfiguration => 5001,

            Self::InternalError => 9000,
        }
    }

    /// Get the HTTP status code for this error.
    pub const fn http_status(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::InvalidPayload => StatusCode::UNPROCESSABLE_ENTITY,
            Self::MalformedBody => StatusCode::BAD_REQUEST,
            Self::JobNotFound => StatusCode::NOT_FOUND,

            Self::DuplicateJob
            | Self::InvalidStateTransition
            | Self::LeaseHeld
            | Self::PersistenceConflict => StatusCode::CONFLICT,

            Self::QueueFull
            | Self::StoreConnectionFailed
            | Self::ExternalServiceError => StatusCode::SERVICE_UNAVAILABLE,

            Self::NetworkError | Self::NotificationDeliveryFailed => StatusCode::BAD_GATEWAY,

            Self::LeaseLost
            | Self::StoreError
            | Self::SerializationError
            | Self::DeserializationError
            | Self::ConfigurationError
            | Self::InvalidConfiguration
            | Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if this error is retryable.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::QueueFull
                | Self::PersistenceConflict
                | Self::StoreConnectionFailed
                | Self::NotificationDeliveryFailed
                | Self::ExternalServiceError
                | Self::NetworkError
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "admission",
            1100..=1199 => "job",
            2000..=2099 => "persistence",
            2200..=2299 => "serialization",
            3000..=3099 => "external_service",
            5000..=5099 => "configuration",
            9000..=9099 => "internal",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Submitter errors (bad input, missing key)
    Low,
    /// Operational pressure (full queue, CAS races, flaky sinks)
    Medium,
    /// System errors (store failures, serialization bugs)
    High,
    /// Errors requiring immediate attention
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::Unauthorized
            | ErrorCode::InvalidPayload
            | ErrorCode::MalformedBody
            | ErrorCode::DuplicateJob
            | ErrorCode::JobNotFound
            | ErrorCode::InvalidStateTransition => Self::Low,

            ErrorCode::QueueFull
            | ErrorCode::PersistenceConflict
            | ErrorCode::LeaseLost
            | ErrorCode::LeaseHeld
            | ErrorCode::NotificationDeliveryFailed => Self::Medium,

            ErrorCode::StoreError
            | ErrorCode::SerializationError
            | ErrorCode::DeserializationError
            | ErrorCode::ExternalServiceError
            | ErrorCode::NetworkError
            | ErrorCode::ConfigurationError
            | ErrorCode::InvalidConfiguration => Self::High,

            ErrorCode::StoreConnectionFailed | ErrorCode::InternalError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Additional structured details about an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Additional context key-value pairs
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,

    /// Related entity ID (job id, step name)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    /// Related entity type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,

    /// Retry information
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl ErrorDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after_secs = Some(seconds);
        self
    }

    fn is_empty(&self) -> bool {
        self.context.is_empty() && self.entity_id.is_none() && self.retry_after_secs.is_none()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for Sutra Core.
#[derive(Error, Debug)]
pub struct SutraError {
    /// Machine-readable error code
    code: ErrorCode,

    /// User-friendly error message (safe to expose to clients)
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// Additional structured details
    details: ErrorDetails,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for SutraError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl SutraError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and user message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            details: ErrorDetails::default(),
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both user and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error (500).
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    /// The request was not authorized.
    pub fn unauthorized(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    /// The submitted body is not a valid render request.
    pub fn invalid_payload(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::InvalidPayload, message)
    }

    /// The request body is not parseable JSON.
    pub fn malformed_body(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::MalformedBody, "Request body is not valid JSON", message)
    }

    /// The pending queue has no free slot.
    pub fn queue_full(capacity: usize) -> Self {
        Self::new(
            ErrorCode::QueueFull,
            "The render queue is full, retry later",
        )
        .with_details(
            ErrorDetails::new()
                .with_context("capacity", capacity)
                .with_retry_after(5),
        )
    }

    /// A job with this id was already admitted.
    pub fn duplicate_job(job_id: impl Into<String>) -> Self {
        let id = job_id.into();
        Self::new(ErrorCode::DuplicateJob, format!("Job already exists: {}", id))
            .with_details(ErrorDetails::new().with_entity("job", id))
    }

    /// No job with this id exists.
    pub fn job_not_found(job_id: impl Into<String>) -> Self {
        let id = job_id.into();
        Self::new(ErrorCode::JobNotFound, format!("Job not found: {}", id))
            .with_details(ErrorDetails::new().with_entity("job", id))
    }

    /// The stored version moved under a compare-and-swap.
    pub fn conflict(job_id: impl Into<String>, expected: u64, actual: u64) -> Self {
        let id = job_id.into();
        Self::new(
            ErrorCode::PersistenceConflict,
            format!("Concurrent update on job {}", id),
        )
        .with_details(
            ErrorDetails::new()
                .with_entity("job", id)
                .with_context("expected_version", expected)
                .with_context("actual_version", actual),
        )
    }

    /// A terminal job was asked to change.
    pub fn invalid_transition(job_id: impl Into<String>, from: impl fmt::Display) -> Self {
        let id = job_id.into();
        Self::new(
            ErrorCode::InvalidStateTransition,
            format!("Job {} is {} and can no longer change", id, from),
        )
        .with_details(ErrorDetails::new().with_entity("job", id))
    }

    /// Another worker took over the job.
    pub fn lease_lost(job_id: impl Into<String>) -> Self {
        let id = job_id.into();
        Self::new(ErrorCode::LeaseLost, format!("Lost ownership of job {}", id))
            .with_details(ErrorDetails::new().with_entity("job", id))
    }

    /// A live worker lease still holds the job.
    pub fn lease_held(job_id: impl Into<String>, retry_after: std::time::Duration) -> Self {
        let id = job_id.into();
        Self::new(ErrorCode::LeaseHeld, format!("Job {} is being driven by another worker", id))
            .with_details(
                ErrorDetails::new()
                    .with_entity("job", id)
                    .with_context("retry_after_ms", retry_after.as_millis() as u64)
                    .with_retry_after(retry_after.as_secs().max(1)),
            )
    }

    /// Configuration failed validation.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::InvalidConfiguration,
            "Configuration is invalid",
            message,
        )
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Add error details.
    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    /// Add context to details.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.context.insert(key.into(), v);
        }
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Get the user-friendly message.
    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    /// Get the internal message (if any).
    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    /// Get the error details.
    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    /// Get the HTTP status code.
    pub fn http_status(&self) -> StatusCode {
        self.code.http_status()
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    /// Get the error severity.
    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();
        let status = self.http_status().as_u16();

        match self.severity() {
            ErrorSeverity::Critical | ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    http_status = status,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    source = ?self.source,
                    "Request failed"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    http_status = status,
                    user_message = %self.user_message,
                    "Request rejected"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    http_status = status,
                    user_message = %self.user_message,
                    "Low severity error"
                );
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Metrics
    // ─────────────────────────────────────────────────────────────────────────

    fn record_metrics(&self) {
        counter!(
            "sutra_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
            "retryable" => self.is_retryable().to_string(),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// API Response
// ═══════════════════════════════════════════════════════════════════════════════

/// Error response for API clients.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Whether the request was successful (always false for errors)
    pub success: bool,

    /// Error information
    pub error: ErrorInfo,
}

/// Detailed error information for API responses.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Machine-readable error code
    pub code: ErrorCode,

    /// Numeric error code
    pub numeric_code: u32,

    /// User-friendly error message
    pub message: String,

    /// Additional details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<ErrorDetails>,

    /// Timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl From<&SutraError> for ErrorResponse {
    fn from(error: &SutraError) -> Self {
        Self {
            success: false,
            error: ErrorInfo {
                code: error.code,
                numeric_code: error.code.numeric_code(),
                message: error.user_message.to_string(),
                details: if error.details.is_empty() {
                    None
                } else {
                    Some(error.details.clone())
                },
                timestamp: chrono::Utc::now(),
            },
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Axum Integration
// ═══════════════════════════════════════════════════════════════════════════════

impl IntoResponse for SutraError {
    fn into_response(self) -> Response {
        self.log();

        let status = self.http_status();
        let body = ErrorResponse::from(&self);
        let mut response = (status, Json(body)).into_response();

        if let Some(secs) = self.details.retry_after_secs {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }

        response
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

impl From<redis::RedisError> for SutraError {
    fn from(error: redis::RedisError) -> Self {
        let (code, user_msg) = if error.is_connection_refusal() || error.is_connection_dropped() {
            (ErrorCode::StoreConnectionFailed, "Unable to connect to the job store")
        } else if error.is_timeout() {
            (ErrorCode::StoreError, "Job store operation timed out")
        } else {
            (ErrorCode::StoreError, "A job store error occurred")
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<serde_json::Error> for SutraError {
    fn from(error: serde_json::Error) -> Self {
        let code = if error.is_syntax() || error.is_data() || error.is_eof() {
            ErrorCode::DeserializationError
        } else {
            ErrorCode::SerializationError
        };

        Self::with_internal(code, "Failed to process JSON data", error.to_string())
            .with_source(error)
    }
}

impl From<reqwest::Error> for SutraError {
    fn from(error: reqwest::Error) -> Self {
        let (code, user_msg) = if error.is_timeout() || error.is_connect() {
            (ErrorCode::NetworkError, "Failed to reach external service")
        } else {
            (ErrorCode::ExternalServiceError, "External service returned an error")
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<std::io::Error> for SutraError {
    fn from(error: std::io::Error) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An I/O error occurred", error.to_string())
            .with_source(error)
    }
}

impl From<config::ConfigError> for SutraError {
    fn from(error: config::ConfigError) -> Self {
        let (code, user_msg) = match &error {
            config::ConfigError::PathParse(_) | config::ConfigError::FileParse { .. } => (
                ErrorCode::InvalidConfiguration,
                "Configuration file is invalid",
            ),
            _ => (ErrorCode::ConfigurationError, "Configuration error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admission_status_codes() {
        assert_eq!(ErrorCode::Unauthorized.http_status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ErrorCode::QueueFull.http_status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            ErrorCode::InvalidPayload.http_status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(ErrorCode::DuplicateJob.http_status(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_retryable_codes() {
        assert!(ErrorCode::PersistenceConflict.is_retryable());
        assert!(ErrorCode::QueueFull.is_retryable());
        assert!(!ErrorCode::Unauthorized.is_retryable());
        assert!(!ErrorCode::InvalidPayload.is_retryable());
    }

    #[test]
    fn test_categories() {
        assert_eq!(ErrorCode::QueueFull.category(), "admission");
        assert_eq!(ErrorCode::PersistenceConflict.category(), "persistence");
        assert_eq!(ErrorCode::InternalError.category(), "internal");
    }

    #[test]
    fn test_conflict_details() {
        let err = SutraError::conflict("abc123", 3, 4);
        assert_eq!(err.code(), ErrorCode::PersistenceConflict);
        assert_eq!(err.details().entity_id.as_deref(), Some("abc123"));
        assert_eq!(err.details().context["expected_version"], 3);
    }

    #[test]
    fn test_queue_full_sets_retry_after() {
        let response = SutraError::queue_full(8).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[header::RETRY_AFTER], "5");
    }

    #[test]
    fn test_error_response_omits_empty_details() {
        let err = SutraError::unauthorized("missing api key");
        let body = ErrorResponse::from(&err);
        assert!(!body.success);
        assert!(body.error.details.is_none());
        assert_eq!(body.error.numeric_code, 1000);
    }

    #[test]
    fn test_lease_held_details() {
        let err = SutraError::lease_held("abc123", std::time::Duration::from_millis(1500));
        assert_eq!(err.http_status(), StatusCode::CONFLICT);
        assert_eq!(err.details().retry_after_secs, Some(1));
        assert_eq!(err.details().context["retry_after_ms"], 1500);
        assert_eq!(err.severity(), ErrorSeverity::Medium);
    }

    #[test]
    fn test_display_includes_internal() {
        let err = SutraError::internal("boom");
        assert_eq!(err.to_string(), "[InternalError] An internal error occurred (internal: boom)");
    }
}
