//! Error types for media-dl
//!
//! This module provides the error taxonomy for the job pipeline:
//! - Admission errors (duplicate request, user over limit, shutdown)
//! - Terminal job errors (extraction exhausted, timeout, cancellation, encoding)
//! - Ambient errors (configuration, database, I/O, external tools)
//!
//! Every terminal failure a job can reach is a distinct variant so the delivery
//! front end can tell "took too long" apart from "could not be downloaded".

use crate::types::{JobId, UserId};
use std::time::Duration;
use thiserror::Error;

/// Result type alias for media-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for media-dl
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "jobs.job_timeout")
        key: Option<String>,
    },

    /// The same (user, request) pair is already in flight or was just submitted
    #[error("duplicate request: job {job_id} is already being processed")]
    DuplicateRequest {
        /// The job that the submission collided with
        job_id: JobId,
    },

    /// The user already holds their maximum number of concurrent jobs
    #[error("user {user_id} already has {active} of {limit} concurrent jobs")]
    UserOverLimit {
        /// The requesting user
        user_id: UserId,
        /// Jobs the user currently has in flight
        active: usize,
        /// Configured per-user ceiling
        limit: usize,
    },

    /// Every extraction strategy in the cascade was exhausted
    #[error("extraction failed after {attempts} attempt(s): {last_error}")]
    ExtractionFailed {
        /// Number of strategies attempted
        attempts: usize,
        /// Diagnostic of the last failed attempt
        last_error: String,
    },

    /// The job exceeded its watchdog timeout
    #[error("job timed out after {}s", after.as_secs())]
    TimedOut {
        /// The timeout that elapsed
        after: Duration,
    },

    /// The job was cancelled (superseded by a newer request or shutdown)
    #[error("job cancelled")]
    Cancelled,

    /// The finisher could not produce any deliverable plan
    #[error("encoding failed: {0}")]
    EncodingFailed(String),

    /// The durability layer (cache/registry store) is unreachable
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// The raw request could not be normalized (empty, unsupported scheme, ...)
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// SQLx database error
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// External tool execution failed (ffmpeg, ffprobe, yt-dlp)
    #[error("external tool error: {0}")]
    ExternalTool(String),

    /// The delivery collaborator rejected or failed to accept the plan
    #[error("delivery failed: {0}")]
    Delivery(String),

    /// Operation not supported (missing binary, not implemented, etc.)
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Shutdown in progress - not accepting new jobs
    #[error("shutdown in progress: not accepting new jobs")]
    ShuttingDown,

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Database-related errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Failed to connect to database
    #[error("failed to connect to database: {0}")]
    ConnectionFailed(String),

    /// Failed to run migrations
    #[error("failed to run migrations: {0}")]
    MigrationFailed(String),

    /// Query failed
    #[error("query failed: {0}")]
    QueryFailed(String),
}

/// Failure of a single extraction attempt.
///
/// These never reach the caller directly: the cascade moves on to the next
/// strategy and only surfaces [`Error::ExtractionFailed`] once every strategy
/// has been tried.
#[derive(Debug, Clone, Error)]
pub enum ExtractionError {
    /// The tool ran and exited unsuccessfully
    #[error("{tool} exited with {status}: {diagnostic}")]
    ToolFailed {
        /// Tool name
        tool: String,
        /// Exit status description
        status: String,
        /// Tail of the tool's stderr
        diagnostic: String,
    },

    /// The tool could not be started
    #[error("failed to launch {tool}: {reason}")]
    Launch {
        /// Tool name
        tool: String,
        /// OS-level reason
        reason: String,
    },

    /// The tool reported success but no usable media file was produced
    #[error("no media file produced: {0}")]
    NoOutput(String),

    /// The attempt exceeded its per-attempt time budget
    #[error("attempt timed out after {}s", .0.as_secs())]
    AttemptTimedOut(Duration),

    /// The attempt was cancelled by the job's cancel token
    #[error("attempt cancelled")]
    Cancelled,
}

impl Error {
    /// Machine-readable error code for the delivery front end
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Config { .. } => "config_error",
            Error::DuplicateRequest { .. } => "duplicate_request",
            Error::UserOverLimit { .. } => "user_over_limit",
            Error::ExtractionFailed { .. } => "extraction_failed",
            Error::TimedOut { .. } => "timed_out",
            Error::Cancelled => "cancelled",
            Error::EncodingFailed(_) => "encoding_failed",
            Error::StorageUnavailable(_) => "storage_unavailable",
            Error::InvalidRequest(_) => "invalid_request",
            Error::Database(_) | Error::Sqlx(_) => "database_error",
            Error::Io(_) => "io_error",
            Error::Serialization(_) => "serialization_error",
            Error::ExternalTool(_) => "external_tool_error",
            Error::Delivery(_) => "delivery_failed",
            Error::NotSupported(_) => "not_supported",
            Error::ShuttingDown => "shutting_down",
            Error::Other(_) => "internal_error",
        }
    }

    /// Whether this error was produced at admission, before any slot was held.
    ///
    /// Admission rejections are never retried automatically; the caller must
    /// resubmit.
    pub fn is_admission_rejection(&self) -> bool {
        matches!(
            self,
            Error::DuplicateRequest { .. }
                | Error::UserOverLimit { .. }
                | Error::InvalidRequest(_)
                | Error::ShuttingDown
        )
    }

    pub(crate) fn config(message: impl Into<String>, key: &str) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.to_string()),
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn all_error_variants() -> Vec<(Error, &'static str)> {
        vec![
            (Error::config("bad value", "limits.bulk_video"), "config_error"),
            (
                Error::DuplicateRequest {
                    job_id: JobId::from_hex("abcd"),
                },
                "duplicate_request",
            ),
            (
                Error::UserOverLimit {
                    user_id: UserId(7),
                    active: 1,
                    limit: 1,
                },
                "user_over_limit",
            ),
            (
                Error::ExtractionFailed {
                    attempts: 3,
                    last_error: "HTTP 403".into(),
                },
                "extraction_failed",
            ),
            (
                Error::TimedOut {
                    after: Duration::from_secs(60),
                },
                "timed_out",
            ),
            (Error::Cancelled, "cancelled"),
            (Error::EncodingFailed("empty".into()), "encoding_failed"),
            (
                Error::StorageUnavailable("db locked".into()),
                "storage_unavailable",
            ),
            (Error::InvalidRequest("empty".into()), "invalid_request"),
            (
                Error::Database(DatabaseError::QueryFailed("timeout".into())),
                "database_error",
            ),
            (
                Error::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "gone")),
                "io_error",
            ),
            (Error::ExternalTool("ffmpeg".into()), "external_tool_error"),
            (Error::Delivery("rejected".into()), "delivery_failed"),
            (Error::NotSupported("no yt-dlp".into()), "not_supported"),
            (Error::ShuttingDown, "shutting_down"),
            (Error::Other("boom".into()), "internal_error"),
        ]
    }

    #[test]
    fn every_variant_has_a_stable_error_code() {
        for (error, expected) in all_error_variants() {
            assert_eq!(error.error_code(), expected, "wrong code for {error:?}");
        }
    }

    #[test]
    fn timeout_and_cancellation_are_distinct_from_failure() {
        let timed_out = Error::TimedOut {
            after: Duration::from_secs(90),
        };
        assert_eq!(timed_out.to_string(), "job timed out after 90s");
        assert_ne!(timed_out.error_code(), Error::Cancelled.error_code());
        assert_ne!(
            Error::Cancelled.error_code(),
            Error::ExtractionFailed {
                attempts: 1,
                last_error: String::new()
            }
            .error_code()
        );
    }

    #[test]
    fn admission_rejections_are_classified() {
        assert!(
            Error::UserOverLimit {
                user_id: UserId(1),
                active: 2,
                limit: 2
            }
            .is_admission_rejection()
        );
        assert!(Error::ShuttingDown.is_admission_rejection());
        assert!(!Error::Cancelled.is_admission_rejection());
        assert!(!Error::EncodingFailed("x".into()).is_admission_rejection());
    }

    #[test]
    fn extraction_error_messages_carry_diagnostics() {
        let err = ExtractionError::ToolFailed {
            tool: "yt-dlp".into(),
            status: "exit status: 1".into(),
            diagnostic: "ERROR: Sign in to confirm you're not a bot".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("yt-dlp"));
        assert!(msg.contains("not a bot"));

        assert_eq!(
            ExtractionError::AttemptTimedOut(Duration::from_secs(300)).to_string(),
            "attempt timed out after 300s"
        );
    }
}
