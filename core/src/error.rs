//! Structured error types for istota
//!
//! Provides type-safe error handling with rich context for debugging,
//! user-friendly messages, and the retry classification used by the
//! executor and the scheduler.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Primary error type for istota operations
#[derive(Error, Debug)]
pub enum IstotaError {
    // =========================================================================
    // Transient Upstream Errors
    // =========================================================================
    /// Agent backend returned an overloaded/unavailable status
    #[error("agent backend error: {status}")]
    AgentBackend { status: u16, payload: String },

    /// Network/connection error while talking to a channel
    #[error("connection failed: {message}")]
    ConnectionFailed { message: String },

    /// Operation exceeded its deadline
    #[error("operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    // =========================================================================
    // Task Failures
    // =========================================================================
    /// Agent subprocess exited unsuccessfully
    #[error("task execution failed: {message}")]
    TaskFailed { message: String },

    /// Agent subprocess ran past the per-task timeout
    #[error("task timed out after {minutes} minutes")]
    TaskTimeout { minutes: u64 },

    /// Retry budget exhausted
    #[error("task failed after {attempts} attempts: {last_error}")]
    AttemptsExhausted { attempts: u32, last_error: String },

    /// Task was cancelled at a safe point
    #[error("task cancelled")]
    Cancelled,

    // =========================================================================
    // Invariant Violations (rejected at the store boundary, never retried)
    // =========================================================================
    /// Invalid task input
    #[error("invalid task: {message}")]
    InvalidTask { message: String },

    /// Attempted transition out of a terminal status
    #[error("task {id} is terminal ({status}); refusing status change")]
    TerminalStatus { id: i64, status: String },

    /// Task not found
    #[error("task not found: {0}")]
    TaskNotFound(i64),

    /// Scheduled job not found
    #[error("scheduled job not found: {user_id}/{name}")]
    JobNotFound { user_id: String, name: String },

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid configuration document
    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// Missing required config
    #[error("missing required configuration: {key}")]
    MissingConfig { key: String },

    /// Cron expression did not parse
    #[error("invalid cron expression '{expression}': {message}")]
    InvalidCron { expression: String, message: String },

    /// Unknown timezone name
    #[error("unknown timezone: {0}")]
    UnknownTimezone(String),

    // =========================================================================
    // Daemon / System Errors
    // =========================================================================
    /// Another scheduler instance already holds the host lock
    #[error("another istota instance is already running (lock: {path})")]
    AlreadyRunning { path: PathBuf },

    /// Delivery to a channel failed (logged, never reopens the task)
    #[error("delivery failed on {channel}: {message}")]
    DeliveryFailed { channel: String, message: String },

    /// Internal system error
    #[error("internal error: {message}")]
    Internal { message: String },

    // =========================================================================
    // External Error Wrappers
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl IstotaError {
    /// Transient errors are retried inside the executor without consuming
    /// task attempts.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::AgentBackend { status, .. } => {
                matches!(status, 429 | 500 | 502 | 503 | 504 | 529)
            }
            Self::ConnectionFailed { .. } | Self::Timeout { .. } => true,

            Self::Io(io_err) => matches!(
                io_err.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
            ),

            Self::TaskFailed { .. }
            | Self::TaskTimeout { .. }
            | Self::AttemptsExhausted { .. }
            | Self::Cancelled
            | Self::InvalidTask { .. }
            | Self::TerminalStatus { .. }
            | Self::TaskNotFound(_)
            | Self::JobNotFound { .. }
            | Self::InvalidConfig { .. }
            | Self::MissingConfig { .. }
            | Self::InvalidCron { .. }
            | Self::UnknownTimezone(_)
            | Self::AlreadyRunning { .. }
            | Self::DeliveryFailed { .. }
            | Self::Internal { .. }
            | Self::Store(_)
            | Self::Json(_) => false,
        }
    }

    /// Errors that consume one task attempt and go through the scheduler's
    /// backoff policy.
    pub fn consumes_attempt(&self) -> bool {
        matches!(self, Self::TaskFailed { .. } | Self::TaskTimeout { .. })
    }

    /// A non-technical message suitable for delivery back to the user.
    /// Raw payloads stay in the logs.
    pub fn user_message(&self) -> String {
        match self {
            Self::AgentBackend { .. } | Self::ConnectionFailed { .. } => {
                "I ran into a temporary problem reaching my backend. I'll retry shortly."
                    .to_string()
            }
            Self::TaskTimeout { minutes } => {
                format!("The task took longer than {} minutes and was stopped.", minutes)
            }
            Self::AttemptsExhausted { .. } => {
                "I wasn't able to finish this task after several tries. Please check the logs or rephrase the request."
                    .to_string()
            }
            Self::Cancelled => "The task was cancelled.".to_string(),
            Self::TaskFailed { .. } => {
                "Something went wrong while working on this task.".to_string()
            }
            _ => "An unexpected error occurred.".to_string(),
        }
    }
}

/// Result type alias using IstotaError
pub type Result<T> = std::result::Result<T, IstotaError>;
