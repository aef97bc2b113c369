//! Unified error handling for batchforge
//!
//! This module provides the single error type returned from the public
//! scheduler surface. Errors are categorized so callers can decide how to
//! react:
//! - User errors (malformed requests or configuration)
//! - Backpressure (the scheduler is saturated, retry later)
//! - Worker errors (the compute worker is gone)
//! - Internal errors (bugs, broken invariants)
//!
//! Reservation failures inside the slot ledger are *not* errors; they are
//! reported as `false`/`None` and handled as backpressure by the batch
//! builder.

use std::fmt;

use crate::request::{RequestId, RequestStatus};

/// Unified error type for batchforge
#[derive(Debug, thiserror::Error)]
pub enum ForgeError {
    // ========== Request Errors ==========
    /// Malformed request (empty prompt, zero output budget, ...)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Request id not known to the scheduler
    #[error("Request not found: {0}")]
    RequestNotFound(RequestId),

    /// A status change the request lifecycle does not allow
    #[error("Invalid state transition for {id}: {from:?} -> {to:?}")]
    InvalidStateTransition {
        id: RequestId,
        from: RequestStatus,
        to: RequestStatus,
    },

    // ========== Backpressure ==========
    /// Admission queue is at its configured depth
    #[error("Queue full: {depth} requests pending (limit {limit})")]
    QueueFull { depth: usize, limit: usize },

    // ========== Scheduler Errors ==========
    /// The scheduler loop has exited and no longer accepts work
    #[error("Scheduler stopped")]
    SchedulerStopped,

    /// The compute worker failed batch-wide and the retry budget is spent
    #[error("Compute worker unavailable: {0}")]
    WorkerUnavailable(String),

    /// Invalid scheduler configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    // ========== Internal Errors ==========
    /// Internal error (indicates a bug)
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl ForgeError {
    /// Categorize the error for handling decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            ForgeError::InvalidRequest(_)
            | ForgeError::RequestNotFound(_)
            | ForgeError::InvalidConfiguration(_) => ErrorCategory::User,

            ForgeError::QueueFull { .. } => ErrorCategory::Backpressure,

            ForgeError::WorkerUnavailable(_) | ForgeError::SchedulerStopped => {
                ErrorCategory::Worker
            }

            ForgeError::InvalidStateTransition { .. } | ForgeError::InternalError(_) => {
                ErrorCategory::Internal
            }
        }
    }

    /// Whether the caller may resubmit the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(self.category(), ErrorCategory::Backpressure)
    }

    /// Check if this is a user-facing error (actionable by users)
    pub fn is_user_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::User)
    }

    /// Check if this is an internal error (indicates a bug)
    pub fn is_internal_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::Internal)
    }
}

/// Error category for handling decisions
///
/// - User: reject, the caller must fix the input
/// - Backpressure: retry after waiting
/// - Worker: the serving process cannot make progress
/// - Internal: log and report as bug
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Invalid input or configuration
    User,
    /// Temporary saturation
    Backpressure,
    /// Compute worker or scheduler loop is gone
    Worker,
    /// Indicates a bug
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::User => write!(f, "User"),
            ErrorCategory::Backpressure => write!(f, "Backpressure"),
            ErrorCategory::Worker => write!(f, "Worker"),
            ErrorCategory::Internal => write!(f, "Internal"),
        }
    }
}

/// Result alias for fallible batchforge operations
pub type ForgeResult<T> = std::result::Result<T, ForgeError>;

// ========== Helper Functions ==========

/// Create a user-facing error with context
///
/// # Examples
/// ```ignore
/// return Err(user_error!("prompt of {} tokens never fits", len));
/// ```
#[macro_export]
macro_rules! user_error {
    ($msg:expr) => {
        $crate::error::ForgeError::InvalidRequest($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::ForgeError::InvalidRequest(format!($fmt, $($arg)*))
    };
}

/// Create an internal error with context
#[macro_export]
macro_rules! internal_error {
    ($msg:expr) => {
        $crate::error::ForgeError::InternalError($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::ForgeError::InternalError(format!($fmt, $($arg)*))
    };
}

/// Create a configuration error with context
#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::error::ForgeError::InvalidConfiguration($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::ForgeError::InvalidConfiguration(format!($fmt, $($arg)*))
    };
}

/// Wrap any error as an internal error with a message prefix
pub fn context<E>(err: E, msg: &str) -> ForgeError
where
    E: std::error::Error + Send + Sync + 'static,
{
    ForgeError::InternalError(format!("{}: {}", msg, err))
}
