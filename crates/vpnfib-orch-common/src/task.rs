//! Job outcome types shared by the coordinator and the orchs.

use thiserror::Error;

/// Outcome of running one job or consumer entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Success,
    /// The entry can never succeed as given (malformed input).
    InvalidEntry,
    Failed,
    /// Transient failure; resubmitting may succeed.
    NeedRetry,
    /// Nothing to do (benign race, stale notification).
    Ignore,
}

impl TaskStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Ignore)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskStatus::NeedRetry)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, TaskStatus::InvalidEntry | TaskStatus::Failed)
    }
}

/// Error type for job failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("Invalid entry: {message}")]
    InvalidEntry { message: String },

    /// The southbound installer rejected a flow or group operation.
    #[error("Southbound error: {message}")]
    Southbound { message: String },

    #[error("Retry needed: {reason}")]
    NeedRetry { reason: String },

    #[error("Ignored: {reason}")]
    Ignored { reason: String },

    #[error("Failed: {message}")]
    Failed { message: String },
}

impl TaskError {
    pub fn invalid_entry(message: impl Into<String>) -> Self {
        TaskError::InvalidEntry {
            message: message.into(),
        }
    }

    pub fn southbound(message: impl Into<String>) -> Self {
        TaskError::Southbound {
            message: message.into(),
        }
    }

    pub fn need_retry(reason: impl Into<String>) -> Self {
        TaskError::NeedRetry {
            reason: reason.into(),
        }
    }

    pub fn ignored(reason: impl Into<String>) -> Self {
        TaskError::Ignored {
            reason: reason.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        TaskError::Failed {
            message: message.into(),
        }
    }

    pub fn to_status(&self) -> TaskStatus {
        match self {
            TaskError::InvalidEntry { .. } => TaskStatus::InvalidEntry,
            TaskError::Southbound { .. } | TaskError::Failed { .. } => TaskStatus::Failed,
            TaskError::NeedRetry { .. } => TaskStatus::NeedRetry,
            TaskError::Ignored { .. } => TaskStatus::Ignore,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.to_status().is_retryable()
    }
}

/// Result type for job execution.
pub type TaskResult<T> = Result<T, TaskError>;

/// Extension trait for converting TaskResult to TaskStatus.
pub trait TaskResultExt {
    fn to_status(&self) -> TaskStatus;
}

impl<T> TaskResultExt for TaskResult<T> {
    fn to_status(&self) -> TaskStatus {
        match self {
            Ok(_) => TaskStatus::Success,
            Err(e) => e.to_status(),
        }
    }
}
