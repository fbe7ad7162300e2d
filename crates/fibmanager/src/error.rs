//! Error types for the FIB engine.
//!
//! Failures fall into a small taxonomy that decides how they are logged and
//! whether the job that hit them is resubmitted:
//!
//! | variant | level | job outcome |
//! |---------|-------|-------------|
//! | `ResolutionMiss`, `DomainNotFound` | warn | skipped, fixed by a later event |
//! | `AlreadyDeleted` | warn | skipped, removal is idempotent |
//! | `Allocation` | error | failed |
//! | `Store` (transient) | error | retried |
//! | `Store` (permanent) | error | failed |
//! | `LockTimeout` | warn | retried |
//! | `Malformed` | error | abandoned |

use log::{error, warn};
use thiserror::Error;
use vpnfib_orch_common::{TaskError, TaskResult};
use vpnfib_types::RouteDistinguisher;

/// Failure reported by the transactional store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Optimistic-lock conflict or a temporarily unavailable backend.
    #[error("transient store failure: {0}")]
    Transient(String),

    #[error("store failure: {0}")]
    Permanent(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

#[derive(Debug, Error)]
pub enum FibError {
    /// No adjacency, directory entry or egress action could be found.
    #[error("resolution miss: {0}")]
    ResolutionMiss(String),

    #[error("routing domain not found for {0}")]
    DomainNotFound(RouteDistinguisher),

    #[error("allocation from pool {pool} failed for {key}: {reason}")]
    Allocation {
        pool: String,
        key: String,
        reason: String,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("already deleted: {0}")]
    AlreadyDeleted(String),

    /// External state violates an invariant; retrying will not help.
    #[error("malformed route: {0}")]
    Malformed(String),

    #[error("timed out acquiring lock {0}")]
    LockTimeout(String),

    #[error("southbound failure: {0}")]
    Southbound(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// The intake queue of the reconciler is gone.
    #[error("queue closed: {0}")]
    QueueClosed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FibError>;

impl FibError {
    pub fn resolution_miss(message: impl Into<String>) -> Self {
        FibError::ResolutionMiss(message.into())
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        FibError::Malformed(message.into())
    }

    pub fn southbound(message: impl Into<String>) -> Self {
        FibError::Southbound(message.into())
    }

    /// Errors that leave forwarding state stale but are expected during
    /// churn and resolved by a later event.
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            FibError::ResolutionMiss(_) | FibError::DomainNotFound(_) | FibError::AlreadyDeleted(_)
        )
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            FibError::Store(e) => e.is_transient(),
            FibError::LockTimeout(_) => true,
            _ => false,
        }
    }

    /// Logs the error at the level its category calls for.
    pub fn log(&self, component: &str, context: &str) {
        match self {
            FibError::ResolutionMiss(_)
            | FibError::DomainNotFound(_)
            | FibError::AlreadyDeleted(_)
            | FibError::LockTimeout(_) => warn!("{}: {}: {}", component, context, self),
            _ => error!("{}: {}: {}", component, context, self),
        }
    }
}

impl From<FibError> for TaskError {
    fn from(e: FibError) -> Self {
        let message = e.to_string();
        match e {
            FibError::ResolutionMiss(_)
            | FibError::DomainNotFound(_)
            | FibError::AlreadyDeleted(_) => TaskError::ignored(message),
            FibError::Store(ref store) if store.is_transient() => TaskError::need_retry(message),
            FibError::LockTimeout(_) => TaskError::need_retry(message),
            FibError::Malformed(_) => TaskError::invalid_entry(message),
            FibError::Southbound(_) => TaskError::southbound(message),
            FibError::Allocation { .. }
            | FibError::Store(_)
            | FibError::Config(_)
            | FibError::QueueClosed(_)
            | FibError::Io(_)
            | FibError::Json(_) => TaskError::failed(message),
        }
    }
}

/// Turns the outcome of one unit of FIB work into a job result.
///
/// Benign errors are logged and reported as success so the coordinator
/// neither counts nor retries them.
pub fn settle(component: &str, context: &str, result: Result<()>) -> TaskResult<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.is_benign() => {
            e.log(component, context);
            Ok(())
        }
        Err(e) => {
            // Retries are logged by the coordinator.
            if !e.is_retryable() {
                e.log(component, context);
            }
            Err(e.into())
        }
    }
}
