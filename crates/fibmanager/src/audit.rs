//! Structured audit records for forwarding-state changes.
//!
//! Every change the engine makes to the fabric that an operator may need to
//! trace afterwards (an entry programmed on a node, a group created, a label
//! handed back to the allocator, a node replayed) is emitted as an
//! [`AuditRecord`] on the `audit` tracing target. Records serialize to one
//! JSON object so they can be shipped as-is.
//!
//! | outcome | level |
//! |---------|-------|
//! | success | info |
//! | in_progress, skipped | debug |
//! | failure | warn |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditCategory {
    /// Local or remote entry written for a route.
    RouteProgram,
    RouteRemove,
    GroupCreate,
    /// Buckets added to or removed from an existing group.
    GroupModify,
    GroupRemove,
    LabelRelease,
    NodeReplay,
    NodeCleanup,
    SystemLifecycle,
    ConfigurationChange,
    ErrorCondition,
    AdminAction,
}

impl fmt::Display for AuditCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AuditCategory::RouteProgram => "ROUTE_PROGRAM",
            AuditCategory::RouteRemove => "ROUTE_REMOVE",
            AuditCategory::GroupCreate => "GROUP_CREATE",
            AuditCategory::GroupModify => "GROUP_MODIFY",
            AuditCategory::GroupRemove => "GROUP_REMOVE",
            AuditCategory::LabelRelease => "LABEL_RELEASE",
            AuditCategory::NodeReplay => "NODE_REPLAY",
            AuditCategory::NodeCleanup => "NODE_CLEANUP",
            AuditCategory::SystemLifecycle => "SYSTEM_LIFECYCLE",
            AuditCategory::ConfigurationChange => "CONFIGURATION_CHANGE",
            AuditCategory::ErrorCondition => "ERROR_CONDITION",
            AuditCategory::AdminAction => "ADMIN_ACTION",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Success,
    Failure,
    InProgress,
    /// Nothing to do, e.g. the state was already gone.
    Skipped,
}

impl fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditOutcome::Success => write!(f, "success"),
            AuditOutcome::Failure => write!(f, "failure"),
            AuditOutcome::InProgress => write!(f, "in_progress"),
            AuditOutcome::Skipped => write!(f, "skipped"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub category: AuditCategory,
    /// Component that made the change.
    pub source: String,
    pub action: String,
    pub outcome: AuditOutcome,

    /// e.g. "100:1/10.0.0.0/24", "2:group:150001", "5000"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,

    /// e.g. "fib_entry", "ecmp_group", "label"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_type: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Ties together the records produced by one job.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl AuditRecord {
    /// Creates a record stamped now, with outcome `InProgress`.
    pub fn new(
        category: AuditCategory,
        source: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            category,
            source: source.into(),
            action: action.into(),
            outcome: AuditOutcome::InProgress,
            object_id: None,
            object_type: None,
            details: None,
            error: None,
            correlation_id: None,
        }
    }

    pub fn with_outcome(mut self, outcome: AuditOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    pub fn with_object_id(mut self, id: impl Into<String>) -> Self {
        self.object_id = Some(id.into());
        self
    }

    pub fn with_object_type(mut self, obj_type: impl Into<String>) -> Self {
        self.object_type = Some(obj_type.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Records the error and marks the outcome as `Failure`.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self.outcome = AuditOutcome::Failure;
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|e| format!(r#"{{"error":"serialization_failed","message":"{}"}}"#, e))
    }
}

/// Emits an [`AuditRecord`] on the `audit` target at the level its outcome
/// calls for.
///
/// ```ignore
/// audit_log!(AuditRecord::new(AuditCategory::GroupCreate, "NextHopGroupManager", "create_ecmp_group")
///     .with_outcome(AuditOutcome::Success)
///     .with_object_id("1:group:150001"));
/// ```
#[macro_export]
macro_rules! audit_log {
    ($record:expr) => {
        let record = $record;
        match record.outcome {
            $crate::audit::AuditOutcome::Success => {
                tracing::info!(
                    target: "audit",
                    category = %record.category,
                    source = %record.source,
                    action = %record.action,
                    outcome = %record.outcome,
                    audit_json = %record.to_json(),
                    "AUDIT: {} - {} - {}",
                    record.category,
                    record.action,
                    record.outcome
                );
            }
            $crate::audit::AuditOutcome::InProgress | $crate::audit::AuditOutcome::Skipped => {
                tracing::debug!(
                    target: "audit",
                    category = %record.category,
                    source = %record.source,
                    action = %record.action,
                    outcome = %record.outcome,
                    audit_json = %record.to_json(),
                    "AUDIT: {} - {} - {}",
                    record.category,
                    record.action,
                    record.outcome
                );
            }
            $crate::audit::AuditOutcome::Failure => {
                tracing::warn!(
                    target: "audit",
                    category = %record.category,
                    source = %record.source,
                    action = %record.action,
                    outcome = %record.outcome,
                    error = record.error.as_deref().unwrap_or(""),
                    audit_json = %record.to_json(),
                    "AUDIT: {} - {} - {}",
                    record.category,
                    record.action,
                    record.outcome
                );
            }
        }
    };
}

/// Installs a JSON tracing subscriber. `RUST_LOG` overrides `log_level`.
///
/// Used by the binary when `--log-format json` is given, in place of
/// `env_logger`.
pub fn init_logging(log_level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .json(),
        )
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_audit_record_creation() {
        let record = AuditRecord::new(
            AuditCategory::GroupCreate,
            "NextHopGroupManager",
            "create_ecmp_group",
        )
        .with_outcome(AuditOutcome::Success)
        .with_object_id("1:group:150001")
        .with_object_type("ecmp_group");

        assert_eq!(record.category, AuditCategory::GroupCreate);
        assert_eq!(record.source, "NextHopGroupManager");
        assert_eq!(record.outcome, AuditOutcome::Success);
        assert_eq!(record.object_id, Some("1:group:150001".to_string()));
        assert_eq!(record.correlation_id, None);
    }

    #[test]
    fn test_error_marks_failure() {
        let record = AuditRecord::new(AuditCategory::LabelRelease, "LabelRouteRegistry", "release")
            .with_error("allocator unavailable");

        assert_eq!(record.outcome, AuditOutcome::Failure);
        assert_eq!(record.error.as_deref(), Some("allocator unavailable"));
    }

    #[test]
    fn test_json_shape() {
        let record = AuditRecord::new(AuditCategory::NodeReplay, "RouteReconciler", "node_joined")
            .with_outcome(AuditOutcome::Success)
            .with_details(serde_json::json!({ "node": 2, "routes": 14 }));

        let json = record.to_json();
        assert!(json.contains("\"category\":\"NODE_REPLAY\""));
        assert!(json.contains("\"outcome\":\"success\""));
        assert!(json.contains("\"routes\":14"));
        assert!(!json.contains("object_id"));
    }

    #[test]
    fn test_display() {
        assert_eq!(AuditCategory::GroupModify.to_string(), "GROUP_MODIFY");
        assert_eq!(AuditOutcome::Skipped.to_string(), "skipped");
    }
}
