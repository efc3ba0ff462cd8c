//! Error types for the Console Orchestrator
//!
//! Provides structured error types for the snapshot reconciliation layer,
//! the backup-controller client, and the node maintenance controllers.

use std::time::Duration;
use thiserror::Error;

/// One failed step of a node purge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurgeFailure {
    /// Step that failed (e.g. "purge storage daemon")
    pub step: String,
    /// Resource the step was acting on
    pub resource: String,
    /// Underlying failure
    pub reason: String,
}

impl std::fmt::Display for PurgeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.step, self.resource, self.reason)
    }
}

fn join_failures(failures: &[PurgeFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Unified error type for the orchestrator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("HTTP transport error: {0}")]
    Hyper(#[from] hyper::Error),

    #[error("Download transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Timed out after {after:?}: {operation}")]
    Timeout { operation: String, after: Duration },

    // =========================================================================
    // Backup Controller Errors
    // =========================================================================
    #[error("RBAC misconfigured for {method} {path} in namespace {namespace}")]
    AccessDenied {
        method: String,
        path: String,
        namespace: String,
    },

    #[error("backup controller is not installed in this cluster")]
    ControllerNotInstalled,

    #[error("Unexpected response {code} for {method} {path}")]
    UnexpectedStatus {
        method: String,
        path: String,
        code: u16,
    },

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("No backup storage location configured (tried: {})", .candidates.join(", "))]
    NoStorageBackend { candidates: Vec<String> },

    #[error("Timed out waiting for {kind} download URL for {target} after {attempts} attempts")]
    DownloadTimeout {
        kind: String,
        target: String,
        attempts: u32,
    },

    #[error("Download of {kind} for {target} was cancelled")]
    DownloadCancelled { kind: String, target: String },

    #[error("Failed to decompress log bundle: {0}")]
    DecompressionError(String),

    #[error("Invalid backup {name}: {reason}")]
    InvalidBackup { name: String, reason: String },

    #[error("Application not found: {app_id}")]
    AppNotFound { app_id: String },

    #[error("Invalid snapshot schedule {schedule}: {reason}")]
    InvalidSchedule { schedule: String, reason: String },

    // =========================================================================
    // Node Maintenance Errors
    // =========================================================================
    #[error("Node not found: {node}")]
    NodeNotFound { node: String },

    #[error("Cordon node {node}: {code}")]
    CordonFailed { node: String, code: u16 },

    #[error("Unexpected response code {code} evicting pod {namespace}/{pod}")]
    EvictionFailed {
        namespace: String,
        pod: String,
        code: u16,
    },

    #[error("Eviction not possible on node {node}: pod may have misconfigured PodDisruptionBudget")]
    EvictionMisconfigured { node: String },

    #[error("Wait and retry draining node {node}: PodDisruptionBudget may be temporarily blocking eviction")]
    EvictionBudgetBlocked { node: String },

    #[error("Exec in pod {namespace}/{pod} failed: {reason}")]
    ExecFailed {
        namespace: String,
        pod: String,
        reason: String,
    },

    #[error("Purge of node {node} incomplete: {}", join_failures(.failures))]
    PurgeIncomplete {
        node: String,
        failures: Vec<PurgeFailure>,
    },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action the caller should take after an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Re-invoke with exponential backoff
    RequeueWithBackoff,
    /// Re-invoke after specific duration
    RequeueAfter(Duration),
    /// Don't re-invoke, an operator has to fix something first
    NoRequeue,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::Kube(_)
            | Error::Hyper(_)
            | Error::Http(_)
            | Error::Timeout { .. }
            | Error::DownloadTimeout { .. } => ErrorAction::RequeueWithBackoff,

            // A disruption budget will usually clear on its own
            Error::EvictionBudgetBlocked { .. } => {
                ErrorAction::RequeueAfter(Duration::from_secs(5))
            }

            // Partial purges can be re-run once the operator looked at them
            Error::PurgeIncomplete { .. } => ErrorAction::RequeueAfter(Duration::from_secs(60)),

            // Cluster misconfiguration - don't retry automatically
            Error::AccessDenied { .. }
            | Error::ControllerNotInstalled
            | Error::NoStorageBackend { .. }
            | Error::EvictionMisconfigured { .. }
            | Error::Configuration(_)
            | Error::InvalidBackup { .. }
            | Error::InvalidSchedule { .. }
            | Error::AppNotFound { .. }
            | Error::NodeNotFound { .. }
            | Error::ResourceNotFound { .. }
            | Error::DownloadCancelled { .. }
            | Error::DecompressionError(_) => ErrorAction::NoRequeue,

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Kube(_)
                | Error::Hyper(_)
                | Error::Http(_)
                | Error::Timeout { .. }
                | Error::DownloadTimeout { .. }
        )
    }

    /// HTTP status the REST surface reports for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Error::AccessDenied { .. } => 403,
            Error::ResourceNotFound { .. }
            | Error::NodeNotFound { .. }
            | Error::AppNotFound { .. } => 404,
            Error::InvalidSchedule { .. } => 400,
            Error::EvictionBudgetBlocked { .. } => 409,
            Error::NoStorageBackend { .. }
            | Error::InvalidBackup { .. }
            | Error::EvictionMisconfigured { .. }
            | Error::Configuration(_) => 422,
            Error::ControllerNotInstalled => 503,
            Error::Timeout { .. }
            | Error::DownloadTimeout { .. }
            | Error::DownloadCancelled { .. } => 504,
            _ => 500,
        }
    }
}

/// Result type alias for the orchestrator
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_actions() {
        let err = Error::EvictionBudgetBlocked {
            node: "node-1".into(),
        };
        assert_eq!(
            err.action(),
            ErrorAction::RequeueAfter(Duration::from_secs(5))
        );

        let err = Error::ControllerNotInstalled;
        assert_eq!(err.action(), ErrorAction::NoRequeue);

        let err = Error::DownloadTimeout {
            kind: "BackupLog".into(),
            target: "manual-1".into(),
            attempts: 30,
        };
        assert_eq!(err.action(), ErrorAction::RequeueWithBackoff);
    }

    #[test]
    fn test_error_retryable() {
        let transient = Error::Timeout {
            operation: "GET /api/v1/nodes/a".into(),
            after: Duration::from_secs(30),
        };
        assert!(transient.is_retryable());
        assert!(transient.is_transient());

        let rbac = Error::AccessDenied {
            method: "GET".into(),
            path: "backups".into(),
            namespace: "velero".into(),
        };
        assert!(!rbac.is_retryable());
        assert!(!rbac.is_transient());
    }

    #[test]
    fn test_access_denied_message() {
        let err = Error::AccessDenied {
            method: "POST".into(),
            path: "backups".into(),
            namespace: "velero".into(),
        };
        assert_eq!(
            err.to_string(),
            "RBAC misconfigured for POST backups in namespace velero"
        );
        assert_eq!(err.status_code(), 403);
    }

    #[test]
    fn test_purge_incomplete_lists_steps() {
        let err = Error::PurgeIncomplete {
            node: "node-2".into(),
            failures: vec![
                PurgeFailure {
                    step: "purge storage daemon".into(),
                    resource: "rook-ceph/rook-ceph-osd-3".into(),
                    reason: "exec failed".into(),
                },
                PurgeFailure {
                    step: "remove consensus member".into(),
                    resource: "kube-system/etcd-node-1".into(),
                    reason: "timeout".into(),
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("purge storage daemon (rook-ceph/rook-ceph-osd-3): exec failed"));
        assert!(msg.contains("remove consensus member"));
    }

    #[test]
    fn test_invalid_schedule_is_bad_request() {
        let err = Error::InvalidSchedule {
            schedule: "0 0 2 * * *".into(),
            reason: "seconds and years are not supported".into(),
        };
        assert_eq!(err.status_code(), 400);
        assert_eq!(err.action(), ErrorAction::NoRequeue);
    }

    #[test]
    fn test_no_storage_backend_message() {
        let err = Error::NoStorageBackend {
            candidates: vec!["default".into(), "local-ceph-rgw".into()],
        };
        assert_eq!(
            err.to_string(),
            "No backup storage location configured (tried: default, local-ceph-rgw)"
        );
    }
}
