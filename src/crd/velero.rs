//! Velero resource types
//!
//! Typed wire structs for the backup controller's custom resources. Field
//! names follow the controller's own schema exactly; every field read with a
//! default is an explicit `Option` or `#[serde(default)]`.

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// API group/version of every resource in this module
pub const VELERO_API_VERSION: &str = "velero.io/v1";

/// Label the controller puts on per-backup child resources
pub const BACKUP_NAME_LABEL: &str = "velero.io/backup-name";

/// Generic list envelope returned by collection GETs
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ObjectList<T> {
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
}

fn default_api_version() -> String {
    VELERO_API_VERSION.to_string()
}

// =============================================================================
// Backup
// =============================================================================

/// Backup lifecycle phase as reported by the controller
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackupPhase {
    #[default]
    New,
    FailedValidation,
    InProgress,
    Completed,
    PartiallyFailed,
    Failed,
    Deleting,
    /// Phase introduced by a newer controller
    #[serde(other)]
    Unknown,
}

impl BackupPhase {
    /// Whether the controller is finished with this backup
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            BackupPhase::New | BackupPhase::InProgress | BackupPhase::Unknown
        )
    }
}

impl std::fmt::Display for BackupPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BackupPhase::New => "New",
            BackupPhase::FailedValidation => "FailedValidation",
            BackupPhase::InProgress => "InProgress",
            BackupPhase::Completed => "Completed",
            BackupPhase::PartiallyFailed => "PartiallyFailed",
            BackupPhase::Failed => "Failed",
            BackupPhase::Deleting => "Deleting",
            BackupPhase::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// Velero Backup resource
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Backup {
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "Backup::default_kind")]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: BackupSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<BackupStatus>,
}

impl Backup {
    fn default_kind() -> String {
        "Backup".to_string()
    }

    pub fn new(name: impl Into<String>, namespace: impl Into<String>, spec: BackupSpec) -> Self {
        Self {
            api_version: default_api_version(),
            kind: Self::default_kind(),
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some(namespace.into()),
                ..Default::default()
            },
            spec,
            status: None,
        }
    }

    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    /// Phase, defaulting to `New` when the controller hasn't written status yet
    pub fn phase(&self) -> BackupPhase {
        self.status
            .as_ref()
            .and_then(|s| s.phase)
            .unwrap_or_default()
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(String::as_str)
    }
}

/// Backup spec
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub included_namespaces: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excluded_namespaces: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub included_resources: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excluded_resources: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<LabelSelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_volumes: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_cluster_resources: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hooks: Option<BackupHooks>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_snapshot_locations: Option<Vec<String>>,
}

/// Backup hooks
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupHooks {
    #[serde(default)]
    pub resources: Vec<BackupResourceHookSpec>,
}

/// Hooks applied to a set of resources
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupResourceHookSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub included_namespaces: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excluded_namespaces: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub included_resources: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excluded_resources: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<LabelSelector>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre: Vec<BackupResourceHook>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post: Vec<BackupResourceHook>,
}

/// A single hook
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupResourceHook {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec: Option<ExecHook>,
}

/// Exec hook run inside a container
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecHook {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}

/// Backup status
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<BackupPhase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_errors: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warnings: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<u32>,
}

// =============================================================================
// PodVolumeBackup
// =============================================================================

/// Velero PodVolumeBackup resource, one per volume per backup
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodVolumeBackup {
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: PodVolumeBackupSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<PodVolumeBackupStatus>,
}

impl PodVolumeBackup {
    pub fn phase(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| s.phase.as_deref())
    }

    pub fn is_completed(&self) -> bool {
        self.phase() == Some("Completed")
    }

    /// Bytes transferred so far, 0 when unknown
    pub fn bytes_done(&self) -> u64 {
        self.status
            .as_ref()
            .and_then(|s| s.progress.as_ref())
            .and_then(|p| p.bytes_done)
            .unwrap_or(0)
    }

    /// Total bytes, 0 when unknown
    pub fn total_bytes(&self) -> u64 {
        self.status
            .as_ref()
            .and_then(|s| s.progress.as_ref())
            .and_then(|p| p.total_bytes)
            .unwrap_or(0)
    }
}

/// PodVolumeBackup spec
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodVolumeBackupSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod: Option<PodReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_storage_location: Option<String>,
}

/// Reference to the pod owning the volume
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// PodVolumeBackup status
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodVolumeBackupStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<VolumeProgress>,
}

/// Transfer progress
///
/// The controller omits zero values, and older versions wrote them as
/// strings, so anything non-numeric reads as absent.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeProgress {
    #[serde(
        default,
        deserialize_with = "lenient_u64",
        skip_serializing_if = "Option::is_none"
    )]
    pub total_bytes: Option<u64>,
    #[serde(
        default,
        deserialize_with = "lenient_u64",
        skip_serializing_if = "Option::is_none"
    )]
    pub bytes_done: Option<u64>,
}

fn lenient_u64<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Number(n)) => n.as_u64(),
        Some(serde_json::Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

// =============================================================================
// DownloadRequest
// =============================================================================

/// What a download request is for
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DownloadTargetKind {
    BackupLog,
    RestoreLog,
}

impl std::fmt::Display for DownloadTargetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DownloadTargetKind::BackupLog => write!(f, "BackupLog"),
            DownloadTargetKind::RestoreLog => write!(f, "RestoreLog"),
        }
    }
}

/// Velero DownloadRequest resource
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRequest {
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "DownloadRequest::default_kind")]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    pub spec: DownloadRequestSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<DownloadRequestStatus>,
}

impl DownloadRequest {
    fn default_kind() -> String {
        "DownloadRequest".to_string()
    }

    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        kind: DownloadTargetKind,
        target: impl Into<String>,
    ) -> Self {
        Self {
            api_version: default_api_version(),
            kind: Self::default_kind(),
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some(namespace.into()),
                ..Default::default()
            },
            spec: DownloadRequestSpec {
                target: DownloadTarget {
                    kind,
                    name: target.into(),
                },
            },
            status: None,
        }
    }

    /// Signed URL, once the controller has produced one
    pub fn download_url(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.download_url.as_deref())
            .filter(|u| !u.is_empty())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DownloadRequestSpec {
    pub target: DownloadTarget,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DownloadTarget {
    pub kind: DownloadTargetKind,
    pub name: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct DownloadRequestStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(rename = "downloadURL", default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<DateTime<Utc>>,
}

// =============================================================================
// BackupStorageLocation
// =============================================================================

/// Velero BackupStorageLocation, only the parts needed to pick one
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupStorageLocation {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: BTreeMap<String, serde_json::Value>,
}

impl BackupStorageLocation {
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }
}

// =============================================================================
// Restore
// =============================================================================

/// Velero Restore resource
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Restore {
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "Restore::default_kind")]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    pub spec: RestoreSpec,
}

impl Restore {
    fn default_kind() -> String {
        "Restore".to_string()
    }

    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        backup_name: impl Into<String>,
    ) -> Self {
        Self {
            api_version: default_api_version(),
            kind: Self::default_kind(),
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some(namespace.into()),
                ..Default::default()
            },
            spec: RestoreSpec {
                backup_name: backup_name.into(),
                restore_pvs: Some(true),
            },
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RestoreSpec {
    pub backup_name: String,
    #[serde(rename = "restorePVs", default, skip_serializing_if = "Option::is_none")]
    pub restore_pvs: Option<bool>,
}

// =============================================================================
// DeleteBackupRequest
// =============================================================================

/// Velero DeleteBackupRequest, the controller's deletion protocol for backups
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeleteBackupRequest {
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "DeleteBackupRequest::default_kind")]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    pub spec: DeleteBackupRequestSpec,
}

impl DeleteBackupRequest {
    fn default_kind() -> String {
        "DeleteBackupRequest".to_string()
    }

    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        backup_name: impl Into<String>,
    ) -> Self {
        let backup_name = backup_name.into();
        let mut labels = BTreeMap::new();
        labels.insert(BACKUP_NAME_LABEL.to_string(), backup_name.clone());
        Self {
            api_version: default_api_version(),
            kind: Self::default_kind(),
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some(namespace.into()),
                labels: Some(labels),
                ..Default::default()
            },
            spec: DeleteBackupRequestSpec { backup_name },
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeleteBackupRequestSpec {
    pub backup_name: String,
}

// =============================================================================
// Selector rendering
// =============================================================================

/// Render a label selector in the API's string form
pub fn selector_string(selector: &LabelSelector) -> String {
    let mut parts = Vec::new();
    if let Some(labels) = &selector.match_labels {
        for (k, v) in labels {
            parts.push(format!("{}={}", k, v));
        }
    }
    if let Some(expressions) = &selector.match_expressions {
        for expr in expressions {
            let values = expr.values.clone().unwrap_or_default().join(",");
            let part = match expr.operator.as_str() {
                "In" => format!("{} in ({})", expr.key, values),
                "NotIn" => format!("{} notin ({})", expr.key, values),
                "Exists" => expr.key.clone(),
                "DoesNotExist" => format!("!{}", expr.key),
                other => format!("{} {} ({})", expr.key, other, values),
            };
            parts.push(part);
        }
    }
    parts.join(",")
}
