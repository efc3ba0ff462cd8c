//! Snapshot View Types
//!
//! Derived, read-only views over backup controller resources. These are
//! computed fresh on every query and never stored on their own.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::crd::BackupPhase;

// =============================================================================
// Well-known annotations
// =============================================================================

/// Annotation carrying how the snapshot was triggered
pub const SNAPSHOT_TRIGGER_KEY: &str = "kots.io/snapshot-trigger";
/// Annotation carrying the owning application slug
pub const APP_SLUG_KEY: &str = "kots.io/app-slug";
/// Annotation carrying the owning application id
pub const APP_ID_KEY: &str = "kots.io/app-id";
/// Annotation carrying the owning application sequence
pub const APP_SEQUENCE_KEY: &str = "kots.io/app-sequence";

pub const VOLUME_COUNT_KEY: &str = "kots.io/snapshot-volume-count";
pub const VOLUME_SUCCESS_COUNT_KEY: &str = "kots.io/snapshot-volume-success-count";
pub const VOLUME_BYTES_KEY: &str = "kots.io/snapshot-volume-bytes";

// =============================================================================
// Trigger
// =============================================================================

/// How a snapshot came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotTrigger {
    Manual,
    Schedule,
    PreUpgrade,
}

impl SnapshotTrigger {
    /// Value stored in the trigger annotation
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotTrigger::Manual => "manual",
            SnapshotTrigger::Schedule => "schedule",
            SnapshotTrigger::PreUpgrade => "pre_upgrade",
        }
    }

    /// Parse an annotation value; unknown values yield `None`
    pub fn from_annotation(value: &str) -> Option<Self> {
        match value {
            "manual" => Some(SnapshotTrigger::Manual),
            "schedule" => Some(SnapshotTrigger::Schedule),
            "pre_upgrade" => Some(SnapshotTrigger::PreUpgrade),
            _ => None,
        }
    }

    /// Prefix for generated backup names
    pub fn name_prefix(&self) -> &'static str {
        match self {
            SnapshotTrigger::Manual => "manual",
            SnapshotTrigger::Schedule => "scheduled",
            SnapshotTrigger::PreUpgrade => "pre-upgrade",
        }
    }
}

impl std::fmt::Display for SnapshotTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Volume Summary
// =============================================================================

/// Aggregate of a backup's pod volume backups
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSummary {
    pub volume_count: u64,
    pub volume_success_count: u64,
    pub volume_bytes: u64,
}

impl VolumeSummary {
    /// Read the summary from annotations; all three keys must be numeric
    pub fn from_annotations(annotations: &BTreeMap<String, String>) -> Option<Self> {
        let read = |key: &str| annotations.get(key)?.trim().parse::<u64>().ok();
        Some(Self {
            volume_count: read(VOLUME_COUNT_KEY)?,
            volume_success_count: read(VOLUME_SUCCESS_COUNT_KEY)?,
            volume_bytes: read(VOLUME_BYTES_KEY)?,
        })
    }

    /// Write the summary into annotations as decimal strings
    pub fn apply_to(&self, annotations: &mut BTreeMap<String, String>) {
        annotations.insert(VOLUME_COUNT_KEY.to_string(), self.volume_count.to_string());
        annotations.insert(
            VOLUME_SUCCESS_COUNT_KEY.to_string(),
            self.volume_success_count.to_string(),
        );
        annotations.insert(VOLUME_BYTES_KEY.to_string(), self.volume_bytes.to_string());
    }
}

// =============================================================================
// Snapshot
// =============================================================================

/// Summary view of one backup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub name: String,
    pub status: BackupPhase,
    pub trigger: Option<SnapshotTrigger>,
    pub app_slug: Option<String>,
    pub app_version: Option<String>,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
    pub expires: Option<DateTime<Utc>>,
    pub volume_count: u64,
    pub volume_success_count: u64,
    pub volume_bytes: u64,
}

// =============================================================================
// Snapshot Detail
// =============================================================================

/// Hook phase relative to the backup of a pod
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotHookPhase {
    Pre,
    Post,
}

impl SnapshotHookPhase {
    pub fn from_log(value: &str) -> Option<Self> {
        match value {
            "pre" => Some(SnapshotHookPhase::Pre),
            "post" => Some(SnapshotHookPhase::Post),
            _ => None,
        }
    }
}

/// Error or warning surfaced to the operator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotError {
    pub title: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// One execution of a hook in one pod
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotHookExec {
    /// Pod the hook ran in
    pub name: String,
    pub namespace: Option<String>,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
    pub stdout: String,
    pub stderr: String,
    pub warning: Option<SnapshotError>,
    pub error: Option<SnapshotError>,
}

/// A hook declared on the backup, with what the logs say about it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotHook {
    pub name: String,
    pub phase: SnapshotHookPhase,
    pub command: String,
    pub selector: String,
    pub container: String,
    pub execs: Vec<SnapshotHookExec>,
}

/// One backed-up pod volume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotVolume {
    pub name: String,
    pub pod_name: Option<String>,
    pub pod_namespace: Option<String>,
    pub phase: Option<String>,
    pub size_bytes: u64,
    pub done_bytes: u64,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
}

/// Detailed view of one backup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotDetail {
    pub name: String,
    pub namespaces: Vec<String>,
    pub hooks: Vec<SnapshotHook>,
    pub volumes: Vec<SnapshotVolume>,
    pub errors: Vec<SnapshotError>,
    pub warnings: Vec<SnapshotError>,
}
