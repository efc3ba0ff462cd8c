//! Custom resource types of the backup controller
//!
//! This module contains the wire types the orchestrator reads and writes:
//! - Backup / PodVolumeBackup: what the controller has done
//! - DownloadRequest: signed URL handshake for log bundles
//! - BackupStorageLocation, Restore, DeleteBackupRequest

pub mod velero;

pub use velero::*;

// Re-export common types for convenience
pub use chrono::{DateTime, Utc};
pub use std::collections::BTreeMap;
