//! Console Orchestrator - Snapshot and Node Maintenance Core
//!
//! Reconciles Velero backup resources into application snapshots, renders
//! new backups from application templates, and drains or purges cluster
//! nodes on behalf of an application console.
//!
//! # Modules
//!
//! - [`controlplane`]: Orchestrator facade, metrics, and REST API
//! - [`snapshot`]: Snapshot reconciliation, summary cache, backup rendering, schedules
//! - [`velero`]: Backup controller client, log bundles, download requests
//! - [`node`]: Node drain and purge controllers
//! - [`cluster`]: Adapters for the cluster API, downloads, and app store
//! - [`crd`]: Backup controller resource types
//! - [`domain`]: Ports and snapshot view types
//! - [`error`]: Error types and handling

pub mod cluster;
pub mod controlplane;
pub mod crd;
pub mod domain;
pub mod error;
pub mod node;
pub mod snapshot;
pub mod velero;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use controlplane::{
    Adapters, ApiServer, ApiServerConfig, Metrics, Orchestrator, OrchestratorConfig, RestRouter,
};

pub use crd::{Backup, BackupPhase, BackupSpec, DownloadTargetKind, PodVolumeBackup};

pub use domain::{
    AppInfo, AppStore, BlobFetcher, ClusterApi, Sleeper, Snapshot, SnapshotDetail,
    SnapshotTrigger, TemplateRenderer, VolumeSummary,
};

pub use error::{Error, ErrorAction, PurgeFailure, Result};

pub use node::{DrainOutcome, NodeDrainer, NodePurger, PurgeReport};

pub use snapshot::{BackupSpecRenderer, SnapshotReconciler, SnapshotSchedule, SnapshotScheduler};

pub use velero::{canonicalize, LogParser, LogRecord, LogRetriever, VeleroClient};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
