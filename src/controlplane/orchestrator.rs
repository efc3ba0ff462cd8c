//! Main Orchestrator
//!
//! Wires the backup-controller client, the snapshot reconciler and renderer,
//! and the node maintenance controllers behind one facade:
//! - Snapshot creation, listing, detail, deletion and restore
//! - Snapshot schedules
//! - Raw log bundle download
//! - Node drain and purge

use bytes::Bytes;
use chrono::Utc;
use futures::future::try_join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::controlplane::metrics::Metrics;
use crate::crd::{DeleteBackupRequest, DownloadTargetKind, Restore};
use crate::domain::{
    AppStoreRef, BlobFetcherRef, ClusterApiRef, SleeperRef, Snapshot, SnapshotDetail,
    SnapshotTrigger, TemplateRendererRef, APP_ID_KEY, APP_SEQUENCE_KEY, APP_SLUG_KEY,
};
use crate::error::{Error, Result};
use crate::node::{DrainConfig, DrainOutcome, NodeDrainer, NodePurger, PurgeConfig, PurgeReport};
use crate::snapshot::{
    AnnotationSummaryCache, BackupSpecRenderer, RendererConfig, ScheduleConfig, SnapshotReconciler,
    SnapshotSchedule, SnapshotScheduler,
};
use crate::velero::{
    canonicalize, DownloadConfig, LogRetriever, VeleroClient, DEFAULT_VELERO_NAMESPACE,
};

// =============================================================================
// Orchestrator Configuration
// =============================================================================

/// Configuration for the orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Namespace the backup controller runs in
    pub velero_namespace: String,
    pub renderer: RendererConfig,
    pub schedule: ScheduleConfig,
    pub download: DownloadConfig,
    pub drain: DrainConfig,
    pub purge: PurgeConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            velero_namespace: DEFAULT_VELERO_NAMESPACE.to_string(),
            renderer: RendererConfig::default(),
            schedule: ScheduleConfig::default(),
            download: DownloadConfig::default(),
            drain: DrainConfig::default(),
            purge: PurgeConfig::default(),
        }
    }
}

/// Adapters the orchestrator runs against
#[derive(Clone)]
pub struct Adapters {
    pub cluster: ClusterApiRef,
    pub fetcher: BlobFetcherRef,
    pub sleeper: SleeperRef,
    pub apps: AppStoreRef,
    pub templates: TemplateRendererRef,
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Entry point for every operation the REST surface exposes
pub struct Orchestrator {
    velero: VeleroClient,
    logs: LogRetriever,
    reconciler: SnapshotReconciler,
    renderer: BackupSpecRenderer,
    scheduler: SnapshotScheduler,
    drainer: NodeDrainer,
    purger: NodePurger,
    metrics: Arc<Metrics>,
}

impl Orchestrator {
    /// Create a new orchestrator
    pub fn new(config: OrchestratorConfig, adapters: Adapters, metrics: Arc<Metrics>) -> Arc<Self> {
        let velero = VeleroClient::new(adapters.cluster.clone(), config.velero_namespace);
        let logs = LogRetriever::new(
            velero.clone(),
            adapters.fetcher,
            adapters.sleeper,
            config.download,
        );
        let reconciler = SnapshotReconciler::new(
            velero.clone(),
            logs.clone(),
            AnnotationSummaryCache::new(velero.clone()),
        )
        .with_metrics(metrics.clone());
        let renderer = BackupSpecRenderer::new(
            velero.clone(),
            adapters.apps.clone(),
            adapters.templates,
            config.renderer,
        );
        let scheduler =
            SnapshotScheduler::new(adapters.cluster.clone(), adapters.apps, config.schedule);
        let drainer =
            NodeDrainer::new(adapters.cluster.clone(), config.drain).with_metrics(metrics.clone());
        let purger = NodePurger::new(adapters.cluster, config.purge).with_metrics(metrics.clone());

        Arc::new(Self {
            velero,
            logs,
            reconciler,
            renderer,
            scheduler,
            drainer,
            purger,
            metrics,
        })
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Upper bound on a log download
    pub fn download_budget(&self) -> Duration {
        self.logs.config().budget()
    }

    fn timer(&self, operation: &str) -> prometheus::HistogramTimer {
        self.metrics
            .operation_duration
            .with_label_values(&[operation])
            .start_timer()
    }

    fn record_read(&self, operation: &str) {
        self.metrics
            .snapshot_reads
            .with_label_values(&[operation])
            .inc();
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    /// Create a snapshot of `app_id`, returning the backup name
    ///
    /// `ttl` replaces the retention from the application's template.
    pub async fn create_snapshot(
        &self,
        app_id: &str,
        trigger: SnapshotTrigger,
        ttl: Option<&str>,
    ) -> Result<String> {
        let _timer = self.timer("create_snapshot");
        let name = self.renderer.create_with_ttl(app_id, trigger, ttl).await?;
        self.metrics
            .snapshots_created
            .with_label_values(&[trigger.as_str()])
            .inc();
        Ok(name)
    }

    /// Every snapshot, optionally only those of one application
    ///
    /// Only a failed backup listing fails the call.
    #[instrument(skip(self))]
    pub async fn list_snapshots(&self, app_slug: Option<&str>) -> Result<Vec<Snapshot>> {
        let _timer = self.timer("list_snapshots");
        self.record_read("list");

        let backups = self.velero.list_backups().await?;
        let selected: Vec<_> = backups
            .iter()
            .filter(|b| app_slug.map_or(true, |slug| b.annotation(APP_SLUG_KEY) == Some(slug)))
            .collect();
        debug!(total = backups.len(), selected = selected.len(), "listing snapshots");

        try_join_all(selected.into_iter().map(|b| self.reconciler.to_snapshot(b))).await
    }

    pub async fn get_snapshot_detail(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<SnapshotDetail> {
        let _timer = self.timer("get_snapshot_detail");
        self.record_read("detail");
        self.reconciler.to_snapshot_detail(name, cancel).await
    }

    /// Ask the controller to delete backup `name` and its data
    #[instrument(skip(self))]
    pub async fn delete_snapshot(&self, name: &str) -> Result<()> {
        let _timer = self.timer("delete_snapshot");
        self.velero.get_backup(name).await?;

        let request = DeleteBackupRequest::new(name, self.velero.namespace(), name);
        self.velero.create_delete_backup_request(&request).await?;
        info!(backup = %name, "requested backup deletion");
        Ok(())
    }

    /// Restore backup `name`, returning the restore name
    #[instrument(skip(self))]
    pub async fn restore_snapshot(&self, name: &str) -> Result<String> {
        let _timer = self.timer("restore_snapshot");
        let backup = self.velero.get_backup(name).await?;

        let invalid = |reason: &str| Error::InvalidBackup {
            name: name.to_string(),
            reason: reason.to_string(),
        };
        let app_id = backup
            .annotation(APP_ID_KEY)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| invalid("missing application id annotation"))?;
        let sequence = backup
            .annotation(APP_SEQUENCE_KEY)
            .ok_or_else(|| invalid("missing application sequence annotation"))?;
        let sequence: i64 = sequence
            .parse()
            .map_err(|_| invalid("application sequence is not an integer"))?;

        let restore_name = canonicalize(&format!("{}-{}", name, Utc::now().timestamp()));
        let restore = Restore::new(&restore_name, self.velero.namespace(), name);
        self.velero.create_restore(&restore).await?;

        info!(backup = %name, restore = %restore_name, app = %app_id, sequence, "created restore");
        Ok(restore_name)
    }

    /// Raw gzip log bundle for a backup or restore
    pub async fn download_logs(
        &self,
        kind: DownloadTargetKind,
        target: &str,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        let _timer = self.timer("download_logs");
        self.logs.fetch_logs(kind, target, cancel).await
    }

    pub async fn download_snapshot_logs(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        self.download_logs(DownloadTargetKind::BackupLog, name, cancel)
            .await
    }

    // =========================================================================
    // Schedules
    // =========================================================================

    /// Create or replace the snapshot schedule of `app_id`
    pub async fn save_snapshot_schedule(
        &self,
        app_id: &str,
        schedule: &SnapshotSchedule,
    ) -> Result<String> {
        let _timer = self.timer("save_snapshot_schedule");
        self.scheduler.save(app_id, schedule).await
    }

    pub async fn get_snapshot_schedule(&self, app_id: &str) -> Result<Option<SnapshotSchedule>> {
        self.scheduler.get(app_id).await
    }

    /// Stop automatic snapshots of `app_id`; `false` when none were scheduled
    pub async fn delete_snapshot_schedule(&self, app_id: &str) -> Result<bool> {
        let _timer = self.timer("delete_snapshot_schedule");
        self.scheduler.delete(app_id).await
    }

    // =========================================================================
    // Nodes
    // =========================================================================

    pub async fn drain_node(&self, name: &str) -> Result<DrainOutcome> {
        let _timer = self.timer("drain_node");
        self.drainer.drain(name).await
    }

    pub async fn purge_node(&self, name: &str) -> Result<PurgeReport> {
        let _timer = self.timer("purge_node");
        self.purger.purge(name).await
    }
}
