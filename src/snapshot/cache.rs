//! Volume summary cache
//!
//! Volume counts for a finished backup never change, so they are stored on
//! the backup itself as annotations and read back on later queries. The
//! reconciler only sees the `SummaryCache` trait, so the storage can move
//! without touching reconciliation.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::crd::Backup;
use crate::domain::VolumeSummary;
use crate::error::Result;
use crate::velero::VeleroClient;

/// Read-through cache of per-backup volume summaries
#[async_trait]
pub trait SummaryCache: Send + Sync {
    /// Cached summary for `backup`, if present and well-formed
    async fn read_cached_summary(&self, backup: &Backup) -> Option<VolumeSummary>;

    /// Persist `summary` for `backup`
    async fn write_cached_summary(&self, backup: &Backup, summary: &VolumeSummary) -> Result<()>;
}

pub type SummaryCacheRef = Arc<dyn SummaryCache>;

/// Cache that keeps summaries in the backup's own annotations
pub struct AnnotationSummaryCache {
    velero: VeleroClient,
}

impl AnnotationSummaryCache {
    pub fn new(velero: VeleroClient) -> Arc<Self> {
        Arc::new(Self { velero })
    }
}

#[async_trait]
impl SummaryCache for AnnotationSummaryCache {
    async fn read_cached_summary(&self, backup: &Backup) -> Option<VolumeSummary> {
        backup
            .metadata
            .annotations
            .as_ref()
            .and_then(VolumeSummary::from_annotations)
    }

    async fn write_cached_summary(&self, backup: &Backup, summary: &VolumeSummary) -> Result<()> {
        let mut annotations = BTreeMap::new();
        summary.apply_to(&mut annotations);
        self.velero
            .annotate_backup(backup.name(), &annotations)
            .await?;
        Ok(())
    }
}
