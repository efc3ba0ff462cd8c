//! Snapshot orchestration
//!
//! - `cache`: volume summary cache behind `SummaryCache`
//! - `reconciler`: backup resources to `Snapshot` / `SnapshotDetail`
//! - `renderer`: application templates to new Backup resources
//! - `schedule`: per-application CronJobs for automatic snapshots

pub mod cache;
pub mod reconciler;
pub mod renderer;
pub mod schedule;

pub use cache::{AnnotationSummaryCache, SummaryCache, SummaryCacheRef};
pub use reconciler::SnapshotReconciler;
pub use renderer::{select_storage_location, BackupSpecRenderer, RendererConfig};
pub use schedule::{
    Retention, RetentionUnit, ScheduleConfig, SnapshotSchedule, SnapshotScheduler,
};
