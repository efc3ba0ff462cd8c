//! Snapshot Reconciler
//!
//! Turns backup controller state into the `Snapshot` and `SnapshotDetail`
//! views. Reads are side-effect free apart from one write: once a backup is
//! terminal its volume summary is stored through the `SummaryCache` so later
//! reads skip the pod volume backup scan.

use indexmap::IndexMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::cache::SummaryCacheRef;
use crate::controlplane::metrics::Metrics;
use crate::crd::{
    selector_string, Backup, BackupResourceHook, DownloadTargetKind, PodVolumeBackup,
};
use crate::domain::{
    Snapshot, SnapshotDetail, SnapshotError, SnapshotHook, SnapshotHookExec, SnapshotHookPhase,
    SnapshotTrigger, SnapshotVolume, VolumeSummary, APP_SEQUENCE_KEY, APP_SLUG_KEY,
    SNAPSHOT_TRIGGER_KEY,
};
use crate::error::Result;
use crate::velero::{LogParser, LogRecord, LogRetriever, VeleroClient};

const RUNNING_HOOK_MSG: &str = "running exec hook";
const STDOUT_PREFIX: &str = "stdout: ";
const STDERR_PREFIX: &str = "stderr: ";

/// Builds snapshot views from controller resources
pub struct SnapshotReconciler {
    velero: VeleroClient,
    logs: LogRetriever,
    cache: SummaryCacheRef,
    metrics: Option<Arc<Metrics>>,
}

impl SnapshotReconciler {
    pub fn new(velero: VeleroClient, logs: LogRetriever, cache: SummaryCacheRef) -> Self {
        Self {
            velero,
            logs,
            cache,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    // =========================================================================
    // Snapshot
    // =========================================================================

    /// Summary view of one backup
    ///
    /// A failed volume scan leaves the volume fields at zero rather than
    /// failing the view.
    #[instrument(skip(self, backup), fields(backup = %backup.name()))]
    pub async fn to_snapshot(&self, backup: &Backup) -> Result<Snapshot> {
        let status = backup.phase();
        let trigger = backup
            .annotation(SNAPSHOT_TRIGGER_KEY)
            .and_then(SnapshotTrigger::from_annotation);

        let summary = match self.cache.read_cached_summary(backup).await {
            Some(summary) => {
                self.record_cache("hit");
                summary
            }
            None => {
                self.record_cache("miss");
                match self.velero.list_pod_volume_backups(backup.name()).await {
                    Ok(volumes) => {
                        let summary = summarize(&volumes);
                        debug!(volumes = volumes.len(), "scanned pod volume backups");

                        if status.is_terminal() {
                            if let Err(e) = self.cache.write_cached_summary(backup, &summary).await
                            {
                                warn!(error = %e, "failed to cache volume summary");
                            }
                        }
                        summary
                    }
                    // Reported without volume counts and retried on the next read
                    Err(e) => {
                        warn!(error = %e, "pod volume backups unavailable");
                        VolumeSummary::default()
                    }
                }
            }
        };

        let backup_status = backup.status.as_ref();
        Ok(Snapshot {
            name: backup.name().to_string(),
            status,
            trigger,
            app_slug: backup.annotation(APP_SLUG_KEY).map(str::to_string),
            app_version: backup.annotation(APP_SEQUENCE_KEY).map(str::to_string),
            started: backup_status.and_then(|s| s.start_timestamp),
            finished: backup_status.and_then(|s| s.completion_timestamp),
            expires: backup_status.and_then(|s| s.expiration),
            volume_count: summary.volume_count,
            volume_success_count: summary.volume_success_count,
            volume_bytes: summary.volume_bytes,
        })
    }

    // =========================================================================
    // Snapshot Detail
    // =========================================================================

    /// Detailed view of backup `name`
    ///
    /// Only a missing backup is an error; unavailable logs or volumes leave
    /// the corresponding fields empty.
    #[instrument(skip(self, cancel))]
    pub async fn to_snapshot_detail(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<SnapshotDetail> {
        let backup = self.velero.get_backup(name).await?;

        let records = match self
            .logs
            .fetch_logs(DownloadTargetKind::BackupLog, name, cancel)
            .await
            .and_then(|raw| LogParser::parse(&raw))
        {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "backup logs unavailable");
                Vec::new()
            }
        };

        let volumes = match self.velero.list_pod_volume_backups(name).await {
            Ok(pvbs) => pvbs.iter().map(to_volume).collect(),
            Err(e) => {
                warn!(error = %e, "pod volume backups unavailable");
                Vec::new()
            }
        };

        Ok(SnapshotDetail {
            name: backup.name().to_string(),
            namespaces: backup.spec.included_namespaces.clone().unwrap_or_default(),
            hooks: assemble_hooks(&backup, &records),
            volumes,
            errors: Vec::new(),
            warnings: Vec::new(),
        })
    }

    fn record_cache(&self, result: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.summary_cache.with_label_values(&[result]).inc();
        }
    }
}

/// Aggregate pod volume backups into a summary
pub fn summarize(volumes: &[PodVolumeBackup]) -> VolumeSummary {
    VolumeSummary {
        volume_count: volumes.len() as u64,
        volume_success_count: volumes.iter().filter(|v| v.is_completed()).count() as u64,
        volume_bytes: volumes.iter().map(PodVolumeBackup::bytes_done).sum(),
    }
}

fn to_volume(pvb: &PodVolumeBackup) -> SnapshotVolume {
    let pod = pvb.spec.pod.as_ref();
    let status = pvb.status.as_ref();
    SnapshotVolume {
        name: pvb
            .spec
            .volume
            .clone()
            .or_else(|| pvb.metadata.name.clone())
            .unwrap_or_default(),
        pod_name: pod.and_then(|p| p.name.clone()),
        pod_namespace: pod.and_then(|p| p.namespace.clone()),
        phase: pvb.phase().map(str::to_string),
        size_bytes: pvb.total_bytes(),
        done_bytes: pvb.bytes_done(),
        started: status.and_then(|s| s.start_timestamp),
        finished: status.and_then(|s| s.completion_timestamp),
    }
}

// =============================================================================
// Hooks
// =============================================================================

/// Declared hooks, each with the executions the logs report for it
fn assemble_hooks(backup: &Backup, records: &[LogRecord]) -> Vec<SnapshotHook> {
    let Some(hooks) = &backup.spec.hooks else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for resource in &hooks.resources {
        let selector = resource
            .label_selector
            .as_ref()
            .map(selector_string)
            .unwrap_or_default();

        let phases = [
            (SnapshotHookPhase::Pre, &resource.pre),
            (SnapshotHookPhase::Post, &resource.post),
        ];
        for (phase, entries) in phases {
            for exec in entries.iter().filter_map(|h: &BackupResourceHook| h.exec.as_ref()) {
                out.push(SnapshotHook {
                    name: resource.name.clone(),
                    phase,
                    command: exec.command.join(" "),
                    selector: selector.clone(),
                    container: exec.container.clone().unwrap_or_default(),
                    execs: hook_execs(records, &resource.name, phase),
                });
            }
        }
    }
    out
}

/// Executions of hook `name` in `phase`, one per pod, in log order
fn hook_execs(records: &[LogRecord], name: &str, phase: SnapshotHookPhase) -> Vec<SnapshotHookExec> {
    let mut execs: IndexMap<(Option<String>, String), SnapshotHookExec> = IndexMap::new();

    let matching = records.iter().filter(|r| {
        r.get("hookName") == Some(name)
            && r.get("hookPhase").and_then(SnapshotHookPhase::from_log) == Some(phase)
    });

    for record in matching {
        let namespace = record.get("namespace").map(str::to_string);
        let pod = record.get("name").unwrap_or_default().to_string();
        let exec = execs
            .entry((namespace.clone(), pod.clone()))
            .or_insert_with(|| SnapshotHookExec {
                name: pod,
                namespace: namespace.clone(),
                started: None,
                finished: None,
                stdout: String::new(),
                stderr: String::new(),
                warning: None,
                error: None,
            });

        let msg = record.msg().unwrap_or_default();
        let time = record.time();

        if msg == RUNNING_HOOK_MSG {
            exec.started = exec.started.or(time);
            continue;
        }
        if let Some(out) = msg.strip_prefix(STDOUT_PREFIX) {
            exec.stdout.push_str(out);
        } else if let Some(err) = msg.strip_prefix(STDERR_PREFIX) {
            exec.stderr.push_str(err);
        }

        let problem = || SnapshotError {
            title: msg.to_string(),
            message: record.get("error").unwrap_or_default().to_string(),
            namespace: namespace.clone(),
        };
        match record.level() {
            Some("error") => exec.error = Some(problem()),
            Some("warning") => exec.warning = Some(problem()),
            _ => {}
        }
        if time.is_some() {
            exec.finished = time;
        }
    }

    execs.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::BackupPhase;
    use crate::domain::{ApiResponse, Verb, VOLUME_BYTES_KEY, VOLUME_COUNT_KEY};
    use crate::error::Error;
    use crate::snapshot::cache::AnnotationSummaryCache;
    use crate::testing::{gzip, FakeCluster, NoWaitSleeper, StaticFetcher};
    use crate::velero::DownloadConfig;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const ROOT: &str = "/apis/velero.io/v1/namespaces/velero";

    fn backup_json(name: &str, phase: &str) -> serde_json::Value {
        serde_json::json!({
            "apiVersion": "velero.io/v1",
            "kind": "Backup",
            "metadata": {
                "name": name,
                "namespace": "velero",
                "annotations": {
                    "kots.io/snapshot-trigger": "manual",
                    "kots.io/app-slug": "acme",
                    "kots.io/app-sequence": "4"
                }
            },
            "spec": {
                "includedNamespaces": ["acme-ns"],
                "hooks": {
                    "resources": [{
                        "name": "dump",
                        "labelSelector": {"matchLabels": {"app": "db"}},
                        "pre": [{"exec": {"container": "db", "command": ["/bin/sh", "-c", "pg_dump"]}}]
                    }]
                }
            },
            "status": {
                "phase": phase,
                "startTimestamp": "2024-01-02T03:04:05Z",
                "completionTimestamp": "2024-01-02T03:09:05Z"
            }
        })
    }

    /// Completed backup carrying fields only the controller knows about
    fn controller_fields() -> serde_json::Value {
        let mut json = backup_json("manual-1", "Completed");
        json["metadata"]["resourceVersion"] = "81723".into();
        json["spec"]["defaultVolumesToRestic"] = true.into();
        json["spec"]["orderedResources"] = serde_json::json!({"pods": "acme-ns/db-0"});
        json["spec"]["csiSnapshotTimeout"] = "10m0s".into();
        json["status"]["version"] = 1.into();
        json["status"]["formatVersion"] = "1.1.0".into();
        json
    }

    fn pvbs_json() -> serde_json::Value {
        serde_json::json!({"items": [
            {"metadata": {"name": "a"}, "spec": {"volume": "data", "pod": {"name": "db-0", "namespace": "acme-ns"}},
             "status": {"phase": "Completed", "progress": {"totalBytes": 100, "bytesDone": 100}}},
            {"metadata": {"name": "b"}, "status": {"phase": "Failed", "progress": {"bytesDone": 40}}},
            {"metadata": {"name": "c"}, "status": {"phase": "InProgress", "progress": {"totalBytes": 90, "bytesDone": 10}}}
        ]})
    }

    struct Fixture {
        cluster: Arc<FakeCluster>,
        fetcher: Arc<StaticFetcher>,
        reconciler: SnapshotReconciler,
        pvb_scans: Arc<AtomicUsize>,
    }

    fn fixture() -> Fixture {
        let cluster = FakeCluster::new();
        let scans = Arc::new(AtomicUsize::new(0));
        let counter = scans.clone();
        cluster.respond(Verb::Get, &format!("{}/podvolumebackups", ROOT), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            ApiResponse::new(200, pvbs_json().to_string())
        });

        let velero = VeleroClient::new(cluster.clone(), "velero");
        let fetcher = StaticFetcher::new();
        let logs = LogRetriever::new(
            velero.clone(),
            fetcher.clone(),
            NoWaitSleeper::new(),
            DownloadConfig::default(),
        );
        let cache = AnnotationSummaryCache::new(velero.clone());
        let reconciler = SnapshotReconciler::new(velero, logs, cache);
        Fixture {
            cluster,
            fetcher,
            reconciler,
            pvb_scans: scans,
        }
    }

    #[tokio::test]
    async fn test_volume_aggregation() {
        let f = fixture();
        let backup: Backup = serde_json::from_value(backup_json("manual-1", "InProgress")).unwrap();

        let snapshot = f.reconciler.to_snapshot(&backup).await.unwrap();
        assert_eq!(snapshot.volume_count, 3);
        assert_eq!(snapshot.volume_success_count, 1);
        assert_eq!(snapshot.volume_bytes, 150);
        assert_eq!(snapshot.status, BackupPhase::InProgress);
        assert_eq!(snapshot.trigger, Some(SnapshotTrigger::Manual));
        assert_eq!(snapshot.app_slug.as_deref(), Some("acme"));
        assert_eq!(snapshot.app_version.as_deref(), Some("4"));

        // Not terminal, nothing written back.
        assert_eq!(f.cluster.count(Verb::Patch, &format!("{}/backups/manual-1", ROOT)), 0);
    }

    #[tokio::test]
    async fn test_terminal_backup_cached_once() {
        let f = fixture();
        let path = format!("{}/backups/manual-1", ROOT);
        let stored = Arc::new(std::sync::Mutex::new(controller_fields()));
        let on_patch = stored.clone();
        f.cluster.respond(Verb::Patch, &path, move |req| {
            let patch: serde_json::Value =
                serde_json::from_slice(req.body.as_deref().unwrap_or_default()).unwrap();
            let mut current = on_patch.lock().unwrap();
            for (k, v) in patch["metadata"]["annotations"].as_object().unwrap() {
                current["metadata"]["annotations"][k] = v.clone();
            }
            ApiResponse::new(200, current.to_string())
        });

        let first_read: Backup = serde_json::from_value(stored.lock().unwrap().clone()).unwrap();
        let first = f.reconciler.to_snapshot(&first_read).await.unwrap();
        assert_eq!(f.cluster.count(Verb::Patch, &path), 1);

        let second_read: Backup = serde_json::from_value(stored.lock().unwrap().clone()).unwrap();
        assert_eq!(second_read.annotation(VOLUME_COUNT_KEY), Some("3"));
        let second = f.reconciler.to_snapshot(&second_read).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(f.pvb_scans.load(Ordering::SeqCst), 1);
        assert_eq!(f.cluster.count(Verb::Patch, &path), 1);

        // Everything outside the annotations is left as the controller wrote it.
        let after = stored.lock().unwrap().clone();
        let mut expected = controller_fields();
        expected["metadata"]["annotations"] = after["metadata"]["annotations"].clone();
        assert_eq!(after, expected);
        assert_eq!(after["spec"]["defaultVolumesToRestic"], true);
        assert_eq!(after["status"]["version"], 1);
    }

    #[tokio::test]
    async fn test_failed_volume_scan_degrades() {
        let f = fixture();
        f.cluster.respond(Verb::Get, &format!("{}/podvolumebackups", ROOT), |_| {
            ApiResponse::new(500, "")
        });

        let backup: Backup = serde_json::from_value(backup_json("manual-1", "Completed")).unwrap();
        let snapshot = f.reconciler.to_snapshot(&backup).await.unwrap();
        assert_eq!(snapshot.name, "manual-1");
        assert_eq!(snapshot.volume_count, 0);
        assert_eq!(snapshot.volume_bytes, 0);
        // Zeros from a failed scan are never cached.
        assert_eq!(f.cluster.count(Verb::Patch, &format!("{}/backups/manual-1", ROOT)), 0);
    }

    #[tokio::test]
    async fn test_write_back_failure_does_not_fail_read() {
        let f = fixture();
        let path = format!("{}/backups/manual-1", ROOT);
        f.cluster.respond(Verb::Patch, &path, |_| ApiResponse::new(409, ""));

        let backup: Backup = serde_json::from_value(backup_json("manual-1", "Failed")).unwrap();
        let snapshot = f.reconciler.to_snapshot(&backup).await.unwrap();
        assert_eq!(snapshot.volume_bytes, 150);
        assert_eq!(f.cluster.count(Verb::Patch, &path), 1);
    }

    #[tokio::test]
    async fn test_cached_annotations_used_verbatim() {
        let f = fixture();
        let mut json = backup_json("manual-2", "Completed");
        json["metadata"]["annotations"][VOLUME_COUNT_KEY] = "7".into();
        json["metadata"]["annotations"]["kots.io/snapshot-volume-success-count"] = "7".into();
        json["metadata"]["annotations"][VOLUME_BYTES_KEY] = "9000".into();
        json["metadata"]["annotations"]["kots.io/snapshot-trigger"] = "nightly".into();
        let backup: Backup = serde_json::from_value(json).unwrap();

        let snapshot = f.reconciler.to_snapshot(&backup).await.unwrap();
        assert_eq!(snapshot.volume_count, 7);
        assert_eq!(snapshot.volume_bytes, 9000);
        assert_eq!(snapshot.trigger, None);
        assert_eq!(f.pvb_scans.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_detail_missing_backup_is_not_found() {
        let f = fixture();
        f.cluster.respond_json(
            Verb::Get,
            &format!("{}/backups/gone", ROOT),
            404,
            serde_json::json!({"kind": "Status", "apiVersion": "v1", "details": {"name": "gone", "kind": "backups"}}),
        );

        let err = f
            .reconciler
            .to_snapshot_detail("gone", &CancellationToken::new())
            .await
            .unwrap_err();
        assert_matches!(err, Error::ResourceNotFound { .. });
    }

    #[tokio::test]
    async fn test_detail_without_logs_degrades() {
        let f = fixture();
        f.cluster.respond_json(
            Verb::Get,
            &format!("{}/backups/manual-1", ROOT),
            200,
            backup_json("manual-1", "Completed"),
        );
        // No DownloadRequest routes: creating one fails.

        let detail = f
            .reconciler
            .to_snapshot_detail("manual-1", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(detail.namespaces, vec!["acme-ns"]);
        assert_eq!(detail.hooks.len(), 1);
        assert!(detail.hooks[0].execs.is_empty());
        assert_eq!(detail.volumes.len(), 3);
        assert!(detail.errors.is_empty());
    }

    #[tokio::test]
    async fn test_detail_assembles_hook_execs() {
        let f = fixture();
        f.cluster.respond_json(
            Verb::Get,
            &format!("{}/backups/manual-1", ROOT),
            200,
            backup_json("manual-1", "Completed"),
        );
        let dr_root = format!("{}/downloadrequests", ROOT);
        f.cluster.respond(Verb::Post, &dr_root, |req| {
            ApiResponse::new(201, req.body.clone().unwrap_or_default())
        });
        f.cluster.respond_prefix(Verb::Get, &format!("{}/", dr_root), |_| {
            ApiResponse::new(
                200,
                serde_json::json!({
                    "spec": {"target": {"kind": "BackupLog", "name": "manual-1"}},
                    "status": {"downloadURL": "https://bucket/manual-1-logs.gz"}
                })
                .to_string(),
            )
        });
        f.cluster
            .respond_prefix(Verb::Delete, &format!("{}/", dr_root), |_| ApiResponse::new(200, "{}"));

        let log = [
            r#"time="2024-01-02T03:04:06Z" level=info msg="running exec hook" hookName=dump hookPhase=pre name=db-0 namespace=acme-ns"#,
            r#"time="2024-01-02T03:04:07Z" level=info msg="stdout: dumped 3 tables" hookName=dump hookPhase=pre name=db-0 namespace=acme-ns"#,
            r#"time="2024-01-02T03:04:08Z" level=error msg="Error executing hook" error="exit code 1" hookName=dump hookPhase=pre name=db-1 namespace=acme-ns"#,
            r#"time="2024-01-02T03:04:09Z" level=info msg="Backed up pod" name=db-0 namespace=acme-ns"#,
            r#"time="2024-01-02T03:04:10Z" level=info msg="running exec hook" hookName=dump hookPhase=post name=db-0 namespace=acme-ns"#,
        ]
        .join("\n");
        f.fetcher
            .insert("https://bucket/manual-1-logs.gz", gzip(&log));

        let detail = f
            .reconciler
            .to_snapshot_detail("manual-1", &CancellationToken::new())
            .await
            .unwrap();

        let hook = &detail.hooks[0];
        assert_eq!(hook.name, "dump");
        assert_eq!(hook.phase, SnapshotHookPhase::Pre);
        assert_eq!(hook.command, "/bin/sh -c pg_dump");
        assert_eq!(hook.selector, "app=db");
        assert_eq!(hook.container, "db");
        assert_eq!(hook.execs.len(), 2);

        let ok = &hook.execs[0];
        assert_eq!(ok.name, "db-0");
        assert_eq!(ok.stdout, "dumped 3 tables");
        assert!(ok.started.is_some());
        assert!(ok.error.is_none());

        let failed = &hook.execs[1];
        assert_eq!(failed.name, "db-1");
        let error = failed.error.as_ref().unwrap();
        assert_eq!(error.title, "Error executing hook");
        assert_eq!(error.message, "exit code 1");
        assert_eq!(error.namespace.as_deref(), Some("acme-ns"));

        let volume = detail.volumes.iter().find(|v| v.name == "data").unwrap();
        assert_eq!(volume.pod_name.as_deref(), Some("db-0"));
        assert_eq!(volume.size_bytes, 100);
    }

    #[test]
    fn test_summarize_empty() {
        assert_eq!(summarize(&[]), VolumeSummary::default());
    }
}
