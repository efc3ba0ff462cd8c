//! Snapshot Schedules
//!
//! Automatic snapshots of an application run from a `velero-<slug>` CronJob
//! in the console's own namespace. Each run posts to the console's snapshot
//! endpoint with the `schedule` trigger and the retention the schedule was
//! saved with, so scheduled backups expire without further bookkeeping.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::{CronJob, CronJobSpec, JobSpec, JobTemplateSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, instrument};

use crate::domain::{ApiRequest, ApiResponse, AppStoreRef, ClusterApiRef, Verb};
use crate::error::{Error, Result};
use crate::velero::canonicalize;

/// Annotation on the CronJob holding the retention it was saved with
pub const RETENTION_KEY: &str = "kots.io/snapshot-retention";

const SCHEDULE_MACROS: &[&str] = &[
    "@yearly",
    "@annually",
    "@monthly",
    "@weekly",
    "@daily",
    "@midnight",
    "@hourly",
];

// =============================================================================
// Configuration
// =============================================================================

/// Where schedules live and what they call
#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    /// Namespace the console runs in, and its CronJobs with it
    pub own_namespace: String,
    /// Base URL of the console's REST API as seen from inside the cluster
    pub api_url: String,
    /// Deployment and container whose image the CronJob runs
    pub image_deployment: String,
    pub image_container: String,
    /// Label put on the CronJob and its pods so snapshots skip them
    pub console_label_key: String,
    pub console_label_value: String,
    pub starting_deadline_seconds: i64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            own_namespace: "default".to_string(),
            api_url: "http://console-orchestrator:8090".to_string(),
            image_deployment: "console-orchestrator".to_string(),
            image_container: "console-orchestrator".to_string(),
            console_label_key: "app.kubernetes.io/name".to_string(),
            console_label_value: "kotsadm".to_string(),
            starting_deadline_seconds: 30,
        }
    }
}

// =============================================================================
// Retention
// =============================================================================

/// Unit of a retention period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
    Weeks,
    /// 30 days
    Months,
    /// 365 days
    Years,
}

impl RetentionUnit {
    fn seconds(&self) -> u64 {
        match self {
            RetentionUnit::Seconds => 1,
            RetentionUnit::Minutes => 60,
            RetentionUnit::Hours => 3_600,
            RetentionUnit::Days => 86_400,
            RetentionUnit::Weeks => 7 * 86_400,
            RetentionUnit::Months => 30 * 86_400,
            RetentionUnit::Years => 365 * 86_400,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RetentionUnit::Seconds => "seconds",
            RetentionUnit::Minutes => "minutes",
            RetentionUnit::Hours => "hours",
            RetentionUnit::Days => "days",
            RetentionUnit::Weeks => "weeks",
            RetentionUnit::Months => "months",
            RetentionUnit::Years => "years",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "seconds" => Some(RetentionUnit::Seconds),
            "minutes" => Some(RetentionUnit::Minutes),
            "hours" => Some(RetentionUnit::Hours),
            "days" => Some(RetentionUnit::Days),
            "weeks" => Some(RetentionUnit::Weeks),
            "months" => Some(RetentionUnit::Months),
            "years" => Some(RetentionUnit::Years),
            _ => None,
        }
    }
}

/// How long scheduled backups are kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Retention {
    pub quantity: u32,
    pub unit: RetentionUnit,
}

impl Retention {
    /// Backup TTL in the controller's duration format, e.g. `720h0m0s`
    pub fn ttl(&self) -> String {
        let total = u64::from(self.quantity) * self.unit.seconds();
        format!("{}h{}m{}s", total / 3_600, total % 3_600 / 60, total % 60)
    }

    /// Parse the `"<quantity> <unit>"` form kept on the CronJob
    pub fn parse(value: &str) -> Option<Self> {
        let (quantity, unit) = value.trim().split_once(' ')?;
        Some(Self {
            quantity: quantity.parse().ok()?,
            unit: RetentionUnit::parse(unit.trim())?,
        })
    }
}

impl std::fmt::Display for Retention {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.quantity, self.unit.as_str())
    }
}

/// Whether `ttl` is a duration the controller accepts, e.g. `72h` or `1h30m0s`
pub fn valid_ttl(ttl: &str) -> bool {
    let mut digits = 0;
    let mut units = 0;
    for c in ttl.chars() {
        match c {
            '0'..='9' => digits += 1,
            'h' | 'm' | 's' if digits > 0 => {
                digits = 0;
                units += 1;
            }
            _ => return false,
        }
    }
    digits == 0 && units > 0
}

// =============================================================================
// Schedule
// =============================================================================

/// An application's snapshot schedule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSchedule {
    /// Five-field cron expression or a macro such as `@daily`
    pub schedule: String,
    pub retention: Retention,
}

impl SnapshotSchedule {
    pub fn validate(&self) -> Result<()> {
        validate_cron(&self.schedule)?;
        if self.retention.quantity < 1 {
            return Err(Error::InvalidSchedule {
                schedule: self.schedule.clone(),
                reason: format!("invalid snapshot retention: {}", self.retention),
            });
        }
        Ok(())
    }
}

/// Check `expression` is something the CronJob controller will run
pub fn validate_cron(expression: &str) -> Result<()> {
    let invalid = |reason: &str| Error::InvalidSchedule {
        schedule: expression.to_string(),
        reason: reason.to_string(),
    };

    let fields: Vec<&str> = expression.split_whitespace().collect();
    match fields.as_slice() {
        [] => Err(invalid("empty schedule")),
        [single] if single.starts_with('@') => {
            if SCHEDULE_MACROS.contains(single) {
                Ok(())
            } else {
                Err(invalid("unknown schedule macro"))
            }
        }
        f if f.len() > 5 => Err(invalid("seconds and years are not supported")),
        f if f.len() < 5 => Err(invalid("expected five fields")),
        f => {
            let allowed = |c: char| c.is_ascii_alphanumeric() || "*,-/?".contains(c);
            if f.iter().all(|field| field.chars().all(allowed)) {
                Ok(())
            } else {
                Err(invalid("unexpected character"))
            }
        }
    }
}

/// CronJob name for an application slug
pub fn schedule_name(app_slug: &str) -> String {
    canonicalize(&format!("velero-{}", app_slug))
}

// =============================================================================
// Scheduler
// =============================================================================

/// Creates, replaces and removes snapshot CronJobs
pub struct SnapshotScheduler {
    cluster: ClusterApiRef,
    apps: AppStoreRef,
    config: ScheduleConfig,
}

impl SnapshotScheduler {
    pub fn new(cluster: ClusterApiRef, apps: AppStoreRef, config: ScheduleConfig) -> Self {
        Self {
            cluster,
            apps,
            config,
        }
    }

    fn cron_jobs_path(&self) -> String {
        format!(
            "/apis/batch/v1/namespaces/{}/cronjobs",
            self.config.own_namespace
        )
    }

    /// Create or replace the schedule of `app_id`, returning the CronJob name
    #[instrument(skip(self, schedule), fields(schedule = %schedule.schedule))]
    pub async fn save(&self, app_id: &str, schedule: &SnapshotSchedule) -> Result<String> {
        schedule.validate()?;
        let app = self.apps.get_app(app_id).await?;
        let name = schedule_name(&app.slug);
        let image = self.own_image().await?;
        let spec = self.cron_job_spec(&name, &image, app_id, schedule);

        let path = format!("{}/{}", self.cron_jobs_path(), name);
        let response = self.cluster.send(ApiRequest::get(&path)).await?;
        if response.status == 404 {
            let mut metadata = ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(self.config.own_namespace.clone()),
                ..Default::default()
            };
            self.stamp(&mut metadata, schedule);
            let cron_job = CronJob {
                metadata,
                spec: Some(spec),
                status: None,
            };
            let collection = self.cron_jobs_path();
            let response = self
                .cluster
                .send(ApiRequest::new(Verb::Post, &collection).json(&cron_job)?)
                .await?;
            self.check(Verb::Post, &collection, response)?;
            info!(cron_job = %name, app = %app_id, "created snapshot schedule");
            return Ok(name);
        }

        let mut cron_job: CronJob = serde_json::from_slice(&self.check(Verb::Get, &path, response)?)?;
        self.stamp(&mut cron_job.metadata, schedule);
        cron_job.spec = Some(spec);
        let response = self
            .cluster
            .send(ApiRequest::new(Verb::Put, &path).json(&cron_job)?)
            .await?;
        self.check(Verb::Put, &path, response)?;
        info!(cron_job = %name, app = %app_id, "replaced snapshot schedule");
        Ok(name)
    }

    /// Current schedule of `app_id`, if it has one
    pub async fn get(&self, app_id: &str) -> Result<Option<SnapshotSchedule>> {
        let app = self.apps.get_app(app_id).await?;
        let path = format!("{}/{}", self.cron_jobs_path(), schedule_name(&app.slug));
        let response = self.cluster.send(ApiRequest::get(&path)).await?;
        if response.status == 404 {
            return Ok(None);
        }
        let cron_job: CronJob = serde_json::from_slice(&self.check(Verb::Get, &path, response)?)?;

        let retention = cron_job
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(RETENTION_KEY))
            .and_then(|r| Retention::parse(r));
        let schedule = cron_job.spec.map(|s| s.schedule);
        match (schedule, retention) {
            (Some(schedule), Some(retention)) => Ok(Some(SnapshotSchedule {
                schedule,
                retention,
            })),
            _ => Err(Error::InvalidSchedule {
                schedule: path,
                reason: "CronJob is missing its schedule or retention".to_string(),
            }),
        }
    }

    /// Remove the schedule of `app_id`; `false` when there was none
    #[instrument(skip(self))]
    pub async fn delete(&self, app_id: &str) -> Result<bool> {
        let app = self.apps.get_app(app_id).await?;
        let name = schedule_name(&app.slug);
        let path = format!("{}/{}", self.cron_jobs_path(), name);
        let response = self.cluster.send(ApiRequest::delete(&path)).await?;
        if response.status == 404 {
            debug!(cron_job = %name, "no snapshot schedule to remove");
            return Ok(false);
        }
        self.check(Verb::Delete, &path, response)?;
        info!(cron_job = %name, app = %app_id, "removed snapshot schedule");
        Ok(true)
    }

    /// Image of the console's own container
    async fn own_image(&self) -> Result<String> {
        let path = format!(
            "/apis/apps/v1/namespaces/{}/deployments/{}",
            self.config.own_namespace, self.config.image_deployment
        );
        let response = self.cluster.send(ApiRequest::get(&path)).await?;
        let deployment: Deployment =
            serde_json::from_slice(&self.check(Verb::Get, &path, response)?)?;

        deployment
            .spec
            .and_then(|s| s.template.spec)
            .into_iter()
            .flat_map(|s| s.containers)
            .find(|c| c.name == self.config.image_container)
            .and_then(|c| c.image)
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "No {} container image in deployment {}/{}",
                    self.config.image_container,
                    self.config.own_namespace,
                    self.config.image_deployment
                ))
            })
    }

    fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(
            self.config.console_label_key.clone(),
            self.config.console_label_value.clone(),
        )])
    }

    fn stamp(&self, metadata: &mut ObjectMeta, schedule: &SnapshotSchedule) {
        metadata
            .labels
            .get_or_insert_with(Default::default)
            .extend(self.labels());
        metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(RETENTION_KEY.to_string(), schedule.retention.to_string());
    }

    fn cron_job_spec(
        &self,
        name: &str,
        image: &str,
        app_id: &str,
        schedule: &SnapshotSchedule,
    ) -> CronJobSpec {
        let body = serde_json::json!({
            "trigger": "schedule",
            "ttl": schedule.retention.ttl(),
        });
        let url = format!(
            "{}/v1/apps/{}/snapshots",
            self.config.api_url.trim_end_matches('/'),
            urlencoding::encode(app_id)
        );
        let command = format!(
            "curl -sS --fail -X POST -H 'Content-Type: application/json' -d '{}' {}",
            body, url
        );

        let metadata = Some(ObjectMeta {
            labels: Some(self.labels()),
            ..Default::default()
        });
        CronJobSpec {
            schedule: schedule.schedule.clone(),
            concurrency_policy: Some("Forbid".to_string()),
            starting_deadline_seconds: Some(self.config.starting_deadline_seconds),
            job_template: JobTemplateSpec {
                metadata: metadata.clone(),
                spec: Some(JobSpec {
                    template: PodTemplateSpec {
                        metadata,
                        spec: Some(PodSpec {
                            containers: vec![Container {
                                name: name.to_string(),
                                image: Some(image.to_string()),
                                command: Some(vec![
                                    "/bin/sh".to_string(),
                                    "-c".to_string(),
                                    command,
                                ]),
                                ..Default::default()
                            }],
                            restart_policy: Some("OnFailure".to_string()),
                            ..Default::default()
                        }),
                    },
                    ..Default::default()
                }),
            },
            ..Default::default()
        }
    }

    fn check(&self, verb: Verb, path: &str, response: ApiResponse) -> Result<bytes::Bytes> {
        match response.status {
            code if (200..300).contains(&code) => Ok(response.body),
            403 => Err(Error::AccessDenied {
                method: verb.to_string(),
                path: path.to_string(),
                namespace: self.config.own_namespace.clone(),
            }),
            code => Err(Error::UnexpectedStatus {
                method: verb.to_string(),
                path: path.to_string(),
                code,
            }),
        }
    }
}
