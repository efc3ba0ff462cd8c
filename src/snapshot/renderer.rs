//! Backup Spec Renderer
//!
//! Resolves an application's backup template into a concrete Backup:
//! namespaces, storage location, the console self-exclusion selector, hooks
//! and retention.

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::{debug, info, instrument};

use crate::crd::{Backup, BackupSpec};
use crate::domain::{
    AppInfo, AppStoreRef, SnapshotTrigger, TemplateRendererRef, APP_ID_KEY, APP_SEQUENCE_KEY,
    APP_SLUG_KEY, SNAPSHOT_TRIGGER_KEY,
};
use crate::error::{Error, Result};
use crate::velero::{canonicalize, VeleroClient};

/// Storage location the cluster installer provisions
pub const LOCAL_STORAGE_LOCATION: &str = "local-ceph-rgw";

/// Renderer configuration
#[derive(Debug, Clone)]
pub struct RendererConfig {
    /// Namespace the console itself runs in
    pub own_namespace: String,
    /// Label identifying the console's own pods
    pub console_label_key: String,
    pub console_label_value: String,
    /// Storage locations to use, most preferred first
    pub storage_preferences: Vec<String>,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            own_namespace: "default".to_string(),
            console_label_key: "app.kubernetes.io/name".to_string(),
            console_label_value: "kotsadm".to_string(),
            storage_preferences: vec!["default".to_string(), LOCAL_STORAGE_LOCATION.to_string()],
        }
    }
}

/// Only the spec of a rendered template matters
#[derive(Debug, Default, Deserialize)]
struct BackupTemplate {
    #[serde(default)]
    spec: Option<BackupSpec>,
}

/// Builds Backup resources for applications
pub struct BackupSpecRenderer {
    velero: VeleroClient,
    apps: AppStoreRef,
    templates: TemplateRendererRef,
    config: RendererConfig,
}

impl BackupSpecRenderer {
    pub fn new(
        velero: VeleroClient,
        apps: AppStoreRef,
        templates: TemplateRendererRef,
        config: RendererConfig,
    ) -> Self {
        Self {
            velero,
            apps,
            templates,
            config,
        }
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    /// Resolve a ready-to-create Backup for `app_id`
    pub async fn render(&self, app_id: &str, trigger: SnapshotTrigger) -> Result<Backup> {
        self.render_with_ttl(app_id, trigger, None).await
    }

    /// Like `render`, with `ttl` replacing the template's retention
    #[instrument(skip(self))]
    pub async fn render_with_ttl(
        &self,
        app_id: &str,
        trigger: SnapshotTrigger,
        ttl: Option<&str>,
    ) -> Result<Backup> {
        let app = self.apps.get_app(app_id).await?;
        let rendered = self.templates.render(&app, &app.backup_spec).await?;
        let mut template = parse_template(&rendered)?;
        if let Some(ttl) = ttl {
            template.ttl = Some(ttl.to_string());
        }

        let available = self.velero.list_storage_locations().await?;
        let location = select_storage_location(&available, &self.config.storage_preferences)?;
        debug!(location = %location, "selected storage location");

        let name = canonicalize(&format!(
            "{}-{}",
            trigger.name_prefix(),
            Utc::now().timestamp_millis()
        ));
        Ok(self.build(&app, trigger, name, template, location))
    }

    /// Render and create a backup, returning its name
    pub async fn create(&self, app_id: &str, trigger: SnapshotTrigger) -> Result<String> {
        self.create_with_ttl(app_id, trigger, None).await
    }

    pub async fn create_with_ttl(
        &self,
        app_id: &str,
        trigger: SnapshotTrigger,
        ttl: Option<&str>,
    ) -> Result<String> {
        let backup = self.render_with_ttl(app_id, trigger, ttl).await?;
        let created = self.velero.create_backup(&backup).await?;
        info!(backup = %created.name(), app = %app_id, trigger = %trigger, "created backup");
        Ok(created.name().to_string())
    }

    fn build(
        &self,
        app: &AppInfo,
        trigger: SnapshotTrigger,
        name: String,
        template: BackupSpec,
        location: String,
    ) -> Backup {
        let mut namespaces: Vec<String> = template
            .included_namespaces
            .unwrap_or_default()
            .into_iter()
            .filter(|ns| !ns.is_empty())
            .collect();
        if namespaces.is_empty() {
            namespaces.push(self.config.own_namespace.clone());
        }

        let label_selector = namespaces
            .contains(&self.config.own_namespace)
            .then(|| self.console_exclusion());

        let spec = BackupSpec {
            included_namespaces: Some(namespaces),
            label_selector,
            ttl: template.ttl,
            hooks: template.hooks,
            storage_location: Some(location),
            ..Default::default()
        };

        let mut backup = Backup::new(name, self.velero.namespace(), spec);
        backup.metadata.annotations = Some(BTreeMap::from([
            (SNAPSHOT_TRIGGER_KEY.to_string(), trigger.as_str().to_string()),
            (APP_SLUG_KEY.to_string(), app.slug.clone()),
            (APP_ID_KEY.to_string(), app.id.clone()),
            (APP_SEQUENCE_KEY.to_string(), app.sequence.to_string()),
        ]));
        backup
    }

    fn console_exclusion(&self) -> LabelSelector {
        LabelSelector {
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: self.config.console_label_key.clone(),
                operator: "NotIn".to_string(),
                values: Some(vec![self.config.console_label_value.clone()]),
            }]),
            match_labels: None,
        }
    }
}

fn parse_template(rendered: &str) -> Result<BackupSpec> {
    if rendered.trim().is_empty() {
        return Ok(BackupSpec::default());
    }
    let template: Option<BackupTemplate> = serde_yaml::from_str(rendered)?;
    Ok(template.and_then(|t| t.spec).unwrap_or_default())
}

/// First preferred location that exists
pub fn select_storage_location(available: &[String], preferences: &[String]) -> Result<String> {
    preferences
        .iter()
        .find(|p| available.iter().any(|a| a == *p))
        .cloned()
        .ok_or_else(|| Error::NoStorageBackend {
            candidates: preferences.to_vec(),
        })
}
