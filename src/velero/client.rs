//! Backup controller client
//!
//! Typed requests against the controller's custom resource API. Every call is
//! rooted at `/apis/velero.io/v1/namespaces/<namespace>/` and non-success
//! responses are translated into the orchestrator's error taxonomy.

use bytes::Bytes;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

use crate::crd::{
    Backup, BackupStorageLocation, DeleteBackupRequest, DownloadRequest, ObjectList,
    PodVolumeBackup, Restore, BACKUP_NAME_LABEL, VELERO_API_VERSION,
};
use crate::domain::{ApiRequest, ApiResponse, ClusterApiRef, Verb};
use crate::error::{Error, Result};

/// Namespace the controller is installed into by default
pub const DEFAULT_VELERO_NAMESPACE: &str = "velero";

/// Client for the backup controller's resources
#[derive(Clone)]
pub struct VeleroClient {
    cluster: ClusterApiRef,
    namespace: String,
}

impl VeleroClient {
    pub fn new(cluster: ClusterApiRef, namespace: impl Into<String>) -> Self {
        Self {
            cluster,
            namespace: namespace.into(),
        }
    }

    /// Namespace the controller's resources live in
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn root(&self) -> String {
        format!("/apis/{}/namespaces/{}", VELERO_API_VERSION, self.namespace)
    }

    // =========================================================================
    // Raw request
    // =========================================================================

    /// Issue `verb` against `resource_path` (relative to the namespace root)
    ///
    /// Returns the raw body on 2xx, which may be empty.
    pub async fn request(
        &self,
        verb: Verb,
        resource_path: &str,
        query: &[(&str, &str)],
        body: Option<&serde_json::Value>,
    ) -> Result<Bytes> {
        let mut req = ApiRequest::new(verb, format!("{}/{}", self.root(), resource_path));
        for (k, v) in query {
            req = req.query(k, *v);
        }
        if let Some(body) = body {
            req = req.json(body)?;
        }

        debug!(method = %verb, path = resource_path, "backup controller request");
        let response = self.cluster.send(req).await?;
        self.check(verb, resource_path, response)
    }

    fn check(&self, verb: Verb, resource_path: &str, response: ApiResponse) -> Result<Bytes> {
        match response.status {
            code if (200..300).contains(&code) => Ok(response.body),
            403 => Err(Error::AccessDenied {
                method: verb.to_string(),
                path: resource_path.to_string(),
                namespace: self.namespace.clone(),
            }),
            404 => Err(not_found(&response)),
            code => Err(Error::UnexpectedStatus {
                method: verb.to_string(),
                path: resource_path.to_string(),
                code,
            }),
        }
    }

    async fn typed<T: DeserializeOwned>(
        &self,
        verb: Verb,
        resource_path: &str,
        query: &[(&str, &str)],
        body: Option<&serde_json::Value>,
    ) -> Result<T> {
        let bytes = self.request(verb, resource_path, query, body).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn create<T: Serialize + DeserializeOwned>(&self, resource: &str, obj: &T) -> Result<T> {
        let body = serde_json::to_value(obj)?;
        self.typed(Verb::Post, resource, &[], Some(&body)).await
    }

    // =========================================================================
    // Backups
    // =========================================================================

    pub async fn list_backups(&self) -> Result<Vec<Backup>> {
        let list: ObjectList<Backup> = self.typed(Verb::Get, "backups", &[], None).await?;
        Ok(list.items)
    }

    pub async fn get_backup(&self, name: &str) -> Result<Backup> {
        self.typed(Verb::Get, &format!("backups/{}", name), &[], None)
            .await
    }

    pub async fn create_backup(&self, backup: &Backup) -> Result<Backup> {
        self.create("backups", backup).await
    }

    /// Merge `annotations` into backup `name`, leaving the rest untouched
    ///
    /// The controller owns the spec and status, and this client only models
    /// part of them, so a full replace would drop fields.
    pub async fn annotate_backup(
        &self,
        name: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<Backup> {
        let patch = serde_json::json!({ "metadata": { "annotations": annotations } });
        self.typed(Verb::Patch, &format!("backups/{}", name), &[], Some(&patch))
            .await
    }

    /// Pod volume backups labelled with `backup_name`
    pub async fn list_pod_volume_backups(&self, backup_name: &str) -> Result<Vec<PodVolumeBackup>> {
        let selector = format!("{}={}", BACKUP_NAME_LABEL, backup_name);
        let list: ObjectList<PodVolumeBackup> = self
            .typed(
                Verb::Get,
                "podvolumebackups",
                &[("labelSelector", selector.as_str())],
                None,
            )
            .await?;
        Ok(list.items)
    }

    pub async fn create_delete_backup_request(
        &self,
        request: &DeleteBackupRequest,
    ) -> Result<DeleteBackupRequest> {
        self.create("deletebackuprequests", request).await
    }

    // =========================================================================
    // Download requests
    // =========================================================================

    pub async fn create_download_request(&self, request: &DownloadRequest) -> Result<DownloadRequest> {
        self.create("downloadrequests", request).await
    }

    pub async fn get_download_request(&self, name: &str) -> Result<DownloadRequest> {
        self.typed(Verb::Get, &format!("downloadrequests/{}", name), &[], None)
            .await
    }

    pub async fn delete_download_request(&self, name: &str) -> Result<()> {
        self.request(
            Verb::Delete,
            &format!("downloadrequests/{}", name),
            &[],
            None,
        )
        .await?;
        Ok(())
    }

    // =========================================================================
    // Storage locations and restores
    // =========================================================================

    /// Names of all configured storage locations
    pub async fn list_storage_locations(&self) -> Result<Vec<String>> {
        let list: ObjectList<BackupStorageLocation> = self
            .typed(Verb::Get, "backupstoragelocations", &[], None)
            .await?;
        Ok(list
            .items
            .iter()
            .map(|l| l.name().to_string())
            .filter(|n| !n.is_empty())
            .collect())
    }

    pub async fn create_restore(&self, restore: &Restore) -> Result<Restore> {
        self.create("restores", restore).await
    }
}

/// A 404 carrying a Status that names the object means the object is gone;
/// anything else means the resource type itself is not served.
fn not_found(response: &ApiResponse) -> Error {
    let named = serde_json::from_slice::<Status>(&response.body)
        .ok()
        .and_then(|s| s.details)
        .and_then(|d| {
            let name = d.name.filter(|n| !n.is_empty())?;
            Some((d.kind.unwrap_or_default(), name))
        });

    match named {
        Some((kind, name)) => Error::ResourceNotFound { kind, name },
        None => Error::ControllerNotInstalled,
    }
}
