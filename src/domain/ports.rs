//! Domain Ports - Core trait definitions for the orchestrator
//!
//! These traits define the boundaries between reconciliation logic and the
//! cluster, the signed-URL download endpoint, the clock, and the
//! application store. Adapters implement them; tests substitute fakes.

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Cluster Requests
// =============================================================================

/// HTTP verb for a cluster API request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    Post,
    Put,
    /// JSON merge patch
    Patch,
    Delete,
}

impl std::fmt::Display for Verb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verb::Get => write!(f, "GET"),
            Verb::Post => write!(f, "POST"),
            Verb::Put => write!(f, "PUT"),
            Verb::Patch => write!(f, "PATCH"),
            Verb::Delete => write!(f, "DELETE"),
        }
    }
}

/// Request against the cluster's REST API
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub verb: Verb,
    /// Absolute API path, e.g. `/api/v1/nodes/node-1`
    pub path: String,
    /// Query parameters, unencoded
    pub query: Vec<(String, String)>,
    /// JSON body
    pub body: Option<Vec<u8>>,
}

impl ApiRequest {
    pub fn new(verb: Verb, path: impl Into<String>) -> Self {
        Self {
            verb,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Verb::Get, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Verb::Delete, path)
    }

    /// Merge `patch` into the object at `path`
    pub fn merge_patch(path: impl Into<String>, patch: &serde_json::Value) -> Result<Self> {
        Self::new(Verb::Patch, path).json(patch)
    }

    /// Content type of the body, if there is one
    pub fn content_type(&self) -> Option<&'static str> {
        self.body.as_ref().map(|_| match self.verb {
            Verb::Patch => "application/merge-patch+json",
            _ => "application/json",
        })
    }

    /// Add a query parameter
    pub fn query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.push((key.to_string(), value.into()));
        self
    }

    /// Attach a JSON body
    pub fn json<T: Serialize>(mut self, body: &T) -> Result<Self> {
        self.body = Some(serde_json::to_vec(body)?);
        Ok(self)
    }

    /// Value of a query parameter, if set
    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Path plus percent-encoded query string
    pub fn uri(&self) -> String {
        if self.query.is_empty() {
            return self.path.clone();
        }
        let query = self
            .query
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        format!("{}?{}", self.path, query)
    }
}

/// Raw response from the cluster's REST API
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Bytes,
}

impl ApiResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Deserialize the body as JSON
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Output of a command executed inside a container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    /// Whether the remote process reported success
    pub success: bool,
}

// =============================================================================
// Cluster Port
// =============================================================================

/// Port for the cluster resource API
///
/// Deliberately untyped at the HTTP level: callers interpret status codes
/// themselves because each controller maps them differently.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Send a request and return the raw status and body
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse>;

    /// Execute a command in a pod container
    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: Option<&str>,
        command: Vec<String>,
    ) -> Result<ExecOutput>;
}

// =============================================================================
// Download and Clock Ports
// =============================================================================

/// Port for plain HTTP GETs against signed download URLs
#[async_trait]
pub trait BlobFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Bytes>;
}

/// Port for waiting between polls
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

// =============================================================================
// Application Ports
// =============================================================================

/// Application as seen by the snapshot layer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppInfo {
    pub id: String,
    pub slug: String,
    /// Currently deployed sequence
    pub sequence: i64,
    /// Raw backup spec template, user values already included
    #[serde(default)]
    pub backup_spec: String,
}

/// Port for looking up applications
#[async_trait]
pub trait AppStore: Send + Sync {
    async fn get_app(&self, app_id: &str) -> Result<AppInfo>;
}

/// Port for rendering an application's backup spec template
#[async_trait]
pub trait TemplateRenderer: Send + Sync {
    async fn render(&self, app: &AppInfo, template: &str) -> Result<String>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type ClusterApiRef = Arc<dyn ClusterApi>;
pub type BlobFetcherRef = Arc<dyn BlobFetcher>;
pub type SleeperRef = Arc<dyn Sleeper>;
pub type AppStoreRef = Arc<dyn AppStore>;
pub type TemplateRendererRef = Arc<dyn TemplateRenderer>;
