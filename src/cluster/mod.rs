//! Adapters for the domain ports
//!
//! - `kubernetes`: cluster REST API and pod exec through `kube::Client`
//! - `http`: signed-URL downloads through reqwest
//! - the clock, a file-backed application store and a pass-through
//!   template renderer live here

pub mod http;
pub mod kubernetes;

pub use self::http::HttpBlobFetcher;
pub use self::kubernetes::{KubeCluster, DEFAULT_REQUEST_TIMEOUT};

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::domain::{AppInfo, AppStore, Sleeper, TemplateRenderer};
use crate::error::{Error, Result};

/// Real-time sleeper
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Applications loaded from a YAML list
#[derive(Debug, Clone, Default)]
pub struct FileAppStore {
    apps: Vec<AppInfo>,
}

impl FileAppStore {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await?;
        let store = Self::from_yaml(&raw)?;
        info!(path = %path.display(), apps = store.apps.len(), "loaded applications");
        Ok(store)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let apps: Option<Vec<AppInfo>> = serde_yaml::from_str(raw)?;
        Ok(Self {
            apps: apps.unwrap_or_default(),
        })
    }
}

#[async_trait]
impl AppStore for FileAppStore {
    async fn get_app(&self, app_id: &str) -> Result<AppInfo> {
        self.apps
            .iter()
            .find(|a| a.id == app_id || a.slug == app_id)
            .cloned()
            .ok_or_else(|| Error::AppNotFound {
                app_id: app_id.to_string(),
            })
    }
}

/// Renderer for templates that carry no template directives
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityRenderer;

#[async_trait]
impl TemplateRenderer for IdentityRenderer {
    async fn render(&self, _app: &AppInfo, template: &str) -> Result<String> {
        Ok(template.to_string())
    }
}
