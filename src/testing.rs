//! Test doubles for the domain ports
//!
//! `FakeCluster` answers requests from per-route closures and records what it
//! was asked, `NoWaitSleeper` counts sleeps without waiting, and
//! `StaticFetcher` serves blobs from memory.

use async_trait::async_trait;
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::domain::{
    ApiRequest, ApiResponse, AppInfo, AppStore, BlobFetcher, ClusterApi, ExecOutput, Sleeper,
    TemplateRenderer, Verb,
};
use crate::error::{Error, Result};

type Route = Box<dyn Fn(&ApiRequest) -> ApiResponse + Send + Sync>;
type ExecHandler = Box<dyn Fn(&ExecCall) -> Result<ExecOutput> + Send + Sync>;

/// One recorded exec
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecCall {
    pub namespace: String,
    pub pod: String,
    pub container: Option<String>,
    pub command: Vec<String>,
}

/// Scripted cluster API
///
/// Unrouted requests get a bare 404.
#[derive(Default)]
pub struct FakeCluster {
    routes: Mutex<HashMap<(Verb, String), Route>>,
    prefix_routes: Mutex<Vec<(Verb, String, Route)>>,
    exec_handler: Mutex<Option<ExecHandler>>,
    requests: Mutex<Vec<ApiRequest>>,
    execs: Mutex<Vec<ExecCall>>,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answer `verb path` with `handler`, replacing any earlier route
    pub fn respond<F>(&self, verb: Verb, path: &str, handler: F)
    where
        F: Fn(&ApiRequest) -> ApiResponse + Send + Sync + 'static,
    {
        self.routes
            .lock()
            .unwrap()
            .insert((verb, path.to_string()), Box::new(handler));
    }

    /// Answer any `verb` request whose path starts with `prefix`
    ///
    /// Exact routes win over prefix routes.
    pub fn respond_prefix<F>(&self, verb: Verb, prefix: &str, handler: F)
    where
        F: Fn(&ApiRequest) -> ApiResponse + Send + Sync + 'static,
    {
        self.prefix_routes
            .lock()
            .unwrap()
            .push((verb, prefix.to_string(), Box::new(handler)));
    }

    /// Answer `verb path` with a fixed JSON body
    pub fn respond_json(&self, verb: Verb, path: &str, status: u16, body: serde_json::Value) {
        let body = body.to_string();
        self.respond(verb, path, move |_| ApiResponse::new(status, body.clone()));
    }

    pub fn on_exec<F>(&self, handler: F)
    where
        F: Fn(&ExecCall) -> Result<ExecOutput> + Send + Sync + 'static,
    {
        *self.exec_handler.lock().unwrap() = Some(Box::new(handler));
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Number of requests sent to `verb path`
    pub fn count(&self, verb: Verb, path: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.verb == verb && r.path == path)
            .count()
    }

    /// Bodies sent to `verb path`, parsed as JSON
    pub fn bodies(&self, verb: Verb, path: &str) -> Vec<serde_json::Value> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.verb == verb && r.path == path)
            .filter_map(|r| r.body.as_ref())
            .map(|b| serde_json::from_slice(b).unwrap())
            .collect()
    }

    pub fn execs(&self) -> Vec<ExecCall> {
        self.execs.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(handler) = self
            .routes
            .lock()
            .unwrap()
            .get(&(request.verb, request.path.clone()))
        {
            return Ok(handler(&request));
        }
        let prefixes = self.prefix_routes.lock().unwrap();
        Ok(prefixes
            .iter()
            .find(|(verb, prefix, _)| *verb == request.verb && request.path.starts_with(prefix))
            .map(|(_, _, handler)| handler(&request))
            .unwrap_or_else(|| ApiResponse::new(404, "")))
    }

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: Option<&str>,
        command: Vec<String>,
    ) -> Result<ExecOutput> {
        let call = ExecCall {
            namespace: namespace.to_string(),
            pod: pod.to_string(),
            container: container.map(str::to_string),
            command,
        };
        self.execs.lock().unwrap().push(call.clone());
        match self.exec_handler.lock().unwrap().as_ref() {
            Some(handler) => handler(&call),
            None => Ok(ExecOutput {
                success: true,
                ..Default::default()
            }),
        }
    }
}

/// Sleeper that returns immediately and remembers what it was asked
#[derive(Default)]
pub struct NoWaitSleeper {
    slept: Mutex<Vec<Duration>>,
}

impl NoWaitSleeper {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sleeps(&self) -> usize {
        self.slept.lock().unwrap().len()
    }
}

#[async_trait]
impl Sleeper for NoWaitSleeper {
    async fn sleep(&self, duration: Duration) {
        self.slept.lock().unwrap().push(duration);
        tokio::task::yield_now().await;
    }
}

/// In-memory blob fetcher keyed by URL
#[derive(Default)]
pub struct StaticFetcher {
    blobs: Mutex<HashMap<String, Bytes>>,
    fetched: Mutex<Vec<String>>,
}

impl StaticFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, url: &str, blob: impl Into<Bytes>) {
        self.blobs
            .lock()
            .unwrap()
            .insert(url.to_string(), blob.into());
    }

    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }
}

#[async_trait]
impl BlobFetcher for StaticFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes> {
        self.fetched.lock().unwrap().push(url.to_string());
        self.blobs
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| Error::Internal(format!("no blob at {}", url)))
    }
}

/// Application store backed by a fixed list
pub struct FixedApps(pub Vec<AppInfo>);

#[async_trait]
impl AppStore for FixedApps {
    async fn get_app(&self, app_id: &str) -> Result<AppInfo> {
        self.0
            .iter()
            .find(|a| a.id == app_id)
            .cloned()
            .ok_or_else(|| Error::AppNotFound {
                app_id: app_id.to_string(),
            })
    }
}

/// Renderer that returns the template unchanged
pub struct PassThrough;

#[async_trait]
impl TemplateRenderer for PassThrough {
    async fn render(&self, _app: &AppInfo, template: &str) -> Result<String> {
        Ok(template.to_string())
    }
}

/// Gzip `text` the way the controller stores log bundles
pub fn gzip(text: &str) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(text.as_bytes()).unwrap();
    encoder.finish().unwrap()
}
