//! Cluster adapter backed by a `kube::Client`

use async_trait::async_trait;
use hyper::Body;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::domain::{ApiRequest, ApiResponse, ClusterApi, ExecOutput, Verb};
use crate::error::{Error, Result};

/// Default bound on a single API round trip
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// `ClusterApi` over the cluster's own REST API
#[derive(Clone)]
pub struct KubeCluster {
    client: kube::Client,
    timeout: Duration,
}

impl KubeCluster {
    pub fn new(client: kube::Client) -> Self {
        Self {
            client,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn build(&self, request: &ApiRequest) -> Result<hyper::Request<Body>> {
        let method = match request.verb {
            Verb::Get => hyper::Method::GET,
            Verb::Post => hyper::Method::POST,
            Verb::Put => hyper::Method::PUT,
            Verb::Patch => hyper::Method::PATCH,
            Verb::Delete => hyper::Method::DELETE,
        };

        let mut builder = hyper::Request::builder()
            .method(method)
            .uri(request.uri())
            .header(hyper::header::ACCEPT, "application/json");
        if let Some(content_type) = request.content_type() {
            builder = builder.header(hyper::header::CONTENT_TYPE, content_type);
        }

        let body = request.body.clone().map(Body::from).unwrap_or_else(Body::empty);
        builder
            .body(body)
            .map_err(|e| Error::Internal(format!("Failed to build request: {}", e)))
    }

    async fn round_trip(&self, request: hyper::Request<Body>) -> Result<ApiResponse> {
        let response = self.client.send(request).await?;
        let status = response.status().as_u16();
        let body = hyper::body::to_bytes(response.into_body()).await?;
        Ok(ApiResponse::new(status, body))
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse> {
        let operation = format!("{} {}", request.verb, request.path);
        debug!(request = %operation, "sending cluster request");

        let http_request = self.build(&request)?;
        match tokio::time::timeout(self.timeout, self.round_trip(http_request)).await {
            Ok(response) => response,
            Err(_) => Err(Error::Timeout {
                operation,
                after: self.timeout,
            }),
        }
    }

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        container: Option<&str>,
        command: Vec<String>,
    ) -> Result<ExecOutput> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = AttachParams {
            container: container.map(str::to_string),
            stdin: false,
            stdout: true,
            stderr: true,
            tty: false,
            ..Default::default()
        };

        let run = async {
            let mut attached = pods.exec(pod, command, &params).await?;

            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            let out = attached.stdout();
            let err = attached.stderr();
            let read_out = async {
                match out {
                    Some(mut r) => r.read_to_end(&mut stdout).await.map(|_| ()),
                    None => Ok(()),
                }
            };
            let read_err = async {
                match err {
                    Some(mut r) => r.read_to_end(&mut stderr).await.map(|_| ()),
                    None => Ok(()),
                }
            };
            let (o, e) = tokio::join!(read_out, read_err);
            o?;
            e?;

            let success = match attached.take_status() {
                Some(status) => status
                    .await
                    .and_then(|s| s.status)
                    .map(|s| s == "Success")
                    .unwrap_or(false),
                None => false,
            };
            if !success {
                warn!(namespace = %namespace, pod = %pod, "command exited with non-success status");
            }

            Ok::<_, Error>(ExecOutput {
                stdout: String::from_utf8_lossy(&stdout).into_owned(),
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
                success,
            })
        };

        match tokio::time::timeout(self.timeout, run).await {
            Ok(output) => output,
            Err(_) => Err(Error::Timeout {
                operation: format!("exec in {}/{}", namespace, pod),
                after: self.timeout,
            }),
        }
    }
}
