//! Log bundle retrieval via DownloadRequest
//!
//! The controller hands out signed URLs for log bundles through a handshake:
//! create a DownloadRequest, poll it until `status.downloadURL` appears, then
//! delete it and GET the URL. The poll is a small state machine so attempts,
//! timeouts and cancellation can be exercised without a wall clock.

use bytes::Bytes;
use chrono::Utc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::client::VeleroClient;
use super::names::canonicalize;
use crate::crd::{DownloadRequest, DownloadTargetKind};
use crate::domain::{BlobFetcherRef, SleeperRef};
use crate::error::{Error, Result};

/// Poll budget for download URLs
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Delay between polls
    pub poll_interval: Duration,
    /// Total number of polls before giving up
    pub max_attempts: u32,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            max_attempts: 30,
        }
    }
}

impl DownloadConfig {
    /// Upper bound on how long a retrieval can poll
    pub fn budget(&self) -> Duration {
        self.poll_interval * self.max_attempts
    }
}

/// Where a retrieval stands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadState {
    Requesting,
    Polling { attempt: u32 },
    Ready(String),
    TimedOut { attempts: u32 },
    Cancelled,
}

/// Fetches log bundles for backups and restores
#[derive(Clone)]
pub struct LogRetriever {
    velero: VeleroClient,
    fetcher: BlobFetcherRef,
    sleeper: SleeperRef,
    config: DownloadConfig,
}

impl LogRetriever {
    pub fn new(
        velero: VeleroClient,
        fetcher: BlobFetcherRef,
        sleeper: SleeperRef,
        config: DownloadConfig,
    ) -> Self {
        Self {
            velero,
            fetcher,
            sleeper,
            config,
        }
    }

    pub fn config(&self) -> &DownloadConfig {
        &self.config
    }

    /// Resolve a signed URL for `target`'s logs
    #[instrument(skip(self, cancel))]
    pub async fn get_logs_url(
        &self,
        kind: DownloadTargetKind,
        target: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let name = request_name(kind, target, Utc::now().timestamp());
        let mut state = DownloadState::Requesting;

        loop {
            state = match state {
                DownloadState::Requesting => {
                    if cancel.is_cancelled() {
                        return Err(cancelled(kind, target));
                    }
                    let request =
                        DownloadRequest::new(&name, self.velero.namespace(), kind, target);
                    let created = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        result = self.velero.create_download_request(&request) => Some(result),
                    };
                    match created {
                        Some(Ok(_)) => {
                            debug!(request = %name, "created download request");
                            DownloadState::Polling { attempt: 1 }
                        }
                        Some(Err(e)) => return Err(e),
                        None => DownloadState::Cancelled,
                    }
                }

                DownloadState::Polling { attempt } => {
                    let polled = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        result = self.velero.get_download_request(&name) => Some(result),
                    };
                    match polled {
                        None => DownloadState::Cancelled,
                        Some(Err(e)) => {
                            self.cleanup(&name).await;
                            return Err(e);
                        }
                        Some(Ok(request)) => match request.download_url() {
                            Some(url) => DownloadState::Ready(url.to_string()),
                            None if attempt >= self.config.max_attempts => {
                                DownloadState::TimedOut { attempts: attempt }
                            }
                            None => {
                                let waited = tokio::select! {
                                    biased;
                                    _ = cancel.cancelled() => false,
                                    _ = self.sleeper.sleep(self.config.poll_interval) => true,
                                };
                                if waited {
                                    DownloadState::Polling {
                                        attempt: attempt + 1,
                                    }
                                } else {
                                    DownloadState::Cancelled
                                }
                            }
                        },
                    }
                }

                DownloadState::Ready(url) => {
                    self.cleanup(&name).await;
                    return Ok(url);
                }

                DownloadState::TimedOut { attempts } => {
                    warn!(request = %name, attempts, "download URL never became available");
                    self.cleanup(&name).await;
                    return Err(Error::DownloadTimeout {
                        kind: kind.to_string(),
                        target: target.to_string(),
                        attempts,
                    });
                }

                DownloadState::Cancelled => {
                    info!(request = %name, "log download cancelled");
                    let velero = self.velero.clone();
                    let name = name.clone();
                    tokio::spawn(async move {
                        if let Err(e) = velero.delete_download_request(&name).await {
                            warn!(request = %name, error = %e, "failed to clean up download request");
                        }
                    });
                    return Err(cancelled(kind, target));
                }
            };
        }
    }

    /// Fetch the gzip log bundle for `target`
    pub async fn fetch_logs(
        &self,
        kind: DownloadTargetKind,
        target: &str,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        let url = self.get_logs_url(kind, target, cancel).await?;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(cancelled(kind, target)),
            blob = self.fetcher.fetch(&url) => blob,
        }
    }

    async fn cleanup(&self, name: &str) {
        if let Err(e) = self.velero.delete_download_request(name).await {
            warn!(request = %name, error = %e, "failed to clean up download request");
        }
    }
}

fn cancelled(kind: DownloadTargetKind, target: &str) -> Error {
    Error::DownloadCancelled {
        kind: kind.to_string(),
        target: target.to_string(),
    }
}

/// Name of the DownloadRequest created for `target` at `unix` seconds
pub fn request_name(kind: DownloadTargetKind, target: &str, unix: i64) -> String {
    let prefix = match kind {
        DownloadTargetKind::BackupLog => "backup",
        DownloadTargetKind::RestoreLog => "restore",
    };
    canonicalize(&format!("{}-{}-{}", prefix, target, unix))
}
