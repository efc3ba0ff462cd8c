//! Backup controller integration
//!
//! - `client`: typed custom resource client with status-code classification
//! - `names`: DNS label canonicalization for generated names
//! - `logs`: gzip + logfmt log bundle parser
//! - `download`: DownloadRequest handshake for log bundles

pub mod client;
pub mod download;
pub mod logs;
pub mod names;

pub use client::{VeleroClient, DEFAULT_VELERO_NAMESPACE};
pub use download::{DownloadConfig, DownloadState, LogRetriever};
pub use logs::{LogParser, LogRecord};
pub use names::canonicalize;
