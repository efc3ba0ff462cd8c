//! API Module
//!
//! REST surface for snapshot and node maintenance operations.

pub mod rest;
pub mod server;

pub use rest::{ApiErrorResponse, CreateSnapshotRequest, CreatedResponse, RestRouter};
pub use server::{ApiServer, ApiServerConfig};
