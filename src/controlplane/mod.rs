//! Control Plane Module
//!
//! The orchestrator facade, its Prometheus metrics, and the REST API
//! in front of them.

pub mod api;
pub mod metrics;
pub mod orchestrator;

pub use api::*;
pub use metrics::Metrics;
pub use orchestrator::{Adapters, Orchestrator, OrchestratorConfig};
