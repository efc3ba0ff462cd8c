//! Domain layer - Port definitions and derived view types
//!
//! This module defines the core traits (ports) that adapters implement,
//! following hexagonal architecture principles, and the snapshot views the
//! reconciler produces.

pub mod ports;
pub mod snapshot;

pub use ports::*;
pub use snapshot::*;
