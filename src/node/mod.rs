//! Node maintenance
//!
//! - `drain`: cordon a node and evict its pods in ordered waves
//! - `purge`: delete a node and clean up its storage and control-plane leftovers

pub mod drain;
pub mod purge;

pub use drain::{should_drain, DrainConfig, DrainOutcome, DrainWave, NodeDrainer};
pub use purge::{NodePurger, PurgeConfig, PurgeReport};
