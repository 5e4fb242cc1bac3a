//! knowledge-sync Library
//!
//! Peer-to-peer replication of knowledge-graph changes. Exposed as a library
//! for embedding and for the integration tests.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod config;
pub mod infrastructure;
pub mod replication;

// Re-export commonly used types
pub use config::{load_config, NodeConfig};
pub use infrastructure::ShutdownController;
pub use replication::{
    HealthReport, InMemoryReplica, MergeCollaborator, OperationPayload, SyncConfig, SyncCoordinator,
    SyncError, SyncEvent, SyncStats,
};
