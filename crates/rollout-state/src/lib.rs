//! Rollout-State: durable state for the edge rollout engine
//!
//! A deployment must survive orchestrator restarts. This crate owns the
//! shape of everything persisted across such a restart: the resume token
//! (deployment stage and rollback markers), the bootstrap task plan, the
//! configuration snapshots used for commit and rollback, and the
//! unacknowledged deployment status records.
//!
//! ## Backends
//!
//! - `fakes`: in-memory stores with write-failure injection (tests)
//! - `DeploymentDirectory`: JSON files under a deployment directory
//! - `SurrealRolloutStore`: SurrealDB (`mem://`, `surrealkv://`, remote)

mod directory;
mod error;
pub mod fakes;
pub mod migrations;
pub mod storage_traits;
pub mod surreal_store;

pub use directory::DeploymentDirectory;
pub use error::{StateError, StorageError};
pub use storage_traits::{
    BootstrapTaskStatus, ConfigSnapshot, ContentDigest, Deployment, DeploymentStage,
    DeploymentType, ExecutionStatus, JobStatus, PersistedStatusRecord, ResumeStore, ResumeToken,
    RollbackMarkers, SnapshotKind, SnapshotStore, StatusStore, StatusUpdate, StorageResult,
};
pub use surreal_store::SurrealRolloutStore;

/// Result type for rollout-state setup operations
pub type Result<T> = std::result::Result<T, StateError>;
