//! Storage trait definitions for the rollout engine
//!
//! These traits define the durable state a deployment needs to survive an
//! orchestrator restart:
//! - `StatusStore`: not-yet-acknowledged deployment outcomes
//! - `ResumeStore`: the resume token (stage, rollback markers) and the
//!   bootstrap task plan
//! - `SnapshotStore`: baseline, rollback and target configuration snapshots
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// Deployment records
// ---------------------------------------------------------------------------

/// Source that issued a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentType {
    CloudJob,
    LocalRequest,
}

impl DeploymentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentType::CloudJob => "CLOUD_JOB",
            DeploymentType::LocalRequest => "LOCAL_REQUEST",
        }
    }

    /// Parse the persisted string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CLOUD_JOB" => Some(DeploymentType::CloudJob),
            "LOCAL_REQUEST" => Some(DeploymentType::LocalRequest),
            _ => None,
        }
    }
}

impl std::fmt::Display for DeploymentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position of a deployment in the activation protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentStage {
    #[default]
    Default,
    KernelActivation,
    KernelRollback,
    Bootstrap,
}

impl DeploymentStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStage::Default => "DEFAULT",
            DeploymentStage::KernelActivation => "KERNEL_ACTIVATION",
            DeploymentStage::KernelRollback => "KERNEL_ROLLBACK",
            DeploymentStage::Bootstrap => "BOOTSTRAP",
        }
    }
}

impl std::fmt::Display for DeploymentStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of rollout work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    /// Job id or locally generated id
    pub id: String,
    pub deployment_type: DeploymentType,
    /// Serialized deployment document, interpreted by the resolver
    pub document: String,
    pub stage: DeploymentStage,
    /// Failure or progress reason recorded along the way
    pub stage_details: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// True when this entry asks to cancel the active deployment
    #[serde(default)]
    pub is_cancelled: bool,
}

impl Deployment {
    /// Create a fresh `DEFAULT`-stage deployment.
    pub fn new(
        id: impl Into<String>,
        deployment_type: DeploymentType,
        document: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            deployment_type,
            document: document.into(),
            stage: DeploymentStage::Default,
            stage_details: None,
            timestamp: Utc::now(),
            is_cancelled: false,
        }
    }

    /// Create a cancellation request carrying its own `id`.
    pub fn cancellation(id: impl Into<String>, deployment_type: DeploymentType) -> Self {
        Self {
            is_cancelled: true,
            ..Self::new(id, deployment_type, String::new())
        }
    }

    /// Return a copy resumed at `stage`.
    pub fn at_stage(mut self, stage: DeploymentStage) -> Self {
        self.stage = stage;
        self
    }
}

/// Rollback bookkeeping persisted alongside the stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RollbackMarkers {
    /// Rollback snapshot confirmed and restart into it requested
    pub prepared: bool,
    /// Revert attempt finished, whatever its outcome
    pub completed: bool,
    /// The finished revert brought the tracked services back
    #[serde(default)]
    pub recovered: bool,
}

/// Everything the orchestrator reads at startup to resume a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeToken {
    pub deployment: Deployment,
    /// When the current stage began; services broken before this are stale
    pub stage_entered_at: DateTime<Utc>,
    #[serde(default)]
    pub rollback: RollbackMarkers,
    /// Failed attempts to commit the target as the new baseline
    #[serde(default)]
    pub commit_attempts: u32,
}

impl ResumeToken {
    pub fn new(deployment: Deployment) -> Self {
        Self {
            deployment,
            stage_entered_at: Utc::now(),
            rollback: RollbackMarkers::default(),
            commit_attempts: 0,
        }
    }

    pub fn stage(&self) -> DeploymentStage {
        self.deployment.stage
    }

    /// Move to `stage`, resetting the stage clock.
    pub fn advance(&mut self, stage: DeploymentStage) {
        self.deployment.stage = stage;
        self.stage_entered_at = Utc::now();
    }
}

// ---------------------------------------------------------------------------
// Bootstrap tasks
// ---------------------------------------------------------------------------

/// Execution status of one bootstrap task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    Done,
}

/// One entry of the durable bootstrap plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapTaskStatus {
    pub service_name: String,
    pub execution_status: ExecutionStatus,
    pub exit_code: Option<i32>,
}

impl BootstrapTaskStatus {
    pub fn pending(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            execution_status: ExecutionStatus::Pending,
            exit_code: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.execution_status == ExecutionStatus::Pending
    }
}

// ---------------------------------------------------------------------------
// StatusStore: unacknowledged deployment outcomes
// ---------------------------------------------------------------------------

/// Job-level status reported to the requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    InProgress,
    Succeeded,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::InProgress => "IN_PROGRESS",
            JobStatus::Succeeded => "SUCCEEDED",
            JobStatus::Failed => "FAILED",
            JobStatus::Canceled => "CANCELED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::InProgress)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A deployment outcome waiting to be persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub deployment_id: String,
    pub deployment_type: DeploymentType,
    pub job_status: JobStatus,
    pub status_details: BTreeMap<String, String>,
}

/// A deployment outcome that has not been acknowledged by its consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedStatusRecord {
    /// Store-assigned, strictly increasing; defines delivery order
    pub seq: u64,
    pub update: StatusUpdate,
    pub recorded_at: DateTime<Utc>,
}

/// Durable queue of unacknowledged deployment outcomes.
///
/// Guarantees:
/// - `append` assigns a `seq` greater than every `seq` it returned before.
/// - `pending` returns records of one type in ascending `seq` order.
/// - `remove` of an absent `seq` is a no-op.
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Persist an outcome and return the stored record.
    async fn append(&self, update: StatusUpdate) -> StorageResult<PersistedStatusRecord>;

    /// All still-persisted records of `deployment_type`, oldest first.
    async fn pending(
        &self,
        deployment_type: DeploymentType,
    ) -> StorageResult<Vec<PersistedStatusRecord>>;

    /// Delete an acknowledged record.
    async fn remove(&self, seq: u64) -> StorageResult<()>;
}

// ---------------------------------------------------------------------------
// ResumeStore: stage, rollback markers and bootstrap plan
// ---------------------------------------------------------------------------

/// Durable resume state for the single in-flight deployment.
#[async_trait]
pub trait ResumeStore: Send + Sync {
    /// Replace the persisted resume token.
    async fn save_token(&self, token: &ResumeToken) -> StorageResult<()>;

    /// Read the persisted resume token, if any.
    async fn load_token(&self) -> StorageResult<Option<ResumeToken>>;

    /// Remove the resume token. No-op if absent.
    async fn clear_token(&self) -> StorageResult<()>;

    /// Replace the persisted bootstrap plan.
    async fn save_bootstrap_tasks(&self, tasks: &[BootstrapTaskStatus]) -> StorageResult<()>;

    /// Read the persisted bootstrap plan. Empty when none was saved.
    async fn load_bootstrap_tasks(&self) -> StorageResult<Vec<BootstrapTaskStatus>>;

    /// Remove the bootstrap plan. No-op if absent.
    async fn clear_bootstrap_tasks(&self) -> StorageResult<()>;
}

// ---------------------------------------------------------------------------
// SnapshotStore: configuration baselines
// ---------------------------------------------------------------------------

/// Content digest (SHA-256 hex string).
///
/// The inner field is private so the string is always lowercase hex
/// produced by `from_bytes` or validated via `TryFrom<String>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Compute the SHA-256 digest of the given bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::Digest;
        let mut hasher = Sha256::new();
        hasher.update(data);
        ContentDigest(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidDigest { digest: s });
        }
        Ok(ContentDigest(s.to_ascii_lowercase()))
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role a configuration snapshot plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotKind {
    /// Last committed configuration
    Baseline,
    /// Configuration to revert to if activation fails
    Rollback,
    /// Configuration being activated
    Target,
}

impl SnapshotKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotKind::Baseline => "baseline",
            SnapshotKind::Rollback => "rollback",
            SnapshotKind::Target => "target",
        }
    }
}

impl std::fmt::Display for SnapshotKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A digest-stamped configuration snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub kind: SnapshotKind,
    pub digest: ContentDigest,
    pub taken_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl ConfigSnapshot {
    /// Stamp `payload` with its digest.
    pub fn new(kind: SnapshotKind, payload: serde_json::Value) -> StorageResult<Self> {
        let digest = Self::digest_of(&payload)?;
        Ok(Self {
            kind,
            digest,
            taken_at: Utc::now(),
            payload,
        })
    }

    fn digest_of(payload: &serde_json::Value) -> StorageResult<ContentDigest> {
        let bytes = serde_json::to_vec(payload)?;
        Ok(ContentDigest::from_bytes(&bytes))
    }

    /// Recompute the digest and compare with the recorded one.
    pub fn verify(&self) -> StorageResult<()> {
        let actual = Self::digest_of(&self.payload)?;
        if actual != self.digest {
            return Err(StorageError::DigestMismatch {
                kind: self.kind.to_string(),
                expected: self.digest.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(())
    }

    /// Same payload and digest under another role.
    pub fn relabel(&self, kind: SnapshotKind) -> Self {
        Self {
            kind,
            ..self.clone()
        }
    }
}

/// Store of configuration snapshots keyed by [`SnapshotKind`].
///
/// Guarantees:
/// - `read_snapshot` verifies the digest and fails with
///   `StorageError::DigestMismatch` on corruption.
/// - `promote(from, to)` fails with `StorageError::NotFound` if `from` is
///   absent and otherwise leaves `from` in place.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Replace the snapshot of `snapshot.kind`.
    async fn write_snapshot(&self, snapshot: &ConfigSnapshot) -> StorageResult<()>;

    /// Read the snapshot of `kind`, if any.
    async fn read_snapshot(&self, kind: SnapshotKind) -> StorageResult<Option<ConfigSnapshot>>;

    /// Copy the snapshot of `from` into the slot `to`.
    async fn promote(&self, from: SnapshotKind, to: SnapshotKind) -> StorageResult<()>;

    /// Delete the snapshot of `kind`. No-op if absent.
    async fn delete_snapshot(&self, kind: SnapshotKind) -> StorageResult<()>;
}
