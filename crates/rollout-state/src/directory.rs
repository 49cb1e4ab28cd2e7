//! Filesystem-backed deployment directory.
//!
//! Layout:
//! ```text
//! <root>/resume_token.json
//! <root>/bootstrap_tasks.json
//! <root>/snapshots/<kind>.json
//! <root>/status/<seq, 20 digits>.json
//! ```
//!
//! Every file is written to a temp file in the same directory and renamed
//! into place, so a crash never leaves a torn record behind.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::{StateError, StorageError};
use crate::storage_traits::*;

const RESUME_TOKEN_FILE: &str = "resume_token.json";
const BOOTSTRAP_TASKS_FILE: &str = "bootstrap_tasks.json";
const SNAPSHOTS_DIR: &str = "snapshots";
const STATUS_DIR: &str = "status";

/// Deployment state kept as JSON files under one root directory.
#[derive(Debug)]
pub struct DeploymentDirectory {
    root: PathBuf,
    /// Serializes seq assignment within this process
    status_lock: Mutex<()>,
}

impl DeploymentDirectory {
    /// Open (creating if needed) a deployment directory rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> crate::Result<Self> {
        let root = root.as_ref().to_path_buf();
        for dir in [root.clone(), root.join(SNAPSHOTS_DIR), root.join(STATUS_DIR)] {
            fs::create_dir_all(&dir).map_err(|e| StateError::Directory {
                path: dir.display().to_string(),
                reason: e.to_string(),
            })?;
        }
        debug!(root = %root.display(), "deployment directory opened");
        Ok(Self {
            root,
            status_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn snapshot_path(&self, kind: SnapshotKind) -> PathBuf {
        self.root
            .join(SNAPSHOTS_DIR)
            .join(format!("{}.json", kind.as_str()))
    }

    fn status_path(&self, seq: u64) -> PathBuf {
        self.root.join(STATUS_DIR).join(format!("{seq:020}.json"))
    }

    fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> StorageResult<()> {
        let dir = path
            .parent()
            .ok_or_else(|| StorageError::Backend(format!("no parent for {}", path.display())))?;
        let bytes = serde_json::to_vec_pretty(value)?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    fn read_json<T: DeserializeOwned>(path: &Path) -> StorageResult<Option<T>> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn remove_file(path: &Path) -> StorageResult<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// All status records on disk, sorted by seq.
    fn status_records(&self) -> StorageResult<Vec<PersistedStatusRecord>> {
        let mut records = Vec::new();
        for entry in fs::read_dir(self.root.join(STATUS_DIR))? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read_json::<PersistedStatusRecord>(&path) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable status record"),
            }
        }
        records.sort_by_key(|r| r.seq);
        Ok(records)
    }
}

#[async_trait]
impl StatusStore for DeploymentDirectory {
    async fn append(&self, update: StatusUpdate) -> StorageResult<PersistedStatusRecord> {
        let _guard = self
            .status_lock
            .lock()
            .map_err(|_| StorageError::Backend("status lock poisoned".to_string()))?;
        let seq = self
            .status_records()?
            .last()
            .map(|r| r.seq + 1)
            .unwrap_or(1);
        let record = PersistedStatusRecord {
            seq,
            update,
            recorded_at: Utc::now(),
        };
        Self::write_json(&self.status_path(seq), &record)?;
        Ok(record)
    }

    async fn pending(
        &self,
        deployment_type: DeploymentType,
    ) -> StorageResult<Vec<PersistedStatusRecord>> {
        Ok(self
            .status_records()?
            .into_iter()
            .filter(|r| r.update.deployment_type == deployment_type)
            .collect())
    }

    async fn remove(&self, seq: u64) -> StorageResult<()> {
        Self::remove_file(&self.status_path(seq))
    }
}

#[async_trait]
impl ResumeStore for DeploymentDirectory {
    async fn save_token(&self, token: &ResumeToken) -> StorageResult<()> {
        Self::write_json(&self.root.join(RESUME_TOKEN_FILE), token)
    }

    async fn load_token(&self) -> StorageResult<Option<ResumeToken>> {
        Self::read_json(&self.root.join(RESUME_TOKEN_FILE))
    }

    async fn clear_token(&self) -> StorageResult<()> {
        Self::remove_file(&self.root.join(RESUME_TOKEN_FILE))
    }

    async fn save_bootstrap_tasks(&self, tasks: &[BootstrapTaskStatus]) -> StorageResult<()> {
        Self::write_json(&self.root.join(BOOTSTRAP_TASKS_FILE), tasks)
    }

    async fn load_bootstrap_tasks(&self) -> StorageResult<Vec<BootstrapTaskStatus>> {
        Ok(Self::read_json(&self.root.join(BOOTSTRAP_TASKS_FILE))?.unwrap_or_default())
    }

    async fn clear_bootstrap_tasks(&self) -> StorageResult<()> {
        Self::remove_file(&self.root.join(BOOTSTRAP_TASKS_FILE))
    }
}

#[async_trait]
impl SnapshotStore for DeploymentDirectory {
    async fn write_snapshot(&self, snapshot: &ConfigSnapshot) -> StorageResult<()> {
        Self::write_json(&self.snapshot_path(snapshot.kind), snapshot)
    }

    async fn read_snapshot(&self, kind: SnapshotKind) -> StorageResult<Option<ConfigSnapshot>> {
        let snapshot: Option<ConfigSnapshot> = Self::read_json(&self.snapshot_path(kind))?;
        if let Some(s) = &snapshot {
            s.verify()?;
        }
        Ok(snapshot)
    }

    async fn promote(&self, from: SnapshotKind, to: SnapshotKind) -> StorageResult<()> {
        let source = self
            .read_snapshot(from)
            .await?
            .ok_or_else(|| StorageError::NotFound {
                what: format!("{from} snapshot"),
            })?;
        Self::write_json(&self.snapshot_path(to), &source.relabel(to))
    }

    async fn delete_snapshot(&self, kind: SnapshotKind) -> StorageResult<()> {
        Self::remove_file(&self.snapshot_path(kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_dir() -> (tempfile::TempDir, DeploymentDirectory) {
        let dir = tempfile::tempdir().unwrap();
        let store = DeploymentDirectory::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn open_creates_layout() {
        let (dir, _store) = make_dir();
        assert!(dir.path().join(SNAPSHOTS_DIR).is_dir());
        assert!(dir.path().join(STATUS_DIR).is_dir());
    }

    #[tokio::test]
    async fn missing_files_read_as_empty() {
        let (_dir, store) = make_dir();
        assert!(store.load_token().await.unwrap().is_none());
        assert!(store.load_bootstrap_tasks().await.unwrap().is_empty());
        assert!(store
            .read_snapshot(SnapshotKind::Baseline)
            .await
            .unwrap()
            .is_none());
        store.clear_token().await.unwrap();
        store.remove(42).await.unwrap();
    }

    #[tokio::test]
    async fn corrupted_snapshot_is_rejected() {
        let (dir, store) = make_dir();
        let snap = ConfigSnapshot::new(SnapshotKind::Rollback, serde_json::json!({"x": 1})).unwrap();
        store.write_snapshot(&snap).await.unwrap();

        let path = dir.path().join(SNAPSHOTS_DIR).join("rollback.json");
        let mut on_disk: serde_json::Value =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        on_disk["payload"] = serde_json::json!({"x": 2});
        fs::write(&path, serde_json::to_vec(&on_disk).unwrap()).unwrap();

        let err = store.read_snapshot(SnapshotKind::Rollback).await.unwrap_err();
        assert!(matches!(err, StorageError::DigestMismatch { .. }));
    }

    #[tokio::test]
    async fn status_seq_continues_after_reopen() {
        let (dir, store) = make_dir();
        let update = StatusUpdate {
            deployment_id: "a".to_string(),
            deployment_type: DeploymentType::LocalRequest,
            job_status: JobStatus::InProgress,
            status_details: Default::default(),
        };
        let first = store.append(update.clone()).await.unwrap();
        drop(store);

        let reopened = DeploymentDirectory::open(dir.path()).unwrap();
        let second = reopened.append(update).await.unwrap();
        assert!(second.seq > first.seq);
    }
}
