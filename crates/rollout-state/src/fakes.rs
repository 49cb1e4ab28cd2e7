//! In-memory fakes for storage traits (testing only)
//!
//! Provides `MemoryStatusStore`, `MemoryResumeStore` and
//! `MemorySnapshotStore`. The resume and snapshot fakes can be told to fail
//! every write so rollback-preparation and commit failures can be exercised.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::StorageError;
use crate::storage_traits::*;

// ---------------------------------------------------------------------------
// MemoryStatusStore
// ---------------------------------------------------------------------------

/// In-memory status store backed by a `BTreeMap<seq, record>`.
#[derive(Debug, Default)]
pub struct MemoryStatusStore {
    records: Mutex<BTreeMap<u64, PersistedStatusRecord>>,
    next_seq: AtomicU64,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records across all types.
    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn append(&self, update: StatusUpdate) -> StorageResult<PersistedStatusRecord> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let record = PersistedStatusRecord {
            seq,
            update,
            recorded_at: Utc::now(),
        };
        self.records.lock().unwrap().insert(seq, record.clone());
        Ok(record)
    }

    async fn pending(
        &self,
        deployment_type: DeploymentType,
    ) -> StorageResult<Vec<PersistedStatusRecord>> {
        let records = self.records.lock().unwrap();
        Ok(records
            .values()
            .filter(|r| r.update.deployment_type == deployment_type)
            .cloned()
            .collect())
    }

    async fn remove(&self, seq: u64) -> StorageResult<()> {
        self.records.lock().unwrap().remove(&seq);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryResumeStore
// ---------------------------------------------------------------------------

/// In-memory resume store with optional write-failure injection.
#[derive(Debug, Default)]
pub struct MemoryResumeStore {
    token: Mutex<Option<ResumeToken>>,
    tasks: Mutex<Vec<BootstrapTaskStatus>>,
    fail_writes: AtomicBool,
    /// Every bootstrap plan ever saved, in order
    task_history: Mutex<Vec<Vec<BootstrapTaskStatus>>>,
}

impl MemoryResumeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with an I/O error.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Bootstrap plans in the order they were saved.
    pub fn task_history(&self) -> Vec<Vec<BootstrapTaskStatus>> {
        self.task_history.lock().unwrap().clone()
    }

    fn check_write(&self, op: &str) -> StorageResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::injected(op));
        }
        Ok(())
    }
}

#[async_trait]
impl ResumeStore for MemoryResumeStore {
    async fn save_token(&self, token: &ResumeToken) -> StorageResult<()> {
        self.check_write("save_token")?;
        *self.token.lock().unwrap() = Some(token.clone());
        Ok(())
    }

    async fn load_token(&self) -> StorageResult<Option<ResumeToken>> {
        Ok(self.token.lock().unwrap().clone())
    }

    async fn clear_token(&self) -> StorageResult<()> {
        self.check_write("clear_token")?;
        *self.token.lock().unwrap() = None;
        Ok(())
    }

    async fn save_bootstrap_tasks(&self, tasks: &[BootstrapTaskStatus]) -> StorageResult<()> {
        self.check_write("save_bootstrap_tasks")?;
        *self.tasks.lock().unwrap() = tasks.to_vec();
        self.task_history.lock().unwrap().push(tasks.to_vec());
        Ok(())
    }

    async fn load_bootstrap_tasks(&self) -> StorageResult<Vec<BootstrapTaskStatus>> {
        Ok(self.tasks.lock().unwrap().clone())
    }

    async fn clear_bootstrap_tasks(&self) -> StorageResult<()> {
        self.check_write("clear_bootstrap_tasks")?;
        self.tasks.lock().unwrap().clear();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemorySnapshotStore
// ---------------------------------------------------------------------------

/// In-memory snapshot store with optional write-failure injection.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    snapshots: Mutex<HashMap<SnapshotKind, ConfigSnapshot>>,
    fail_writes: AtomicBool,
    promotions: AtomicU64,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write or promotion fail with an I/O error.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful `promote` calls.
    pub fn promotions(&self) -> u64 {
        self.promotions.load(Ordering::SeqCst)
    }

    fn check_write(&self, op: &str) -> StorageResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::injected(op));
        }
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn write_snapshot(&self, snapshot: &ConfigSnapshot) -> StorageResult<()> {
        self.check_write("write_snapshot")?;
        self.snapshots
            .lock()
            .unwrap()
            .insert(snapshot.kind, snapshot.clone());
        Ok(())
    }

    async fn read_snapshot(&self, kind: SnapshotKind) -> StorageResult<Option<ConfigSnapshot>> {
        let snapshot = self.snapshots.lock().unwrap().get(&kind).cloned();
        if let Some(s) = &snapshot {
            s.verify()?;
        }
        Ok(snapshot)
    }

    async fn promote(&self, from: SnapshotKind, to: SnapshotKind) -> StorageResult<()> {
        self.check_write("promote")?;
        let mut snapshots = self.snapshots.lock().unwrap();
        let source = snapshots
            .get(&from)
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                what: format!("{from} snapshot"),
            })?;
        snapshots.insert(to, source.relabel(to));
        self.promotions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete_snapshot(&self, kind: SnapshotKind) -> StorageResult<()> {
        self.check_write("delete_snapshot")?;
        self.snapshots.lock().unwrap().remove(&kind);
        Ok(())
    }
}
