//! SurrealDB-backed implementation of all three rollout stores.
//!
//! Records are kept as JSON bodies next to the columns that are queried
//! (`seq`, `deployment_type`, `slot`), converting to and from
//! `storage_traits` types at the boundary.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{StateError, StorageError};
use crate::migrations;
use crate::storage_traits::*;

const TOKEN_SLOT: &str = "token";
const TASKS_SLOT: &str = "bootstrap_tasks";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StatusRow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<surrealdb::sql::Thing>,
    seq: i64,
    deployment_type: String,
    body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SlotRow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<surrealdb::sql::Thing>,
    slot: String,
    body: String,
}

fn backend(e: surrealdb::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

/// SurrealDB-backed [`StatusStore`], [`ResumeStore`] and [`SnapshotStore`].
pub struct SurrealRolloutStore {
    db: Surreal<Any>,
    /// Serializes seq assignment within this process
    seq_lock: Mutex<()>,
}

impl SurrealRolloutStore {
    /// Create an in-memory instance for testing.
    ///
    /// Connects to `mem://`, selects `rollout/main`, and runs `init_schema`.
    pub async fn in_memory() -> crate::Result<Self> {
        let store = Self::connect("mem://").await?;
        info!("SurrealRolloutStore connected (in-memory)");
        Ok(store)
    }

    /// Open an embedded on-disk database under `path`.
    pub async fn open(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path).map_err(|e| {
            StateError::Connection(format!(
                "Failed to create database directory {}: {}",
                path.display(),
                e
            ))
        })?;
        let url = format!("surrealkv://{}", path.display());
        let store = Self::connect(&url).await?;
        info!("SurrealRolloutStore connected ({})", url);
        Ok(store)
    }

    /// Connect to any endpoint understood by `surrealdb::engine::any`.
    pub async fn connect(url: &str) -> crate::Result<Self> {
        let db = surrealdb::engine::any::connect(url)
            .await
            .map_err(|e| StateError::Connection(format!("Failed to connect to {}: {}", url, e)))?;

        db.use_ns("rollout")
            .use_db("main")
            .await
            .map_err(|e| StateError::Connection(e.to_string()))?;

        migrations::init_schema(&db).await?;
        Ok(Self {
            db,
            seq_lock: Mutex::new(()),
        })
    }

    // -- private helpers -----------------------------------------------------

    async fn put_slot<T: Serialize + Sync + ?Sized>(
        &self,
        table: &'static str,
        slot: &str,
        value: &T,
    ) -> StorageResult<()> {
        let row = SlotRow {
            id: None,
            slot: slot.to_string(),
            body: serde_json::to_string(value)?,
        };
        let sql = format!("DELETE {table} WHERE slot = $slot; CREATE {table} CONTENT $row;");
        self.db
            .query(sql)
            .bind(("slot", slot.to_string()))
            .bind(("row", row))
            .await
            .map_err(backend)?
            .check()
            .map_err(backend)?;
        Ok(())
    }

    async fn get_slot<T: DeserializeOwned + Send>(
        &self,
        table: &'static str,
        slot: &str,
    ) -> StorageResult<Option<T>> {
        let mut res = self
            .db
            .query(format!("SELECT * FROM {table} WHERE slot = $slot"))
            .bind(("slot", slot.to_string()))
            .await
            .map_err(backend)?;
        let rows: Vec<SlotRow> = res.take(0).map_err(backend)?;
        match rows.into_iter().next() {
            Some(row) => Ok(Some(serde_json::from_str(&row.body)?)),
            None => Ok(None),
        }
    }

    async fn delete_slot(&self, table: &'static str, slot: &str) -> StorageResult<()> {
        self.db
            .query(format!("DELETE {table} WHERE slot = $slot"))
            .bind(("slot", slot.to_string()))
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn last_seq(&self) -> StorageResult<u64> {
        let mut res = self
            .db
            .query("SELECT * FROM deployment_status ORDER BY seq DESC LIMIT 1")
            .await
            .map_err(backend)?;
        let rows: Vec<StatusRow> = res.take(0).map_err(backend)?;
        Ok(rows.first().map(|r| r.seq.max(0) as u64).unwrap_or(0))
    }
}

#[async_trait]
impl StatusStore for SurrealRolloutStore {
    async fn append(&self, update: StatusUpdate) -> StorageResult<PersistedStatusRecord> {
        let _guard = self.seq_lock.lock().await;
        let seq = self.last_seq().await? + 1;
        let record = PersistedStatusRecord {
            seq,
            update,
            recorded_at: chrono::Utc::now(),
        };
        let row = StatusRow {
            id: None,
            seq: seq as i64,
            deployment_type: record.update.deployment_type.as_str().to_string(),
            body: serde_json::to_string(&record)?,
        };

        debug!(seq, deployment_id = %record.update.deployment_id, "persisting status record");

        let _created: Option<StatusRow> = self
            .db
            .create("deployment_status")
            .content(row)
            .await
            .map_err(backend)?;

        Ok(record)
    }

    async fn pending(
        &self,
        deployment_type: DeploymentType,
    ) -> StorageResult<Vec<PersistedStatusRecord>> {
        let mut res = self
            .db
            .query("SELECT * FROM deployment_status WHERE deployment_type = $ty ORDER BY seq ASC")
            .bind(("ty", deployment_type.as_str().to_string()))
            .await
            .map_err(backend)?;
        let rows: Vec<StatusRow> = res.take(0).map_err(backend)?;
        rows.into_iter()
            .map(|row| serde_json::from_str(&row.body).map_err(StorageError::from))
            .collect()
    }

    async fn remove(&self, seq: u64) -> StorageResult<()> {
        self.db
            .query("DELETE deployment_status WHERE seq = $seq")
            .bind(("seq", seq as i64))
            .await
            .map_err(backend)?;
        Ok(())
    }
}

#[async_trait]
impl ResumeStore for SurrealRolloutStore {
    async fn save_token(&self, token: &ResumeToken) -> StorageResult<()> {
        self.put_slot("resume_state", TOKEN_SLOT, token).await
    }

    async fn load_token(&self) -> StorageResult<Option<ResumeToken>> {
        self.get_slot("resume_state", TOKEN_SLOT).await
    }

    async fn clear_token(&self) -> StorageResult<()> {
        self.delete_slot("resume_state", TOKEN_SLOT).await
    }

    async fn save_bootstrap_tasks(&self, tasks: &[BootstrapTaskStatus]) -> StorageResult<()> {
        self.put_slot("resume_state", TASKS_SLOT, tasks).await
    }

    async fn load_bootstrap_tasks(&self) -> StorageResult<Vec<BootstrapTaskStatus>> {
        Ok(self
            .get_slot("resume_state", TASKS_SLOT)
            .await?
            .unwrap_or_default())
    }

    async fn clear_bootstrap_tasks(&self) -> StorageResult<()> {
        self.delete_slot("resume_state", TASKS_SLOT).await
    }
}

#[async_trait]
impl SnapshotStore for SurrealRolloutStore {
    async fn write_snapshot(&self, snapshot: &ConfigSnapshot) -> StorageResult<()> {
        self.put_slot("config_snapshots", snapshot.kind.as_str(), snapshot)
            .await
    }

    async fn read_snapshot(&self, kind: SnapshotKind) -> StorageResult<Option<ConfigSnapshot>> {
        let snapshot: Option<ConfigSnapshot> =
            self.get_slot("config_snapshots", kind.as_str()).await?;
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
        self.write_snapshot(&source.relabel(to)).await
    }

    async fn delete_snapshot(&self, kind: SnapshotKind) -> StorageResult<()> {
        self.delete_slot("config_snapshots", kind.as_str()).await
    }
}
