//! SurrealDB schema migrations and initialization
//!
//! Sets up the tables backing the resume token, the bootstrap plan, the
//! configuration snapshots and the unacknowledged status records.

use crate::Result;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

/// Initialize all rollout tables in SurrealDB
///
/// Safe to call multiple times (idempotent).
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    info!("Initializing rollout SurrealDB schema");

    init_deployment_status_table(db).await?;
    init_resume_state_table(db).await?;
    init_config_snapshots_table(db).await?;

    info!("rollout schema initialization complete");
    Ok(())
}

/// Initialize `deployment_status` table
///
/// Schema:
/// ```text
/// TABLE deployment_status {
///   seq:              INT (unique, delivery order)
///   deployment_type:  STRING (CLOUD_JOB | LOCAL_REQUEST)
///   body:             STRING (JSON-encoded PersistedStatusRecord)
/// }
/// ```
async fn init_deployment_status_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing deployment_status table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS deployment_status SCHEMALESS;

        DEFINE INDEX IF NOT EXISTS idx_status_seq ON TABLE deployment_status COLUMNS seq UNIQUE;

        DEFINE INDEX IF NOT EXISTS idx_status_type_seq ON TABLE deployment_status COLUMNS deployment_type, seq;
    "#;

    db.query(sql).await?;
    Ok(())
}

/// Initialize `resume_state` table
///
/// One row per slot: `token` holds the resume token, `bootstrap_tasks` the
/// bootstrap plan.
async fn init_resume_state_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing resume_state table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS resume_state SCHEMALESS;

        DEFINE INDEX IF NOT EXISTS idx_resume_slot ON TABLE resume_state COLUMNS slot UNIQUE;
    "#;

    db.query(sql).await?;
    Ok(())
}

/// Initialize `config_snapshots` table, one row per snapshot kind.
async fn init_config_snapshots_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing config_snapshots table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS config_snapshots SCHEMALESS;

        DEFINE INDEX IF NOT EXISTS idx_snapshot_slot ON TABLE config_snapshots COLUMNS slot UNIQUE;
    "#;

    db.query(sql).await?;
    Ok(())
}
