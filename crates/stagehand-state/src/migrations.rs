//! SurrealDB schema initialization
//!
//! Sets up the `executions` table with its indexes. Safe to call on every
//! connection (idempotent).

use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::error::StorageError;
use crate::store::StorageResult;

/// Initialize all Stagehand tables.
pub async fn init_schema(db: &Surreal<Any>) -> StorageResult<()> {
    info!("Initializing Stagehand SurrealDB schema");
    init_executions_table(db).await?;
    info!("Stagehand schema initialization complete");
    Ok(())
}

/// Initialize `executions` table with constraints and indexes
///
/// Schema:
/// ```text
/// TABLE executions {
///   build_id:      STRING (unique)
///   repository:    STRING
///   branch:        STRING
///   commit:        STRING
///   clone_url:     STRING
///   display_name:  STRING
///   pr_number:     INT?
///   created_at:    DATETIME (indexed)
///   status:        STRING (pending | passed | failed, indexed)
///   active_stage:  STRING?
///   is_paused:     BOOL (indexed)
///   pause_stage:   STRING?
///   pause_point:   STRING?
///   breakpoints:   OBJECT
///   logs:          STRING
///   duration_ms:   INT?
///   check_run_id:  STRING?
///   config:        OBJECT
/// }
/// ```
///
/// Status transitions (pending -> passed | failed) and the pause-field
/// pairing are enforced by `ExecutionRecord`, not the database.
async fn init_executions_table(db: &Surreal<Any>) -> StorageResult<()> {
    debug!("Initializing executions table");

    let sql = r#"
        DEFINE TABLE executions AS
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update FULL
                FOR delete NONE;

        DEFINE INDEX idx_execution_build_id ON TABLE executions COLUMNS build_id UNIQUE;
        DEFINE INDEX idx_execution_created_at ON TABLE executions COLUMNS created_at;
        DEFINE INDEX idx_execution_status ON TABLE executions COLUMNS status;
        DEFINE INDEX idx_execution_paused ON TABLE executions COLUMNS is_paused;
    "#;

    db.query(sql)
        .await
        .map_err(|e| StorageError::Backend(format!("schema setup failed: {e}")))?;

    debug!("executions table ready");
    Ok(())
}
