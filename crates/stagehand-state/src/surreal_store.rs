//! SurrealDB-backed ExecutionStore implementation
//!
//! Rows are stored as `ExecutionRow` and converted to/from
//! [`ExecutionRecord`] at the boundary.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use surrealdb::engine::any::Any;
use surrealdb::sql::Datetime as SurrealDatetime;
use surrealdb::Surreal;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::StorageError;
use crate::migrations;
use crate::record::{Breakpoints, BuildId, BuildStatus, ExecutionRecord, TimeRange};
use crate::store::{ExecutionMutator, ExecutionStore, StorageResult};
use crate::surreal_dt;

const NAMESPACE: &str = "stagehand";
const DATABASE: &str = "main";
const LOCAL_DB_PATH: &str = ".stagehand/db";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ExecutionRow {
    id: Option<surrealdb::sql::Thing>,
    build_id: String,
    repository: String,
    branch: String,
    commit: String,
    clone_url: String,
    display_name: String,
    pr_number: Option<u64>,
    #[serde(with = "surreal_dt::required")]
    created_at: DateTime<Utc>,
    status: String,
    active_stage: Option<String>,
    is_paused: bool,
    pause_stage: Option<String>,
    pause_point: Option<String>,
    breakpoints: serde_json::Value,
    logs: String,
    duration_ms: Option<u64>,
    check_run_id: Option<String>,
    config: serde_json::Value,
}

impl ExecutionRow {
    fn from_record(
        record: ExecutionRecord,
        id: Option<surrealdb::sql::Thing>,
    ) -> StorageResult<Self> {
        Ok(Self {
            id,
            build_id: record.id.to_string(),
            repository: record.repository,
            branch: record.branch,
            commit: record.commit,
            clone_url: record.clone_url,
            display_name: record.display_name,
            pr_number: record.pr_number,
            created_at: record.created_at,
            status: record.status.as_str().to_string(),
            active_stage: record.active_stage,
            is_paused: record.is_paused,
            pause_stage: record.pause_stage,
            pause_point: record.pause_point,
            breakpoints: serde_json::to_value(&record.breakpoints)?,
            logs: record.logs,
            duration_ms: record.duration_ms,
            check_run_id: record.check_run_id,
            config: record.config,
        })
    }

    fn into_record(self) -> StorageResult<ExecutionRecord> {
        let status: BuildStatus = self
            .status
            .parse()
            .map_err(|e| StorageError::Serialization(format!("{e}")))?;
        let breakpoints: Breakpoints = if self.breakpoints.is_null() {
            Breakpoints::default()
        } else {
            serde_json::from_value(self.breakpoints)?
        };

        Ok(ExecutionRecord {
            id: BuildId::from(self.build_id),
            repository: self.repository,
            branch: self.branch,
            commit: self.commit,
            clone_url: self.clone_url,
            display_name: self.display_name,
            pr_number: self.pr_number,
            created_at: self.created_at,
            status,
            active_stage: self.active_stage,
            is_paused: self.is_paused,
            pause_stage: self.pause_stage,
            pause_point: self.pause_point,
            breakpoints,
            logs: self.logs,
            duration_ms: self.duration_ms,
            check_run_id: self.check_run_id,
            config: self.config,
        })
    }
}

/// SurrealDB-backed implementation of [`ExecutionStore`].
pub struct SurrealExecutionStore {
    db: Surreal<Any>,
    // Serializes read-modify-write updates issued by this process.
    write_lock: Mutex<()>,
}

impl SurrealExecutionStore {
    /// Create an in-memory instance for testing.
    pub async fn in_memory() -> StorageResult<Self> {
        Self::connect("mem://").await
    }

    /// Connect to `url` (`mem://`, `surrealkv://path`, `ws://host:port`, ...).
    pub async fn connect(url: &str) -> StorageResult<Self> {
        let db = surrealdb::engine::any::connect(url)
            .await
            .map_err(|e| StorageError::Backend(format!("failed to connect to {url}: {e}")))?;

        db.use_ns(NAMESPACE)
            .use_db(DATABASE)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        migrations::init_schema(&db).await?;
        info!(url = %url, "SurrealExecutionStore connected");
        Ok(Self {
            db,
            write_lock: Mutex::new(()),
        })
    }

    /// Connect using `SURREALDB_URL`, falling back to local persistence in
    /// `.stagehand/db`.
    pub async fn from_env() -> StorageResult<Self> {
        if let Ok(url) = std::env::var("SURREALDB_URL") {
            return Self::connect(&url).await;
        }

        std::fs::create_dir_all(LOCAL_DB_PATH).map_err(|e| {
            StorageError::Backend(format!(
                "failed to create database directory {LOCAL_DB_PATH}: {e}"
            ))
        })?;
        info!(
            "No SURREALDB_URL found, using local persistence: surrealkv://{}",
            LOCAL_DB_PATH
        );
        Self::connect(&format!("surrealkv://{LOCAL_DB_PATH}")).await
    }

    async fn fetch_row(&self, build_id: &str) -> StorageResult<Option<ExecutionRow>> {
        let bid = build_id.to_string();
        let mut res = self
            .db
            .query("SELECT * FROM executions WHERE build_id = $bid")
            .bind(("bid", bid))
            .await?;
        let rows: Vec<ExecutionRow> = res.take(0)?;
        Ok(rows.into_iter().next())
    }

    fn rows_to_records(rows: Vec<ExecutionRow>) -> StorageResult<Vec<ExecutionRecord>> {
        rows.into_iter().map(ExecutionRow::into_record).collect()
    }
}

#[async_trait]
impl ExecutionStore for SurrealExecutionStore {
    async fn create(&self, record: ExecutionRecord) -> StorageResult<()> {
        let _guard = self.write_lock.lock().await;
        if self.fetch_row(record.id.as_str()).await?.is_some() {
            return Err(StorageError::AlreadyExists {
                build_id: record.id.to_string(),
            });
        }

        debug!(build_id = %record.id, "creating execution");
        let row = ExecutionRow::from_record(record, None)?;
        let _created: Option<ExecutionRow> = self.db.create("executions").content(row).await?;
        Ok(())
    }

    async fn get(&self, id: &BuildId) -> StorageResult<Option<ExecutionRecord>> {
        self.fetch_row(id.as_str())
            .await?
            .map(ExecutionRow::into_record)
            .transpose()
    }

    async fn update(
        &self,
        id: &BuildId,
        mutate: ExecutionMutator,
    ) -> StorageResult<ExecutionRecord> {
        let _guard = self.write_lock.lock().await;
        let row = self
            .fetch_row(id.as_str())
            .await?
            .ok_or_else(|| StorageError::NotFound {
                build_id: id.to_string(),
            })?;

        let thing = row.id.clone();
        let mut record = row.into_record()?;
        mutate(&mut record);
        let updated = ExecutionRow::from_record(record.clone(), thing)?;

        self.db
            .query("UPDATE executions CONTENT $row WHERE build_id = $bid")
            .bind(("row", updated))
            .bind(("bid", id.to_string()))
            .await?;

        Ok(record)
    }

    async fn list(&self, range: TimeRange) -> StorageResult<Vec<ExecutionRecord>> {
        let rows: Vec<ExecutionRow> = match range.since {
            Some(since) => {
                let mut res = self
                    .db
                    .query(
                        "SELECT * FROM executions WHERE created_at >= $since ORDER BY created_at DESC",
                    )
                    .bind(("since", SurrealDatetime::from(since)))
                    .await?;
                res.take(0)?
            }
            None => {
                let mut res = self
                    .db
                    .query("SELECT * FROM executions ORDER BY created_at DESC")
                    .await?;
                res.take(0)?
            }
        };

        let records = Self::rows_to_records(rows)?;
        Ok(records
            .into_iter()
            .filter(|r| range.contains(r.created_at))
            .collect())
    }

    async fn list_paused(&self) -> StorageResult<Vec<ExecutionRecord>> {
        let mut res = self
            .db
            .query("SELECT * FROM executions WHERE is_paused = true ORDER BY created_at ASC")
            .await?;
        let rows: Vec<ExecutionRow> = res.take(0)?;
        Self::rows_to_records(rows)
    }
}
