//! In-memory fake for the execution store (testing only)
//!
//! `MemoryExecutionStore` satisfies the `ExecutionStore` contract without any
//! external dependencies, and can be switched "offline" to exercise the
//! engine's persistence-error paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::StorageError;
use crate::record::{BuildId, ExecutionRecord, TimeRange};
use crate::store::{ExecutionMutator, ExecutionStore, StorageResult};

/// In-memory execution store backed by a `HashMap<BuildId, ExecutionRecord>`.
#[derive(Debug, Default)]
pub struct MemoryExecutionStore {
    records: Mutex<HashMap<BuildId, ExecutionRecord>>,
    offline: AtomicBool,
}

impl MemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline every call fails with `StorageError::Backend`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> StorageResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("store offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ExecutionStore for MemoryExecutionStore {
    async fn create(&self, record: ExecutionRecord) -> StorageResult<()> {
        self.check_online()?;
        let mut records = self.records.lock().await;
        if records.contains_key(&record.id) {
            return Err(StorageError::AlreadyExists {
                build_id: record.id.to_string(),
            });
        }
        records.insert(record.id.clone(), record);
        Ok(())
    }

    async fn get(&self, id: &BuildId) -> StorageResult<Option<ExecutionRecord>> {
        self.check_online()?;
        let records = self.records.lock().await;
        Ok(records.get(id).cloned())
    }

    async fn update(
        &self,
        id: &BuildId,
        mutate: ExecutionMutator,
    ) -> StorageResult<ExecutionRecord> {
        self.check_online()?;
        let mut records = self.records.lock().await;
        let record = records.get_mut(id).ok_or_else(|| StorageError::NotFound {
            build_id: id.to_string(),
        })?;
        mutate(record);
        Ok(record.clone())
    }

    async fn list(&self, range: TimeRange) -> StorageResult<Vec<ExecutionRecord>> {
        self.check_online()?;
        let records = self.records.lock().await;
        let mut rows: Vec<ExecutionRecord> = records
            .values()
            .filter(|r| range.contains(r.created_at))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn list_paused(&self) -> StorageResult<Vec<ExecutionRecord>> {
        self.check_online()?;
        let records = self.records.lock().await;
        let mut rows: Vec<ExecutionRecord> = records
            .values()
            .filter(|r| r.is_paused)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.created_at);
        Ok(rows)
    }
}
