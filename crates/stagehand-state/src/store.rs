//! Storage trait for execution records.
//!
//! `ExecutionStore` is async and backend-agnostic. An in-memory fake lives in
//! the `fakes` module; `SurrealExecutionStore` is the durable backend.

use async_trait::async_trait;

use crate::error::StorageError;
use crate::record::{BuildId, ExecutionRecord, TimeRange};

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// In-place edit applied to a record under the store's write lock.
pub type ExecutionMutator = Box<dyn FnOnce(&mut ExecutionRecord) + Send>;

/// Durable execution record store.
///
/// Guarantees:
/// - `create` fails with `AlreadyExists` for a duplicate build id.
/// - `update` applies the mutator atomically with respect to other updates of
///   the same store instance and returns the record as written.
/// - `list` returns records newest first.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Persist a new record.
    async fn create(&self, record: ExecutionRecord) -> StorageResult<()>;

    /// Fetch a record, or `None` if absent.
    async fn get(&self, id: &BuildId) -> StorageResult<Option<ExecutionRecord>>;

    /// Apply `mutate` to the stored record. Fails with `NotFound` if absent.
    async fn update(&self, id: &BuildId, mutate: ExecutionMutator)
        -> StorageResult<ExecutionRecord>;

    /// Records created inside `range`, newest first.
    async fn list(&self, range: TimeRange) -> StorageResult<Vec<ExecutionRecord>>;

    /// Records parked at a checkpoint, oldest first.
    async fn list_paused(&self) -> StorageResult<Vec<ExecutionRecord>>;
}
