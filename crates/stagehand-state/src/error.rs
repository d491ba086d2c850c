//! Error types for stagehand-state

use thiserror::Error;

/// Errors that can occur in the execution record store
#[derive(Error, Debug)]
pub enum StorageError {
    /// No record exists for the build
    #[error("execution not found: {build_id}")]
    NotFound { build_id: String },

    /// A record with this build id already exists
    #[error("execution already exists: {build_id}")]
    AlreadyExists { build_id: String },

    /// Backend unreachable or query failed
    #[error("storage backend error: {0}")]
    Backend(String),

    /// Row could not be encoded or decoded
    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl From<surrealdb::Error> for StorageError {
    fn from(err: surrealdb::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
