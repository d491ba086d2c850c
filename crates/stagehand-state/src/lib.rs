//! Stagehand-State: execution record persistence
//!
//! This crate owns the durable side of a pipeline run: who triggered it,
//! where it is, whether it is parked at a breakpoint, and what it has logged.
//!
//! ## Layer 0 - Data/Persistence
//!
//! The engine treats the [`ExecutionStore`] as the single source of truth for
//! cross-restart recovery. In-memory state kept elsewhere is a cache.
//!
//! ## Key Components
//!
//! - `ExecutionRecord`: one row per build, with pause state and breakpoints
//! - `ExecutionStore`: async, backend-agnostic access contract
//! - `SurrealExecutionStore`: SurrealDB implementation (`mem://`, `surrealkv://`, remote)
//! - `MemoryExecutionStore`: in-memory fake for tests
//! - `DashboardMetrics`: aggregate counts over a time range

mod error;
pub mod fakes;
pub mod metrics;
mod migrations;
pub mod record;
pub mod store;
mod surreal_dt;
pub mod surreal_store;

pub use error::StorageError;
pub use metrics::DashboardMetrics;
pub use record::{
    Breakpoint, Breakpoints, BuildId, BuildStatus, CheckpointStage, ExecutionRecord,
    ExecutionSummary, ParseCheckpointError, PausePoint, TimeRange,
};
pub use store::{ExecutionMutator, ExecutionStore, StorageResult};
pub use surreal_store::SurrealExecutionStore;
