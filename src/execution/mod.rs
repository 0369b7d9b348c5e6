//! Run records and their lifecycle
//!
//! - Execution and step execution records
//! - Pluggable execution store (SQLite, in-memory)
//! - Background task queue
//! - Orchestrator for start / cancel / retry

pub mod types;

pub mod store;

pub mod queue;

pub mod orchestrator;

pub use orchestrator::{ExecutionOrchestrator, OrchestratorError, StartRequest, StartedRun};
pub use queue::{JobHandle, TaskQueue, TokioTaskQueue};
pub use store::{ExecutionStore, InMemoryExecutionStore, SqliteExecutionStore};
pub use types::{ExecutionStatus, StepExecutionStatus, TriggerSource, WorkflowExecution, WorkflowStepExecution};
