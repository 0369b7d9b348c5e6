//! Workflow definition layer
//!
//! - Type definitions (Workflow, WorkflowStep, WorkflowConnection)
//! - Structural validation (graph and connection validators)
//! - SQLite persistence with sqlx
//! - Lock-free hot-reload registry using ArcSwap

pub mod types;

pub mod validator;

pub mod storage;

pub mod registry;

pub use registry::{ActiveWorkflow, WorkflowRegistry};
pub use types::{Condition, DataMap, StepType, Workflow, WorkflowConnection, WorkflowDefinition, WorkflowStep};
pub use validator::{ConnectionValidator, GraphValidator, ValidationError, ValidationErrors};
