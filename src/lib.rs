//! flowrun: workflow definition validator and execution engine
//!
//! Tenants assemble directed graphs of typed steps. This crate validates those
//! graphs, walks them step by step against pluggable integrations, and records
//! a per-step trace for every run.

// Core configuration and setup
pub mod config;

// Workflow definitions, validation, storage and the hot-reload registry
pub mod workflow;

// Run records, execution store, task queue and orchestrator
pub mod execution;

// Graph walk, integrations, conditions, progress events and schedules
pub mod runtime;

// HTTP API layer - REST endpoints and webhook triggers
pub mod api;

// Server setup and initialization
pub mod server;

pub use execution::{ExecutionOrchestrator, ExecutionStatus, StartRequest, WorkflowExecution};
pub use runtime::ExecutionEngine;
pub use server::{create_app, start_server};
pub use workflow::{GraphValidator, StepType, Workflow, WorkflowDefinition, WorkflowRegistry};
