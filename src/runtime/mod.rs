//! Runtime Execution Engine
//!
//! - Depth-first graph walk with branch selection and cancellation
//! - Integration executor for side-effecting steps
//! - Lua-backed condition evaluation and scripts
//! - Progress events
//! - Cron schedule triggers

pub mod binder;

pub mod lua;

pub mod condition;

pub mod integration;

pub mod progress;

// Core execution engine walking the step graph
pub mod engine;

// Background cron scheduler service for scheduled Start steps
pub mod scheduler;

pub use condition::{ConditionEvaluator, LuaConditionEvaluator};
pub use engine::{EngineSettings, ExecutionEngine, StepHandler};
pub use integration::{DefaultIntegrationExecutor, IntegrationExecutor, IntegrationSettings};
pub use progress::{BroadcastProgressPublisher, ProgressEvent, ProgressPublisher, TracingProgressPublisher};
pub use scheduler::CronSchedulerService;
