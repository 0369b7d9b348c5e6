//! Run and step execution records

use crate::workflow::types::{DataMap, StepType, WorkflowStep};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a whole run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Stable name used in the store's status column
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Cancelled => "Cancelled",
        }
    }
}

/// Lifecycle of a single step visit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

/// What started a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerSource {
    #[default]
    Manual,
    Api,
    Webhook,
    Schedule,
}

/// One run of a workflow with its ordered step trace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub workflow_id: String,
    pub tenant_id: String,
    pub status: ExecutionStatus,
    pub input_data: DataMap,
    pub output_data: DataMap,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub error_message: Option<String>,
    pub trigger_source: TriggerSource,
    /// Appended in visit order; never removed
    pub step_executions: Vec<WorkflowStepExecution>,
}

impl WorkflowExecution {
    /// A fresh Pending record
    pub fn new(
        workflow_id: impl Into<String>,
        tenant_id: impl Into<String>,
        input_data: DataMap,
        trigger_source: TriggerSource,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id: workflow_id.into(),
            tenant_id: tenant_id.into(),
            status: ExecutionStatus::Pending,
            input_data,
            output_data: DataMap::new(),
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            error_message: None,
            trigger_source,
            step_executions: Vec::new(),
        }
    }

    /// Step executions for one step id, in visit order
    pub fn executions_of<'a>(&'a self, step_id: &'a str) -> impl Iterator<Item = &'a WorkflowStepExecution> + 'a {
        self.step_executions.iter().filter(move |step| step.step_id == step_id)
    }

    /// Stamp completion time and duration
    pub fn finish(&mut self, status: ExecutionStatus) {
        let now = Utc::now();
        self.status = status;
        self.completed_at = Some(now);
        self.duration_ms = Some((now - self.started_at).num_milliseconds());
    }
}

/// One visit of one step within a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStepExecution {
    pub id: Uuid,
    pub step_id: String,
    pub step_name: String,
    pub step_type: StepType,
    pub status: StepExecutionStatus,
    pub input_data: DataMap,
    pub output_data: DataMap,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub error_message: Option<String>,
    pub retry_count: u32,
}

impl WorkflowStepExecution {
    pub fn new(step: &WorkflowStep, status: StepExecutionStatus, input_data: DataMap) -> Self {
        Self {
            id: Uuid::new_v4(),
            step_id: step.id.clone(),
            step_name: step.name.clone(),
            step_type: step.step_type,
            status,
            input_data,
            output_data: DataMap::new(),
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            error_message: None,
            retry_count: 0,
        }
    }

    /// Move to a terminal status, stamping completion time and duration
    pub fn finish(&mut self, status: StepExecutionStatus) {
        let now = Utc::now();
        self.status = status;
        self.completed_at = Some(now);
        self.duration_ms = Some((now - self.started_at).num_milliseconds());
    }
}
