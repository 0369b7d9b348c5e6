//! Graph-walking execution engine
//!
//! Walks a definition depth-first from its single start step. Every visit
//! appends a step execution to the run record; each branch carries its own
//! copy of the visited set, so diamonds re-run shared steps while cycles stop
//! at the first repeat. The walk uses an explicit stack (children pushed in
//! reverse) which yields the same pre-order as the recursive formulation.

use crate::execution::store::ExecutionStore;
use crate::execution::types::{
    ExecutionStatus, StepExecutionStatus, TriggerSource, WorkflowExecution, WorkflowStepExecution,
};
use crate::runtime::condition::{ConditionEvaluator, LuaConditionEvaluator};
use crate::runtime::integration::IntegrationExecutor;
use crate::runtime::progress::{ProgressEvent, ProgressPublisher, TracingProgressPublisher};
use crate::workflow::types::{DataMap, StepType, Workflow, WorkflowDefinition, WorkflowStep};
use anyhow::Result;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Output key carrying a Condition step's result
pub const CONDITION_RESULT_KEY: &str = "conditionResult";

/// Engine tuning
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Upper bound for a single Wait step
    pub max_wait: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_secs(3600),
        }
    }
}

/// How a step type is executed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepHandler {
    /// Delegated to the integration executor
    Integration,
    /// Input becomes output unchanged
    PassThrough,
    /// Evaluates the step condition and selects a boolean port
    Condition,
    /// Suspends the branch, interruptible by cancellation
    Wait,
}

impl StepHandler {
    pub fn for_step_type(step_type: StepType) -> Self {
        match step_type {
            StepType::HttpRequest
            | StepType::EmailSend
            | StepType::DatabaseQuery
            | StepType::ScriptExecution
            | StepType::Webhook => Self::Integration,
            StepType::Condition => Self::Condition,
            StepType::Wait => Self::Wait,
            StepType::Start | StepType::End | StepType::Action | StepType::UserTask => Self::PassThrough,
        }
    }
}

/// Result of dispatching one step
enum StepOutcome {
    Completed {
        output: DataMap,
        /// Output port whose connections must not be followed
        rejected_port: Option<&'static str>,
    },
    Failed(String),
    Cancelled,
}

impl StepOutcome {
    fn completed(output: DataMap) -> Self {
        Self::Completed { output, rejected_port: None }
    }
}

/// A pending visit on the walk stack
struct Frame<'a> {
    step: &'a WorkflowStep,
    input: DataMap,
    visited: HashSet<&'a str>,
}

/// Walk stack entry; skipped targets are queued so their records keep visit order
enum Visit<'a> {
    Step(Frame<'a>),
    Skipped {
        step: &'a WorkflowStep,
        input: DataMap,
        error: Option<String>,
    },
}

/// What the walk observed, used to decide the terminal status
#[derive(Default)]
struct WalkState {
    cancelled: bool,
    first_failure: Option<String>,
    end_output: Option<DataMap>,
    last_output: Option<DataMap>,
}

/// Executes workflow definitions and records their traces
pub struct ExecutionEngine {
    integrations: Arc<dyn IntegrationExecutor>,
    conditions: Arc<dyn ConditionEvaluator>,
    progress: Arc<dyn ProgressPublisher>,
    store: Arc<dyn ExecutionStore>,
    settings: EngineSettings,
}

impl ExecutionEngine {
    /// Engine with Lua conditions and log-only progress
    pub fn new(integrations: Arc<dyn IntegrationExecutor>, store: Arc<dyn ExecutionStore>) -> Self {
        Self {
            integrations,
            conditions: Arc::new(LuaConditionEvaluator),
            progress: Arc::new(TracingProgressPublisher),
            store,
            settings: EngineSettings::default(),
        }
    }

    pub fn with_conditions(mut self, conditions: Arc<dyn ConditionEvaluator>) -> Self {
        self.conditions = conditions;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressPublisher>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    /// Run a workflow to completion under a fresh record
    pub async fn execute(&self, workflow: &Workflow, input_data: DataMap, trigger: TriggerSource) -> WorkflowExecution {
        let execution = WorkflowExecution::new(&workflow.id, &workflow.tenant_id, input_data, trigger);
        self.run(&workflow.definition, execution, &CancellationToken::new()).await
    }

    /// Walk `definition` for an existing record and return its final state
    ///
    /// Never fails: run-level errors end up in the record as a Failed status.
    pub async fn run(
        &self,
        definition: &WorkflowDefinition,
        mut execution: WorkflowExecution,
        cancel: &CancellationToken,
    ) -> WorkflowExecution {
        execution.status = ExecutionStatus::Running;
        execution.started_at = chrono::Utc::now();
        execution.completed_at = None;
        execution.duration_ms = None;
        execution.error_message = None;

        tracing::info!("🚀 Starting execution {} of workflow {}", execution.id, execution.workflow_id);

        let mut state = WalkState::default();
        let walked = match self.checkpoint(&execution, cancel).await {
            Ok(()) => self.walk(definition, &mut execution, cancel, &mut state).await,
            Err(e) => Err(e),
        };

        self.finalize(&mut execution, walked, state, cancel);
        if let Err(e) = self.store.save(&execution).await {
            tracing::error!("❌ Failed to persist final state of execution {}: {}", execution.id, e);
        }
        execution
    }

    async fn walk<'a>(
        &self,
        definition: &'a WorkflowDefinition,
        execution: &mut WorkflowExecution,
        cancel: &CancellationToken,
        state: &mut WalkState,
    ) -> Result<()> {
        let start = single_start_step(definition)?;
        let mut stack = vec![Visit::Step(Frame {
            step: start,
            input: execution.input_data.clone(),
            visited: HashSet::new(),
        })];

        while let Some(visit) = stack.pop() {
            let Frame { step, input, mut visited } = match visit {
                Visit::Step(frame) => frame,
                Visit::Skipped { step, input, error } => {
                    push_finished(execution, step, StepExecutionStatus::Skipped, input, error);
                    continue;
                }
            };

            if cancel.is_cancelled() {
                state.cancelled = true;
                push_finished(execution, step, StepExecutionStatus::Cancelled, input, None);
                continue;
            }

            // Cycle guard
            if !visited.insert(step.id.as_str()) {
                tracing::debug!("🔁 Step '{}' already on this path, stopping branch", step.id);
                continue;
            }

            let mut record = WorkflowStepExecution::new(step, StepExecutionStatus::Running, input.clone());
            record.retry_count = execution
                .executions_of(&step.id)
                .filter(|earlier| earlier.status == StepExecutionStatus::Failed)
                .count() as u32;
            execution.step_executions.push(record);
            let index = execution.step_executions.len() - 1;

            tracing::debug!("📍 Executing step '{}' (type: {:?})", step.id, step.step_type);
            let outcome = self.dispatch(step, &input, cancel).await;

            let (output, rejected_port) = {
                let record = &mut execution.step_executions[index];
                match outcome {
                    StepOutcome::Completed { output, rejected_port } => {
                        record.output_data = output.clone();
                        record.finish(StepExecutionStatus::Completed);
                        self.progress.publish(ProgressEvent::StepCompleted {
                            execution_id: execution.id,
                            step_id: step.id.clone(),
                            status: StepExecutionStatus::Completed,
                            output_data: output.clone(),
                        });
                        (output, rejected_port)
                    }
                    StepOutcome::Failed(error) => {
                        tracing::warn!("❌ Step '{}' failed: {}", step.id, error);
                        record.error_message = Some(error.clone());
                        record.finish(StepExecutionStatus::Failed);
                        state
                            .first_failure
                            .get_or_insert_with(|| format!("Step '{}' failed: {}", step.id, error));
                        self.progress.publish(ProgressEvent::StepFailed {
                            execution_id: execution.id,
                            step_id: step.id.clone(),
                            status: StepExecutionStatus::Failed,
                            error,
                        });
                        self.checkpoint(execution, cancel).await?;
                        continue;
                    }
                    StepOutcome::Cancelled => {
                        record.finish(StepExecutionStatus::Cancelled);
                        state.cancelled = true;
                        continue;
                    }
                }
            };

            if step.is_end_step {
                state.end_output = Some(output.clone());
            }
            state.last_output = Some(output.clone());

            let next_input = if output.is_empty() { input } else { output };
            let mut children = Vec::new();

            for connection in definition.outgoing(&step.id) {
                let target = definition.step(&connection.target_step_id).ok_or_else(|| {
                    anyhow::anyhow!(
                        "Connection '{}' targets unknown step '{}'",
                        connection.id,
                        connection.target_step_id
                    )
                })?;

                if rejected_port == Some(connection.source_port.as_str()) {
                    tracing::debug!("⏭️ Skipping '{}' (port '{}' not selected)", target.id, connection.source_port);
                    children.push(Visit::Skipped { step: target, input: next_input.clone(), error: None });
                    continue;
                }

                if let Some(guard) = &connection.condition {
                    match self.conditions.evaluate(guard, &next_input) {
                        Ok(true) => {}
                        Ok(false) => {
                            tracing::debug!("⏭️ Skipping '{}' (guard on '{}' is false)", target.id, connection.id);
                            children.push(Visit::Skipped { step: target, input: next_input.clone(), error: None });
                            continue;
                        }
                        Err(e) => {
                            tracing::warn!("⚠️ Guard on connection '{}' failed: {}", connection.id, e);
                            let error = format!("Guard condition failed: {}", e);
                            children.push(Visit::Skipped { step: target, input: next_input.clone(), error: Some(error) });
                            continue;
                        }
                    }
                }

                children.push(Visit::Step(Frame {
                    step: target,
                    input: next_input.clone(),
                    visited: visited.clone(),
                }));
            }

            self.checkpoint(execution, cancel).await?;
            stack.extend(children.into_iter().rev());
        }

        Ok(())
    }

    async fn dispatch(&self, step: &WorkflowStep, input: &DataMap, cancel: &CancellationToken) -> StepOutcome {
        match StepHandler::for_step_type(step.step_type) {
            StepHandler::PassThrough => StepOutcome::completed(input.clone()),
            StepHandler::Integration => {
                let result = self
                    .integrations
                    .execute(&step.step_type, &step.configuration, input)
                    .await;

                if result.get("isSuccess").and_then(Value::as_bool).unwrap_or(false) {
                    StepOutcome::Completed {
                        output: result,
                        rejected_port: Some("error"),
                    }
                } else {
                    let error = result
                        .get("error")
                        .and_then(Value::as_str)
                        .unwrap_or("Integration reported failure")
                        .to_string();
                    StepOutcome::Failed(error)
                }
            }
            StepHandler::Condition => {
                let outcome = match &step.condition {
                    Some(condition) => self.conditions.evaluate(condition, input),
                    None => Ok(true),
                };

                match outcome {
                    Ok(result) => {
                        let mut output = input.clone();
                        output.insert(CONDITION_RESULT_KEY.to_string(), Value::Bool(result));
                        StepOutcome::Completed {
                            output,
                            rejected_port: Some(if result { "false" } else { "true" }),
                        }
                    }
                    Err(e) => StepOutcome::Failed(format!("Condition evaluation failed: {}", e)),
                }
            }
            StepHandler::Wait => {
                let duration = wait_duration(&step.configuration, self.settings.max_wait);
                tracing::debug!("⏳ Step '{}' waiting {:?}", step.id, duration);

                tokio::select! {
                    _ = tokio::time::sleep(duration) => StepOutcome::completed(input.clone()),
                    _ = cancel.cancelled() => StepOutcome::Cancelled,
                }
            }
        }
    }

    /// Persist the in-flight record unless the run has been cancelled
    ///
    /// Once cancelled, only the final save writes the record.
    async fn checkpoint(&self, execution: &WorkflowExecution, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Ok(());
        }
        self.store.save(execution).await
    }

    fn finalize(&self, execution: &mut WorkflowExecution, walked: Result<()>, state: WalkState, cancel: &CancellationToken) {
        let WalkState { cancelled, first_failure, end_output, last_output } = state;
        let end_completed = end_output.is_some();
        execution.output_data = end_output.or(last_output).unwrap_or_default();

        let (status, error) = if cancelled || cancel.is_cancelled() {
            (ExecutionStatus::Cancelled, Some("Execution cancelled".to_string()))
        } else if let Err(e) = walked {
            (ExecutionStatus::Failed, Some(e.to_string()))
        } else if let (Some(failure), false) = (first_failure, end_completed) {
            (ExecutionStatus::Failed, Some(failure))
        } else {
            (ExecutionStatus::Completed, None)
        };

        execution.error_message = error.clone();
        execution.finish(status);

        match (status, error) {
            (ExecutionStatus::Completed, _) => {
                tracing::info!("🎉 Execution {} completed in {} ms", execution.id, execution.duration_ms.unwrap_or_default());
                self.progress.publish(ProgressEvent::RunCompleted {
                    execution_id: execution.id,
                    status,
                    output_data: execution.output_data.clone(),
                });
            }
            (status, error) => {
                let error = error.unwrap_or_default();
                tracing::warn!("💥 Execution {} ended {:?}: {}", execution.id, status, error);
                self.progress.publish(ProgressEvent::RunFailed {
                    execution_id: execution.id,
                    status,
                    error,
                    output_data: execution.output_data.clone(),
                });
            }
        }
    }
}

fn single_start_step(definition: &WorkflowDefinition) -> Result<&WorkflowStep> {
    let mut starts = definition.start_steps();
    match (starts.next(), starts.next()) {
        (Some(start), None) => Ok(start),
        (None, _) => Err(anyhow::anyhow!("Workflow has no start step")),
        (Some(_), Some(_)) => Err(anyhow::anyhow!("Workflow has more than one start step")),
    }
}

/// Append a step execution that is already in a terminal status
fn push_finished(
    execution: &mut WorkflowExecution,
    step: &WorkflowStep,
    status: StepExecutionStatus,
    input: DataMap,
    error: Option<String>,
) {
    let mut record = WorkflowStepExecution::new(step, status, input);
    record.error_message = error;
    record.finish(status);
    execution.step_executions.push(record);
}

/// `durationMs` wins over `durationSeconds`; both are capped at `max`
fn wait_duration(configuration: &DataMap, max: Duration) -> Duration {
    let requested = configuration
        .get("durationMs")
        .and_then(Value::as_u64)
        .map(Duration::from_millis)
        .or_else(|| {
            configuration
                .get("durationSeconds")
                .and_then(Value::as_f64)
                .filter(|seconds| seconds.is_finite() && *seconds >= 0.0)
                .map(|seconds| Duration::from_secs_f64(seconds.min(max.as_secs_f64())))
        })
        .unwrap_or_default();

    requested.min(max)
}
