//! Run lifecycle: start (inline or queued), query, cancel and retry
//!
//! The orchestrator owns the cancellation tokens of in-flight runs. A token is
//! registered before the Running record is first saved and released after the
//! engine's final save. Step and run failures never surface here as errors;
//! they live in the returned or stored execution record.

use crate::execution::queue::{JobHandle, TaskQueue};
use crate::execution::store::ExecutionStore;
use crate::execution::types::{ExecutionStatus, TriggerSource, WorkflowExecution};
use crate::runtime::engine::ExecutionEngine;
use crate::workflow::registry::WorkflowRegistry;
use crate::workflow::types::{DataMap, Workflow};
use serde::Deserialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),
    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),
    #[error("execution store failure: {0}")]
    Store(#[from] anyhow::Error),
}

/// Parameters of a run start
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub workflow_id: String,
    /// Must match the workflow's tenant when given
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub input_data: DataMap,
    #[serde(default)]
    pub trigger_source: TriggerSource,
    /// Run inline and return the full trace instead of queueing
    #[serde(default)]
    pub wait_for_completion: bool,
}

impl StartRequest {
    pub fn new(workflow_id: impl Into<String>, input_data: DataMap) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            input_data,
            ..Default::default()
        }
    }

    pub fn triggered_by(mut self, trigger_source: TriggerSource) -> Self {
        self.trigger_source = trigger_source;
        self
    }

    pub fn wait(mut self) -> Self {
        self.wait_for_completion = true;
        self
    }
}

/// Outcome of a run start
#[derive(Debug)]
pub struct StartedRun {
    pub execution_id: Uuid,
    /// Final record when the run was started inline
    pub execution: Option<WorkflowExecution>,
    /// Background job when the run was queued
    pub job: Option<JobHandle>,
}

pub struct ExecutionOrchestrator {
    registry: Arc<WorkflowRegistry>,
    engine: Arc<ExecutionEngine>,
    store: Arc<dyn ExecutionStore>,
    queue: Arc<dyn TaskQueue>,
    /// Cancellation tokens of runs that have not finished yet
    active: Arc<RwLock<HashMap<Uuid, CancellationToken>>>,
}

impl ExecutionOrchestrator {
    pub fn new(registry: Arc<WorkflowRegistry>, engine: Arc<ExecutionEngine>, queue: Arc<dyn TaskQueue>) -> Self {
        let store = Arc::clone(engine.store());
        Self {
            registry,
            engine,
            store,
            queue,
            active: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn registry(&self) -> &Arc<WorkflowRegistry> {
        &self.registry
    }

    /// Start a run against the current definition snapshot
    pub async fn start(&self, request: StartRequest) -> Result<StartedRun, OrchestratorError> {
        let active = self
            .registry
            .get_workflow(&request.workflow_id)
            .filter(|active| {
                request
                    .tenant_id
                    .as_deref()
                    .map_or(true, |tenant| tenant == active.workflow.tenant_id)
            })
            .ok_or_else(|| OrchestratorError::WorkflowNotFound(request.workflow_id.clone()))?;

        let workflow = self
            .registry
            .snapshot_for_run(&active.workflow.id)
            .ok_or_else(|| OrchestratorError::WorkflowNotFound(request.workflow_id.clone()))?;

        let mut execution = WorkflowExecution::new(
            &workflow.id,
            &workflow.tenant_id,
            request.input_data,
            request.trigger_source,
        );
        execution.status = ExecutionStatus::Running;

        let execution_id = execution.id;
        let cancel = self.track(execution_id).await;
        if let Err(e) = self.store.save(&execution).await {
            self.active.write().await.remove(&execution_id);
            return Err(e.into());
        }
        tracing::info!("▶️ Started execution {} of {} ({:?})", execution_id, workflow.id, request.trigger_source);

        if request.wait_for_completion {
            // Detached so the run still finishes if the caller goes away
            let finished = tokio::spawn(self.drive(workflow, execution, cancel))
                .await
                .map_err(|e| anyhow::anyhow!("Execution task {} failed: {}", execution_id, e))?;
            Ok(StartedRun {
                execution_id,
                execution: Some(finished),
                job: None,
            })
        } else {
            let job = self.enqueue(workflow, execution, cancel);
            Ok(StartedRun {
                execution_id,
                execution: None,
                job: Some(job),
            })
        }
    }

    pub async fn get(&self, execution_id: Uuid) -> Result<WorkflowExecution, OrchestratorError> {
        self.store
            .get(execution_id)
            .await?
            .ok_or(OrchestratorError::ExecutionNotFound(execution_id))
    }

    /// Runs of a workflow, most recent first
    pub async fn list(&self, workflow_id: &str) -> Result<Vec<WorkflowExecution>, OrchestratorError> {
        Ok(self.store.list_for_workflow(workflow_id).await?)
    }

    /// Cancel a Running execution; any other status is left alone
    ///
    /// An in-flight run is only signalled: the engine stops at its next step
    /// boundary and writes the Cancelled record itself. A Running record
    /// without a live run (left over from a previous process) is closed here.
    pub async fn cancel(&self, execution_id: Uuid) -> Result<bool, OrchestratorError> {
        if let Some(token) = self.active.read().await.get(&execution_id) {
            token.cancel();
            tracing::info!("🛑 Cancellation requested for execution {}", execution_id);
            return Ok(true);
        }

        let mut execution = self.get(execution_id).await?;
        if execution.status != ExecutionStatus::Running {
            return Ok(false);
        }

        // A retry may have picked the record up while it was being read
        if self.active.read().await.contains_key(&execution_id) {
            return Ok(false);
        }

        execution.error_message = Some("Execution cancelled".to_string());
        execution.finish(ExecutionStatus::Cancelled);
        self.store.save(&execution).await?;

        tracing::info!("🛑 Closed orphaned execution {}", execution_id);
        Ok(true)
    }

    /// Re-queue a Failed execution under the same id
    pub async fn retry(&self, execution_id: Uuid) -> Result<bool, OrchestratorError> {
        Ok(self.retry_queued(execution_id).await?.is_some())
    }

    /// Like [`retry`](Self::retry), returning the background job when re-queued
    pub async fn retry_queued(&self, execution_id: Uuid) -> Result<Option<JobHandle>, OrchestratorError> {
        let mut execution = self.get(execution_id).await?;
        if execution.status != ExecutionStatus::Failed {
            return Ok(None);
        }

        let workflow = self
            .registry
            .snapshot_for_run(&execution.workflow_id)
            .ok_or_else(|| OrchestratorError::WorkflowNotFound(execution.workflow_id.clone()))?;

        execution.status = ExecutionStatus::Running;
        execution.error_message = None;
        execution.completed_at = None;
        execution.duration_ms = None;

        let cancel = self.track(execution_id).await;
        if let Err(e) = self.store.save(&execution).await {
            self.active.write().await.remove(&execution_id);
            return Err(e.into());
        }
        tracing::info!("🔁 Retrying execution {} of {}", execution_id, workflow.id);
        Ok(Some(self.enqueue(workflow, execution, cancel)))
    }

    async fn track(&self, execution_id: Uuid) -> CancellationToken {
        let token = CancellationToken::new();
        self.active.write().await.insert(execution_id, token.clone());
        token
    }

    /// Walk the run to its final save, then release its token
    fn drive(
        &self,
        workflow: Arc<Workflow>,
        execution: WorkflowExecution,
        cancel: CancellationToken,
    ) -> impl Future<Output = WorkflowExecution> + Send + 'static {
        let engine = Arc::clone(&self.engine);
        let active = Arc::clone(&self.active);

        async move {
            let execution_id = execution.id;
            let finished = engine.run(&workflow.definition, execution, &cancel).await;
            active.write().await.remove(&execution_id);
            finished
        }
    }

    fn enqueue(&self, workflow: Arc<Workflow>, execution: WorkflowExecution, cancel: CancellationToken) -> JobHandle {
        let run = self.drive(workflow, execution, cancel);

        self.queue.enqueue(Box::pin(async move {
            let finished = run.await;
            tracing::debug!("🏁 Background execution {} ended {:?}", finished.id, finished.status);
        }))
    }
}
