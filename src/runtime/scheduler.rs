//! Background cron scheduler service
//!
//! A Start step whose configuration carries a `schedule` (6-field cron, with
//! seconds) gets a tokio-cron-scheduler job. Each firing queues a background
//! run with trigger source `schedule`. Jobs are replaced in place when a
//! workflow is saved and dropped when it is deleted.

use crate::execution::orchestrator::{ExecutionOrchestrator, OrchestratorError, StartRequest};
use crate::execution::types::TriggerSource;
use crate::workflow::types::{DataMap, StepType, Workflow, WorkflowStep};
use anyhow::Result;
use serde_json::Value;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

/// Hot-reload cron scheduler for scheduled workflows
pub struct CronSchedulerService {
    scheduler: Arc<RwLock<JobScheduler>>,
    /// "{workflow_id}:{step_id}" -> scheduler job id
    job_uuid_map: Arc<RwLock<HashMap<String, Uuid>>>,
    orchestrator: Arc<ExecutionOrchestrator>,
}

impl CronSchedulerService {
    pub async fn new(orchestrator: Arc<ExecutionOrchestrator>) -> Result<Self> {
        let scheduler = JobScheduler::new().await?;

        Ok(Self {
            scheduler: Arc::new(RwLock::new(scheduler)),
            job_uuid_map: Arc::new(RwLock::new(HashMap::new())),
            orchestrator,
        })
    }

    /// Register schedules for every active workflow and start ticking
    pub async fn start(&self) -> Result<()> {
        tracing::info!("⏰ Starting cron scheduler service");

        self.register_all_schedules().await?;

        {
            let scheduler = self.scheduler.read().await;
            scheduler.start().await?;
        }

        tracing::info!("✅ Cron scheduler started");
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        tracing::info!("⏹️ Stopping cron scheduler service");

        self.job_uuid_map.write().await.clear();
        {
            let mut scheduler = self.scheduler.write().await;
            scheduler.shutdown().await?;
        }

        tracing::info!("✅ Cron scheduler stopped");
        Ok(())
    }

    /// Replace the jobs of a saved workflow with its current schedules
    pub async fn add_or_update_workflow_schedules(&self, workflow: &Workflow) -> Result<()> {
        self.remove_workflow_schedules(&workflow.id).await;

        let scheduled: Vec<(&WorkflowStep, &str)> = workflow
            .definition
            .steps
            .iter()
            .filter_map(|step| schedule_of(step).map(|schedule| (step, schedule)))
            .collect();

        if scheduled.is_empty() {
            tracing::debug!("📋 No schedules found in workflow: {}", workflow.id);
            return Ok(());
        }

        for (step, schedule) in &scheduled {
            self.add_job(&workflow.id, step, schedule).await?;
        }

        tracing::info!("🔥 Registered {} schedule(s) for workflow: {}", scheduled.len(), workflow.id);
        Ok(())
    }

    /// Drop every job belonging to a workflow
    pub async fn remove_workflow_schedules(&self, workflow_id: &str) {
        let prefix = format!("{}:", workflow_id);
        let mut job_uuid_map = self.job_uuid_map.write().await;
        let keys: Vec<String> = job_uuid_map
            .keys()
            .filter(|key| key.starts_with(&prefix))
            .cloned()
            .collect();

        for key in keys {
            if let Some(job_uuid) = job_uuid_map.remove(&key) {
                let scheduler = self.scheduler.read().await;
                if let Err(e) = scheduler.remove(&job_uuid).await {
                    tracing::warn!("⚠️ Failed to remove job {} from scheduler: {}", key, e);
                } else {
                    tracing::debug!("🛑 Removed cron job from scheduler: {}", key);
                }
            }
        }
    }

    /// Job keys currently registered, sorted
    pub async fn registered_jobs(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.job_uuid_map.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    async fn add_job(&self, workflow_id: &str, step: &WorkflowStep, schedule: &str) -> Result<()> {
        let job_id = format!("{}:{}", workflow_id, step.id);
        let input = step
            .configuration
            .get("scheduleInput")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        let workflow_id = workflow_id.to_string();
        let orchestrator = Arc::clone(&self.orchestrator);

        let job = Job::new_async(schedule, move |_uuid, _l| {
            let workflow_id = workflow_id.clone();
            let input = input.clone();
            let orchestrator = Arc::clone(&orchestrator);

            Box::pin(async move {
                tracing::debug!("🔔 Schedule fired for workflow {}", workflow_id);
                fire(&orchestrator, &workflow_id, input).await;
            })
        })
        .map_err(|e| anyhow::anyhow!("Invalid schedule '{}' on {}: {}", schedule, job_id, e))?;

        let job_uuid = {
            let scheduler = self.scheduler.write().await;
            scheduler.add(job).await?
        };
        self.job_uuid_map.write().await.insert(job_id.clone(), job_uuid);

        tracing::info!("🔥 Scheduled job: {} ({})", job_id, schedule);
        Ok(())
    }

    async fn register_all_schedules(&self) -> Result<()> {
        let workflows = self.orchestrator.registry().get_all_workflows();
        for workflow in &workflows {
            self.add_or_update_workflow_schedules(workflow).await?;
        }

        tracing::info!("📊 Registered {} schedule(s) from {} workflows",
            self.job_uuid_map.read().await.len(), workflows.len());
        Ok(())
    }
}

/// The cron expression of a scheduled Start step
pub(crate) fn schedule_of(step: &WorkflowStep) -> Option<&str> {
    if step.step_type != StepType::Start {
        return None;
    }
    step.configuration
        .get("schedule")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|schedule| !schedule.is_empty())
}

/// Why a cron expression cannot be turned into a job, if it cannot
pub(crate) fn schedule_error(schedule: &str) -> Option<String> {
    Job::new_async(schedule, |_uuid, _l| Box::pin(async {}))
        .err()
        .map(|e| e.to_string())
}

async fn fire(orchestrator: &ExecutionOrchestrator, workflow_id: &str, input: DataMap) {
    let request = StartRequest::new(workflow_id, input).triggered_by(TriggerSource::Schedule);
    match orchestrator.start(request).await {
        Ok(started) => {
            tracing::info!("🚀 Scheduled run queued: {} ({})", workflow_id, started.execution_id);
        }
        Err(OrchestratorError::WorkflowNotFound(_)) => {
            // Deleted after the job was registered
            tracing::debug!("⏭️ Skipping schedule for removed workflow: {}", workflow_id);
        }
        Err(e) => {
            tracing::error!("❌ Scheduled run of {} could not start: {}", workflow_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::queue::TokioTaskQueue;
    use crate::execution::store::InMemoryExecutionStore;
    use crate::execution::types::ExecutionStatus;
    use crate::runtime::engine::ExecutionEngine;
    use crate::runtime::integration::DefaultIntegrationExecutor;
    use crate::workflow::registry::WorkflowRegistry;
    use crate::workflow::types::{WorkflowConnection, WorkflowDefinition};
    use crate::workflow::validator::GraphValidator;
    use serde_json::json;

    fn scheduled(id: &str, schedule: &str) -> Workflow {
        Workflow {
            id: id.into(),
            tenant_id: "default".into(),
            name: id.into(),
            definition: WorkflowDefinition {
                steps: vec![
                    WorkflowStep::new("tick", "Tick", StepType::Start)
                        .with_config("schedule", schedule)
                        .with_config("scheduleInput", json!({ "source": "cron" })),
                    WorkflowStep::new("done", "Done", StepType::End),
                ],
                connections: vec![WorkflowConnection::new("c", ("tick", "output"), ("done", "input"))],
                ..Default::default()
            },
        }
    }

    fn orchestrator() -> Arc<ExecutionOrchestrator> {
        let registry = Arc::new(WorkflowRegistry::new(GraphValidator::new()));
        let engine = Arc::new(ExecutionEngine::new(
            Arc::new(DefaultIntegrationExecutor::default()),
            Arc::new(InMemoryExecutionStore::new()),
        ));
        Arc::new(ExecutionOrchestrator::new(registry, engine, Arc::new(TokioTaskQueue::new(2))))
    }

    #[test]
    fn only_start_steps_carry_schedules() {
        let workflow = scheduled("wf", "0 */5 * * * *");
        assert_eq!(schedule_of(&workflow.definition.steps[0]), Some("0 */5 * * * *"));
        let action = WorkflowStep::new("a", "A", StepType::Action).with_config("schedule", "* * * * * *");
        assert_eq!(schedule_of(&action), None);
    }

    #[tokio::test]
    async fn jobs_are_replaced_and_removed_per_workflow() {
        let service = CronSchedulerService::new(orchestrator()).await.unwrap();

        service.add_or_update_workflow_schedules(&scheduled("wf-1", "0 0 * * * *")).await.unwrap();
        service.add_or_update_workflow_schedules(&scheduled("wf-10", "0 0 * * * *")).await.unwrap();
        service.add_or_update_workflow_schedules(&scheduled("wf-1", "0 30 * * * *")).await.unwrap();
        assert_eq!(service.registered_jobs().await, vec!["wf-1:tick", "wf-10:tick"]);

        service.remove_workflow_schedules("wf-1").await;
        assert_eq!(service.registered_jobs().await, vec!["wf-10:tick"]);
    }

    #[test]
    fn schedule_errors_explain_unparsable_expressions() {
        assert!(schedule_error("0 0 * * * *").is_none());
        assert!(schedule_error("whenever").is_some());
        assert!(schedule_error("61 * * * * *").is_some());
    }

    #[tokio::test]
    async fn invalid_schedule_is_rejected() {
        let service = CronSchedulerService::new(orchestrator()).await.unwrap();
        assert!(service.add_or_update_workflow_schedules(&scheduled("wf", "whenever")).await.is_err());
    }

    #[tokio::test]
    async fn firing_queues_a_scheduled_run() {
        let orchestrator = orchestrator();
        orchestrator.registry().upsert(scheduled("wf", "0 0 * * * *")).unwrap();

        fire(&orchestrator, "wf", json!({ "source": "cron" }).as_object().cloned().unwrap()).await;
        fire(&orchestrator, "missing", DataMap::new()).await;

        // Give the queued run a moment to finish
        for _ in 0..50 {
            let runs = orchestrator.list("wf").await.unwrap();
            if runs.first().is_some_and(|run| run.status.is_terminal()) {
                assert_eq!(runs[0].trigger_source, TriggerSource::Schedule);
                assert_eq!(runs[0].status, ExecutionStatus::Completed);
                assert_eq!(runs[0].output_data["source"], json!("cron"));
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("scheduled run did not finish");
    }
}
