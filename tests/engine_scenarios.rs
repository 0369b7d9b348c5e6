use async_trait::async_trait;
use flowrun::execution::{
    ExecutionStatus, ExecutionStore, InMemoryExecutionStore, StepExecutionStatus, TriggerSource, WorkflowExecution,
};
use flowrun::runtime::{
    BroadcastProgressPublisher, DefaultIntegrationExecutor, EngineSettings, ExecutionEngine, IntegrationExecutor,
    ProgressEvent,
};
use flowrun::workflow::{Condition, DataMap, StepType, Workflow, WorkflowConnection, WorkflowDefinition, WorkflowStep};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Succeeds with the input plus `isSuccess`, unless the step is configured with `fail: true`
struct StubIntegrations;

#[async_trait]
impl IntegrationExecutor for StubIntegrations {
    async fn execute(&self, _step_type: &StepType, configuration: &DataMap, input: &DataMap) -> DataMap {
        if configuration.get("fail").and_then(Value::as_bool).unwrap_or(false) {
            return map(json!({ "isSuccess": false, "error": "upstream refused" }));
        }
        let mut output = input.clone();
        output.insert("isSuccess".to_string(), Value::Bool(true));
        output
    }
}

fn map(value: Value) -> DataMap {
    value.as_object().cloned().unwrap()
}

fn connect(id: &str, from: (&str, &str), to: &str) -> WorkflowConnection {
    WorkflowConnection::new(id, from, (to, "input"))
}

fn workflow(steps: Vec<WorkflowStep>, connections: Vec<WorkflowConnection>) -> Workflow {
    Workflow {
        id: "wf-test".to_string(),
        tenant_id: "default".to_string(),
        name: "Test".to_string(),
        definition: WorkflowDefinition {
            steps,
            connections,
            layout: Value::Null,
        },
    }
}

fn engine_with(integrations: Arc<dyn IntegrationExecutor>) -> (ExecutionEngine, Arc<InMemoryExecutionStore>) {
    let store = Arc::new(InMemoryExecutionStore::new());
    let engine = ExecutionEngine::new(integrations, store.clone());
    (engine, store)
}

fn stub_engine() -> (ExecutionEngine, Arc<InMemoryExecutionStore>) {
    engine_with(Arc::new(StubIntegrations))
}

fn visit_order(execution: &WorkflowExecution) -> Vec<(&str, StepExecutionStatus)> {
    execution
        .step_executions
        .iter()
        .map(|step| (step.step_id.as_str(), step.status))
        .collect()
}

#[tokio::test]
async fn linear_workflow_completes_with_end_output() {
    let (engine, store) = stub_engine();
    let wf = workflow(
        vec![
            WorkflowStep::new("start", "Start", StepType::Start),
            WorkflowStep::new("act", "Transform", StepType::Action),
            WorkflowStep::new("end", "End", StepType::End),
        ],
        vec![connect("c1", ("start", "output"), "act"), connect("c2", ("act", "output"), "end")],
    );

    let execution = engine.execute(&wf, map(json!({ "x": 1 })), TriggerSource::Manual).await;

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(
        visit_order(&execution),
        vec![
            ("start", StepExecutionStatus::Completed),
            ("act", StepExecutionStatus::Completed),
            ("end", StepExecutionStatus::Completed),
        ]
    );
    assert_eq!(execution.output_data, map(json!({ "x": 1 })));
    assert!(execution.error_message.is_none());
    assert!(execution.completed_at.is_some());

    let stored = store.get(execution.id).await.unwrap().unwrap();
    assert_eq!(stored, execution);
}

#[tokio::test]
async fn failed_http_step_stops_its_branch_and_fails_the_run() {
    let (engine, _) = engine_with(Arc::new(DefaultIntegrationExecutor::default()));
    let wf = workflow(
        vec![
            WorkflowStep::new("start", "Start", StepType::Start),
            WorkflowStep::new("http", "Call", StepType::HttpRequest).with_config("url", "not a valid url"),
            WorkflowStep::new("end", "End", StepType::End),
        ],
        vec![connect("c1", ("start", "output"), "http"), connect("c2", ("http", "success"), "end")],
    );

    let execution = engine.execute(&wf, DataMap::new(), TriggerSource::Api).await;

    assert_eq!(execution.status, ExecutionStatus::Failed);
    let http = execution.executions_of("http").next().unwrap();
    assert_eq!(http.status, StepExecutionStatus::Failed);
    assert!(http.error_message.is_some());
    assert_eq!(execution.executions_of("end").count(), 0);
    assert!(execution.error_message.unwrap().contains("Step 'http' failed"));
}

fn branching_workflow() -> Workflow {
    workflow(
        vec![
            WorkflowStep::new("start", "Start", StepType::Start),
            WorkflowStep::new("check", "Large order?", StepType::Condition)
                .with_condition(Condition::new("amount > 100")),
            WorkflowStep::new("high", "Manual review", StepType::Action),
            WorkflowStep::new("low", "Auto approve", StepType::Action),
            WorkflowStep::new("end", "End", StepType::End),
        ],
        vec![
            connect("c1", ("start", "output"), "check"),
            connect("c2", ("check", "true"), "high"),
            connect("c3", ("check", "false"), "low"),
            connect("c4", ("high", "output"), "end"),
            connect("c5", ("low", "output"), "end"),
        ],
    )
}

#[tokio::test]
async fn condition_follows_only_the_selected_port() {
    let (engine, _) = stub_engine();
    let wf = branching_workflow();

    let large = engine.execute(&wf, map(json!({ "amount": 150 })), TriggerSource::Manual).await;
    assert_eq!(large.status, ExecutionStatus::Completed);
    assert_eq!(
        visit_order(&large),
        vec![
            ("start", StepExecutionStatus::Completed),
            ("check", StepExecutionStatus::Completed),
            ("high", StepExecutionStatus::Completed),
            ("end", StepExecutionStatus::Completed),
            ("low", StepExecutionStatus::Skipped),
        ]
    );
    assert_eq!(large.output_data["conditionResult"], true);

    let small = engine.execute(&wf, map(json!({ "amount": 20 })), TriggerSource::Manual).await;
    assert_eq!(small.executions_of("high").next().unwrap().status, StepExecutionStatus::Skipped);
    assert_eq!(small.executions_of("low").next().unwrap().status, StepExecutionStatus::Completed);
    assert_eq!(small.output_data["conditionResult"], false);
}

#[tokio::test]
async fn fan_out_walks_each_branch_depth_first() {
    let (engine, _) = stub_engine();
    let wf = workflow(
        vec![
            WorkflowStep::new("start", "Start", StepType::Start),
            WorkflowStep::new("a", "A", StepType::Action),
            WorkflowStep::new("b", "B", StepType::UserTask),
            WorkflowStep::new("end", "End", StepType::End),
        ],
        vec![
            connect("c1", ("start", "output"), "a"),
            connect("c2", ("start", "output"), "b"),
            connect("c3", ("a", "output"), "end"),
            connect("c4", ("b", "output"), "end"),
        ],
    );

    let execution = engine.execute(&wf, DataMap::new(), TriggerSource::Manual).await;

    let ids: Vec<&str> = execution.step_executions.iter().map(|step| step.step_id.as_str()).collect();
    assert_eq!(ids, vec!["start", "a", "end", "b", "end"]);
    assert_eq!(execution.status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn failing_branch_does_not_stop_its_sibling() {
    let (engine, _) = stub_engine();
    let wf = workflow(
        vec![
            WorkflowStep::new("start", "Start", StepType::Start),
            WorkflowStep::new("bad", "Notify", StepType::Webhook).with_config("fail", true),
            WorkflowStep::new("after-bad", "Never", StepType::Action),
            WorkflowStep::new("ok", "Record", StepType::Action),
            WorkflowStep::new("end", "End", StepType::End),
        ],
        vec![
            connect("c1", ("start", "output"), "bad"),
            connect("c2", ("bad", "success"), "after-bad"),
            connect("c3", ("start", "output"), "ok"),
            connect("c4", ("ok", "output"), "end"),
        ],
    );

    let execution = engine.execute(&wf, DataMap::new(), TriggerSource::Manual).await;

    assert_eq!(
        visit_order(&execution),
        vec![
            ("start", StepExecutionStatus::Completed),
            ("bad", StepExecutionStatus::Failed),
            ("ok", StepExecutionStatus::Completed),
            ("end", StepExecutionStatus::Completed),
        ]
    );
    assert_eq!(execution.executions_of("bad").next().unwrap().error_message.as_deref(), Some("upstream refused"));
    // An End step completed, so the run succeeds despite the failed branch
    assert_eq!(execution.status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn successful_integration_skips_its_error_port() {
    let (engine, _) = stub_engine();
    let wf = workflow(
        vec![
            WorkflowStep::new("start", "Start", StepType::Start),
            WorkflowStep::new("call", "Call", StepType::HttpRequest),
            WorkflowStep::new("alert", "Alert", StepType::Action),
            WorkflowStep::new("end", "End", StepType::End),
        ],
        vec![
            connect("c1", ("start", "output"), "call"),
            connect("c2", ("call", "error"), "alert"),
            connect("c3", ("call", "success"), "end"),
        ],
    );

    let execution = engine.execute(&wf, map(json!({ "id": 7 })), TriggerSource::Manual).await;

    // Skipped targets are recorded in connection order, like visited ones
    assert_eq!(
        visit_order(&execution),
        vec![
            ("start", StepExecutionStatus::Completed),
            ("call", StepExecutionStatus::Completed),
            ("alert", StepExecutionStatus::Skipped),
            ("end", StepExecutionStatus::Completed),
        ]
    );
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.output_data["id"], 7);
    assert_eq!(execution.output_data["isSuccess"], true);
}

#[tokio::test]
async fn cycle_stops_at_first_repeat() {
    let (engine, _) = stub_engine();
    let wf = workflow(
        vec![
            WorkflowStep::new("start", "Start", StepType::Start),
            WorkflowStep::new("a", "A", StepType::Action),
            WorkflowStep::new("b", "B", StepType::Action),
            WorkflowStep::new("end", "End", StepType::End),
        ],
        vec![
            connect("c1", ("start", "output"), "a"),
            connect("c2", ("a", "output"), "b"),
            connect("c3", ("b", "output"), "a"),
        ],
    );

    let execution = engine.execute(&wf, map(json!({ "n": 1 })), TriggerSource::Manual).await;

    let ids: Vec<&str> = execution.step_executions.iter().map(|step| step.step_id.as_str()).collect();
    assert_eq!(ids, vec!["start", "a", "b"]);
    assert_eq!(execution.status, ExecutionStatus::Completed);
    // No End step ran, so the last completed output is reported
    assert_eq!(execution.output_data, map(json!({ "n": 1 })));
}

#[tokio::test]
async fn connection_guards_skip_targets() {
    let (engine, _) = stub_engine();
    let mut guarded = connect("c2", ("start", "output"), "big");
    guarded.condition = Some(Condition::new("x > 5"));
    let mut broken = connect("c3", ("start", "output"), "broken");
    broken.condition = Some(Condition::new("x >>> ("));

    let wf = workflow(
        vec![
            WorkflowStep::new("start", "Start", StepType::Start),
            WorkflowStep::new("small", "Small", StepType::Action),
            WorkflowStep::new("big", "Big", StepType::Action),
            WorkflowStep::new("broken", "Broken", StepType::Action),
            WorkflowStep::new("end", "End", StepType::End),
        ],
        vec![
            connect("c1", ("start", "output"), "small"),
            guarded,
            broken,
            connect("c4", ("small", "output"), "end"),
        ],
    );

    let execution = engine.execute(&wf, map(json!({ "x": 2 })), TriggerSource::Manual).await;

    let ids: Vec<&str> = execution.step_executions.iter().map(|step| step.step_id.as_str()).collect();
    assert_eq!(ids, vec!["start", "small", "end", "big", "broken"]);

    let big = execution.executions_of("big").next().unwrap();
    assert_eq!(big.status, StepExecutionStatus::Skipped);
    assert!(big.error_message.is_none());

    let broken = execution.executions_of("broken").next().unwrap();
    assert_eq!(broken.status, StepExecutionStatus::Skipped);
    assert!(broken.error_message.as_deref().unwrap().starts_with("Guard condition failed"));

    assert_eq!(execution.executions_of("end").next().unwrap().status, StepExecutionStatus::Completed);
    assert_eq!(execution.status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn script_templates_are_bound_from_input() {
    let (engine, _) = engine_with(Arc::new(DefaultIntegrationExecutor::default()));
    let wf = workflow(
        vec![
            WorkflowStep::new("start", "Start", StepType::Start),
            WorkflowStep::new("greet", "Greet", StepType::ScriptExecution)
                .with_config("script", "return { greeting = 'hi ${name}', doubled = input.n * 2 }"),
            WorkflowStep::new("end", "End", StepType::End),
        ],
        vec![connect("c1", ("start", "output"), "greet"), connect("c2", ("greet", "success"), "end")],
    );

    let execution = engine
        .execute(&wf, map(json!({ "name": "Ada", "n": 21 })), TriggerSource::Manual)
        .await;

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.output_data["result"]["greeting"], "hi Ada");
    assert_eq!(execution.output_data["result"]["doubled"], 42);
}

#[tokio::test]
async fn missing_start_step_fails_the_run() {
    let (engine, _) = stub_engine();
    let wf = workflow(vec![WorkflowStep::new("end", "End", StepType::End)], vec![]);

    let execution = engine.execute(&wf, DataMap::new(), TriggerSource::Manual).await;

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert!(execution.step_executions.is_empty());
    assert_eq!(execution.error_message.as_deref(), Some("Workflow has no start step"));
}

fn waiting_workflow(config_key: &str, amount: u64) -> Workflow {
    workflow(
        vec![
            WorkflowStep::new("start", "Start", StepType::Start),
            WorkflowStep::new("pause", "Pause", StepType::Wait).with_config(config_key, amount),
            WorkflowStep::new("end", "End", StepType::End),
        ],
        vec![connect("c1", ("start", "output"), "pause"), connect("c2", ("pause", "output"), "end")],
    )
}

#[tokio::test]
async fn short_wait_passes_input_through() {
    let (engine, _) = stub_engine();
    let wf = waiting_workflow("durationMs", 20);

    let execution = engine.execute(&wf, map(json!({ "k": "v" })), TriggerSource::Manual).await;

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.output_data["k"], "v");
}

#[tokio::test]
async fn cancellation_interrupts_a_wait() {
    let (engine, store) = stub_engine();
    let wf = waiting_workflow("durationSeconds", 30);
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let execution = WorkflowExecution::new(&wf.id, &wf.tenant_id, DataMap::new(), TriggerSource::Manual);
    let execution = tokio::time::timeout(Duration::from_secs(5), engine.run(&wf.definition, execution, &cancel))
        .await
        .expect("wait step should be interrupted");

    assert_eq!(execution.status, ExecutionStatus::Cancelled);
    assert_eq!(execution.executions_of("pause").next().unwrap().status, StepExecutionStatus::Cancelled);
    assert_eq!(execution.executions_of("end").count(), 0);
    assert_eq!(store.get(execution.id).await.unwrap().unwrap().status, ExecutionStatus::Cancelled);
}

#[tokio::test]
async fn cancelled_before_start_records_a_cancelled_step() {
    let (engine, _) = stub_engine();
    let wf = waiting_workflow("durationMs", 0);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let execution = WorkflowExecution::new(&wf.id, &wf.tenant_id, DataMap::new(), TriggerSource::Manual);
    let execution = engine.run(&wf.definition, execution, &cancel).await;

    assert_eq!(execution.status, ExecutionStatus::Cancelled);
    assert_eq!(visit_order(&execution), vec![("start", StepExecutionStatus::Cancelled)]);
}

#[tokio::test]
async fn wait_is_capped_by_engine_settings() {
    let (engine, _) = stub_engine();
    let engine = engine.with_settings(EngineSettings {
        max_wait: Duration::from_millis(10),
    });
    let wf = waiting_workflow("durationSeconds", 600);

    let execution = tokio::time::timeout(
        Duration::from_secs(5),
        engine.execute(&wf, DataMap::new(), TriggerSource::Manual),
    )
    .await
    .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn progress_events_follow_the_walk() {
    let progress = Arc::new(BroadcastProgressPublisher::new(16));
    let mut events = progress.subscribe();
    let (engine, _) = stub_engine();
    let engine = engine.with_progress(progress.clone());

    let wf = workflow(
        vec![
            WorkflowStep::new("start", "Start", StepType::Start),
            WorkflowStep::new("bad", "Notify", StepType::EmailSend).with_config("fail", true),
            WorkflowStep::new("end", "End", StepType::End),
        ],
        vec![connect("c1", ("start", "output"), "bad"), connect("c2", ("bad", "success"), "end")],
    );
    let execution = engine.execute(&wf, DataMap::new(), TriggerSource::Manual).await;

    let mut received = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.execution_id(), execution.id);
        received.push(event);
    }

    assert_eq!(received.len(), 3);
    assert!(matches!(&received[0], ProgressEvent::StepCompleted { step_id, .. } if step_id == "start"));
    assert!(matches!(&received[1], ProgressEvent::StepFailed { step_id, error, .. }
        if step_id == "bad" && error == "upstream refused"));
    match &received[2] {
        ProgressEvent::RunFailed { status, output_data, .. } => {
            assert_eq!(*status, ExecutionStatus::Failed);
            assert_eq!(output_data, &execution.output_data);
        }
        other => panic!("expected RunFailed, got {:?}", other),
    }
}

#[tokio::test]
async fn rerunning_a_record_counts_earlier_failures() {
    let (engine, _) = stub_engine();
    let wf = workflow(
        vec![
            WorkflowStep::new("start", "Start", StepType::Start),
            WorkflowStep::new("query", "Query", StepType::DatabaseQuery).with_config("fail", true),
            WorkflowStep::new("end", "End", StepType::End),
        ],
        vec![connect("c1", ("start", "output"), "query"), connect("c2", ("query", "success"), "end")],
    );

    let first = engine.execute(&wf, DataMap::new(), TriggerSource::Manual).await;
    assert_eq!(first.status, ExecutionStatus::Failed);

    let second = engine.run(&wf.definition, first, &CancellationToken::new()).await;

    let retries: Vec<u32> = second.executions_of("query").map(|step| step.retry_count).collect();
    assert_eq!(retries, vec![0, 1]);
    assert_eq!(second.executions_of("start").count(), 2);
    assert_eq!(second.status, ExecutionStatus::Failed);
}
