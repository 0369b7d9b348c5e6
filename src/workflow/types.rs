//! Core workflow definition types
//!
//! Defines the graph a tenant assembles: steps, port-typed connections and the
//! envelope stored per workflow. These types are serialized to/from camelCase
//! JSON for persistence and for the HTTP API.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// Flat key/value data threaded between steps (input, output, configuration)
pub type DataMap = Map<String, Value>;

/// Tenant used when a workflow or run does not name one
pub const DEFAULT_TENANT: &str = "default";

/// A stored workflow: identity plus its graph definition
///
/// The registry hands out `Arc<Workflow>` snapshots so a run keeps the exact
/// definition it started with even if the workflow is edited mid-flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    /// Unique workflow identifier (e.g., "wf-onboarding")
    pub id: String,
    /// Owning tenant
    #[serde(default = "default_tenant")]
    pub tenant_id: String,
    /// Human-readable workflow name
    pub name: String,
    /// The step graph
    pub definition: WorkflowDefinition,
}

fn default_tenant() -> String {
    DEFAULT_TENANT.to_string()
}

/// The step graph: ordered steps, connections and a cosmetic layout
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    /// Steps in declaration order
    pub steps: Vec<WorkflowStep>,
    /// Directed, port-qualified edges between steps
    #[serde(default)]
    pub connections: Vec<WorkflowConnection>,
    /// Editor coordinates; never read by validation or execution
    #[serde(default)]
    pub layout: Value,
}

impl WorkflowDefinition {
    /// Look up a step by id (first match when ids are duplicated)
    pub fn step(&self, step_id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|step| step.id == step_id)
    }

    /// The steps flagged as the entry point
    pub fn start_steps(&self) -> impl Iterator<Item = &WorkflowStep> {
        self.steps.iter().filter(|step| step.is_start_step)
    }

    /// Outgoing connections of a step, in definition order
    pub fn outgoing<'a>(&'a self, step_id: &'a str) -> impl Iterator<Item = &'a WorkflowConnection> + 'a {
        self.connections
            .iter()
            .filter(move |connection| connection.source_step_id == step_id)
    }
}

/// A single typed unit of work in the graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    /// Unique step identifier within the workflow
    pub id: String,
    /// Human-readable step name
    pub name: String,
    /// Step type which selects the execution handler
    pub step_type: StepType,
    /// Step-type specific configuration
    /// HttpRequest: { "url": "...", "method": "POST", "headers": {...}, "body": "..." }
    /// DatabaseQuery: { "connectionString": "sqlite://app.db", "query": "SELECT ..." }
    /// Wait: { "durationSeconds": 5 }
    #[serde(default)]
    pub configuration: DataMap,
    /// Declared input ports; empty means the type's defaults
    #[serde(default)]
    pub input_ports: BTreeSet<String>,
    /// Declared output ports; empty means the type's defaults
    #[serde(default)]
    pub output_ports: BTreeSet<String>,
    #[serde(default)]
    pub is_start_step: bool,
    #[serde(default)]
    pub is_end_step: bool,
    /// Branch expression used by Condition steps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
}

impl WorkflowStep {
    /// Create a step with default ports for its type and no configuration
    pub fn new(id: impl Into<String>, name: impl Into<String>, step_type: StepType) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            step_type,
            configuration: DataMap::new(),
            input_ports: BTreeSet::new(),
            output_ports: BTreeSet::new(),
            is_start_step: matches!(step_type, StepType::Start),
            is_end_step: matches!(step_type, StepType::End),
            condition: None,
        }
    }

    /// Builder: attach a configuration entry
    pub fn with_config(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.configuration.insert(key.to_string(), value.into());
        self
    }

    /// Builder: attach a branch condition
    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    /// Whether `port` is one of this step's input ports
    pub fn accepts_input(&self, port: &str) -> bool {
        if self.input_ports.is_empty() {
            self.step_type.default_input_ports().contains(&port)
        } else {
            self.input_ports.contains(port)
        }
    }

    /// Whether `port` is one of this step's output ports
    pub fn emits_output(&self, port: &str) -> bool {
        if self.output_ports.is_empty() {
            self.step_type.default_output_ports().contains(&port)
        } else {
            self.output_ports.contains(port)
        }
    }

    /// Copy of this step with empty port sets replaced by the type defaults
    pub fn normalized(&self) -> Self {
        let mut step = self.clone();
        if step.input_ports.is_empty() {
            step.input_ports = port_set(self.step_type.default_input_ports());
        }
        if step.output_ports.is_empty() {
            step.output_ports = port_set(self.step_type.default_output_ports());
        }
        step
    }
}

fn port_set(ports: &[&str]) -> BTreeSet<String> {
    ports.iter().map(|port| port.to_string()).collect()
}

/// Available step types
///
/// Integration types (HttpRequest, EmailSend, DatabaseQuery, ScriptExecution,
/// Webhook) are delegated to the integration executor; the rest run in-process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepType {
    /// Entry point of the graph
    Start,
    /// Terminal step
    End,
    /// Pass-through placeholder for data transforms
    Action,
    /// Boolean branch; output ports "true" and "false"
    Condition,
    /// Outbound HTTP call
    /// Expected configuration: { "url": "https://api.example.com", "method": "GET" }
    HttpRequest,
    /// Mail delivered through a relay endpoint
    /// Expected configuration: { "to": "${email}", "subject": "Welcome" }
    EmailSend,
    /// SQL statement against a SQLite database
    /// Expected configuration: { "connectionString": "sqlite://crm.db", "query": "SELECT * FROM users WHERE id = @id" }
    DatabaseQuery,
    /// Sandboxed Lua script
    /// Expected configuration: { "script": "return { total = input.a + input.b }" }
    ScriptExecution,
    /// Signed outbound webhook call
    /// Expected configuration: { "url": "https://hooks.example.com", "secret": "..." }
    Webhook,
    /// Suspends the branch for a fixed duration
    /// Expected configuration: { "durationSeconds": 30 } or { "durationMs": 250 }
    Wait,
    /// Human task marker; passes data through
    UserTask,
}

impl StepType {
    /// Whether this step type is executed by the integration executor
    pub fn is_integration(&self) -> bool {
        matches!(
            self,
            StepType::HttpRequest
                | StepType::EmailSend
                | StepType::DatabaseQuery
                | StepType::ScriptExecution
                | StepType::Webhook
        )
    }

    pub fn default_input_ports(&self) -> &'static [&'static str] {
        match self {
            StepType::Start => &[],
            _ => &["input"],
        }
    }

    pub fn default_output_ports(&self) -> &'static [&'static str] {
        match self {
            StepType::End => &[],
            StepType::Condition => &["true", "false"],
            step_type if step_type.is_integration() => &["success", "error"],
            _ => &["output"],
        }
    }
}

/// Expression plus variable bindings used for branching
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Boolean expression (Lua syntax), e.g. "amount > 100 and approved"
    pub expression: String,
    /// Extra variables; a value of exactly "${key}" binds the raw input value
    #[serde(default)]
    pub variables: DataMap,
}

impl Condition {
    pub fn new(expression: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
            variables: DataMap::new(),
        }
    }
}

/// Directed, port-qualified edge between two steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowConnection {
    pub id: String,
    pub source_step_id: String,
    pub source_port: String,
    pub target_step_id: String,
    pub target_port: String,
    /// Optional guard; the edge is only followed when it evaluates true
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
}

impl WorkflowConnection {
    pub fn new(
        id: impl Into<String>,
        (source_step_id, source_port): (&str, &str),
        (target_step_id, target_port): (&str, &str),
    ) -> Self {
        Self {
            id: id.into(),
            source_step_id: source_step_id.to_string(),
            source_port: source_port.to_string(),
            target_step_id: target_step_id.to_string(),
            target_port: target_port.to_string(),
            condition: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_ports_follow_step_type() {
        let condition = WorkflowStep::new("c", "Check", StepType::Condition);
        assert!(condition.emits_output("true"));
        assert!(condition.emits_output("false"));
        assert!(!condition.emits_output("output"));

        let http = WorkflowStep::new("h", "Call", StepType::HttpRequest);
        assert!(http.emits_output("success"));
        assert!(http.accepts_input("input"));

        let start = WorkflowStep::new("s", "Start", StepType::Start);
        assert!(!start.accepts_input("input"));
    }

    #[test]
    fn declared_ports_override_defaults() {
        let mut step = WorkflowStep::new("a", "Route", StepType::Action);
        step.output_ports.insert("left".to_string());
        assert!(step.emits_output("left"));
        assert!(!step.emits_output("output"));
        assert_eq!(step.normalized().input_ports.len(), 1);
    }

    #[test]
    fn deserializes_camel_case_definition() {
        let workflow: Workflow = serde_json::from_value(json!({
            "id": "wf-1",
            "name": "Demo",
            "definition": {
                "steps": [
                    { "id": "s", "name": "Start", "stepType": "Start", "isStartStep": true },
                    { "id": "e", "name": "End", "stepType": "End", "isEndStep": true }
                ],
                "connections": [
                    { "id": "c1", "sourceStepId": "s", "sourcePort": "output",
                      "targetStepId": "e", "targetPort": "input" }
                ]
            }
        }))
        .unwrap();

        assert_eq!(workflow.tenant_id, DEFAULT_TENANT);
        assert_eq!(workflow.definition.start_steps().count(), 1);
        assert_eq!(workflow.definition.outgoing("s").count(), 1);
    }
}
