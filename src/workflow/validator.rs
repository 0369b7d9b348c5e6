//! Structural validation for workflow definitions
//!
//! The graph validator proves a definition is a single-entry graph reachable
//! from one start step; the connection validator guards individual edges at
//! edit time so committed definitions stay cycle-free.

use crate::runtime::integration::IntegrationExecutor;
use crate::runtime::scheduler::{schedule_error, schedule_of};
use crate::workflow::types::{StepType, WorkflowConnection, WorkflowDefinition};
use petgraph::algo::{has_path_connecting, is_cyclic_directed, tarjan_scc};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Bfs;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// A single structural problem found in a definition
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("workflow must have exactly one start step, found {0}")]
    StartStepCount(usize),

    #[error("workflow must have at least one end step")]
    MissingEndStep,

    #[error("step id '{id}' is used by {count} steps")]
    DuplicateStepId { id: String, count: usize },

    #[error("connection '{connection_id}' references unknown step '{step_id}'")]
    UnknownStep { connection_id: String, step_id: String },

    #[error("connection '{connection_id}' uses '{port}', which is not an output port of step '{step_id}'")]
    UnknownSourcePort { connection_id: String, step_id: String, port: String },

    #[error("connection '{connection_id}' uses '{port}', which is not an input port of step '{step_id}'")]
    UnknownTargetPort { connection_id: String, step_id: String, port: String },

    #[error("step '{0}' is not reachable from the start step")]
    Unreachable(String),

    #[error("connection '{connection_id}' would create a cycle: '{target}' already leads back to '{source_step}'")]
    CycleDetected { connection_id: String, source_step: String, target: String },

    #[error("steps {} form a cycle", .0.iter().map(|id| format!("'{}'", id)).collect::<Vec<_>>().join(", "))]
    Cycle(Vec<String>),

    #[error("step '{step_id}' ({step_type:?}) is missing required configuration: {}", .missing.join(", "))]
    MissingConfiguration { step_id: String, step_type: StepType, missing: Vec<String> },

    #[error("step '{step_id}' has an unusable schedule '{schedule}': {reason}")]
    InvalidSchedule { step_id: String, schedule: String, reason: String },
}

/// Aggregate of every problem found in one validation pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationErrors(Vec<ValidationError>);

impl ValidationErrors {
    pub fn errors(&self) -> &[ValidationError] {
        &self.0
    }

    /// Human-readable messages, one per error
    pub fn messages(&self) -> Vec<String> {
        self.0.iter().map(ToString::to_string).collect()
    }

    fn into_result<T>(errors: Vec<ValidationError>, ok: T) -> Result<T, ValidationErrors> {
        if errors.is_empty() {
            Ok(ok)
        } else {
            Err(ValidationErrors(errors))
        }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "definition failed validation with {} error(s): {}", self.0.len(), self.messages().join("; "))
    }
}

impl std::error::Error for ValidationErrors {}

impl IntoIterator for ValidationErrors {
    type Item = ValidationError;
    type IntoIter = std::vec::IntoIter<ValidationError>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Petgraph view of a definition's steps and resolvable connections
///
/// Duplicate step ids map to their first occurrence; connections with an
/// unknown endpoint are left out of the graph (they are reported separately).
struct StepGraph<'a> {
    graph: DiGraph<&'a str, ()>,
    index_of: HashMap<&'a str, NodeIndex>,
}

impl<'a> StepGraph<'a> {
    fn build(definition: &'a WorkflowDefinition) -> Self {
        let mut graph = DiGraph::new();
        let mut index_of = HashMap::new();

        for step in &definition.steps {
            index_of
                .entry(step.id.as_str())
                .or_insert_with(|| graph.add_node(step.id.as_str()));
        }

        for connection in &definition.connections {
            if let (Some(&from), Some(&to)) = (
                index_of.get(connection.source_step_id.as_str()),
                index_of.get(connection.target_step_id.as_str()),
            ) {
                graph.add_edge(from, to, ());
            }
        }

        Self { graph, index_of }
    }

    /// Ids reachable from `start` following connections forward (including `start`)
    fn reachable_from(&self, start: &str) -> HashSet<&'a str> {
        let mut visited = HashSet::new();
        if let Some(&start_index) = self.index_of.get(start) {
            let mut bfs = Bfs::new(&self.graph, start_index);
            while let Some(index) = bfs.next(&self.graph) {
                visited.insert(self.graph[index]);
            }
        }
        visited
    }

    /// Step ids of every cycle (including self-loops), each sorted
    fn cycles(&self) -> Vec<Vec<&'a str>> {
        if !is_cyclic_directed(&self.graph) {
            return Vec::new();
        }

        let mut cycles: Vec<Vec<&'a str>> = tarjan_scc(&self.graph)
            .into_iter()
            .filter(|component| component.len() > 1 || self.graph.contains_edge(component[0], component[0]))
            .map(|component| {
                let mut ids: Vec<&'a str> = component.iter().map(|&index| self.graph[index]).collect();
                ids.sort_unstable();
                ids
            })
            .collect();
        cycles.sort();
        cycles
    }

    /// Whether a forward path leads from `from` to `to` (a step trivially reaches itself)
    fn has_path(&self, from: &str, to: &str) -> bool {
        match (self.index_of.get(from), self.index_of.get(to)) {
            (Some(&from), Some(&to)) => has_path_connecting(&self.graph, from, to, None),
            _ => false,
        }
    }
}

/// Check a connection's endpoints and ports against the definition
fn check_connection_endpoints(connection: &WorkflowConnection, definition: &WorkflowDefinition, errors: &mut Vec<ValidationError>) {
    match definition.step(&connection.source_step_id) {
        None => errors.push(ValidationError::UnknownStep {
            connection_id: connection.id.clone(),
            step_id: connection.source_step_id.clone(),
        }),
        Some(source) if !source.emits_output(&connection.source_port) => {
            errors.push(ValidationError::UnknownSourcePort {
                connection_id: connection.id.clone(),
                step_id: source.id.clone(),
                port: connection.source_port.clone(),
            })
        }
        Some(_) => {}
    }

    match definition.step(&connection.target_step_id) {
        None => errors.push(ValidationError::UnknownStep {
            connection_id: connection.id.clone(),
            step_id: connection.target_step_id.clone(),
        }),
        Some(target) if !target.accepts_input(&connection.target_port) => {
            errors.push(ValidationError::UnknownTargetPort {
                connection_id: connection.id.clone(),
                step_id: target.id.clone(),
                port: connection.target_port.clone(),
            })
        }
        Some(_) => {}
    }
}

/// Whole-definition validator run before a workflow is saved or activated
#[derive(Default, Clone)]
pub struct GraphValidator {
    /// When present, step configurations are checked for required keys
    integrations: Option<Arc<dyn IntegrationExecutor>>,
}

impl GraphValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also check each step's configuration against the executor's requirements
    pub fn with_configuration_checks(integrations: Arc<dyn IntegrationExecutor>) -> Self {
        Self {
            integrations: Some(integrations),
        }
    }

    /// Validate a definition, collecting every error
    ///
    /// Returns a normalized copy (empty port sets filled with the step type's
    /// defaults) on success. The input is never mutated.
    pub fn validate(&self, definition: &WorkflowDefinition) -> Result<WorkflowDefinition, ValidationErrors> {
        let mut errors = Vec::new();

        let start_ids: Vec<&str> = definition.start_steps().map(|step| step.id.as_str()).collect();
        if start_ids.len() != 1 {
            errors.push(ValidationError::StartStepCount(start_ids.len()));
        }

        if !definition.steps.iter().any(|step| step.is_end_step) {
            errors.push(ValidationError::MissingEndStep);
        }

        // Report duplicates in first-seen order
        let mut counts: HashMap<&str, usize> = HashMap::new();
        let mut order = Vec::new();
        for step in &definition.steps {
            let count = counts.entry(step.id.as_str()).or_insert(0);
            if *count == 0 {
                order.push(step.id.as_str());
            }
            *count += 1;
        }
        for id in order {
            let count = counts[id];
            if count > 1 {
                errors.push(ValidationError::DuplicateStepId { id: id.to_string(), count });
            }
        }

        for connection in &definition.connections {
            check_connection_endpoints(connection, definition, &mut errors);
        }

        let graph = StepGraph::build(definition);

        // Reachability only makes sense with a single entry point
        if let [start_id] = start_ids.as_slice() {
            let reachable = graph.reachable_from(start_id);
            let mut reported = HashSet::new();
            for step in &definition.steps {
                if step.id != *start_id && !reachable.contains(step.id.as_str()) && reported.insert(step.id.as_str()) {
                    errors.push(ValidationError::Unreachable(step.id.clone()));
                }
            }
        }

        for cycle in graph.cycles() {
            errors.push(ValidationError::Cycle(cycle.into_iter().map(str::to_string).collect()));
        }

        for step in &definition.steps {
            let Some(schedule) = schedule_of(step) else { continue };
            if let Some(reason) = schedule_error(schedule) {
                errors.push(ValidationError::InvalidSchedule {
                    step_id: step.id.clone(),
                    schedule: schedule.to_string(),
                    reason,
                });
            }
        }

        if let Some(integrations) = &self.integrations {
            for step in definition.steps.iter().filter(|step| step.step_type.is_integration()) {
                let missing = integrations.missing_configuration(&step.step_type, &step.configuration);
                if !missing.is_empty() {
                    errors.push(ValidationError::MissingConfiguration {
                        step_id: step.id.clone(),
                        step_type: step.step_type,
                        missing,
                    });
                }
            }
        }

        if errors.is_empty() {
            tracing::debug!("✅ Definition valid: {} steps, {} connections",
                definition.steps.len(), definition.connections.len());
        } else {
            tracing::debug!("❌ Definition rejected with {} error(s)", errors.len());
        }

        let normalized = WorkflowDefinition {
            steps: definition.steps.iter().map(|step| step.normalized()).collect(),
            connections: definition.connections.clone(),
            layout: definition.layout.clone(),
        };
        ValidationErrors::into_result(errors, normalized)
    }
}

/// Edit-time guard for a single proposed connection
#[derive(Debug, Default, Clone, Copy)]
pub struct ConnectionValidator;

impl ConnectionValidator {
    pub fn new() -> Self {
        Self
    }

    /// Whether `connection` may be added to `definition`
    pub fn validate(&self, connection: &WorkflowConnection, definition: &WorkflowDefinition) -> bool {
        self.check(connection, definition).is_ok()
    }

    /// Same as [`validate`](Self::validate) but reports why a connection is rejected
    ///
    /// Rejects unknown endpoints, ports the steps do not declare, and any edge
    /// whose target already reaches its source over the existing connections.
    pub fn check(&self, connection: &WorkflowConnection, definition: &WorkflowDefinition) -> Result<(), ValidationErrors> {
        let mut errors = Vec::new();
        check_connection_endpoints(connection, definition, &mut errors);

        if errors.is_empty() {
            let graph = StepGraph::build(definition);
            if graph.has_path(&connection.target_step_id, &connection.source_step_id) {
                tracing::debug!("🔁 Rejecting connection '{}': {} → {} closes a cycle",
                    connection.id, connection.source_step_id, connection.target_step_id);
                errors.push(ValidationError::CycleDetected {
                    connection_id: connection.id.clone(),
                    source_step: connection.source_step_id.clone(),
                    target: connection.target_step_id.clone(),
                });
            }
        }

        ValidationErrors::into_result(errors, ())
    }
}
