//! Hot-reload workflow registry using ArcSwap
//!
//! Holds the active (validated) definitions in memory. Every change swaps the
//! whole map atomically, so runs already holding a snapshot are unaffected by
//! edits and lookups never block.

use crate::workflow::{
    storage::WorkflowStorage,
    types::Workflow,
    validator::{GraphValidator, ValidationErrors},
};
use anyhow::Result;
use arc_swap::ArcSwap;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

/// Per-workflow run statistics shared by every concurrent run start
#[derive(Debug, Default)]
pub struct ExecutionStats {
    execution_count: AtomicU64,
    /// Milliseconds since the epoch; 0 means never executed
    last_executed_ms: AtomicI64,
}

impl ExecutionStats {
    /// Count one run start; returns the new total
    fn record_start(&self, at: DateTime<Utc>) -> u64 {
        self.last_executed_ms.fetch_max(at.timestamp_millis(), Ordering::Relaxed);
        self.execution_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn execution_count(&self) -> u64 {
        self.execution_count.load(Ordering::Relaxed)
    }

    pub fn last_executed_at(&self) -> Option<DateTime<Utc>> {
        match self.last_executed_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Utc.timestamp_millis_opt(ms).single(),
        }
    }
}

/// A validated workflow plus its run statistics
#[derive(Debug, Clone)]
pub struct ActiveWorkflow {
    /// Normalized definition snapshot
    pub workflow: Arc<Workflow>,
    /// Survives definition updates so counts are not reset by edits
    pub stats: Arc<ExecutionStats>,
}

/// Lock-free registry of active workflows
pub struct WorkflowRegistry {
    workflows: ArcSwap<HashMap<String, ActiveWorkflow>>,
    validator: GraphValidator,
}

impl WorkflowRegistry {
    /// Create an empty registry that admits workflows passing `validator`
    pub fn new(validator: GraphValidator) -> Self {
        Self {
            workflows: ArcSwap::new(Arc::new(HashMap::new())),
            validator,
        }
    }

    /// Populate the registry from storage at startup
    ///
    /// Stored workflows that no longer validate are logged and left inactive.
    pub async fn init_from_storage(&self, storage: &WorkflowStorage) -> Result<()> {
        let stored = storage.load_all_workflows().await?;
        let mut active = HashMap::new();

        for (id, workflow) in stored {
            match self.validate(workflow) {
                Ok(workflow) => {
                    active.insert(id, ActiveWorkflow {
                        workflow: Arc::new(workflow),
                        stats: Arc::new(ExecutionStats::default()),
                    });
                }
                Err(errors) => {
                    tracing::warn!("⚠️ Skipping invalid stored workflow {}: {}", id, errors);
                }
            }
        }

        self.workflows.store(Arc::new(active));
        tracing::info!("Initialized workflow registry with {} workflows", self.workflows.load().len());
        Ok(())
    }

    /// Validate and activate (or replace) a workflow
    ///
    /// Returns the normalized workflow that is now active.
    pub fn upsert(&self, workflow: Workflow) -> Result<Arc<Workflow>, ValidationErrors> {
        let workflow = Arc::new(self.validate(workflow)?);
        let id = workflow.id.clone();

        self.workflows.rcu(|current| {
            let mut next = (**current).clone();
            let stats = current
                .get(&id)
                .map(|active| Arc::clone(&active.stats))
                .unwrap_or_default();
            next.insert(id.clone(), ActiveWorkflow {
                workflow: Arc::clone(&workflow),
                stats,
            });
            next
        });

        tracing::info!("🔥 Hot-reloaded workflow: {}", id);
        Ok(workflow)
    }

    /// Lock-free lookup
    pub fn get_workflow(&self, workflow_id: &str) -> Option<ActiveWorkflow> {
        self.workflows.load().get(workflow_id).cloned()
    }

    /// Take the definition snapshot for a new run and count the run start
    pub fn snapshot_for_run(&self, workflow_id: &str) -> Option<Arc<Workflow>> {
        let active = self.get_workflow(workflow_id)?;
        let count = active.stats.record_start(Utc::now());
        tracing::debug!("📊 Workflow {} started {} time(s)", workflow_id, count);
        Some(active.workflow)
    }

    pub fn get_all_workflows(&self) -> Vec<Arc<Workflow>> {
        self.workflows
            .load()
            .values()
            .map(|active| Arc::clone(&active.workflow))
            .collect()
    }

    pub fn list_workflow_ids(&self) -> Vec<String> {
        self.workflows.load().keys().cloned().collect()
    }

    pub fn remove_workflow(&self, workflow_id: &str) -> bool {
        let previous = self.workflows.rcu(|current| {
            let mut next = (**current).clone();
            next.remove(workflow_id);
            next
        });

        let removed = previous.contains_key(workflow_id);
        if removed {
            tracing::info!("Removed workflow from registry: {}", workflow_id);
        }
        removed
    }

    /// Validate a workflow without activating it; returns the normalized copy
    pub fn validate(&self, workflow: Workflow) -> Result<Workflow, ValidationErrors> {
        let definition = self.validator.validate(&workflow.definition)?;
        Ok(Workflow { definition, ..workflow })
    }

    pub fn validator(&self) -> &GraphValidator {
        &self.validator
    }
}
