//! Persistence for run records
//!
//! The full record (including its step trace) is stored as one JSON document;
//! workflow id, status and start time sit beside it as indexed columns.

use crate::execution::types::WorkflowExecution;
use anyhow::Result;
use async_trait::async_trait;
use chrono::SecondsFormat;
use sqlx::{sqlite::SqlitePool, Row};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Insert or replace the record with the same id
    async fn save(&self, execution: &WorkflowExecution) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<WorkflowExecution>>;

    /// Runs of one workflow, most recent first
    async fn list_for_workflow(&self, workflow_id: &str) -> Result<Vec<WorkflowExecution>>;
}

/// SQLite-backed store sharing the service database
#[derive(Debug, Clone)]
pub struct SqliteExecutionStore {
    pool: SqlitePool,
}

impl SqliteExecutionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Safe to call multiple times (uses IF NOT EXISTS)
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_executions (
                id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                status TEXT NOT NULL,
                -- fixed-width UTC timestamp so text order is time order
                started_at TEXT NOT NULL,
                record JSON NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_executions_workflow ON workflow_executions(workflow_id, started_at)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl ExecutionStore for SqliteExecutionStore {
    async fn save(&self, execution: &WorkflowExecution) -> Result<()> {
        let record = serde_json::to_string(execution)?;

        sqlx::query(
            r#"
            INSERT INTO workflow_executions (id, workflow_id, tenant_id, status, started_at, record)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                started_at = excluded.started_at,
                record = excluded.record
            "#,
        )
        .bind(execution.id.to_string())
        .bind(&execution.workflow_id)
        .bind(&execution.tenant_id)
        .bind(execution.status.as_str())
        .bind(execution.started_at.to_rfc3339_opts(SecondsFormat::Micros, true))
        .bind(&record)
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to save execution {}: {}", execution.id, e))?;

        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<WorkflowExecution>> {
        let row = sqlx::query("SELECT record FROM workflow_executions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let record: String = row.get("record");
                Ok(Some(serde_json::from_str(&record)?))
            }
            None => Ok(None),
        }
    }

    async fn list_for_workflow(&self, workflow_id: &str) -> Result<Vec<WorkflowExecution>> {
        let rows = sqlx::query(
            "SELECT record FROM workflow_executions WHERE workflow_id = ? ORDER BY started_at DESC",
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let record: String = row.get("record");
                Ok(serde_json::from_str(&record)?)
            })
            .collect()
    }
}

/// Process-local store for tests and embedding
#[derive(Debug, Default)]
pub struct InMemoryExecutionStore {
    records: RwLock<HashMap<Uuid, WorkflowExecution>>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn save(&self, execution: &WorkflowExecution) -> Result<()> {
        self.records.write().await.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<WorkflowExecution>> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn list_for_workflow(&self, workflow_id: &str) -> Result<Vec<WorkflowExecution>> {
        let mut runs: Vec<_> = self
            .records
            .read()
            .await
            .values()
            .filter(|execution| execution.workflow_id == workflow_id)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(runs)
    }
}
