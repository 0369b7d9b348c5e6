//! Fire-and-forget progress notifications emitted by the engine

use crate::execution::types::{ExecutionStatus, StepExecutionStatus};
use crate::workflow::types::DataMap;
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

/// A single progress notification
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ProgressEvent {
    StepCompleted {
        execution_id: Uuid,
        step_id: String,
        status: StepExecutionStatus,
        output_data: DataMap,
    },
    StepFailed {
        execution_id: Uuid,
        step_id: String,
        status: StepExecutionStatus,
        error: String,
    },
    RunCompleted {
        execution_id: Uuid,
        status: ExecutionStatus,
        output_data: DataMap,
    },
    RunFailed {
        execution_id: Uuid,
        status: ExecutionStatus,
        error: String,
        /// Whatever the run produced before it stopped
        output_data: DataMap,
    },
}

impl ProgressEvent {
    pub fn execution_id(&self) -> Uuid {
        match self {
            Self::StepCompleted { execution_id, .. }
            | Self::StepFailed { execution_id, .. }
            | Self::RunCompleted { execution_id, .. }
            | Self::RunFailed { execution_id, .. } => *execution_id,
        }
    }
}

/// Receives progress events; delivery is best effort and never blocks the run
pub trait ProgressPublisher: Send + Sync {
    fn publish(&self, event: ProgressEvent);
}

/// Writes every event as a structured log line
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgressPublisher;

impl ProgressPublisher for TracingProgressPublisher {
    fn publish(&self, event: ProgressEvent) {
        match &event {
            ProgressEvent::StepCompleted { execution_id, step_id, .. } => {
                tracing::info!(%execution_id, step_id = %step_id, "✅ Step completed");
            }
            ProgressEvent::StepFailed { execution_id, step_id, error, .. } => {
                tracing::warn!(%execution_id, step_id = %step_id, error = %error, "❌ Step failed");
            }
            ProgressEvent::RunCompleted { execution_id, status, .. } => {
                tracing::info!(%execution_id, ?status, "🎉 Run completed");
            }
            ProgressEvent::RunFailed { execution_id, status, error, .. } => {
                tracing::error!(%execution_id, ?status, error = %error, "💥 Run failed");
            }
        }
    }
}

/// Fans events out to any number of subscribers over a tokio broadcast channel
#[derive(Debug, Clone)]
pub struct BroadcastProgressPublisher {
    sender: broadcast::Sender<ProgressEvent>,
}

impl BroadcastProgressPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }
}

impl ProgressPublisher for BroadcastProgressPublisher {
    fn publish(&self, event: ProgressEvent) {
        // No subscribers is not an error
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn broadcast_reaches_subscribers_and_tolerates_none() {
        let publisher = BroadcastProgressPublisher::new(8);
        let id = Uuid::new_v4();

        publisher.publish(ProgressEvent::RunFailed {
            execution_id: id,
            status: ExecutionStatus::Failed,
            error: "lost".into(),
            output_data: DataMap::new(),
        });

        let mut receiver = publisher.subscribe();
        publisher.publish(ProgressEvent::StepCompleted {
            execution_id: id,
            step_id: "s".into(),
            status: StepExecutionStatus::Completed,
            output_data: DataMap::new(),
        });

        let event = receiver.recv().await.unwrap();
        assert_eq!(event.execution_id(), id);
        assert!(matches!(event, ProgressEvent::StepCompleted { .. }));
    }

    #[test]
    fn run_failed_carries_partial_output() {
        let event = ProgressEvent::RunFailed {
            execution_id: Uuid::nil(),
            status: ExecutionStatus::Cancelled,
            error: "Execution cancelled".into(),
            output_data: json!({ "partial": true }).as_object().cloned().unwrap(),
        };

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "runFailed");
        assert_eq!(value["status"], "Cancelled");
        assert_eq!(value["outputData"], json!({ "partial": true }));
    }

    #[test]
    fn serializes_with_event_tag() {
        let id = Uuid::nil();
        let event = ProgressEvent::StepFailed {
            execution_id: id,
            step_id: "http".into(),
            status: StepExecutionStatus::Failed,
            error: "boom".into(),
        };

        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "event": "stepFailed",
                "executionId": id,
                "stepId": "http",
                "status": "Failed",
                "error": "boom",
            })
        );
    }
}
