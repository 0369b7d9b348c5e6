//! Background job queue for queued runs

use anyhow::Result;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

/// A unit of background work
pub type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Accepts jobs and runs them off the caller's task
pub trait TaskQueue: Send + Sync {
    fn enqueue(&self, job: Job) -> JobHandle;
}

/// Handle to an enqueued job
#[derive(Debug)]
pub struct JobHandle {
    handle: JoinHandle<()>,
}

impl JobHandle {
    pub fn new(handle: JoinHandle<()>) -> Self {
        Self { handle }
    }

    /// Wait for the job to finish
    pub async fn wait(self) -> Result<()> {
        self.handle
            .await
            .map_err(|e| anyhow::anyhow!("Background job did not finish: {}", e))
    }
}

/// Runs jobs on the tokio runtime, at most `workers` at a time
#[derive(Debug, Clone)]
pub struct TokioTaskQueue {
    permits: Arc<Semaphore>,
}

impl TokioTaskQueue {
    pub fn new(workers: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }
}

impl TaskQueue for TokioTaskQueue {
    fn enqueue(&self, job: Job) -> JobHandle {
        let permits = Arc::clone(&self.permits);
        JobHandle::new(tokio::spawn(async move {
            // The semaphore is never closed
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            job.await;
        }))
    }
}
