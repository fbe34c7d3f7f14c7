//! Job executor: turns a job document into a task run.
//!
//! The processor only knows [`JobExecutor`]. [`TaskJobExecutor`] is the
//! production adapter: it pulls `tasks` and `vars` out of the document
//! and forwards them to a [`TaskRunner`], returning its verdict as-is.

use async_trait::async_trait;
use autonom_core::JobDocument;

use crate::runner::{RunnerError, TaskRunner};

/// Runs one job document to completion.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Returns `Ok(true)` on success and `Ok(false)` on a clean failure.
    /// `Err` is treated by the processor exactly like `Ok(false)`.
    async fn execute(&self, document: &serde_json::Value) -> Result<bool, ExecutorError>;
}

/// Errors raised while executing a job document.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("Invalid job document: {0}")]
    InvalidDocument(#[from] serde_json::Error),

    #[error(transparent)]
    Runner(#[from] RunnerError),
}

/// Adapter from job documents to a [`TaskRunner`].
#[derive(Debug, Clone)]
pub struct TaskJobExecutor<R> {
    runner: R,
}

impl<R: TaskRunner> TaskJobExecutor<R> {
    pub fn new(runner: R) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl<R: TaskRunner> JobExecutor for TaskJobExecutor<R> {
    async fn execute(&self, document: &serde_json::Value) -> Result<bool, ExecutorError> {
        let doc = JobDocument::from_value(document)?;
        let ok = self
            .runner
            .run(doc.tasks.as_deref(), doc.vars.as_ref())
            .await?;
        Ok(ok)
    }
}
