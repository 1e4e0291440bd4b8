//! Job handler contract and execution context.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tracing::warn;
use uuid::Uuid;

use digitizer_core::{Job, JobFailure, JobQueue, Result};

/// Progress callback type for job handlers.
pub type ProgressCallback = Box<dyn Fn(i32, Option<&str>) + Send + Sync>;

/// Context provided to job handlers.
pub struct JobContext {
    /// The job being processed.
    pub job: Job,
    /// Queue holding the job's lease; progress checkpoints are persisted here.
    queue: Option<Arc<dyn JobQueue>>,
    /// Progress callback for updating job progress.
    progress_callback: Option<ProgressCallback>,
}

impl JobContext {
    /// Create a new job context.
    pub fn new(job: Job) -> Self {
        Self {
            job,
            queue: None,
            progress_callback: None,
        }
    }

    /// Persist checkpoints to `queue`.
    pub fn with_queue(mut self, queue: Arc<dyn JobQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Set the progress callback.
    pub fn with_progress_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(i32, Option<&str>) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Box::new(callback));
        self
    }

    /// Report progress to the callback.
    pub fn report_progress(&self, percent: i32, message: Option<&str>) {
        if let Some(ref callback) = self.progress_callback {
            callback(percent, message);
        }
    }

    /// Persist a progress checkpoint and renew the lease, then report it.
    ///
    /// A failed write is logged and does not abort the job; the lease check at
    /// finalization decides whether the attempt still counts.
    pub async fn checkpoint(&self, percent: i32, message: Option<&str>) {
        if let (Some(queue), Some(token)) = (&self.queue, self.job.lease_token) {
            if let Err(e) = queue.update_progress(self.job.id, token, percent).await {
                warn!(
                    job_id = %self.job.id,
                    progress = percent,
                    error = %e,
                    "Failed to persist progress checkpoint"
                );
            }
        }
        self.report_progress(percent, message);
    }

    /// The job ID.
    pub fn job_id(&self) -> Uuid {
        self.job.id
    }

    /// Get the job payload.
    pub fn payload(&self) -> &JsonValue {
        &self.job.payload
    }

    /// Whether this attempt is the last one the queue will grant.
    pub fn is_final_attempt(&self) -> bool {
        self.job.is_final_attempt()
    }
}

/// Result of job execution.
#[derive(Debug)]
pub enum JobResult {
    /// Job completed successfully with optional result data.
    Success(Option<JsonValue>),
    /// The attempt failed; the queue decides between retry and exhaustion.
    Failed(JobFailure),
}

/// Trait for job handlers.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// The job type this handler processes.
    fn job_type(&self) -> &str;

    /// Execute the job.
    async fn execute(&self, ctx: JobContext) -> JobResult;

    /// Called once a job of this type is finalized as failed, whether by its
    /// last attempt, a timeout or an expired lease.
    async fn on_exhausted(&self, _job: &Job) -> Result<()> {
        Ok(())
    }

    /// Called when the job timeout cuts an attempt off, before the queue
    /// records the failure.
    async fn on_attempt_timeout(&self, _job: &Job, _failure: &JobFailure) -> Result<()> {
        Ok(())
    }

    /// Check if this handler can process the given job type.
    fn can_handle(&self, job_type: &str) -> bool {
        self.job_type() == job_type
    }
}

/// No-op handler for testing.
pub struct NoOpHandler {
    job_type: String,
}

impl NoOpHandler {
    /// Create a new no-op handler for the given job type.
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
        }
    }
}

#[async_trait]
impl JobHandler for NoOpHandler {
    fn job_type(&self) -> &str {
        &self.job_type
    }

    async fn execute(&self, ctx: JobContext) -> JobResult {
        ctx.checkpoint(50, Some("Processing...")).await;
        ctx.checkpoint(100, Some("Done")).await;
        JobResult::Success(None)
    }
}
