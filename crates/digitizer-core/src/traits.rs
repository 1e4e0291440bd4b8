//! Repository and provider traits.
//!
//! The queue, stores and providers are external services; the worker only
//! depends on these contracts.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::{
    CompletedOutcome, DeadLetterEntry, EnqueueOptions, FailOutcome, Job, JobFailure, JobState,
    NewWorkRecord, Page, QueueCounts, Result, StalledRecovery, Translation, WorkRecord,
    WorkRecordQuery,
};

// =============================================================================
// DURABLE QUEUE
// =============================================================================

/// Durable job queue with delayed retries and lease-based claiming.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Name of the queue.
    fn name(&self) -> &str;

    /// How long a claim stays valid without renewal.
    fn lease_duration(&self) -> Duration;

    /// Add a job and return its id.
    async fn enqueue(
        &self,
        job_type: &str,
        payload: JsonValue,
        options: EnqueueOptions,
    ) -> Result<Uuid>;

    /// Claim the next eligible job whose type is in `job_types`.
    /// An empty slice means "claim any type".
    ///
    /// The claimed job is `active`, carries a fresh lease token and has its
    /// attempt count incremented. Concurrent claims never return the same job.
    async fn claim_next(&self, job_types: &[&str]) -> Result<Option<Job>>;

    /// Record progress and renew the lease.
    async fn update_progress(&self, job_id: Uuid, lease_token: Uuid, percent: i32) -> Result<()>;

    /// Extend the lease of an active job by another `lease_duration`.
    ///
    /// Fails with `Conflict` once the lease was lost to recovery or another
    /// worker; the holder must then abandon the attempt.
    async fn renew_lease(&self, job_id: Uuid, lease_token: Uuid) -> Result<()>;

    /// Finalize an active job as completed.
    async fn complete(
        &self,
        job_id: Uuid,
        lease_token: Uuid,
        result: Option<JsonValue>,
    ) -> Result<()>;

    /// Record a failed attempt; reschedules with backoff or finalizes as failed.
    async fn fail(&self, job_id: Uuid, lease_token: Uuid, failure: &JobFailure)
        -> Result<FailOutcome>;

    /// Get job by ID.
    async fn get(&self, job_id: Uuid) -> Result<Option<Job>>;

    /// Current state of a job, or `None` if it does not exist.
    async fn state(&self, job_id: Uuid) -> Result<Option<JobState>>;

    /// Remove a job. Fails with `Conflict` while the job is active.
    async fn remove(&self, job_id: Uuid) -> Result<()>;

    /// Requeue or finalize active jobs whose lease expired.
    async fn recover_stalled(&self) -> Result<StalledRecovery>;

    /// List jobs in a state, oldest first.
    async fn list_by_state(&self, state: JobState, limit: i64) -> Result<Vec<Job>>;

    /// Failed jobs not yet handed to the dead letter queue, oldest first.
    async fn list_awaiting_dead_letter(&self, limit: i64) -> Result<Vec<Job>>;

    /// Record that a failed job reached the dead letter queue. Returns
    /// `false` when the job is gone, not failed or already marked.
    async fn mark_dead_lettered(&self, job_id: Uuid) -> Result<bool>;

    /// Job counts per state.
    async fn counts(&self) -> Result<QueueCounts>;

    /// Delete finished jobs past the queue's retention policy.
    async fn prune(&self) -> Result<u64>;
}

// =============================================================================
// DEAD LETTER QUEUE
// =============================================================================

/// Durable sink for jobs that exhausted their attempts.
#[async_trait]
pub trait DeadLetterQueue: Send + Sync {
    /// Store an entry. Pushing a second entry for the same original job is a
    /// no-op returning the existing entry's id.
    async fn push(&self, entry: DeadLetterEntry) -> Result<Uuid>;

    /// Get entry by ID.
    async fn get(&self, id: Uuid) -> Result<Option<DeadLetterEntry>>;

    /// Find the entry for an original job.
    async fn find_by_job(&self, job_id: Uuid) -> Result<Option<DeadLetterEntry>>;

    /// List entries, newest first.
    async fn list(&self, limit: i64) -> Result<Vec<DeadLetterEntry>>;

    /// Number of entries.
    async fn count(&self) -> Result<i64>;

    /// Remove an entry once handled. Returns whether it existed.
    async fn remove(&self, id: Uuid) -> Result<bool>;

    /// Delete entries that failed before `now - max_age`.
    async fn purge_older_than(&self, max_age: chrono::Duration) -> Result<u64>;
}

// =============================================================================
// WORK RECORD STORE
// =============================================================================

/// Durable store for work records.
///
/// Transition methods return `Ok(false)` without writing when the record is
/// already terminal, so status never regresses.
#[async_trait]
pub trait WorkRecordRepository: Send + Sync {
    /// Create a record in `pending`.
    async fn create(&self, record: NewWorkRecord) -> Result<WorkRecord>;

    /// Fetch by id.
    async fn get(&self, id: Uuid) -> Result<Option<WorkRecord>>;

    /// List newest first with optional status filter.
    async fn list(&self, query: &WorkRecordQuery) -> Result<Page<WorkRecord>>;

    /// Delete a record. Returns whether it existed.
    async fn delete(&self, id: Uuid) -> Result<bool>;

    /// `pending|processing → processing`.
    async fn mark_processing(&self, id: Uuid) -> Result<bool>;

    /// Record the reason of a failed, non-final attempt. Status is unchanged.
    async fn record_attempt_failure(&self, id: Uuid, reason: &str) -> Result<bool>;

    /// `processing → completed` with recognition and translation results.
    async fn mark_completed(&self, id: Uuid, outcome: &CompletedOutcome) -> Result<bool>;

    /// `pending|processing → failed`.
    async fn mark_failed(&self, id: Uuid, reason: &str) -> Result<bool>;

    /// Records not yet terminal and untouched since `updated_before`, in id
    /// order starting after `after`. Callers page by passing the last id seen.
    async fn list_unfinished(
        &self,
        updated_before: DateTime<Utc>,
        after: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<WorkRecord>>;
}

// =============================================================================
// PROVIDERS
// =============================================================================

/// Extracts text from an image.
#[async_trait]
pub trait TextRecognizer: Send + Sync {
    /// Recognize text in the image at `image_uri`.
    ///
    /// Fails with `ExternalService` when no text is found or the call errors.
    async fn recognize(&self, image_uri: &str, language_hints: &[String]) -> Result<String>;
}

/// Translates text to a target language.
#[async_trait]
pub trait Translator: Send + Sync {
    /// Fails with `ExternalService` on an empty result or call error.
    async fn translate(&self, text: &str, target_language: &str) -> Result<Translation>;
}

/// Uploads image bytes to blob storage.
#[async_trait]
pub trait BlobUploader: Send + Sync {
    /// Upload and return the public URL.
    ///
    /// Fails with `ExternalService` on upload error or timeout.
    async fn upload(&self, image: &[u8], folder: &str) -> Result<String>;
}

/// Fetches a remote image.
#[async_trait]
pub trait ImageDownloader: Send + Sync {
    async fn download(&self, url: &str) -> Result<Vec<u8>>;
}
