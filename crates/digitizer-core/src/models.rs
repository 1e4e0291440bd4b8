//! Data models for jobs, work records and dead letter entries.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::defaults;

// =============================================================================
// JOB TYPES
// =============================================================================

/// State of a job in the durable queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Eligible for claiming.
    Waiting,
    /// Scheduled for a retry; becomes eligible once `run_at` passes.
    Delayed,
    /// Held by exactly one worker under a lease.
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(JobState::Waiting),
            "delayed" => Some(JobState::Delayed),
            "active" => Some(JobState::Active),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            _ => None,
        }
    }

    /// Whether the job has been finalized.
    pub fn is_finished(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of queued work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub queue: String,
    pub job_type: String,
    pub payload: JsonValue,
    pub state: JobState,
    pub attempts_made: i32,
    pub max_attempts: i32,
    pub backoff_base_ms: i64,
    pub progress: i32,
    pub result: Option<JsonValue>,
    pub failed_reason: Option<String>,
    /// One entry per failed attempt, oldest first.
    pub stacktrace: Vec<String>,
    /// Earliest time the job may be claimed.
    pub run_at: DateTime<Utc>,
    pub lease_token: Option<Uuid>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Set once a failed job has been handed to the dead letter queue.
    pub dead_lettered_at: Option<DateTime<Utc>>,
}

impl Job {
    /// State as observed at `now`: a delayed job whose delay elapsed is waiting.
    pub fn state_at(&self, now: DateTime<Utc>) -> JobState {
        match self.state {
            JobState::Delayed if self.run_at <= now => JobState::Waiting,
            state => state,
        }
    }

    /// Whether the current attempt is the last one the queue will grant.
    pub fn is_final_attempt(&self) -> bool {
        self.attempts_made >= self.max_attempts
    }

    /// Whether the job is active and its lease has run out.
    pub fn lease_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Active && self.lease_expires_at.is_some_and(|exp| exp < now)
    }

    /// Decode the payload into a typed structure.
    pub fn decode_payload<T: serde::de::DeserializeOwned>(&self) -> crate::Result<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            crate::Error::Validation(format!("Malformed payload for job {}: {}", self.id, e))
        })
    }
}

/// Payload of a `process-digitization` job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DigitizationPayload {
    pub image_url: String,
    #[serde(default)]
    pub source_language_hints: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_language: Option<String>,
    pub work_record_id: Uuid,
}

/// Options accepted by `JobQueue::enqueue`.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Caller-chosen job id. Enqueueing a duplicate id is a conflict.
    pub job_id: Option<Uuid>,
    /// Initial delay before the job becomes claimable.
    pub delay: Option<Duration>,
    /// Overrides the queue's max attempts for this job.
    pub max_attempts: Option<i32>,
}

impl EnqueueOptions {
    pub fn with_job_id(mut self, id: Uuid) -> Self {
        self.job_id = Some(id);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_max_attempts(mut self, max: i32) -> Self {
        self.max_attempts = Some(max);
        self
    }
}

/// Failure reported for one attempt of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    /// Human-readable reason, persisted as `failed_reason`.
    pub message: String,
    /// Error chain for this attempt, outermost first.
    pub trace: Vec<String>,
}

impl JobFailure {
    pub fn new(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            trace: vec![message.clone()],
            message,
        }
    }

    /// Single-line trace entry appended to the job's stacktrace.
    pub fn trace_line(&self) -> String {
        self.trace.join(" <- ")
    }
}

impl From<&crate::Error> for JobFailure {
    fn from(err: &crate::Error) -> Self {
        Self {
            message: err.to_string(),
            trace: err.chain(),
        }
    }
}

/// What the queue did with a failed attempt.
#[derive(Debug, Clone)]
pub enum FailOutcome {
    /// Rescheduled as `delayed`; eligible again after `delay`.
    Retrying { attempts_made: i32, delay: Duration },
    /// Attempts exhausted; the job is now `failed`. Returned once per job.
    Exhausted(Job),
}

/// Per-state job counts for one queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub waiting: i64,
    pub delayed: i64,
    pub active: i64,
    pub completed: i64,
    pub failed: i64,
}

/// Result of a stalled-lease sweep.
#[derive(Debug, Clone, Default)]
pub struct StalledRecovery {
    /// Jobs returned to `waiting` for another attempt.
    pub requeued: u64,
    /// Jobs finalized as `failed` because no attempts remained.
    pub exhausted: Vec<Job>,
}

// =============================================================================
// WORK RECORD TYPES
// =============================================================================

/// Lifecycle status of a work record. Advances monotonically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkRecordStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl WorkRecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkRecordStatus::Pending => "pending",
            WorkRecordStatus::Processing => "processing",
            WorkRecordStatus::Completed => "completed",
            WorkRecordStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(WorkRecordStatus::Pending),
            "processing" => Some(WorkRecordStatus::Processing),
            "completed" => Some(WorkRecordStatus::Completed),
            "failed" => Some(WorkRecordStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkRecordStatus::Completed | WorkRecordStatus::Failed)
    }

    /// Whether moving from `self` to `next` keeps the status monotonic.
    ///
    /// Re-entering `processing` is allowed so retries can touch the record.
    pub fn can_transition_to(&self, next: WorkRecordStatus) -> bool {
        use WorkRecordStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Processing)
                | (Pending, Failed)
                | (Processing, Completed)
                | (Processing, Failed)
        )
    }
}

impl std::fmt::Display for WorkRecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The durable entity tracking one digitization request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkRecord {
    pub id: Uuid,
    pub status: WorkRecordStatus,
    pub image_url: String,
    pub source_language_hints: Vec<String>,
    pub detected_language: Option<String>,
    pub recognized_text: Option<String>,
    pub translated_text: Option<String>,
    pub target_language: Option<String>,
    /// Set when the record completed without a translation step.
    pub translation_skipped: bool,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Request for creating a work record in `pending`.
#[derive(Debug, Clone, Default)]
pub struct NewWorkRecord {
    /// Caller-chosen id; a UUIDv7 is generated when absent.
    pub id: Option<Uuid>,
    pub image_url: String,
    pub source_language_hints: Vec<String>,
    pub target_language: Option<String>,
}

/// Results persisted when a work record completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedOutcome {
    pub recognized_text: String,
    pub translation: Option<Translation>,
}

/// Result of a translation call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Translation {
    pub translated_text: String,
    pub detected_language_code: Option<String>,
}

/// Filter and pagination for listing work records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkRecordQuery {
    pub status: Option<WorkRecordStatus>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

impl WorkRecordQuery {
    pub fn with_status(mut self, status: WorkRecordStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_page(mut self, page: u32, limit: u32) -> Self {
        self.page = Some(page);
        self.limit = Some(limit);
        self
    }

    /// Page number, at least 1.
    pub fn page(&self) -> u32 {
        self.page.unwrap_or(1).max(1)
    }

    /// Page size clamped to `[1, PAGE_LIMIT_MAX]`; zero falls back to the default.
    pub fn limit(&self) -> u32 {
        match self.limit {
            None | Some(0) => defaults::PAGE_LIMIT,
            Some(l) => l.min(defaults::PAGE_LIMIT_MAX),
        }
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page() - 1) * u64::from(self.limit())
    }
}

/// One page of results with navigation metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub limit: u32,
    pub total_pages: u64,
    pub has_next_page: bool,
    pub has_previous_page: bool,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: u64, query: &WorkRecordQuery) -> Self {
        let page = query.page();
        let limit = query.limit();
        let total_pages = total.div_ceil(u64::from(limit));
        Self {
            items,
            total,
            page,
            limit,
            total_pages,
            has_next_page: u64::from(page) < total_pages,
            has_previous_page: page > 1,
        }
    }
}

// =============================================================================
// DEAD LETTER TYPES
// =============================================================================

/// Snapshot of the job that exhausted its attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OriginalJob {
    pub id: Uuid,
    pub data: JsonValue,
    pub failed_reason: String,
    pub stacktrace: Vec<String>,
    pub attempts_made: i32,
}

/// Entry in the dead letter queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterEntry {
    /// Entry id; `None` until persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    pub original_job: OriginalJob,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    /// Build an entry from a job finalized as `failed`.
    pub fn from_failed_job(job: &Job, failed_at: DateTime<Utc>) -> Self {
        Self {
            id: None,
            original_job: OriginalJob {
                id: job.id,
                data: job.payload.clone(),
                failed_reason: job.failed_reason.clone().unwrap_or_default(),
                stacktrace: job.stacktrace.clone(),
                attempts_made: job.attempts_made,
            },
            failed_at,
        }
    }
}
