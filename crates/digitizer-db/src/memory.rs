//! In-memory queue and stores.
//!
//! These follow the same state rules as the PostgreSQL implementations and
//! are used by tests and local runs without a database. A single write lock
//! per operation gives the same exclusivity as `FOR UPDATE SKIP LOCKED`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tokio::sync::RwLock;
use uuid::Uuid;

use digitizer_core::{
    backoff_delay, new_v7, CompletedOutcome, DeadLetterEntry, DeadLetterQueue, EnqueueOptions,
    Error, FailOutcome, Job, JobFailure, JobQueue, JobState, NewWorkRecord, Page, QueueCounts,
    QueueOptions, Result, StalledRecovery, WorkRecord, WorkRecordQuery, WorkRecordRepository,
    WorkRecordStatus,
};

use crate::jobs::{to_chrono, LEASE_EXPIRED_REASON};

// =============================================================================
// JOB QUEUE
// =============================================================================

#[derive(Debug, Clone)]
struct StoredJob {
    job: Job,
    /// Insertion order; breaks ties between jobs with the same `run_at`.
    seq: u64,
}

/// In-memory implementation of [`JobQueue`].
#[derive(Clone)]
pub struct MemoryJobQueue {
    jobs: Arc<RwLock<HashMap<Uuid, StoredJob>>>,
    seq: Arc<AtomicU64>,
    options: QueueOptions,
}

impl MemoryJobQueue {
    pub fn new(options: QueueOptions) -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            seq: Arc::new(AtomicU64::new(0)),
            options,
        }
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    /// Force the lease of an active job to lapse. Used to simulate a crashed worker.
    pub async fn expire_lease(&self, job_id: Uuid) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        let stored = jobs
            .get_mut(&job_id)
            .ok_or_else(|| Error::NotFound(format!("Job {}", job_id)))?;
        if stored.job.state == JobState::Active {
            stored.job.lease_expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        }
        Ok(())
    }

    fn lease_lost(job_id: Uuid) -> Error {
        Error::Conflict(format!("Job {} is not held under this lease", job_id))
    }

    fn leased_mut<'a>(
        jobs: &'a mut HashMap<Uuid, StoredJob>,
        job_id: Uuid,
        lease_token: Uuid,
    ) -> Result<&'a mut Job> {
        match jobs.get_mut(&job_id) {
            Some(stored)
                if stored.job.state == JobState::Active
                    && stored.job.lease_token == Some(lease_token) =>
            {
                Ok(&mut stored.job)
            }
            _ => Err(Self::lease_lost(job_id)),
        }
    }
}

impl Default for MemoryJobQueue {
    fn default() -> Self {
        Self::new(QueueOptions::default())
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    fn name(&self) -> &str {
        &self.options.name
    }

    fn lease_duration(&self) -> std::time::Duration {
        self.options.lease_duration
    }

    async fn enqueue(
        &self,
        job_type: &str,
        payload: JsonValue,
        options: EnqueueOptions,
    ) -> Result<Uuid> {
        let id = options.job_id.unwrap_or_else(new_v7);
        let now = Utc::now();
        let (state, run_at) = match options.delay {
            Some(delay) if !delay.is_zero() => (JobState::Delayed, now + to_chrono(delay)),
            _ => (JobState::Waiting, now),
        };

        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&id) {
            return Err(Error::Conflict(format!("Job {} already exists", id)));
        }

        let job = Job {
            id,
            queue: self.options.name.clone(),
            job_type: job_type.to_string(),
            payload,
            state,
            attempts_made: 0,
            max_attempts: options
                .max_attempts
                .unwrap_or(self.options.max_attempts)
                .max(1),
            backoff_base_ms: self.options.backoff.base_delay.as_millis() as i64,
            progress: 0,
            result: None,
            failed_reason: None,
            stacktrace: Vec::new(),
            run_at,
            lease_token: None,
            lease_expires_at: None,
            created_at: now,
            processed_at: None,
            finished_at: None,
            dead_lettered_at: None,
        };
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        jobs.insert(id, StoredJob { job, seq });
        Ok(id)
    }

    async fn claim_next(&self, job_types: &[&str]) -> Result<Option<Job>> {
        let now = Utc::now();
        let mut jobs = self.jobs.write().await;

        let next = jobs
            .values_mut()
            .filter(|s| {
                matches!(s.job.state, JobState::Waiting | JobState::Delayed)
                    && s.job.run_at <= now
                    && (job_types.is_empty() || job_types.contains(&s.job.job_type.as_str()))
            })
            .min_by(|a, b| (a.job.run_at, a.seq).cmp(&(b.job.run_at, b.seq)));

        let Some(stored) = next else {
            return Ok(None);
        };

        let job = &mut stored.job;
        job.state = JobState::Active;
        job.attempts_made += 1;
        job.progress = 0;
        job.lease_token = Some(Uuid::new_v4());
        job.lease_expires_at = Some(now + to_chrono(self.options.lease_duration));
        job.processed_at = Some(now);
        Ok(Some(job.clone()))
    }

    async fn update_progress(&self, job_id: Uuid, lease_token: Uuid, percent: i32) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        let job = Self::leased_mut(&mut jobs, job_id, lease_token)?;
        job.progress = percent.clamp(0, 100);
        job.lease_expires_at = Some(Utc::now() + to_chrono(self.options.lease_duration));
        Ok(())
    }

    async fn renew_lease(&self, job_id: Uuid, lease_token: Uuid) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        let job = Self::leased_mut(&mut jobs, job_id, lease_token)?;
        job.lease_expires_at = Some(Utc::now() + to_chrono(self.options.lease_duration));
        Ok(())
    }

    async fn complete(
        &self,
        job_id: Uuid,
        lease_token: Uuid,
        result: Option<JsonValue>,
    ) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        let job = Self::leased_mut(&mut jobs, job_id, lease_token)?;
        job.state = JobState::Completed;
        job.progress = 100;
        job.result = result;
        job.finished_at = Some(Utc::now());
        job.lease_token = None;
        job.lease_expires_at = None;
        Ok(())
    }

    async fn fail(
        &self,
        job_id: Uuid,
        lease_token: Uuid,
        failure: &JobFailure,
    ) -> Result<FailOutcome> {
        let now = Utc::now();
        let mut jobs = self.jobs.write().await;
        let job = Self::leased_mut(&mut jobs, job_id, lease_token)?;

        job.failed_reason = Some(failure.message.clone());
        job.stacktrace.push(failure.trace_line());
        job.lease_token = None;
        job.lease_expires_at = None;

        if job.attempts_made < job.max_attempts {
            let delay = backoff_delay(job.backoff_base_ms, job.attempts_made);
            job.state = JobState::Delayed;
            job.run_at = now + to_chrono(delay);
            job.progress = 0;
            Ok(FailOutcome::Retrying {
                attempts_made: job.attempts_made,
                delay,
            })
        } else {
            job.state = JobState::Failed;
            job.finished_at = Some(now);
            Ok(FailOutcome::Exhausted(job.clone()))
        }
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        Ok(self.jobs.read().await.get(&job_id).map(|s| s.job.clone()))
    }

    async fn state(&self, job_id: Uuid) -> Result<Option<JobState>> {
        let now = Utc::now();
        Ok(self
            .jobs
            .read()
            .await
            .get(&job_id)
            .map(|s| s.job.state_at(now)))
    }

    async fn remove(&self, job_id: Uuid) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        match jobs.get(&job_id) {
            None => Err(Error::NotFound(format!("Job {}", job_id))),
            Some(s) if s.job.state == JobState::Active => Err(Error::Conflict(format!(
                "Cannot remove job {} while it is being processed",
                job_id
            ))),
            Some(_) => {
                jobs.remove(&job_id);
                Ok(())
            }
        }
    }

    async fn recover_stalled(&self) -> Result<StalledRecovery> {
        let now = Utc::now();
        let mut jobs = self.jobs.write().await;
        let mut recovery = StalledRecovery::default();

        for stored in jobs.values_mut() {
            let job = &mut stored.job;
            if !job.lease_expired_at(now) {
                continue;
            }
            job.failed_reason = Some(LEASE_EXPIRED_REASON.to_string());
            job.stacktrace.push(LEASE_EXPIRED_REASON.to_string());
            job.lease_token = None;
            job.lease_expires_at = None;

            if job.attempts_made < job.max_attempts {
                job.state = JobState::Waiting;
                job.run_at = now;
                job.progress = 0;
                recovery.requeued += 1;
            } else {
                job.state = JobState::Failed;
                job.finished_at = Some(now);
                recovery.exhausted.push(job.clone());
            }
        }
        Ok(recovery)
    }

    async fn list_by_state(&self, state: JobState, limit: i64) -> Result<Vec<Job>> {
        let jobs = self.jobs.read().await;
        let mut matching: Vec<&StoredJob> = jobs.values().filter(|s| s.job.state == state).collect();
        matching.sort_by_key(|s| s.seq);
        Ok(matching
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|s| s.job.clone())
            .collect())
    }

    async fn list_awaiting_dead_letter(&self, limit: i64) -> Result<Vec<Job>> {
        let jobs = self.jobs.read().await;
        let mut awaiting: Vec<&Job> = jobs
            .values()
            .map(|s| &s.job)
            .filter(|j| j.state == JobState::Failed && j.dead_lettered_at.is_none())
            .collect();
        awaiting.sort_by_key(|j| (j.finished_at, j.id));
        Ok(awaiting
            .into_iter()
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn mark_dead_lettered(&self, job_id: Uuid) -> Result<bool> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&job_id) {
            Some(stored)
                if stored.job.state == JobState::Failed && stored.job.dead_lettered_at.is_none() =>
            {
                stored.job.dead_lettered_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn counts(&self) -> Result<QueueCounts> {
        let jobs = self.jobs.read().await;
        let mut counts = QueueCounts::default();
        for stored in jobs.values() {
            match stored.job.state {
                JobState::Waiting => counts.waiting += 1,
                JobState::Delayed => counts.delayed += 1,
                JobState::Active => counts.active += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn prune(&self) -> Result<u64> {
        let now = Utc::now();
        let retention = self.options.retention;
        let mut jobs = self.jobs.write().await;

        let mut completed: Vec<(chrono::DateTime<Utc>, u64, Uuid)> = jobs
            .values()
            .filter(|s| s.job.state == JobState::Completed)
            .map(|s| (s.job.finished_at.unwrap_or(s.job.created_at), s.seq, s.job.id))
            .collect();
        completed.sort_by(|a, b| b.cmp(a));

        let mut doomed: Vec<Uuid> = completed
            .iter()
            .enumerate()
            .filter(|(i, (finished, _, _))| {
                *i as i64 >= retention.completed_keep
                    || *finished < now - retention.completed_max_age
            })
            .map(|(_, (_, _, id))| *id)
            .collect();

        doomed.extend(jobs.values().filter_map(|s| {
            let finished = s.job.finished_at?;
            (s.job.state == JobState::Failed && finished < now - retention.failed_max_age)
                .then_some(s.job.id)
        }));

        for id in &doomed {
            jobs.remove(id);
        }
        Ok(doomed.len() as u64)
    }
}

// =============================================================================
// DEAD LETTER QUEUE
// =============================================================================

/// In-memory implementation of [`DeadLetterQueue`].
#[derive(Clone, Default)]
pub struct MemoryDeadLetterQueue {
    entries: Arc<RwLock<Vec<DeadLetterEntry>>>,
}

impl MemoryDeadLetterQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeadLetterQueue for MemoryDeadLetterQueue {
    async fn push(&self, mut entry: DeadLetterEntry) -> Result<Uuid> {
        let mut entries = self.entries.write().await;
        if let Some(existing) = entries
            .iter()
            .find(|e| e.original_job.id == entry.original_job.id)
        {
            return existing
                .id
                .ok_or_else(|| Error::Internal("Stored dead letter entry has no id".to_string()));
        }
        let id = entry.id.unwrap_or_else(new_v7);
        entry.id = Some(id);
        entries.push(entry);
        Ok(id)
    }

    async fn get(&self, id: Uuid) -> Result<Option<DeadLetterEntry>> {
        let entries = self.entries.read().await;
        Ok(entries.iter().find(|e| e.id == Some(id)).cloned())
    }

    async fn find_by_job(&self, job_id: Uuid) -> Result<Option<DeadLetterEntry>> {
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .find(|e| e.original_job.id == job_id)
            .cloned())
    }

    async fn list(&self, limit: i64) -> Result<Vec<DeadLetterEntry>> {
        let entries = self.entries.read().await;
        let mut sorted: Vec<DeadLetterEntry> = entries.clone();
        sorted.sort_by(|a, b| b.failed_at.cmp(&a.failed_at));
        sorted.truncate(limit.max(0) as usize);
        Ok(sorted)
    }

    async fn count(&self) -> Result<i64> {
        Ok(self.entries.read().await.len() as i64)
    }

    async fn remove(&self, id: Uuid) -> Result<bool> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|e| e.id != Some(id));
        Ok(entries.len() < before)
    }

    async fn purge_older_than(&self, max_age: chrono::Duration) -> Result<u64> {
        let cutoff = Utc::now() - max_age;
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|e| e.failed_at >= cutoff);
        Ok((before - entries.len()) as u64)
    }
}

// =============================================================================
// WORK RECORD STORE
// =============================================================================

/// In-memory implementation of [`WorkRecordRepository`].
#[derive(Clone, Default)]
pub struct MemoryWorkRecordRepository {
    records: Arc<RwLock<HashMap<Uuid, WorkRecord>>>,
}

impl MemoryWorkRecordRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `update` when the record may move to `next`.
    async fn transition<F>(&self, id: Uuid, next: WorkRecordStatus, update: F) -> Result<bool>
    where
        F: FnOnce(&mut WorkRecord) + Send,
    {
        let mut records = self.records.write().await;
        match records.get_mut(&id) {
            Some(record) if record.status.can_transition_to(next) => {
                record.status = next;
                record.updated_at = Utc::now();
                update(record);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl WorkRecordRepository for MemoryWorkRecordRepository {
    async fn create(&self, record: NewWorkRecord) -> Result<WorkRecord> {
        let id = record.id.unwrap_or_else(new_v7);
        let now = Utc::now();
        let mut records = self.records.write().await;
        if records.contains_key(&id) {
            return Err(Error::Conflict(format!("Work record {} already exists", id)));
        }
        let created = WorkRecord {
            id,
            status: WorkRecordStatus::Pending,
            image_url: record.image_url,
            source_language_hints: record.source_language_hints,
            detected_language: None,
            recognized_text: None,
            translated_text: None,
            target_language: record.target_language,
            translation_skipped: false,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        };
        records.insert(id, created.clone());
        Ok(created)
    }

    async fn get(&self, id: Uuid) -> Result<Option<WorkRecord>> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn list(&self, query: &WorkRecordQuery) -> Result<Page<WorkRecord>> {
        let records = self.records.read().await;
        let mut matching: Vec<WorkRecord> = records
            .values()
            .filter(|r| query.status.map_or(true, |s| r.status == s))
            .cloned()
            .collect();
        matching.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));

        let total = matching.len() as u64;
        let items = matching
            .into_iter()
            .skip(query.offset() as usize)
            .take(query.limit() as usize)
            .collect();
        Ok(Page::new(items, total, query))
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        Ok(self.records.write().await.remove(&id).is_some())
    }

    async fn mark_processing(&self, id: Uuid) -> Result<bool> {
        self.transition(id, WorkRecordStatus::Processing, |_| {})
            .await
    }

    async fn record_attempt_failure(&self, id: Uuid, reason: &str) -> Result<bool> {
        let mut records = self.records.write().await;
        match records.get_mut(&id) {
            Some(record) if !record.status.is_terminal() => {
                record.failure_reason = Some(reason.to_string());
                record.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_completed(&self, id: Uuid, outcome: &CompletedOutcome) -> Result<bool> {
        let outcome = outcome.clone();
        self.transition(id, WorkRecordStatus::Completed, move |record| {
            record.recognized_text = Some(outcome.recognized_text);
            record.translation_skipped = outcome.translation.is_none();
            record.failure_reason = None;
            if let Some(t) = outcome.translation {
                record.translated_text = Some(t.translated_text);
                record.detected_language = t.detected_language_code;
            }
        })
        .await
    }

    async fn mark_failed(&self, id: Uuid, reason: &str) -> Result<bool> {
        let reason = reason.to_string();
        self.transition(id, WorkRecordStatus::Failed, move |record| {
            record.failure_reason = Some(reason);
        })
        .await
    }

    async fn list_unfinished(
        &self,
        updated_before: DateTime<Utc>,
        after: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<WorkRecord>> {
        let records = self.records.read().await;
        let mut unfinished: Vec<WorkRecord> = records
            .values()
            .filter(|r| {
                !r.status.is_terminal()
                    && r.updated_at < updated_before
                    && after.map_or(true, |a| r.id > a)
            })
            .cloned()
            .collect();
        unfinished.sort_by_key(|r| r.id);
        unfinished.truncate(limit.max(0) as usize);
        Ok(unfinished)
    }
}
