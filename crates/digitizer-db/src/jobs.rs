//! PostgreSQL job queue.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::types::Json;
use sqlx::{Pool, Postgres, Row};
use tracing::{debug, info, warn};
use uuid::Uuid;

use digitizer_core::{
    backoff_delay, new_v7, EnqueueOptions, Error, FailOutcome, Job, JobFailure, JobQueue,
    JobState, QueueCounts, QueueOptions, Result, StalledRecovery,
};

pub(crate) const JOB_COLUMNS: &str = "id, queue, job_type, payload, state, attempts_made, \
     max_attempts, backoff_base_ms, progress, result, failed_reason, stacktrace, run_at, \
     lease_token, lease_expires_at, created_at, processed_at, finished_at, dead_lettered_at";

/// Reason recorded when a lease runs out before the attempt finishes.
pub const LEASE_EXPIRED_REASON: &str = "lease expired before the attempt finished";

/// PostgreSQL implementation of [`JobQueue`].
///
/// Claims use `FOR UPDATE SKIP LOCKED`, so any number of workers can poll the
/// same queue without handing out the same job twice.
#[derive(Clone)]
pub struct PgJobQueue {
    pool: Pool<Postgres>,
    options: QueueOptions,
}

impl PgJobQueue {
    /// Create a new queue over the given pool.
    pub fn new(pool: Pool<Postgres>, options: QueueOptions) -> Self {
        Self { pool, options }
    }

    /// Queue settings.
    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    fn lease_expiry(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + to_chrono(self.options.lease_duration)
    }

    /// Parse a job row into a Job struct.
    fn parse_job_row(row: sqlx::postgres::PgRow) -> Result<Job> {
        let state: String = row.try_get("state")?;
        let state = JobState::parse(&state)
            .ok_or_else(|| Error::Internal(format!("Unknown job state in database: {}", state)))?;
        let stacktrace: Json<Vec<String>> = row.try_get("stacktrace")?;

        Ok(Job {
            id: row.try_get("id")?,
            queue: row.try_get("queue")?,
            job_type: row.try_get("job_type")?,
            payload: row.try_get("payload")?,
            state,
            attempts_made: row.try_get("attempts_made")?,
            max_attempts: row.try_get("max_attempts")?,
            backoff_base_ms: row.try_get("backoff_base_ms")?,
            progress: row.try_get("progress")?,
            result: row.try_get("result")?,
            failed_reason: row.try_get("failed_reason")?,
            stacktrace: stacktrace.0,
            run_at: row.try_get("run_at")?,
            lease_token: row.try_get("lease_token")?,
            lease_expires_at: row.try_get("lease_expires_at")?,
            created_at: row.try_get("created_at")?,
            processed_at: row.try_get("processed_at")?,
            finished_at: row.try_get("finished_at")?,
            dead_lettered_at: row.try_get("dead_lettered_at")?,
        })
    }

    fn lease_lost(job_id: Uuid) -> Error {
        Error::Conflict(format!("Job {} is not held under this lease", job_id))
    }
}

/// Convert a std duration, saturating at one century.
pub(crate) fn to_chrono(d: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

#[async_trait]
impl JobQueue for PgJobQueue {
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
        let job_id = options.job_id.unwrap_or_else(new_v7);
        let now = Utc::now();
        let max_attempts = options
            .max_attempts
            .unwrap_or(self.options.max_attempts)
            .max(1);
        let (state, run_at) = match options.delay {
            Some(delay) if !delay.is_zero() => (JobState::Delayed, now + to_chrono(delay)),
            _ => (JobState::Waiting, now),
        };

        let inserted = sqlx::query(
            "INSERT INTO jobs (id, queue, job_type, payload, state, attempts_made, max_attempts,
                               backoff_base_ms, run_at, created_at)
             VALUES ($1, $2, $3, $4, $5, 0, $6, $7, $8, $9)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(job_id)
        .bind(&self.options.name)
        .bind(job_type)
        .bind(&payload)
        .bind(state.as_str())
        .bind(max_attempts)
        .bind(self.options.backoff.base_delay.as_millis() as i64)
        .bind(run_at)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 0 {
            return Err(Error::Conflict(format!("Job {} already exists", job_id)));
        }

        debug!(
            subsystem = "db",
            component = "queue",
            op = "enqueue",
            queue = %self.options.name,
            job_id = %job_id,
            job_type,
            "Job enqueued"
        );
        Ok(job_id)
    }

    async fn claim_next(&self, job_types: &[&str]) -> Result<Option<Job>> {
        let now = Utc::now();
        let lease_token = Uuid::new_v4();
        let type_strings: Vec<String> = job_types.iter().map(|t| t.to_string()).collect();

        // Filter by type before locking; empty array = claim any type.
        let query = format!(
            "UPDATE jobs
             SET state = 'active', attempts_made = attempts_made + 1, lease_token = $1,
                 lease_expires_at = $2, processed_at = $3, progress = 0
             WHERE id = (
                 SELECT id FROM jobs
                 WHERE queue = $4
                   AND state IN ('waiting', 'delayed')
                   AND run_at <= $3
                   AND (cardinality($5::text[]) = 0 OR job_type = ANY($5))
                 ORDER BY run_at ASC, created_at ASC
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {JOB_COLUMNS}"
        );

        let row = sqlx::query(&query)
            .bind(lease_token)
            .bind(self.lease_expiry(now))
            .bind(now)
            .bind(&self.options.name)
            .bind(&type_strings)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::parse_job_row).transpose()
    }

    async fn update_progress(&self, job_id: Uuid, lease_token: Uuid, percent: i32) -> Result<()> {
        let now = Utc::now();
        let updated = sqlx::query(
            "UPDATE jobs SET progress = $1, lease_expires_at = $2
             WHERE id = $3 AND lease_token = $4 AND state = 'active'",
        )
        .bind(percent.clamp(0, 100))
        .bind(self.lease_expiry(now))
        .bind(job_id)
        .bind(lease_token)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(Self::lease_lost(job_id));
        }
        Ok(())
    }

    async fn renew_lease(&self, job_id: Uuid, lease_token: Uuid) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE jobs SET lease_expires_at = $1
             WHERE id = $2 AND lease_token = $3 AND state = 'active'",
        )
        .bind(self.lease_expiry(Utc::now()))
        .bind(job_id)
        .bind(lease_token)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(Self::lease_lost(job_id));
        }
        Ok(())
    }

    async fn complete(
        &self,
        job_id: Uuid,
        lease_token: Uuid,
        result: Option<JsonValue>,
    ) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE jobs
             SET state = 'completed', progress = 100, result = $1, finished_at = $2,
                 lease_token = NULL, lease_expires_at = NULL
             WHERE id = $3 AND lease_token = $4 AND state = 'active'",
        )
        .bind(&result)
        .bind(Utc::now())
        .bind(job_id)
        .bind(lease_token)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(Self::lease_lost(job_id));
        }
        Ok(())
    }

    async fn fail(
        &self,
        job_id: Uuid,
        lease_token: Uuid,
        failure: &JobFailure,
    ) -> Result<FailOutcome> {
        let now = Utc::now();
        let trace = Json(vec![failure.trace_line()]);

        let mut tx = self.pool.begin().await?;

        let current: Option<(i32, i32, i64)> = sqlx::query_as(
            "SELECT attempts_made, max_attempts, backoff_base_ms FROM jobs
             WHERE id = $1 AND lease_token = $2 AND state = 'active'
             FOR UPDATE",
        )
        .bind(job_id)
        .bind(lease_token)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((attempts_made, max_attempts, backoff_base_ms)) = current else {
            return Err(Self::lease_lost(job_id));
        };

        let outcome = if attempts_made < max_attempts {
            let delay = backoff_delay(backoff_base_ms, attempts_made);
            sqlx::query(
                "UPDATE jobs
                 SET state = 'delayed', run_at = $1, failed_reason = $2,
                     stacktrace = stacktrace || $3::jsonb, progress = 0,
                     lease_token = NULL, lease_expires_at = NULL
                 WHERE id = $4",
            )
            .bind(now + to_chrono(delay))
            .bind(&failure.message)
            .bind(&trace)
            .bind(job_id)
            .execute(&mut *tx)
            .await?;

            FailOutcome::Retrying {
                attempts_made,
                delay,
            }
        } else {
            let query = format!(
                "UPDATE jobs
                 SET state = 'failed', finished_at = $1, failed_reason = $2,
                     stacktrace = stacktrace || $3::jsonb,
                     lease_token = NULL, lease_expires_at = NULL
                 WHERE id = $4
                 RETURNING {JOB_COLUMNS}"
            );
            let row = sqlx::query(&query)
                .bind(now)
                .bind(&failure.message)
                .bind(&trace)
                .bind(job_id)
                .fetch_one(&mut *tx)
                .await?;

            FailOutcome::Exhausted(Self::parse_job_row(row)?)
        };

        tx.commit().await?;
        Ok(outcome)
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        let query = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::parse_job_row).transpose()
    }

    async fn state(&self, job_id: Uuid) -> Result<Option<JobState>> {
        Ok(self.get(job_id).await?.map(|job| job.state_at(Utc::now())))
    }

    async fn remove(&self, job_id: Uuid) -> Result<()> {
        let deleted: Option<Uuid> =
            sqlx::query_scalar("DELETE FROM jobs WHERE id = $1 AND state <> 'active' RETURNING id")
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await?;

        if deleted.is_some() {
            return Ok(());
        }

        let exists: Option<String> = sqlx::query_scalar("SELECT state FROM jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        match exists {
            Some(_) => Err(Error::Conflict(format!(
                "Cannot remove job {} while it is being processed",
                job_id
            ))),
            None => Err(Error::NotFound(format!("Job {}", job_id))),
        }
    }

    async fn recover_stalled(&self) -> Result<StalledRecovery> {
        let now = Utc::now();
        let trace = Json(vec![LEASE_EXPIRED_REASON.to_string()]);

        let mut tx = self.pool.begin().await?;

        let requeued = sqlx::query(
            "UPDATE jobs
             SET state = 'waiting', run_at = $1, failed_reason = $2,
                 stacktrace = stacktrace || $3::jsonb, progress = 0,
                 lease_token = NULL, lease_expires_at = NULL
             WHERE queue = $4 AND state = 'active' AND lease_expires_at < $1
               AND attempts_made < max_attempts",
        )
        .bind(now)
        .bind(LEASE_EXPIRED_REASON)
        .bind(&trace)
        .bind(&self.options.name)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let query = format!(
            "UPDATE jobs
             SET state = 'failed', finished_at = $1, failed_reason = $2,
                 stacktrace = stacktrace || $3::jsonb,
                 lease_token = NULL, lease_expires_at = NULL
             WHERE queue = $4 AND state = 'active' AND lease_expires_at < $1
               AND attempts_made >= max_attempts
             RETURNING {JOB_COLUMNS}"
        );
        let rows = sqlx::query(&query)
            .bind(now)
            .bind(LEASE_EXPIRED_REASON)
            .bind(&trace)
            .bind(&self.options.name)
            .fetch_all(&mut *tx)
            .await?;

        tx.commit().await?;

        let exhausted = rows
            .into_iter()
            .map(Self::parse_job_row)
            .collect::<Result<Vec<_>>>()?;

        if requeued > 0 || !exhausted.is_empty() {
            warn!(
                subsystem = "db",
                component = "queue",
                op = "recover_stalled",
                queue = %self.options.name,
                requeued,
                exhausted = exhausted.len(),
                "Recovered jobs with expired leases"
            );
        }

        Ok(StalledRecovery {
            requeued,
            exhausted,
        })
    }

    async fn list_by_state(&self, state: JobState, limit: i64) -> Result<Vec<Job>> {
        let query = format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE queue = $1 AND state = $2
             ORDER BY created_at ASC
             LIMIT $3"
        );
        let rows = sqlx::query(&query)
            .bind(&self.options.name)
            .bind(state.as_str())
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Self::parse_job_row).collect()
    }

    async fn list_awaiting_dead_letter(&self, limit: i64) -> Result<Vec<Job>> {
        let query = format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE queue = $1 AND state = 'failed' AND dead_lettered_at IS NULL
             ORDER BY finished_at ASC, id ASC
             LIMIT $2"
        );
        let rows = sqlx::query(&query)
            .bind(&self.options.name)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Self::parse_job_row).collect()
    }

    async fn mark_dead_lettered(&self, job_id: Uuid) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE jobs SET dead_lettered_at = $1
             WHERE id = $2 AND state = 'failed' AND dead_lettered_at IS NULL",
        )
        .bind(Utc::now())
        .bind(job_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    async fn counts(&self) -> Result<QueueCounts> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT state, COUNT(*) FROM jobs WHERE queue = $1 GROUP BY state",
        )
        .bind(&self.options.name)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = QueueCounts::default();
        for (state, n) in rows {
            match JobState::parse(&state) {
                Some(JobState::Waiting) => counts.waiting = n,
                Some(JobState::Delayed) => counts.delayed = n,
                Some(JobState::Active) => counts.active = n,
                Some(JobState::Completed) => counts.completed = n,
                Some(JobState::Failed) => counts.failed = n,
                None => warn!(state = %state, "Ignoring unknown job state in counts"),
            }
        }
        Ok(counts)
    }

    async fn prune(&self) -> Result<u64> {
        let now = Utc::now();
        let retention = &self.options.retention;

        let failed = sqlx::query(
            "DELETE FROM jobs WHERE queue = $1 AND state = 'failed' AND finished_at < $2",
        )
        .bind(&self.options.name)
        .bind(now - retention.failed_max_age)
        .execute(&self.pool)
        .await?
        .rows_affected();

        let completed = sqlx::query(
            "DELETE FROM jobs
             WHERE queue = $1 AND state = 'completed'
               AND (finished_at < $2 OR id NOT IN (
                   SELECT id FROM jobs
                   WHERE queue = $1 AND state = 'completed'
                   ORDER BY finished_at DESC
                   LIMIT $3
               ))",
        )
        .bind(&self.options.name)
        .bind(now - retention.completed_max_age)
        .bind(retention.completed_keep)
        .execute(&self.pool)
        .await?
        .rows_affected();

        let total = failed + completed;
        if total > 0 {
            info!(
                subsystem = "db",
                component = "queue",
                op = "prune",
                queue = %self.options.name,
                completed,
                failed,
                "Pruned finished jobs"
            );
        }
        Ok(total)
    }
}
