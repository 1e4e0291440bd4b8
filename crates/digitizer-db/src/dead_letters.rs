//! Dead letter queue backed by the `dead_letters` table.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::types::Json;
use sqlx::{Pool, Postgres, Row};
use tracing::info;
use uuid::Uuid;

use digitizer_core::{new_v7, DeadLetterEntry, DeadLetterQueue, OriginalJob, Result};

const DEAD_LETTER_COLUMNS: &str =
    "id, original_job_id, data, failed_reason, stacktrace, attempts_made, failed_at";

/// PostgreSQL implementation of [`DeadLetterQueue`].
#[derive(Clone)]
pub struct PgDeadLetterQueue {
    pool: Pool<Postgres>,
    name: String,
}

impl PgDeadLetterQueue {
    pub fn new(pool: Pool<Postgres>, name: impl Into<String>) -> Self {
        Self {
            pool,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn parse_row(row: sqlx::postgres::PgRow) -> Result<DeadLetterEntry> {
        let stacktrace: Json<Vec<String>> = row.try_get("stacktrace")?;
        Ok(DeadLetterEntry {
            id: Some(row.try_get("id")?),
            original_job: OriginalJob {
                id: row.try_get("original_job_id")?,
                data: row.try_get("data")?,
                failed_reason: row.try_get("failed_reason")?,
                stacktrace: stacktrace.0,
                attempts_made: row.try_get("attempts_made")?,
            },
            failed_at: row.try_get("failed_at")?,
        })
    }
}

#[async_trait]
impl DeadLetterQueue for PgDeadLetterQueue {
    async fn push(&self, entry: DeadLetterEntry) -> Result<Uuid> {
        let id = entry.id.unwrap_or_else(new_v7);
        let original = &entry.original_job;

        // The no-op update makes RETURNING yield the existing row's id.
        let stored: Uuid = sqlx::query_scalar(
            "INSERT INTO dead_letters (id, queue, original_job_id, data, failed_reason,
                                       stacktrace, attempts_made, failed_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (original_job_id) DO UPDATE SET original_job_id = EXCLUDED.original_job_id
             RETURNING id",
        )
        .bind(id)
        .bind(&self.name)
        .bind(original.id)
        .bind(&original.data)
        .bind(&original.failed_reason)
        .bind(Json(&original.stacktrace))
        .bind(original.attempts_made)
        .bind(entry.failed_at)
        .fetch_one(&self.pool)
        .await?;

        if stored == id {
            info!(
                subsystem = "db",
                component = "dlq",
                op = "push",
                queue = %self.name,
                job_id = %original.id,
                attempt = original.attempts_made,
                "Job moved to dead letter queue"
            );
        }
        Ok(stored)
    }

    async fn get(&self, id: Uuid) -> Result<Option<DeadLetterEntry>> {
        let query = format!("SELECT {DEAD_LETTER_COLUMNS} FROM dead_letters WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Self::parse_row).transpose()
    }

    async fn find_by_job(&self, job_id: Uuid) -> Result<Option<DeadLetterEntry>> {
        let query =
            format!("SELECT {DEAD_LETTER_COLUMNS} FROM dead_letters WHERE original_job_id = $1");
        let row = sqlx::query(&query)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Self::parse_row).transpose()
    }

    async fn list(&self, limit: i64) -> Result<Vec<DeadLetterEntry>> {
        let query = format!(
            "SELECT {DEAD_LETTER_COLUMNS} FROM dead_letters
             WHERE queue = $1
             ORDER BY failed_at DESC
             LIMIT $2"
        );
        let rows = sqlx::query(&query)
            .bind(&self.name)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Self::parse_row).collect()
    }

    async fn count(&self) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dead_letters WHERE queue = $1")
            .bind(&self.name)
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    async fn remove(&self, id: Uuid) -> Result<bool> {
        let deleted = sqlx::query("DELETE FROM dead_letters WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted > 0)
    }

    async fn purge_older_than(&self, max_age: chrono::Duration) -> Result<u64> {
        let purged = sqlx::query("DELETE FROM dead_letters WHERE queue = $1 AND failed_at < $2")
            .bind(&self.name)
            .bind(Utc::now() - max_age)
            .execute(&self.pool)
            .await?
            .rows_affected();

        if purged > 0 {
            info!(
                subsystem = "db",
                component = "dlq",
                op = "purge",
                queue = %self.name,
                purged,
                "Purged expired dead letter entries"
            );
        }
        Ok(purged)
    }
}
