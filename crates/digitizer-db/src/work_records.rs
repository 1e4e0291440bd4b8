//! Work record repository implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres, Row};
use tracing::debug;
use uuid::Uuid;

use digitizer_core::{
    new_v7, CompletedOutcome, Error, NewWorkRecord, Page, Result, WorkRecord,
    WorkRecordQuery, WorkRecordRepository, WorkRecordStatus,
};

const RECORD_COLUMNS: &str = "id, status, image_url, source_language_hints, detected_language, \
     recognized_text, translated_text, target_language, translation_skipped, failure_reason, \
     created_at, updated_at";

/// PostgreSQL implementation of [`WorkRecordRepository`].
///
/// Every transition is a single guarded `UPDATE` that only matches rows in an
/// allowed source status, so concurrent or replayed writes cannot regress a
/// terminal record.
#[derive(Clone)]
pub struct PgWorkRecordRepository {
    pool: Pool<Postgres>,
}

impl PgWorkRecordRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_row(row: sqlx::postgres::PgRow) -> Result<WorkRecord> {
        let status: String = row.try_get("status")?;
        let status = WorkRecordStatus::parse(&status).ok_or_else(|| {
            Error::Internal(format!("Unknown work record status in database: {}", status))
        })?;

        Ok(WorkRecord {
            id: row.try_get("id")?,
            status,
            image_url: row.try_get("image_url")?,
            source_language_hints: row.try_get("source_language_hints")?,
            detected_language: row.try_get("detected_language")?,
            recognized_text: row.try_get("recognized_text")?,
            translated_text: row.try_get("translated_text")?,
            target_language: row.try_get("target_language")?,
            translation_skipped: row.try_get("translation_skipped")?,
            failure_reason: row.try_get("failure_reason")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl WorkRecordRepository for PgWorkRecordRepository {
    async fn create(&self, record: NewWorkRecord) -> Result<WorkRecord> {
        let id = record.id.unwrap_or_else(new_v7);
        let now = Utc::now();

        let query = format!(
            "INSERT INTO work_records (id, status, image_url, source_language_hints,
                                       target_language, created_at, updated_at)
             VALUES ($1, 'pending', $2, $3, $4, $5, $5)
             RETURNING {RECORD_COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(id)
            .bind(&record.image_url)
            .bind(&record.source_language_hints)
            .bind(&record.target_language)
            .bind(now)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                    Error::Conflict(format!("Work record {} already exists", id))
                }
                other => Error::Database(other),
            })?;

        debug!(
            subsystem = "db",
            component = "work_records",
            op = "create",
            work_record_id = %id,
            "Work record created"
        );
        Self::parse_row(row)
    }

    async fn get(&self, id: Uuid) -> Result<Option<WorkRecord>> {
        let query = format!("SELECT {RECORD_COLUMNS} FROM work_records WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::parse_row).transpose()
    }

    async fn list(&self, query: &WorkRecordQuery) -> Result<Page<WorkRecord>> {
        let status = query.status.map(|s| s.as_str());

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM work_records WHERE ($1::text IS NULL OR status = $1)",
        )
        .bind(status)
        .fetch_one(&self.pool)
        .await?;

        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM work_records
             WHERE ($1::text IS NULL OR status = $1)
             ORDER BY created_at DESC, id DESC
             LIMIT $2 OFFSET $3"
        );
        let rows = sqlx::query(&sql)
            .bind(status)
            .bind(i64::from(query.limit()))
            .bind(query.offset() as i64)
            .fetch_all(&self.pool)
            .await?;

        let items = rows
            .into_iter()
            .map(Self::parse_row)
            .collect::<Result<Vec<_>>>()?;

        Ok(Page::new(items, total.max(0) as u64, query))
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let deleted = sqlx::query("DELETE FROM work_records WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted > 0)
    }

    async fn mark_processing(&self, id: Uuid) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE work_records SET status = 'processing', updated_at = $1
             WHERE id = $2 AND status IN ('pending', 'processing')",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    async fn record_attempt_failure(&self, id: Uuid, reason: &str) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE work_records SET failure_reason = $1, updated_at = $2
             WHERE id = $3 AND status IN ('pending', 'processing')",
        )
        .bind(reason)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    async fn mark_completed(&self, id: Uuid, outcome: &CompletedOutcome) -> Result<bool> {
        let (translated_text, detected_language) = match &outcome.translation {
            Some(t) => (Some(t.translated_text.as_str()), t.detected_language_code.as_deref()),
            None => (None, None),
        };

        let updated = sqlx::query(
            "UPDATE work_records
             SET status = 'completed', recognized_text = $1, translated_text = $2,
                 detected_language = $3, translation_skipped = $4, failure_reason = NULL,
                 updated_at = $5
             WHERE id = $6 AND status = 'processing'",
        )
        .bind(&outcome.recognized_text)
        .bind(translated_text)
        .bind(detected_language)
        .bind(outcome.translation.is_none())
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    async fn mark_failed(&self, id: Uuid, reason: &str) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE work_records SET status = 'failed', failure_reason = $1, updated_at = $2
             WHERE id = $3 AND status IN ('pending', 'processing')",
        )
        .bind(reason)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    async fn list_unfinished(
        &self,
        updated_before: DateTime<Utc>,
        after: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<WorkRecord>> {
        let query = format!(
            "SELECT {RECORD_COLUMNS} FROM work_records
             WHERE status IN ('pending', 'processing')
               AND updated_at < $1
               AND ($2::uuid IS NULL OR id > $2)
             ORDER BY id ASC
             LIMIT $3"
        );
        let rows = sqlx::query(&query)
            .bind(updated_before)
            .bind(after)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Self::parse_row).collect()
    }
}
