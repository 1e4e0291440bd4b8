//! Submission and administration of digitization requests.
//!
//! Producers go through [`DigitizationService`]: it validates the request,
//! creates the work record and enqueues the job that processes it. The job id
//! is the work record id, so either can be found from the other.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use digitizer_core::{
    defaults, BlobUploader, DeadLetterEntry, DigitizationPayload, EnqueueOptions, Error,
    ImageDownloader, Job, JobState, NewWorkRecord, Page, QueueCounts, Result, WorkRecord,
    WorkRecordQuery,
};
use digitizer_providers::detect_image_type;

use crate::Stores;

/// Blob storage folder for images fetched from a remote URL.
pub const URL_UPLOAD_FOLDER: &str = "url-uploads";

/// Blob storage folder for images uploaded directly.
pub const DIRECT_UPLOAD_FOLDER: &str = "direct-uploads";

/// Page size for reconciliation queries.
const RECONCILE_BATCH: i64 = 500;

/// Age after which an unfinished record without a job is considered orphaned.
const ORPHAN_GRACE_SECS: i64 = 600;

/// A request to digitize the image at `image_url`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmitDigitization {
    pub image_url: String,
    pub source_language_hints: Vec<String>,
    pub target_language: Option<String>,
}

impl SubmitDigitization {
    pub fn new(image_url: impl Into<String>) -> Self {
        Self {
            image_url: image_url.into(),
            ..Default::default()
        }
    }

    pub fn with_language_hints<I, S>(mut self, hints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.source_language_hints = hints.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_target_language(mut self, language: impl Into<String>) -> Self {
        self.target_language = Some(language.into());
        self
    }

    /// Trim language codes and reject malformed input.
    fn validated(mut self) -> Result<Self> {
        validate_image_url(&self.image_url)?;

        for hint in self.source_language_hints.iter_mut() {
            *hint = hint.trim().to_string();
            if hint.is_empty() {
                return Err(Error::Validation(
                    "Source language hints must not be empty".to_string(),
                ));
            }
        }

        if let Some(target) = self.target_language.as_mut() {
            *target = target.trim().to_string();
            if target.is_empty() {
                return Err(Error::Validation(
                    "Target language must not be empty".to_string(),
                ));
            }
        }

        Ok(self)
    }
}

fn validate_image_url(url: &str) -> Result<()> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"));
    match rest {
        Some(host) if !host.trim().is_empty() => Ok(()),
        _ => Err(Error::Validation(format!(
            "Image URL must be an http(s) URL: {:?}",
            url
        ))),
    }
}

/// What a reconciliation pass repaired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Unfinished work records moved to `failed`.
    pub records_failed: u64,
    /// Failed jobs handed to the dead letter queue by this pass.
    pub dead_lettered: u64,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.records_failed == 0 && self.dead_lettered == 0
    }
}

/// Producer-facing operations over the queue and work record store.
#[derive(Clone)]
pub struct DigitizationService {
    stores: Stores,
    uploader: Arc<dyn BlobUploader>,
    downloader: Arc<dyn ImageDownloader>,
    reconcile_batch: i64,
    orphan_grace: chrono::Duration,
}

impl DigitizationService {
    pub fn new(
        stores: Stores,
        uploader: Arc<dyn BlobUploader>,
        downloader: Arc<dyn ImageDownloader>,
    ) -> Self {
        Self {
            stores,
            uploader,
            downloader,
            reconcile_batch: RECONCILE_BATCH,
            orphan_grace: chrono::Duration::seconds(ORPHAN_GRACE_SECS),
        }
    }

    /// Rows fetched per reconciliation query. Every pass still walks all of
    /// them; this only bounds each read.
    pub fn with_reconcile_batch(mut self, batch: i64) -> Self {
        self.reconcile_batch = batch.max(1);
        self
    }

    /// How long an unfinished record may go untouched without a job before
    /// reconciliation fails it.
    pub fn with_orphan_grace(mut self, grace: chrono::Duration) -> Self {
        self.orphan_grace = grace;
        self
    }

    /// Create a `pending` work record and enqueue the job that processes it.
    ///
    /// When the enqueue fails the record is marked `failed` and the error is
    /// returned.
    #[instrument(skip(self, request), fields(image_url = %request.image_url))]
    pub async fn submit(&self, request: SubmitDigitization) -> Result<WorkRecord> {
        let request = request.validated()?;

        let record = self
            .stores
            .work_records
            .create(NewWorkRecord {
                id: None,
                image_url: request.image_url.clone(),
                source_language_hints: request.source_language_hints.clone(),
                target_language: request.target_language.clone(),
            })
            .await?;

        let payload = DigitizationPayload {
            image_url: request.image_url,
            source_language_hints: request.source_language_hints,
            target_language: request.target_language,
            work_record_id: record.id,
        };

        let enqueued = self
            .stores
            .queue
            .enqueue(
                defaults::DIGITIZATION_JOB_TYPE,
                serde_json::to_value(&payload)?,
                EnqueueOptions::default().with_job_id(record.id),
            )
            .await;

        if let Err(e) = enqueued {
            error!(work_record_id = %record.id, error = %e, "Failed to enqueue digitization job");
            let reason = format!("Failed to enqueue job: {}", e);
            if let Err(mark_err) = self.stores.work_records.mark_failed(record.id, &reason).await {
                error!(
                    work_record_id = %record.id,
                    error = %mark_err,
                    "Failed to mark unqueued work record as failed"
                );
            }
            return Err(e);
        }

        info!(work_record_id = %record.id, "Digitization submitted");
        Ok(record)
    }

    /// Fetch a remote image, store it in blob storage and submit the stored copy.
    pub async fn submit_from_url(&self, request: SubmitDigitization) -> Result<WorkRecord> {
        validate_image_url(&request.image_url)?;
        let image = self.downloader.download(&request.image_url).await?;
        let stored_url = self.uploader.upload(&image, URL_UPLOAD_FOLDER).await?;
        debug!(source = %request.image_url, stored = %stored_url, "Remote image stored");

        self.submit(SubmitDigitization {
            image_url: stored_url,
            ..request
        })
        .await
    }

    /// Store uploaded image bytes and submit them.
    ///
    /// Fails with `Validation` when the bytes are not an image.
    pub async fn submit_upload(
        &self,
        image: &[u8],
        source_language_hints: Vec<String>,
        target_language: Option<String>,
    ) -> Result<WorkRecord> {
        let kind = detect_image_type(image)?;
        let stored_url = self.uploader.upload(image, DIRECT_UPLOAD_FOLDER).await?;
        debug!(mime_type = kind.mime_type(), bytes = image.len(), "Uploaded image stored");

        self.submit(SubmitDigitization {
            image_url: stored_url,
            source_language_hints,
            target_language,
        })
        .await
    }

    pub async fn get(&self, id: Uuid) -> Result<WorkRecord> {
        self.stores
            .work_records
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Work record {}", id)))
    }

    pub async fn list(&self, query: &WorkRecordQuery) -> Result<Page<WorkRecord>> {
        self.stores.work_records.list(query).await
    }

    /// Delete a request: its job and its work record.
    ///
    /// Fails with `Conflict` while a worker holds the job, leaving the record
    /// untouched, and with `NotFound` when neither exists.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        let job_state = self.stores.queue.state(id).await?;
        if job_state == Some(JobState::Active) {
            return Err(Error::Conflict(format!(
                "Job {} is being processed and cannot be deleted",
                id
            )));
        }

        if job_state.is_some() {
            self.stores.queue.remove(id).await?;
        }
        let record_deleted = self.stores.work_records.delete(id).await?;

        if job_state.is_none() && !record_deleted {
            return Err(Error::NotFound(format!("Work record {}", id)));
        }
        info!(work_record_id = %id, "Digitization deleted");
        Ok(())
    }

    /// Newest dead letter entries first.
    pub async fn dead_letters(&self, limit: i64) -> Result<Vec<DeadLetterEntry>> {
        self.stores.dead_letters.list(limit).await
    }

    pub async fn queue_counts(&self) -> Result<QueueCounts> {
        self.stores.queue.counts().await
    }

    /// Bring work records and the dead letter queue in line with job state.
    ///
    /// Covers writes lost between finalizing a job and updating its record.
    /// Failed jobs not yet dead-lettered have their record failed and are
    /// pushed, then marked so a drained entry is never recreated. Unfinished
    /// records idle past the orphan grace are failed when their job failed or
    /// vanished. Safe to run repeatedly and from several workers.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        loop {
            let awaiting = self
                .stores
                .queue
                .list_awaiting_dead_letter(self.reconcile_batch)
                .await?;
            let last_page = (awaiting.len() as i64) < self.reconcile_batch;

            for job in awaiting {
                if self.fail_record_of(&job).await? {
                    report.records_failed += 1;
                }
                let failed_at = job.finished_at.unwrap_or_else(Utc::now);
                let entry_id = self
                    .stores
                    .dead_letters
                    .push(DeadLetterEntry::from_failed_job(&job, failed_at))
                    .await?;
                self.stores.queue.mark_dead_lettered(job.id).await?;
                warn!(job_id = %job.id, entry_id = %entry_id, "Reconciled failed job into dead letter queue");
                report.dead_lettered += 1;
            }

            if last_page {
                break;
            }
        }

        let idle_before = Utc::now() - self.orphan_grace;
        let mut after = None;
        loop {
            let page = self
                .stores
                .work_records
                .list_unfinished(idle_before, after, self.reconcile_batch)
                .await?;
            let last_page = (page.len() as i64) < self.reconcile_batch;
            after = page.last().map(|r| r.id);

            for record in page {
                let reason = match self.stores.queue.get(record.id).await? {
                    Some(job) if job.state == JobState::Failed => job
                        .failed_reason
                        .unwrap_or_else(|| "Job failed".to_string()),
                    None => "Job no longer exists in the queue".to_string(),
                    Some(_) => continue,
                };
                if self.stores.work_records.mark_failed(record.id, &reason).await? {
                    warn!(work_record_id = %record.id, reason = %reason, "Reconciled work record to failed");
                    report.records_failed += 1;
                }
            }

            if last_page {
                break;
            }
        }

        Ok(report)
    }

    /// Fail the work record a failed digitization job was processing.
    async fn fail_record_of(&self, job: &Job) -> Result<bool> {
        if job.job_type != defaults::DIGITIZATION_JOB_TYPE {
            return Ok(false);
        }
        let payload: DigitizationPayload = match job.decode_payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Failed job has no readable work record id");
                return Ok(false);
            }
        };
        let reason = job.failed_reason.as_deref().unwrap_or("Job failed");
        let failed = self
            .stores
            .work_records
            .mark_failed(payload.work_record_id, reason)
            .await?;
        if failed {
            warn!(work_record_id = %payload.work_record_id, reason = %reason, "Reconciled work record to failed");
        }
        Ok(failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_image_url() {
        assert!(validate_image_url("https://x/a.png").is_ok());
        assert!(validate_image_url("http://x/a.png").is_ok());
        for bad in ["", "ftp://x/a.png", "https://", "x/a.png"] {
            assert!(validate_image_url(bad).is_err(), "{bad:?} accepted");
        }
    }

    #[test]
    fn test_validated_trims_language_codes() {
        let request = SubmitDigitization::new("https://x/a.png")
            .with_language_hints([" en ", "fr"])
            .with_target_language(" de")
            .validated()
            .unwrap();
        assert_eq!(request.source_language_hints, vec!["en", "fr"]);
        assert_eq!(request.target_language.as_deref(), Some("de"));
    }

    #[test]
    fn test_validated_rejects_empty_codes() {
        let err = SubmitDigitization::new("https://x/a.png")
            .with_language_hints(["en", " "])
            .validated()
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let err = SubmitDigitization::new("https://x/a.png")
            .with_target_language("")
            .validated()
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_reconcile_report_is_empty() {
        assert!(ReconcileReport::default().is_empty());
        assert!(!ReconcileReport {
            records_failed: 1,
            dead_lettered: 0
        }
        .is_empty());
    }
}
