//! Handler for `process-digitization` jobs.
//!
//! Drives one work record through recognition, optional translation and
//! persistence. Status writes are guarded by the store, so a redelivered job
//! whose record is already terminal finishes without side effects.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use digitizer_core::{
    defaults, CompletedOutcome, DigitizationPayload, Error, Job, JobFailure, Result,
    TextRecognizer, Translator,
};

use crate::handler::{JobContext, JobHandler, JobResult};
use crate::Stores;

/// What a single attempt did with the work record.
enum Attempt {
    Completed(JsonValue),
    /// The record reached a terminal status before this attempt got to it.
    Skipped,
}

/// Recognizes text in the submitted image, translates it when a target
/// language was requested and stores the result on the work record.
pub struct DigitizationHandler {
    stores: Stores,
    recognizer: Arc<dyn TextRecognizer>,
    translator: Arc<dyn Translator>,
}

impl DigitizationHandler {
    pub fn new(
        stores: Stores,
        recognizer: Arc<dyn TextRecognizer>,
        translator: Arc<dyn Translator>,
    ) -> Self {
        Self {
            stores,
            recognizer,
            translator,
        }
    }

    async fn process(&self, ctx: &JobContext, payload: &DigitizationPayload) -> Result<Attempt> {
        let record_id = payload.work_record_id;

        if !self.stores.work_records.mark_processing(record_id).await? {
            return Ok(Attempt::Skipped);
        }
        ctx.checkpoint(5, Some("Processing")).await;

        let start = Instant::now();
        let recognized_text = self
            .recognizer
            .recognize(&payload.image_url, &payload.source_language_hints)
            .await?;
        debug!(
            work_record_id = %record_id,
            chars = recognized_text.chars().count(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Text recognized"
        );
        ctx.checkpoint(25, Some("Text recognized")).await;

        let translation = match payload.target_language.as_deref() {
            Some(target) => {
                let translation = self.translator.translate(&recognized_text, target).await?;
                ctx.checkpoint(75, Some("Text translated")).await;
                Some(translation)
            }
            None => {
                debug!(work_record_id = %record_id, "No target language, skipping translation");
                None
            }
        };

        let translated = translation.is_some();
        let outcome = CompletedOutcome {
            recognized_text,
            translation,
        };
        if !self
            .stores
            .work_records
            .mark_completed(record_id, &outcome)
            .await?
        {
            return Ok(Attempt::Skipped);
        }
        ctx.checkpoint(95, Some("Results saved")).await;
        ctx.checkpoint(100, Some("Done")).await;

        Ok(Attempt::Completed(json!({
            "workRecordId": record_id,
            "translated": translated,
        })))
    }

    /// Persist the reason of a failed attempt on the record.
    ///
    /// The final attempt finalizes the record; earlier ones only note the reason.
    async fn record_failure(&self, ctx: &JobContext, record_id: Uuid, err: &Error) {
        let reason = err.to_string();
        let written = if ctx.is_final_attempt() {
            self.stores.work_records.mark_failed(record_id, &reason).await
        } else {
            self.stores
                .work_records
                .record_attempt_failure(record_id, &reason)
                .await
        };
        if let Err(e) = written {
            error!(
                work_record_id = %record_id,
                error = %e,
                "Failed to persist attempt failure"
            );
        }
    }
}

fn skipped(record_id: Uuid) -> JobResult {
    JobResult::Success(Some(json!({
        "workRecordId": record_id,
        "skipped": true,
    })))
}

#[async_trait]
impl JobHandler for DigitizationHandler {
    fn job_type(&self) -> &str {
        defaults::DIGITIZATION_JOB_TYPE
    }

    async fn execute(&self, ctx: JobContext) -> JobResult {
        let payload: DigitizationPayload = match ctx.job.decode_payload() {
            Ok(p) => p,
            Err(e) => return JobResult::Failed(JobFailure::from(&e)),
        };
        let record_id = payload.work_record_id;

        let record = match self.stores.work_records.get(record_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                let err = Error::NotFound(format!("Work record {}", record_id));
                warn!(job_id = %ctx.job_id(), work_record_id = %record_id, "Work record missing");
                return JobResult::Failed(JobFailure::from(&err));
            }
            Err(e) => return JobResult::Failed(JobFailure::from(&e)),
        };

        if record.status.is_terminal() {
            info!(
                job_id = %ctx.job_id(),
                work_record_id = %record_id,
                status = %record.status,
                "Work record already finished, skipping redelivered job"
            );
            return skipped(record_id);
        }

        match self.process(&ctx, &payload).await {
            Ok(Attempt::Completed(result)) => {
                info!(
                    job_id = %ctx.job_id(),
                    work_record_id = %record_id,
                    "Digitization completed"
                );
                JobResult::Success(Some(result))
            }
            Ok(Attempt::Skipped) => {
                info!(
                    job_id = %ctx.job_id(),
                    work_record_id = %record_id,
                    "Work record finished concurrently, skipping"
                );
                skipped(record_id)
            }
            Err(e) => {
                warn!(
                    job_id = %ctx.job_id(),
                    work_record_id = %record_id,
                    attempt = ctx.job.attempts_made,
                    final_attempt = ctx.is_final_attempt(),
                    error = %e,
                    "Digitization attempt failed"
                );
                self.record_failure(&ctx, record_id, &e).await;
                JobResult::Failed(JobFailure::from(&e))
            }
        }
    }

    async fn on_exhausted(&self, job: &Job) -> Result<()> {
        let payload: DigitizationPayload = job.decode_payload()?;
        let reason = job.failed_reason.as_deref().unwrap_or("Job failed");
        if self
            .stores
            .work_records
            .mark_failed(payload.work_record_id, reason)
            .await?
        {
            info!(
                job_id = %job.id,
                work_record_id = %payload.work_record_id,
                "Work record failed after exhausted job"
            );
        }
        Ok(())
    }

    async fn on_attempt_timeout(&self, job: &Job, failure: &JobFailure) -> Result<()> {
        let payload: DigitizationPayload = job.decode_payload()?;
        self.stores
            .work_records
            .record_attempt_failure(payload.work_record_id, &failure.message)
            .await?;
        Ok(())
    }
}
