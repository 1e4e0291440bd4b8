//! End-to-end tests for the digitization pipeline.
//!
//! Every test runs the real worker against the in-memory stores and the
//! scriptable mock providers, with millisecond backoffs so retries finish
//! quickly. Covered here:
//! - Translation and no-translation completions
//! - Retry with exponential backoff, exhaustion and dead-lettering
//! - Deleting an in-flight job
//! - Timeouts, expired leases, lease renewal and reconciliation
//! - Concurrent workers sharing one queue
//! - Observer subscriptions

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;
use tokio::time::sleep;
use uuid::Uuid;

use digitizer_db::{MemoryDatabase, MemoryJobQueue, LEASE_EXPIRED_REASON};
use digitizer_jobs::{
    defaults, DeadLetterQueue, DigitizationHandler, DigitizationPayload, DigitizationService,
    EnqueueOptions, ErrorKind, FailOutcome, Job, JobFailure, JobQueue, JobState, NewWorkRecord,
    QueueCounts, QueueOptions, StalledRecovery, Stores, SubmitDigitization, WorkRecord, WorkRecordRepository,
    WorkRecordStatus, WorkerBuilder, WorkerConfig, WorkerEvent, WorkerHandle, WorkerObserver,
};
use digitizer_providers::mock::{MockDownloader, MockRecognizer, MockTranslator, MockUploader};

const WAIT_LIMIT: Duration = Duration::from_secs(10);

// ============================================================================
// HELPERS
// ============================================================================

struct Harness {
    db: MemoryDatabase,
    stores: Stores,
    service: DigitizationService,
}

fn harness(options: QueueOptions) -> Harness {
    let db = MemoryDatabase::new(options);
    let stores = Stores::from_memory(&db);
    let service = DigitizationService::new(
        stores.clone(),
        Arc::new(MockUploader::new()),
        Arc::new(MockDownloader::new(vec![0x89, b'P', b'N', b'G'])),
    );
    Harness {
        db,
        stores,
        service,
    }
}

fn fast_queue() -> QueueOptions {
    QueueOptions::default()
        .with_max_attempts(3)
        .with_backoff(Duration::from_millis(10))
}

fn fast_worker() -> WorkerConfig {
    WorkerConfig::default()
        .with_poll_interval(5)
        .with_job_timeout(Duration::from_secs(5))
}

async fn start_worker(
    h: &Harness,
    recognizer: MockRecognizer,
    translator: MockTranslator,
    config: WorkerConfig,
) -> WorkerHandle {
    WorkerBuilder::new(h.stores.clone())
        .with_config(config)
        .with_handler(DigitizationHandler::new(
            h.stores.clone(),
            Arc::new(recognizer),
            Arc::new(translator),
        ))
        .with_reconciler(h.service.clone())
        .build()
        .await
        .start()
}

async fn wait_for_record(h: &Harness, id: Uuid, status: WorkRecordStatus) -> WorkRecord {
    let start = Instant::now();
    loop {
        if let Some(record) = h.db.work_records.get(id).await.unwrap() {
            if record.status == status {
                return record;
            }
        }
        assert!(
            start.elapsed() < WAIT_LIMIT,
            "work record {} never reached {}",
            id,
            status
        );
        sleep(Duration::from_millis(5)).await;
    }
}

async fn wait_for_dead_letters(h: &Harness, count: i64) {
    let start = Instant::now();
    while h.db.dead_letters.count().await.unwrap() < count {
        assert!(start.elapsed() < WAIT_LIMIT, "dead letter queue never reached {count}");
        sleep(Duration::from_millis(5)).await;
    }
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<WorkerEvent>>,
}

#[async_trait]
impl WorkerObserver for Recorder {
    async fn on_event(&self, event: &WorkerEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

// ============================================================================
// COMPLETION PATHS
// ============================================================================

#[tokio::test]
async fn test_completes_with_translation() {
    let h = harness(fast_queue());
    let worker = start_worker(
        &h,
        MockRecognizer::new("hello"),
        MockTranslator::new("bonjour").with_detected_language("en"),
        fast_worker(),
    )
    .await;

    let record = h
        .service
        .submit(SubmitDigitization::new("https://x/a.png").with_target_language("fr"))
        .await
        .unwrap();
    assert_eq!(record.status, WorkRecordStatus::Pending);

    let done = wait_for_record(&h, record.id, WorkRecordStatus::Completed).await;
    assert_eq!(done.recognized_text.as_deref(), Some("hello"));
    assert_eq!(done.translated_text.as_deref(), Some("bonjour"));
    assert_eq!(done.detected_language.as_deref(), Some("en"));
    assert!(!done.translation_skipped);

    worker.shutdown().await.unwrap();
    let job = h.db.jobs.get(record.id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.progress, 100);
    assert_eq!(h.db.dead_letters.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_completes_without_translation() {
    let h = harness(fast_queue());
    let translator = MockTranslator::new("unused");
    let worker = start_worker(
        &h,
        MockRecognizer::new("hello"),
        translator.clone(),
        fast_worker(),
    )
    .await;

    let record = h
        .service
        .submit(SubmitDigitization::new("https://x/a.png"))
        .await
        .unwrap();
    let done = wait_for_record(&h, record.id, WorkRecordStatus::Completed).await;
    worker.shutdown().await.unwrap();

    assert_eq!(done.recognized_text.as_deref(), Some("hello"));
    assert!(done.translated_text.is_none());
    assert!(done.translation_skipped);
    assert_eq!(translator.call_count(), 0);
}

#[tokio::test]
async fn test_retry_then_success_is_not_dead_lettered() {
    let h = harness(fast_queue());
    let recognizer = MockRecognizer::new("hello").failing_first(2);
    let worker = start_worker(
        &h,
        recognizer.clone(),
        MockTranslator::new("x"),
        fast_worker(),
    )
    .await;

    let record = h
        .service
        .submit(SubmitDigitization::new("https://x/a.png"))
        .await
        .unwrap();
    let done = wait_for_record(&h, record.id, WorkRecordStatus::Completed).await;
    worker.shutdown().await.unwrap();

    assert_eq!(recognizer.call_count(), 3);
    assert!(done.failure_reason.is_none());
    let job = h.db.jobs.get(record.id).await.unwrap().unwrap();
    assert_eq!(job.attempts_made, 3);
    assert_eq!(job.stacktrace.len(), 2);
    assert_eq!(h.db.dead_letters.count().await.unwrap(), 0);
}

// ============================================================================
// EXHAUSTION AND DEAD LETTERS
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_exhausted_job_fails_record_and_is_dead_lettered_once() {
    let h = harness(
        QueueOptions::default()
            .with_max_attempts(3)
            .with_backoff(Duration::from_millis(50)),
    );
    let recognizer = MockRecognizer::new("hello").always_failing();
    let worker = start_worker(
        &h,
        recognizer.clone(),
        MockTranslator::new("x"),
        fast_worker(),
    )
    .await;
    let mut events = worker.events();

    let record = h
        .service
        .submit(SubmitDigitization::new("https://x/a.png"))
        .await
        .unwrap();
    let failed = wait_for_record(&h, record.id, WorkRecordStatus::Failed).await;
    wait_for_dead_letters(&h, 1).await;
    worker.shutdown().await.unwrap();

    assert_eq!(recognizer.call_count(), 3);
    assert_eq!(
        failed.failure_reason.as_deref(),
        Some("[Google Vision]: mock recognition failure")
    );

    let entry = h.db.dead_letters.find_by_job(record.id).await.unwrap().unwrap();
    assert_eq!(entry.original_job.attempts_made, 3);
    assert_eq!(entry.original_job.stacktrace.len(), 3);
    assert_eq!(
        entry.original_job.failed_reason,
        "[Google Vision]: mock recognition failure"
    );
    assert_eq!(entry.original_job.data["workRecordId"], record.id.to_string());

    let mut retry_flags = Vec::new();
    let mut dead_lettered = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            WorkerEvent::JobFailed { will_retry, .. } => retry_flags.push(will_retry),
            WorkerEvent::JobDeadLettered { job_id, .. } => {
                assert_eq!(job_id, record.id);
                dead_lettered += 1;
            }
            _ => {}
        }
    }
    assert_eq!(retry_flags, vec![true, true, false]);
    assert_eq!(dead_lettered, 1);

    let job = h.db.jobs.get(record.id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts_made, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_retry_delays_grow_exponentially() {
    let h = harness(
        QueueOptions::default()
            .with_max_attempts(3)
            .with_backoff(Duration::from_millis(50)),
    );
    let worker = start_worker(
        &h,
        MockRecognizer::new("hello").always_failing(),
        MockTranslator::new("x"),
        fast_worker(),
    )
    .await;
    let mut events = worker.events();

    h.service
        .submit(SubmitDigitization::new("https://x/a.png"))
        .await
        .unwrap();

    let mut active_at = Vec::new();
    let start = Instant::now();
    while active_at.len() < 3 {
        assert!(start.elapsed() < WAIT_LIMIT, "job was not attempted three times");
        if let Ok(Ok(WorkerEvent::JobActive { .. })) =
            tokio::time::timeout(Duration::from_millis(500), events.recv()).await
        {
            active_at.push(Instant::now());
        }
    }
    worker.shutdown().await.unwrap();

    let first_gap = active_at[1] - active_at[0];
    let second_gap = active_at[2] - active_at[1];
    assert!(first_gap >= Duration::from_millis(45), "first gap {first_gap:?}");
    assert!(second_gap >= Duration::from_millis(95), "second gap {second_gap:?}");
}

#[tokio::test]
async fn test_timeout_counts_as_failed_attempt() {
    let h = harness(fast_queue().with_max_attempts(1));
    let worker = start_worker(
        &h,
        MockRecognizer::new("hello").with_latency(Duration::from_secs(2)),
        MockTranslator::new("x"),
        fast_worker().with_job_timeout(Duration::from_millis(50)),
    )
    .await;

    let record = h
        .service
        .submit(SubmitDigitization::new("https://x/a.png"))
        .await
        .unwrap();
    let failed = wait_for_record(&h, record.id, WorkRecordStatus::Failed).await;
    wait_for_dead_letters(&h, 1).await;
    worker.shutdown().await.unwrap();

    assert_eq!(
        failed.failure_reason.as_deref(),
        Some("Job exceeded timeout of 50ms")
    );
}

#[tokio::test]
async fn test_timed_out_attempt_with_retries_left_records_reason() {
    let h = harness(fast_queue().with_backoff(Duration::from_secs(60)));
    let worker = start_worker(
        &h,
        MockRecognizer::new("hello").with_latency(Duration::from_secs(2)),
        MockTranslator::new("x"),
        fast_worker().with_job_timeout(Duration::from_millis(50)),
    )
    .await;

    let record = h
        .service
        .submit(SubmitDigitization::new("https://x/a.png"))
        .await
        .unwrap();

    let start = Instant::now();
    let record = loop {
        let current = h.db.work_records.get(record.id).await.unwrap().unwrap();
        if current.failure_reason.is_some() {
            break current;
        }
        assert!(start.elapsed() < WAIT_LIMIT, "timeout was never recorded on the record");
        sleep(Duration::from_millis(5)).await;
    };
    worker.shutdown().await.unwrap();

    assert_eq!(record.status, WorkRecordStatus::Processing);
    assert_eq!(
        record.failure_reason.as_deref(),
        Some("Job exceeded timeout of 50ms")
    );
    let job = h.db.jobs.get(record.id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Delayed);
    assert_eq!(job.attempts_made, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lease_is_renewed_during_slow_recognition() {
    let h = harness(fast_queue().with_lease_duration(Duration::from_millis(100)));
    let recognizer = MockRecognizer::new("hello").with_latency(Duration::from_millis(400));
    let config = fast_worker().with_maintenance_interval(Duration::from_millis(20));
    let first = start_worker(&h, recognizer.clone(), MockTranslator::new("x"), config.clone()).await;
    let second = start_worker(&h, recognizer.clone(), MockTranslator::new("x"), config).await;

    let record = h
        .service
        .submit(SubmitDigitization::new("https://x/a.png"))
        .await
        .unwrap();
    wait_for_record(&h, record.id, WorkRecordStatus::Completed).await;
    first.shutdown().await.unwrap();
    second.shutdown().await.unwrap();

    assert_eq!(recognizer.call_count(), 1);
    let job = h.db.jobs.get(record.id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.attempts_made, 1);
    assert!(job.stacktrace.is_empty(), "{:?}", job.stacktrace);
}

#[tokio::test]
async fn test_expired_lease_on_final_attempt_is_dead_lettered() {
    let h = harness(fast_queue().with_max_attempts(1));
    let record = h
        .service
        .submit(SubmitDigitization::new("https://x/a.png"))
        .await
        .unwrap();

    // A worker claims the job and dies without finishing it.
    let job = h.db.jobs.claim_next(&[]).await.unwrap().unwrap();
    h.db.jobs.expire_lease(job.id).await.unwrap();

    let worker = start_worker(
        &h,
        MockRecognizer::new("hello"),
        MockTranslator::new("x"),
        fast_worker(),
    )
    .await;
    let failed = wait_for_record(&h, record.id, WorkRecordStatus::Failed).await;
    wait_for_dead_letters(&h, 1).await;
    worker.shutdown().await.unwrap();

    assert_eq!(failed.failure_reason.as_deref(), Some(LEASE_EXPIRED_REASON));
}

#[tokio::test]
async fn test_expired_lease_with_attempts_left_is_retried() {
    let h = harness(fast_queue());
    let record = h
        .service
        .submit(SubmitDigitization::new("https://x/a.png"))
        .await
        .unwrap();
    let job = h.db.jobs.claim_next(&[]).await.unwrap().unwrap();
    h.db.jobs.expire_lease(job.id).await.unwrap();

    let worker = start_worker(
        &h,
        MockRecognizer::new("hello"),
        MockTranslator::new("x"),
        fast_worker(),
    )
    .await;
    wait_for_record(&h, record.id, WorkRecordStatus::Completed).await;
    worker.shutdown().await.unwrap();

    let job = h.db.jobs.get(record.id).await.unwrap().unwrap();
    assert_eq!(job.attempts_made, 2);
    assert_eq!(h.db.dead_letters.count().await.unwrap(), 0);
}

// ============================================================================
// DELETION AND REDELIVERY
// ============================================================================

#[tokio::test]
async fn test_delete_in_flight_job_conflicts() {
    let h = harness(fast_queue());
    let worker = start_worker(
        &h,
        MockRecognizer::new("hello").with_latency(Duration::from_millis(500)),
        MockTranslator::new("x"),
        fast_worker(),
    )
    .await;

    let record = h
        .service
        .submit(SubmitDigitization::new("https://x/a.png"))
        .await
        .unwrap();
    wait_for_record(&h, record.id, WorkRecordStatus::Processing).await;

    let err = h.service.delete(record.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    let still = h.service.get(record.id).await.unwrap();
    assert_eq!(still.status, WorkRecordStatus::Processing);

    wait_for_record(&h, record.id, WorkRecordStatus::Completed).await;
    worker.shutdown().await.unwrap();

    h.service.delete(record.id).await.unwrap();
    assert!(h.db.jobs.get(record.id).await.unwrap().is_none());
    assert_eq!(
        h.service.get(record.id).await.unwrap_err().kind(),
        ErrorKind::NotFound
    );
    assert_eq!(
        h.service.delete(record.id).await.unwrap_err().kind(),
        ErrorKind::NotFound
    );
}

#[tokio::test]
async fn test_redelivered_job_for_finished_record_is_a_no_op() {
    let h = harness(fast_queue());
    let recognizer = MockRecognizer::new("hello");
    let worker = start_worker(
        &h,
        recognizer.clone(),
        MockTranslator::new("x"),
        fast_worker(),
    )
    .await;

    let record = h
        .service
        .submit(SubmitDigitization::new("https://x/a.png"))
        .await
        .unwrap();
    let done = wait_for_record(&h, record.id, WorkRecordStatus::Completed).await;

    let payload = DigitizationPayload {
        image_url: record.image_url.clone(),
        source_language_hints: Vec::new(),
        target_language: None,
        work_record_id: record.id,
    };
    let duplicate = h
        .db
        .jobs
        .enqueue(
            defaults::DIGITIZATION_JOB_TYPE,
            serde_json::to_value(&payload).unwrap(),
            EnqueueOptions::default(),
        )
        .await
        .unwrap();

    let start = Instant::now();
    loop {
        let state = h.db.jobs.state(duplicate).await.unwrap();
        if state == Some(JobState::Completed) {
            break;
        }
        assert!(start.elapsed() < WAIT_LIMIT, "duplicate job never completed");
        sleep(Duration::from_millis(5)).await;
    }
    worker.shutdown().await.unwrap();

    assert_eq!(recognizer.call_count(), 1);
    let job = h.db.jobs.get(duplicate).await.unwrap().unwrap();
    assert_eq!(job.result.unwrap()["skipped"], true);
    assert_eq!(h.db.work_records.get(record.id).await.unwrap().unwrap(), done);
}

// ============================================================================
// RECONCILIATION
// ============================================================================

#[tokio::test]
async fn test_reconcile_repairs_records_and_dead_letters() {
    let h = harness(fast_queue().with_max_attempts(1));
    let record = h
        .service
        .submit(SubmitDigitization::new("https://x/a.png"))
        .await
        .unwrap();

    // The job is finalized but the process stops before touching the
    // record or the dead letter queue.
    let job = h.db.jobs.claim_next(&[]).await.unwrap().unwrap();
    h.db.work_records.mark_processing(record.id).await.unwrap();
    h.db.jobs
        .fail(job.id, job.lease_token.unwrap(), &JobFailure::new("[Google Vision]: down"))
        .await
        .unwrap();

    let report = h.service.reconcile().await.unwrap();
    assert_eq!(report.records_failed, 1);
    assert_eq!(report.dead_lettered, 1);

    let failed = h.service.get(record.id).await.unwrap();
    assert_eq!(failed.status, WorkRecordStatus::Failed);
    assert_eq!(failed.failure_reason.as_deref(), Some("[Google Vision]: down"));
    let entries = h.service.dead_letters(10).await.unwrap();
    assert_eq!(entries.len(), 1);

    assert!(h.service.reconcile().await.unwrap().is_empty());

    // An operator drains the entry; later passes must not recreate it.
    assert!(h.db.dead_letters.remove(entries[0].id.unwrap()).await.unwrap());
    assert!(h.service.reconcile().await.unwrap().is_empty());
    assert_eq!(h.db.dead_letters.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_drained_dead_letter_stays_drained() {
    let h = harness(fast_queue().with_max_attempts(1));
    let worker = start_worker(
        &h,
        MockRecognizer::new("hello").always_failing(),
        MockTranslator::new("x"),
        fast_worker().with_maintenance_interval(Duration::from_millis(20)),
    )
    .await;

    let record = h
        .service
        .submit(SubmitDigitization::new("https://x/a.png"))
        .await
        .unwrap();
    wait_for_record(&h, record.id, WorkRecordStatus::Failed).await;
    wait_for_dead_letters(&h, 1).await;
    let start = Instant::now();
    while h.db.jobs.get(record.id).await.unwrap().unwrap().dead_lettered_at.is_none() {
        assert!(start.elapsed() < WAIT_LIMIT, "job was never marked dead-lettered");
        sleep(Duration::from_millis(5)).await;
    }

    let entry = h.db.dead_letters.find_by_job(record.id).await.unwrap().unwrap();
    assert!(h.db.dead_letters.remove(entry.id.unwrap()).await.unwrap());

    // Several maintenance ticks run reconciliation while the worker idles.
    sleep(Duration::from_millis(100)).await;
    worker.shutdown().await.unwrap();

    assert!(h.service.reconcile().await.unwrap().is_empty());
    assert_eq!(h.db.dead_letters.count().await.unwrap(), 0);
    let job = h.db.jobs.get(record.id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert!(job.dead_lettered_at.is_some());
}

/// Submit a request and fail its only attempt without touching the record's
/// terminal status or the dead letter queue.
async fn fail_without_routing(h: &Harness, n: usize) -> Uuid {
    let record = h
        .service
        .submit(SubmitDigitization::new(format!("https://x/{n}.png")))
        .await
        .unwrap();
    let job = h.db.jobs.claim_next(&[]).await.unwrap().unwrap();
    assert_eq!(job.id, record.id);
    h.db.work_records.mark_processing(record.id).await.unwrap();
    h.db.jobs
        .fail(job.id, job.lease_token.unwrap(), &JobFailure::new("boom"))
        .await
        .unwrap();
    record.id
}

#[tokio::test]
async fn test_reconcile_reaches_failures_behind_a_full_page() {
    let h = harness(fast_queue().with_max_attempts(1));
    let service = h.service.clone().with_reconcile_batch(2);

    for n in 0..3 {
        fail_without_routing(&h, n).await;
    }
    let report = service.reconcile().await.unwrap();
    assert_eq!(report.dead_lettered, 3);
    assert_eq!(report.records_failed, 3);

    // Older settled failures must not hide a new one.
    let late = fail_without_routing(&h, 3).await;
    let report = service.reconcile().await.unwrap();
    assert_eq!(report.dead_lettered, 1);
    assert_eq!(report.records_failed, 1);
    assert!(h.db.dead_letters.find_by_job(late).await.unwrap().is_some());
    assert_eq!(
        h.service.get(late).await.unwrap().status,
        WorkRecordStatus::Failed
    );
    assert_eq!(h.db.dead_letters.count().await.unwrap(), 4);
}

#[tokio::test]
async fn test_reconcile_finds_orphans_behind_live_records() {
    let h = harness(fast_queue());
    let service = h
        .service
        .clone()
        .with_reconcile_batch(2)
        .with_orphan_grace(chrono::Duration::zero());

    let mut live = Vec::new();
    for n in 0..3 {
        let record = h
            .service
            .submit(SubmitDigitization::new(format!("https://x/{n}.png")))
            .await
            .unwrap();
        live.push(record.id);
    }
    let orphan = h
        .db
        .work_records
        .create(NewWorkRecord {
            image_url: "https://x/orphan.png".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    sleep(Duration::from_millis(5)).await;

    let report = service.reconcile().await.unwrap();
    assert_eq!(report.records_failed, 1);
    assert_eq!(report.dead_lettered, 0);

    let orphan = h.service.get(orphan.id).await.unwrap();
    assert_eq!(orphan.status, WorkRecordStatus::Failed);
    assert_eq!(
        orphan.failure_reason.as_deref(),
        Some("Job no longer exists in the queue")
    );
    for id in live {
        assert_eq!(
            h.service.get(id).await.unwrap().status,
            WorkRecordStatus::Pending
        );
    }
}

#[tokio::test]
async fn test_reconcile_leaves_live_work_alone() {
    let h = harness(fast_queue());
    let record = h
        .service
        .submit(SubmitDigitization::new("https://x/a.png"))
        .await
        .unwrap();
    h.db.jobs.claim_next(&[]).await.unwrap().unwrap();
    h.db.work_records.mark_processing(record.id).await.unwrap();

    assert!(h.service.reconcile().await.unwrap().is_empty());
    assert_eq!(
        h.service.get(record.id).await.unwrap().status,
        WorkRecordStatus::Processing
    );
}

// ============================================================================
// SUBMISSION
// ============================================================================

#[tokio::test]
async fn test_submit_validates_before_writing() {
    let h = harness(fast_queue());
    for request in [
        SubmitDigitization::new(""),
        SubmitDigitization::new("ftp://x/a.png"),
        SubmitDigitization::new("https://x/a.png").with_target_language(" "),
    ] {
        let err = h.service.submit(request).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
    assert_eq!(h.service.queue_counts().await.unwrap().waiting, 0);
    assert_eq!(
        h.service
            .list(&Default::default())
            .await
            .unwrap()
            .total,
        0
    );
}

#[tokio::test]
async fn test_submit_enqueues_job_keyed_by_record() {
    let h = harness(fast_queue());
    let record = h
        .service
        .submit(
            SubmitDigitization::new("https://x/a.png")
                .with_language_hints(["kn"])
                .with_target_language("en"),
        )
        .await
        .unwrap();

    let job = h.db.jobs.get(record.id).await.unwrap().unwrap();
    assert_eq!(job.job_type, defaults::DIGITIZATION_JOB_TYPE);
    assert_eq!(job.state, JobState::Waiting);
    assert_eq!(
        job.payload,
        json!({
            "imageUrl": "https://x/a.png",
            "sourceLanguageHints": ["kn"],
            "targetLanguage": "en",
            "workRecordId": record.id,
        })
    );
}

/// Queue whose `enqueue` always fails; everything else goes to the inner queue.
struct RejectingQueue(MemoryJobQueue);

#[async_trait]
impl JobQueue for RejectingQueue {
    fn name(&self) -> &str {
        self.0.name()
    }
    fn lease_duration(&self) -> Duration {
        self.0.lease_duration()
    }
    async fn enqueue(
        &self,
        _job_type: &str,
        _payload: serde_json::Value,
        _options: EnqueueOptions,
    ) -> digitizer_jobs::Result<Uuid> {
        Err(digitizer_jobs::Error::Connection("queue unavailable".to_string()))
    }
    async fn claim_next(&self, job_types: &[&str]) -> digitizer_jobs::Result<Option<Job>> {
        self.0.claim_next(job_types).await
    }
    async fn update_progress(
        &self,
        job_id: Uuid,
        lease_token: Uuid,
        percent: i32,
    ) -> digitizer_jobs::Result<()> {
        self.0.update_progress(job_id, lease_token, percent).await
    }
    async fn renew_lease(&self, job_id: Uuid, lease_token: Uuid) -> digitizer_jobs::Result<()> {
        self.0.renew_lease(job_id, lease_token).await
    }
    async fn complete(
        &self,
        job_id: Uuid,
        lease_token: Uuid,
        result: Option<serde_json::Value>,
    ) -> digitizer_jobs::Result<()> {
        self.0.complete(job_id, lease_token, result).await
    }
    async fn fail(
        &self,
        job_id: Uuid,
        lease_token: Uuid,
        failure: &JobFailure,
    ) -> digitizer_jobs::Result<FailOutcome> {
        self.0.fail(job_id, lease_token, failure).await
    }
    async fn get(&self, job_id: Uuid) -> digitizer_jobs::Result<Option<Job>> {
        self.0.get(job_id).await
    }
    async fn state(&self, job_id: Uuid) -> digitizer_jobs::Result<Option<JobState>> {
        self.0.state(job_id).await
    }
    async fn remove(&self, job_id: Uuid) -> digitizer_jobs::Result<()> {
        self.0.remove(job_id).await
    }
    async fn recover_stalled(&self) -> digitizer_jobs::Result<StalledRecovery> {
        self.0.recover_stalled().await
    }
    async fn list_by_state(
        &self,
        state: JobState,
        limit: i64,
    ) -> digitizer_jobs::Result<Vec<Job>> {
        self.0.list_by_state(state, limit).await
    }
    async fn list_awaiting_dead_letter(&self, limit: i64) -> digitizer_jobs::Result<Vec<Job>> {
        self.0.list_awaiting_dead_letter(limit).await
    }
    async fn mark_dead_lettered(&self, job_id: Uuid) -> digitizer_jobs::Result<bool> {
        self.0.mark_dead_lettered(job_id).await
    }
    async fn counts(&self) -> digitizer_jobs::Result<QueueCounts> {
        self.0.counts().await
    }
    async fn prune(&self) -> digitizer_jobs::Result<u64> {
        self.0.prune().await
    }
}

#[tokio::test]
async fn test_submit_enqueue_failure_marks_record_failed() {
    let db = MemoryDatabase::new(fast_queue());
    let stores = Stores {
        queue: Arc::new(RejectingQueue(db.jobs.clone())),
        ..Stores::from_memory(&db)
    };
    let service = DigitizationService::new(
        stores,
        Arc::new(MockUploader::new()),
        Arc::new(MockDownloader::new(Vec::new())),
    );

    let err = service
        .submit(SubmitDigitization::new("https://x/a.png"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);

    let page = service.list(&Default::default()).await.unwrap();
    assert_eq!(page.total, 1);
    let record = &page.items[0];
    assert_eq!(record.status, WorkRecordStatus::Failed);
    assert!(record
        .failure_reason
        .as_deref()
        .unwrap()
        .contains("queue unavailable"));
}

#[tokio::test]
async fn test_submit_from_url_stores_image_first() {
    let h = harness(fast_queue());
    let record = h
        .service
        .submit_from_url(SubmitDigitization::new("https://remote/a.png"))
        .await
        .unwrap();
    assert!(record
        .image_url
        .starts_with("https://cdn.mock/digitizer-app/url-uploads/"));
}

#[tokio::test]
async fn test_submit_upload_rejects_non_images() {
    let h = harness(fast_queue());
    let err = h
        .service
        .submit_upload(b"plain text", Vec::new(), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let png = [
        0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44,
        0x52,
    ];
    let record = h
        .service
        .submit_upload(&png, vec!["en".to_string()], Some("fr".to_string()))
        .await
        .unwrap();
    assert!(record
        .image_url
        .starts_with("https://cdn.mock/digitizer-app/direct-uploads/"));
    assert_eq!(record.target_language.as_deref(), Some("fr"));
}

// ============================================================================
// CONCURRENCY AND EVENTS
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_workers_process_each_job_once() {
    let h = harness(fast_queue());
    let recognizer = MockRecognizer::new("hello").with_latency(Duration::from_millis(20));
    let config = fast_worker().with_max_concurrent(3);
    let first = start_worker(&h, recognizer.clone(), MockTranslator::new("x"), config.clone()).await;
    let second = start_worker(&h, recognizer.clone(), MockTranslator::new("x"), config).await;

    let mut ids = Vec::new();
    for n in 0..12 {
        let record = h
            .service
            .submit(SubmitDigitization::new(format!("https://x/{n}.png")))
            .await
            .unwrap();
        ids.push(record.id);
    }
    for id in &ids {
        wait_for_record(&h, *id, WorkRecordStatus::Completed).await;
    }
    first.shutdown().await.unwrap();
    second.shutdown().await.unwrap();

    assert_eq!(recognizer.call_count(), 12);
    let counts = h.service.queue_counts().await.unwrap();
    assert_eq!(counts.completed, 12);
    assert_eq!(counts.active, 0);
    for id in &ids {
        assert_eq!(h.db.jobs.get(*id).await.unwrap().unwrap().attempts_made, 1);
    }
}

#[tokio::test]
async fn test_observer_sees_lifecycle_until_cancelled() {
    let h = harness(fast_queue());
    let worker = start_worker(
        &h,
        MockRecognizer::new("hello"),
        MockTranslator::new("bonjour"),
        fast_worker(),
    )
    .await;
    let recorder = Arc::new(Recorder::default());
    let subscription = worker.observe(recorder.clone());

    let record = h
        .service
        .submit(SubmitDigitization::new("https://x/a.png").with_target_language("fr"))
        .await
        .unwrap();
    wait_for_record(&h, record.id, WorkRecordStatus::Completed).await;

    let start = Instant::now();
    while !recorder
        .events
        .lock()
        .unwrap()
        .iter()
        .any(|e| matches!(e, WorkerEvent::JobCompleted { .. }))
    {
        assert!(start.elapsed() < WAIT_LIMIT, "no completion event");
        sleep(Duration::from_millis(5)).await;
    }
    subscription.cancel();

    let events = recorder.events.lock().unwrap().clone();
    let progress: Vec<i32> = events
        .iter()
        .filter_map(|e| match e {
            WorkerEvent::JobProgress { percent, .. } => Some(*percent),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![5, 25, 75, 95, 100]);
    assert!(matches!(
        events.iter().find(|e| !matches!(e, WorkerEvent::WorkerStarted)),
        Some(WorkerEvent::JobActive { attempt: 1, .. })
    ));

    let seen = events.len();
    h.service
        .submit(SubmitDigitization::new("https://x/b.png"))
        .await
        .unwrap();
    sleep(Duration::from_millis(100)).await;
    worker.shutdown().await.unwrap();
    assert_eq!(recorder.events.lock().unwrap().len(), seen);
}

#[tokio::test]
async fn test_disabled_worker_does_not_claim() {
    let h = harness(fast_queue());
    let record = h
        .service
        .submit(SubmitDigitization::new("https://x/a.png"))
        .await
        .unwrap();
    let worker = start_worker(
        &h,
        MockRecognizer::new("hello"),
        MockTranslator::new("x"),
        fast_worker().with_enabled(false),
    )
    .await;

    sleep(Duration::from_millis(50)).await;
    assert!(!worker.is_running());
    worker.shutdown().await.unwrap();
    assert_eq!(
        h.db.jobs.state(record.id).await.unwrap(),
        Some(JobState::Waiting)
    );
}
