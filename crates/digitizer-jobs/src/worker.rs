//! Job worker and runner for processing queued jobs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use digitizer_core::{
    defaults, DeadLetterEntry, Error, ErrorKind, FailOutcome, Job, JobFailure, Result,
};

use crate::events::{Subscription, WorkerEvent, WorkerObserver};
use crate::handler::{JobContext, JobHandler, JobResult};
use crate::service::DigitizationService;
use crate::{Stores, DEFAULT_POLL_INTERVAL_MS};

type HandlerMap = Arc<RwLock<HashMap<String, Arc<dyn JobHandler>>>>;

/// Configuration for the job worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Polling interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Maximum number of concurrent jobs.
    pub max_concurrent_jobs: usize,
    /// Whether to enable job processing.
    pub enabled: bool,
    /// Hard limit on a single attempt.
    pub job_timeout: Duration,
    /// How often stalled-lease recovery, pruning and reconciliation run.
    pub maintenance_interval: Duration,
    /// How long dead letter entries are kept.
    pub dlq_retention: chrono::Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            max_concurrent_jobs: defaults::JOB_MAX_CONCURRENT,
            enabled: true,
            job_timeout: Duration::from_secs(defaults::JOB_TIMEOUT_SECS),
            maintenance_interval: Duration::from_secs(defaults::JOB_MAINTENANCE_INTERVAL_SECS),
            dlq_retention: chrono::Duration::seconds(defaults::DLQ_RETENTION_SECS),
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `JOB_WORKER_ENABLED` | `true` | Enable/disable job processing |
    /// | `JOB_MAX_CONCURRENT` | `1` | Max concurrent jobs |
    /// | `JOB_POLL_INTERVAL_MS` | `1000` | Polling interval when queue is empty |
    /// | `JOB_TIMEOUT_SECS` | `300` | Hard limit per attempt |
    /// | `JOB_MAINTENANCE_INTERVAL_SECS` | `60` | Maintenance cadence |
    pub fn from_env() -> Self {
        let enabled = std::env::var("JOB_WORKER_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let max_concurrent_jobs = std::env::var("JOB_MAX_CONCURRENT")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults::JOB_MAX_CONCURRENT)
            .max(1);

        let poll_interval_ms = std::env::var("JOB_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DEFAULT_POLL_INTERVAL_MS);

        let job_timeout_secs = std::env::var("JOB_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::JOB_TIMEOUT_SECS)
            .max(1);

        let maintenance_secs = std::env::var("JOB_MAINTENANCE_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::JOB_MAINTENANCE_INTERVAL_SECS)
            .max(1);

        Self {
            poll_interval_ms,
            max_concurrent_jobs,
            enabled,
            job_timeout: Duration::from_secs(job_timeout_secs),
            maintenance_interval: Duration::from_secs(maintenance_secs),
            ..Self::default()
        }
    }

    /// Create a new config with custom poll interval.
    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Set maximum concurrent jobs.
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = max.max(1);
        self
    }

    /// Enable or disable job processing.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = interval;
        self
    }
}

/// Handle for controlling a running worker.
pub struct WorkerHandle {
    shutdown_tx: mpsc::Sender<()>,
    event_tx: broadcast::Sender<WorkerEvent>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Signal the worker to shut down and wait for in-flight jobs to finish.
    pub async fn shutdown(self) -> Result<()> {
        // A closed channel means the loop already exited.
        let _ = self.shutdown_tx.send(()).await;
        self.task
            .await
            .map_err(|e| Error::Internal(format!("Worker task failed: {}", e)))
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_tx.subscribe()
    }

    /// Deliver every subsequent event to `observer` until the returned
    /// subscription is cancelled or dropped.
    pub fn observe(&self, observer: Arc<dyn WorkerObserver>) -> Subscription {
        Subscription::spawn(self.event_tx.subscribe(), observer)
    }

    /// Whether the worker loop is still running.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

/// Job worker that processes jobs from the queue.
pub struct JobWorker {
    stores: Stores,
    config: WorkerConfig,
    handlers: HandlerMap,
    event_tx: broadcast::Sender<WorkerEvent>,
    reconciler: Option<DigitizationService>,
}

impl JobWorker {
    /// Create a new job worker.
    pub fn new(stores: Stores, config: WorkerConfig) -> Self {
        let (event_tx, _) = broadcast::channel(defaults::EVENT_BUS_CAPACITY);
        Self {
            stores,
            config,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
            reconciler: None,
        }
    }

    /// Register a handler for a job type.
    pub async fn register_handler<H: JobHandler + 'static>(&self, handler: H) {
        let job_type = handler.job_type().to_string();
        let mut handlers = self.handlers.write().await;
        debug!(job_type = %job_type, "Registered job handler");
        handlers.insert(job_type, Arc::new(handler));
    }

    /// Start the worker and return a handle for control.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let event_tx = self.event_tx.clone();

        let task = tokio::spawn(async move {
            self.run(&mut shutdown_rx).await;
        });

        WorkerHandle {
            shutdown_tx,
            event_tx,
            task,
        }
    }

    /// Run the worker loop with concurrent job processing.
    ///
    /// Claims up to `max_concurrent_jobs` at a time and processes them concurrently.
    /// Only sleeps when the queue is empty.
    #[instrument(skip(self, shutdown_rx), fields(queue = %self.stores.queue.name()))]
    async fn run(&self, shutdown_rx: &mut mpsc::Receiver<()>) {
        if !self.config.enabled {
            info!("Job worker is disabled, not starting");
            return;
        }

        info!(
            poll_interval_ms = self.config.poll_interval_ms,
            max_concurrent = self.config.max_concurrent_jobs,
            job_timeout_secs = self.config.job_timeout.as_secs(),
            "Job worker started"
        );

        let _ = self.event_tx.send(WorkerEvent::WorkerStarted);

        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        let max_concurrent = self.config.max_concurrent_jobs;
        let mut last_maintenance: Option<Instant> = None;

        loop {
            // Check for shutdown before claiming jobs
            if shutdown_rx.try_recv().is_ok() {
                info!("Job worker received shutdown signal");
                break;
            }

            if last_maintenance.map_or(true, |t| t.elapsed() >= self.config.maintenance_interval)
            {
                self.run_maintenance().await;
                last_maintenance = Some(Instant::now());
            }

            // Claim up to max_concurrent jobs
            let mut claimed = 0;
            let mut tasks = tokio::task::JoinSet::new();

            for _ in 0..max_concurrent {
                match self.claim_job().await {
                    Some(job) => {
                        claimed += 1;
                        let worker = self.clone_refs();
                        tasks.spawn(async move {
                            worker.execute_job(job).await;
                        });
                    }
                    None => break,
                }
            }

            if claimed == 0 {
                // Queue empty, sleep before polling again
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Job worker received shutdown signal");
                        break;
                    }
                    _ = sleep(poll_interval) => {}
                }
            } else {
                debug!(claimed, "Processing concurrent job batch");
                while let Some(result) = tasks.join_next().await {
                    if let Err(e) = result {
                        error!(error = ?e, "Job task panicked");
                    }
                }
            }
        }

        let _ = self.event_tx.send(WorkerEvent::WorkerStopped);
        info!("Job worker stopped");
    }

    /// Claim the next available job without processing it.
    async fn claim_job(&self) -> Option<Job> {
        let job_types: Vec<String> = {
            let handlers = self.handlers.read().await;
            handlers.keys().cloned().collect()
        };
        if job_types.is_empty() {
            return None;
        }
        let type_refs: Vec<&str> = job_types.iter().map(String::as_str).collect();

        match self.stores.queue.claim_next(&type_refs).await {
            Ok(job) => job,
            Err(e) => {
                error!(error = %e, "Failed to claim job");
                None
            }
        }
    }

    /// Recover expired leases, prune finished jobs and expired dead letters,
    /// then reconcile work records. Each step is independent.
    async fn run_maintenance(&self) {
        let refs = self.clone_refs();

        match self.stores.queue.recover_stalled().await {
            Ok(recovery) => {
                for job in recovery.exhausted {
                    refs.finalize_exhausted(job).await;
                }
            }
            Err(e) => error!(error = %e, "Stalled job recovery failed"),
        }

        if let Err(e) = self.stores.queue.prune().await {
            warn!(error = %e, "Job pruning failed");
        }

        if let Err(e) = self
            .stores
            .dead_letters
            .purge_older_than(self.config.dlq_retention)
            .await
        {
            warn!(error = %e, "Dead letter purge failed");
        }

        if let Some(reconciler) = &self.reconciler {
            match reconciler.reconcile().await {
                Ok(report) if report.is_empty() => {}
                Ok(report) => info!(
                    records_failed = report.records_failed,
                    dead_lettered = report.dead_lettered,
                    "Reconciled work records with queue state"
                ),
                Err(e) => error!(error = %e, "Reconciliation failed"),
            }
        }
    }

    /// Clone references needed for spawned job tasks.
    fn clone_refs(&self) -> JobWorkerRef {
        JobWorkerRef {
            stores: self.stores.clone(),
            handlers: self.handlers.clone(),
            event_tx: self.event_tx.clone(),
            job_timeout: self.config.job_timeout,
        }
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_tx.subscribe()
    }
}

/// Lightweight reference bundle for executing a single job in a spawned task.
struct JobWorkerRef {
    stores: Stores,
    handlers: HandlerMap,
    event_tx: broadcast::Sender<WorkerEvent>,
    job_timeout: Duration,
}

impl JobWorkerRef {
    async fn handler_for(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        let handlers = self.handlers.read().await;
        handlers.get(job_type).cloned()
    }

    /// Execute a single claimed job.
    async fn execute_job(self, job: Job) {
        let start = Instant::now();
        let job_id = job.id;
        let job_type = job.job_type.clone();
        let attempt = job.attempts_made;

        let Some(lease_token) = job.lease_token else {
            error!(job_id = %job_id, "Claimed job carries no lease token");
            return;
        };

        info!(job_id = %job_id, job_type = %job_type, attempt, "Processing job");

        let _ = self.event_tx.send(WorkerEvent::JobActive {
            job_id,
            job_type: job_type.clone(),
            attempt,
        });

        let result = match self.handler_for(&job_type).await {
            Some(handler) => match self.run_attempt(handler, job, lease_token).await {
                Some(result) => result,
                None => return,
            },
            None => {
                warn!(job_type = %job_type, "No handler registered for job type");
                JobResult::Failed(JobFailure::new(format!(
                    "No handler for job type: {}",
                    job_type
                )))
            }
        };

        match result {
            JobResult::Success(result_data) => {
                match self
                    .stores
                    .queue
                    .complete(job_id, lease_token, result_data)
                    .await
                {
                    Ok(()) => {
                        let duration_ms = start.elapsed().as_millis() as u64;
                        info!(
                            job_id = %job_id,
                            job_type = %job_type,
                            duration_ms,
                            "Job completed successfully"
                        );
                        let _ = self.event_tx.send(WorkerEvent::JobCompleted {
                            job_id,
                            job_type,
                            duration_ms,
                        });
                    }
                    Err(e) => error!(error = %e, job_id = %job_id, "Failed to mark job as completed"),
                }
            }
            JobResult::Failed(failure) => {
                match self.stores.queue.fail(job_id, lease_token, &failure).await {
                    Ok(FailOutcome::Retrying {
                        attempts_made,
                        delay,
                    }) => {
                        warn!(
                            job_id = %job_id,
                            job_type = %job_type,
                            attempt = attempts_made,
                            delay_ms = delay.as_millis() as u64,
                            error = %failure.message,
                            duration_ms = start.elapsed().as_millis() as u64,
                            "Job failed, retry scheduled"
                        );
                        let _ = self.event_tx.send(WorkerEvent::JobFailed {
                            job_id,
                            job_type,
                            attempts_made,
                            will_retry: true,
                            error: failure.message,
                        });
                    }
                    Ok(FailOutcome::Exhausted(failed)) => {
                        error!(
                            job_id = %job_id,
                            job_type = %job_type,
                            attempt = failed.attempts_made,
                            error = %failure.message,
                            "Job failed after final attempt"
                        );
                        let _ = self.event_tx.send(WorkerEvent::JobFailed {
                            job_id,
                            job_type,
                            attempts_made: failed.attempts_made,
                            will_retry: false,
                            error: failure.message,
                        });
                        self.finalize_exhausted(failed).await;
                    }
                    Err(e) => error!(error = %e, job_id = %job_id, "Failed to mark job as failed"),
                }
            }
        }
    }

    /// Run the handler under the job timeout, renewing the lease every third
    /// of its duration.
    ///
    /// Returns `None` when a renewal finds the lease gone. The attempt is then
    /// abandoned without touching the job, which recovery already requeued or
    /// failed.
    async fn run_attempt(
        &self,
        handler: Arc<dyn JobHandler>,
        job: Job,
        lease_token: Uuid,
    ) -> Option<JobResult> {
        let job_id = job.id;
        let claimed = job.clone();
        let event_tx = self.event_tx.clone();
        let ctx = JobContext::new(job)
            .with_queue(self.stores.queue.clone())
            .with_progress_callback(move |percent, message| {
                let _ = event_tx.send(WorkerEvent::JobProgress {
                    job_id,
                    percent,
                    message: message.map(String::from),
                });
            });

        let attempt = tokio::time::timeout(self.job_timeout, handler.execute(ctx));
        tokio::pin!(attempt);

        let every = heartbeat_interval(self.stores.queue.lease_duration());
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            tokio::select! {
                outcome = &mut attempt => break outcome,
                _ = heartbeat.tick() => {
                    match self.stores.queue.renew_lease(job_id, lease_token).await {
                        Ok(()) => {}
                        Err(e) if e.kind() == ErrorKind::Conflict => {
                            warn!(job_id = %job_id, "Lease lost mid-attempt, abandoning it");
                            return None;
                        }
                        Err(e) => warn!(job_id = %job_id, error = %e, "Failed to renew job lease"),
                    }
                }
            }
        };

        match outcome {
            Ok(result) => Some(result),
            Err(_) => {
                warn!(
                    job_id = %job_id,
                    job_type = %claimed.job_type,
                    timeout_ms = self.job_timeout.as_millis() as u64,
                    "Job exceeded its timeout"
                );
                let failure = JobFailure::new(format!(
                    "Job exceeded timeout of {}ms",
                    self.job_timeout.as_millis()
                ));
                if let Err(e) = handler.on_attempt_timeout(&claimed, &failure).await {
                    error!(error = %e, job_id = %job_id, "Timeout hook failed");
                }
                Some(JobResult::Failed(failure))
            }
        }
    }

    /// Let the handler settle its records, then move the job to the DLQ.
    ///
    /// The job is marked dead-lettered only when both steps succeed; otherwise
    /// reconciliation repeats them.
    async fn finalize_exhausted(&self, job: Job) {
        let mut settled = true;
        if let Some(handler) = self.handler_for(&job.job_type).await {
            if let Err(e) = handler.on_exhausted(&job).await {
                error!(error = %e, job_id = %job.id, "Exhaustion hook failed");
                settled = false;
            }
        }

        let failed_at = job.finished_at.unwrap_or_else(Utc::now);
        let entry_id = match self
            .stores
            .dead_letters
            .push(DeadLetterEntry::from_failed_job(&job, failed_at))
            .await
        {
            Ok(entry_id) => entry_id,
            Err(e) => {
                error!(error = %e, job_id = %job.id, "Failed to dead-letter job");
                return;
            }
        };
        let _ = self.event_tx.send(WorkerEvent::JobDeadLettered {
            job_id: job.id,
            entry_id,
        });

        if settled {
            if let Err(e) = self.stores.queue.mark_dead_lettered(job.id).await {
                warn!(error = %e, job_id = %job.id, "Failed to mark job as dead-lettered");
            }
        }
    }
}

/// Renewal cadence for a lease of the given length.
fn heartbeat_interval(lease: Duration) -> Duration {
    (lease / 3).max(Duration::from_millis(10))
}

/// Builder for creating a job worker with handlers.
pub struct WorkerBuilder {
    stores: Stores,
    config: WorkerConfig,
    handlers: Vec<Box<dyn JobHandler>>,
    reconciler: Option<DigitizationService>,
}

impl WorkerBuilder {
    /// Create a new worker builder.
    pub fn new(stores: Stores) -> Self {
        Self {
            stores,
            config: WorkerConfig::default(),
            handlers: Vec::new(),
            reconciler: None,
        }
    }

    /// Set the worker configuration.
    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Add a handler.
    pub fn with_handler<H: JobHandler + 'static>(mut self, handler: H) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    /// Run `service.reconcile()` on every maintenance tick.
    pub fn with_reconciler(mut self, service: DigitizationService) -> Self {
        self.reconciler = Some(service);
        self
    }

    /// Build and return the worker.
    pub async fn build(self) -> JobWorker {
        let mut worker = JobWorker::new(self.stores, self.config);
        worker.reconciler = self.reconciler;

        {
            let mut handlers = worker.handlers.write().await;
            for handler in self.handlers {
                handlers.insert(handler.job_type().to_string(), Arc::from(handler));
            }
        }

        worker
    }
}
