//! # digitizer-jobs
//!
//! Asynchronous digitization pipeline.
//!
//! This crate provides:
//! - The job worker: lease-based claiming, hard per-job timeouts, retry
//!   routing and dead-lettering
//! - The digitization handler (recognize, optionally translate, persist)
//! - Lifecycle events through a broadcast channel and observer subscriptions
//! - The submission and administration service producers call
//!
//! ## Example
//!
//! ```ignore
//! use digitizer_jobs::{DigitizationHandler, LoggingObserver, Stores, WorkerBuilder, WorkerConfig};
//!
//! let stores = Stores::from_database(&db);
//! let worker = WorkerBuilder::new(stores.clone())
//!     .with_config(WorkerConfig::from_env())
//!     .with_handler(DigitizationHandler::new(stores, recognizer, translator))
//!     .build()
//!     .await;
//!
//! let handle = worker.start();
//! let _subscription = handle.observe(Arc::new(LoggingObserver));
//!
//! // Graceful shutdown
//! handle.shutdown().await?;
//! ```

pub mod digitization;
pub mod events;
pub mod handler;
pub mod service;
pub mod worker;

use std::sync::Arc;

// Re-export core types
pub use digitizer_core::*;

pub use digitization::DigitizationHandler;
pub use events::{LoggingObserver, Subscription, WorkerEvent, WorkerObserver};
pub use handler::{JobContext, JobHandler, JobResult, NoOpHandler};
pub use service::{DigitizationService, ReconcileReport, SubmitDigitization};
pub use worker::{JobWorker, WorkerBuilder, WorkerConfig, WorkerHandle};

/// Default polling interval for job processing (milliseconds).
pub const DEFAULT_POLL_INTERVAL_MS: u64 = digitizer_core::defaults::JOB_POLL_INTERVAL_MS;

/// The queue, dead letter queue and work record store the pipeline runs on.
#[derive(Clone)]
pub struct Stores {
    pub queue: Arc<dyn JobQueue>,
    pub dead_letters: Arc<dyn DeadLetterQueue>,
    pub work_records: Arc<dyn WorkRecordRepository>,
}

impl Stores {
    /// PostgreSQL-backed stores.
    pub fn from_database(db: &digitizer_db::Database) -> Self {
        Self {
            queue: Arc::new(db.jobs.clone()),
            dead_letters: Arc::new(db.dead_letters.clone()),
            work_records: Arc::new(db.work_records.clone()),
        }
    }

    /// In-memory stores.
    pub fn from_memory(db: &digitizer_db::MemoryDatabase) -> Self {
        Self {
            queue: Arc::new(db.jobs.clone()),
            dead_letters: Arc::new(db.dead_letters.clone()),
            work_records: Arc::new(db.work_records.clone()),
        }
    }
}
