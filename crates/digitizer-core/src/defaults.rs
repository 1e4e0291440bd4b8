//! Centralized default constants for the digitizer pipeline.
//!
//! **This module is the single source of truth** for shared default values.
//! Crates should reference these constants instead of defining their own
//! magic numbers.

// =============================================================================
// QUEUE
// =============================================================================

/// Name of the primary digitization queue.
pub const QUEUE_NAME: &str = "digitization";

/// Name of the dead letter queue.
pub const DLQ_NAME: &str = "digitization-dlq";

/// Job type used by producers for digitization requests.
pub const DIGITIZATION_JOB_TYPE: &str = "process-digitization";

/// Attempts per job before it is dead-lettered.
pub const JOB_MAX_ATTEMPTS: i32 = 3;

/// Base delay for exponential backoff (milliseconds).
pub const JOB_BACKOFF_BASE_MS: u64 = 2_000;

/// Lease duration granted on claim and on every progress update (seconds).
pub const JOB_LEASE_SECS: u64 = 30;

// =============================================================================
// RETENTION
// =============================================================================

/// Completed jobs are pruned after this age (seconds).
pub const COMPLETED_JOB_RETENTION_SECS: i64 = 86_400;

/// Newest completed jobs always kept regardless of age.
pub const COMPLETED_JOB_KEEP_COUNT: i64 = 100;

/// Failed jobs are pruned after this age (seconds).
pub const FAILED_JOB_RETENTION_SECS: i64 = 7 * 86_400;

/// Dead letter entries are purged after this age (seconds).
pub const DLQ_RETENTION_SECS: i64 = 30 * 86_400;

// =============================================================================
// WORKER
// =============================================================================

/// Default polling interval when the queue is empty (milliseconds).
pub const JOB_POLL_INTERVAL_MS: u64 = 1_000;

/// Default concurrency. One job at a time serializes provider calls.
pub const JOB_MAX_CONCURRENT: usize = 1;

/// Hard upper bound for a single job execution (seconds).
pub const JOB_TIMEOUT_SECS: u64 = 300;

/// Interval between stalled-job recovery, reconciliation and pruning (seconds).
pub const JOB_MAINTENANCE_INTERVAL_SECS: u64 = 60;

/// Capacity of the worker event broadcast channel.
pub const EVENT_BUS_CAPACITY: usize = 256;

// =============================================================================
// PAGINATION
// =============================================================================

/// Default page size for work record listings.
pub const PAGE_LIMIT: u32 = 10;

/// Largest page size a caller may request.
pub const PAGE_LIMIT_MAX: u32 = 100;

// =============================================================================
// PROVIDERS
// =============================================================================

/// Google Cloud Vision REST endpoint.
pub const GOOGLE_VISION_URL: &str = "https://vision.googleapis.com/v1";

/// Google Cloud Translation v2 REST endpoint.
pub const GOOGLE_TRANSLATE_URL: &str = "https://translation.googleapis.com/language/translate/v2";

/// Cloudinary REST endpoint.
pub const CLOUDINARY_URL: &str = "https://api.cloudinary.com/v1_1";

/// Root folder for uploaded images.
pub const UPLOAD_ROOT_FOLDER: &str = "digitizer-app";

/// Language hints used when a request supplies none.
pub const DEFAULT_LANGUAGE_HINTS: &[&str] = &["en", "hi", "kn"];

/// Recognition request timeout (seconds).
pub const RECOGNITION_TIMEOUT_SECS: u64 = 60;

/// Translation request timeout (seconds).
pub const TRANSLATION_TIMEOUT_SECS: u64 = 30;

/// Upload request timeout (seconds).
pub const UPLOAD_TIMEOUT_SECS: u64 = 60;

/// Image download timeout (seconds).
pub const DOWNLOAD_TIMEOUT_SECS: u64 = 30;

/// Largest image accepted for download or upload (bytes).
pub const MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;
