//! Structured logging field name constants.
//!
//! All crates use these names for structured `tracing` fields so that log
//! aggregation can query by the same keys across subsystems.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded service, requires operator attention |
//! | WARN  | Recoverable issue, job will be retried |
//! | INFO  | Lifecycle events (startup, shutdown), job completions |
//! | DEBUG | Decision points, claimed batches, config choices |
//! | TRACE | Per-poll iteration |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Subsystem originating the log event.
/// Values: "db", "jobs", "providers", "worker"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
/// Examples: "pool", "queue", "dlq", "vision", "translate", "cloudinary"
pub const COMPONENT: &str = "component";

/// Logical operation name.
/// Examples: "claim_next", "fail", "recognize", "upload"
pub const OPERATION: &str = "op";

// ─── Entity fields ─────────────────────────────────────────────────────────

/// Job UUID being processed.
pub const JOB_ID: &str = "job_id";

/// Job type name.
pub const JOB_TYPE: &str = "job_type";

/// Work record UUID being operated on.
pub const WORK_RECORD_ID: &str = "work_record_id";

/// Attempt number (1-based) of the current job execution.
pub const ATTEMPT: &str = "attempt";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Retry delay in milliseconds.
pub const DELAY_MS: &str = "delay_ms";

/// Progress percentage.
pub const PROGRESS: &str = "progress";

// ─── Outcome fields ────────────────────────────────────────────────────────

/// Boolean success/failure indicator.
pub const SUCCESS: &str = "success";

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";
