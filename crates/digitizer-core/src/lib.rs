//! # digitizer-core
//!
//! Core types, traits, and abstractions for the digitizer pipeline.
//!
//! This crate provides the data structures (jobs, work records, dead letter
//! entries), the error taxonomy, the retry policy and the trait contracts
//! that the queue, stores and provider crates implement.

pub mod defaults;
pub mod error;
pub mod logging;
pub mod models;
pub mod retry;
pub mod traits;

// Re-export commonly used types at crate root
pub use error::{Error, ErrorKind, Result};
pub use models::*;
pub use retry::{backoff_delay, BackoffPolicy, QueueOptions, RetentionPolicy};
pub use traits::*;

/// Generate a time-ordered UUIDv7.
pub fn new_v7() -> uuid::Uuid {
    uuid::Uuid::now_v7()
}
