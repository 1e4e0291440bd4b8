//! # digitizer-db
//!
//! PostgreSQL persistence for the digitizer pipeline.
//!
//! This crate provides:
//! - Connection pool management
//! - The durable job queue (`jobs` table, lease-based claiming)
//! - The dead letter queue (`dead_letters` table)
//! - The work record store (`work_records` table)
//! - In-memory implementations of the same contracts for tests
//!
//! ## Example
//!
//! ```rust,ignore
//! use digitizer_db::{Database, QueueOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("postgres://localhost/digitizer", QueueOptions::default()).await?;
//!     let counts = db.jobs.counts().await?;
//!     println!("waiting jobs: {}", counts.waiting);
//!     Ok(())
//! }
//! ```
pub mod dead_letters;
pub mod jobs;
pub mod memory;
pub mod pool;
pub mod work_records;

// Test fixtures for integration tests
pub mod test_fixtures;

// Re-export core types
pub use digitizer_core::*;

pub use dead_letters::PgDeadLetterQueue;
pub use jobs::{PgJobQueue, LEASE_EXPIRED_REASON};
pub use memory::{MemoryDeadLetterQueue, MemoryJobQueue, MemoryWorkRecordRepository};
pub use pool::{connect_pool, PoolConfig};
pub use work_records::PgWorkRecordRepository;

/// Combined database context with the queue, dead letter queue and store.
#[derive(Clone)]
pub struct Database {
    /// The underlying connection pool.
    pub pool: sqlx::Pool<sqlx::Postgres>,
    /// Durable job queue.
    pub jobs: PgJobQueue,
    /// Dead letter queue for exhausted jobs.
    pub dead_letters: PgDeadLetterQueue,
    /// Work record store.
    pub work_records: PgWorkRecordRepository,
}

impl Database {
    /// Create a new Database instance from a connection pool.
    ///
    /// The dead letter queue is named after the job queue with a `-dlq` suffix.
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>, options: QueueOptions) -> Self {
        let dlq_name = format!("{}-dlq", options.name);
        Self {
            jobs: PgJobQueue::new(pool.clone(), options),
            dead_letters: PgDeadLetterQueue::new(pool.clone(), dlq_name),
            work_records: PgWorkRecordRepository::new(pool.clone()),
            pool,
        }
    }

    /// Create a new Database instance by connecting to the given URL.
    pub async fn connect(url: &str, options: QueueOptions) -> Result<Self> {
        Self::connect_with_config(url, PoolConfig::default(), options).await
    }

    /// Create with custom pool configuration.
    pub async fn connect_with_config(
        url: &str,
        config: PoolConfig,
        options: QueueOptions,
    ) -> Result<Self> {
        let pool = connect_pool(url, &config).await?;
        Ok(Self::new(pool, options))
    }

    /// Run pending migrations.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &sqlx::Pool<sqlx::Postgres> {
        &self.pool
    }
}

/// In-memory counterpart of [`Database`] sharing the same contracts.
#[derive(Clone, Default)]
pub struct MemoryDatabase {
    pub jobs: MemoryJobQueue,
    pub dead_letters: MemoryDeadLetterQueue,
    pub work_records: MemoryWorkRecordRepository,
}

impl MemoryDatabase {
    pub fn new(options: QueueOptions) -> Self {
        Self {
            jobs: MemoryJobQueue::new(options),
            dead_letters: MemoryDeadLetterQueue::new(),
            work_records: MemoryWorkRecordRepository::new(),
        }
    }
}
