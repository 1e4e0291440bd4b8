//! PostgreSQL connection pool.

use std::time::{Duration, Instant};

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

use digitizer_core::{Error, Result};

/// Sizing and timeouts for the worker's pool.
///
/// | Variable | Default |
/// |----------|---------|
/// | `DB_MAX_CONNECTIONS` | `10` |
/// | `DB_CONNECT_TIMEOUT_SECS` | `30` |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_connections: u32,
    /// Also bounds how long a query waits for a free connection.
    pub connect_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_connections: env_parse("DB_MAX_CONNECTIONS")
                .map_or(defaults.max_connections, |n: u32| n.max(1)),
            connect_timeout: env_parse("DB_CONNECT_TIMEOUT_SECS")
                .map_or(defaults.connect_timeout, Duration::from_secs),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.parse().ok()
}

/// Open a pool. An unreachable database is [`Error::Connection`].
pub async fn connect_pool(database_url: &str, config: &PoolConfig) -> Result<PgPool> {
    let start = Instant::now();
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.connect_timeout)
        .connect(database_url)
        .await
        .map_err(|e| Error::Connection(format!("Failed to connect to database: {}", e)))?;

    info!(
        subsystem = "db",
        component = "pool",
        max_connections = config.max_connections,
        duration_ms = start.elapsed().as_millis() as u64,
        "Database pool ready"
    );
    Ok(pool)
}
