//! `PostgreSQL` adapter for the `writeflow` durable storage seam.
//!
//! Implements [`writeflow::Storage`] over an `sqlx` connection pool: the
//! outbox and dead-letter tables, the durable counter aggregates, the
//! ranking query, and a lock-table based [`writeflow::LockManager`] for the
//! scheduled jobs. The unit of work is a real database transaction, so an
//! outbox append and the caller's own mutation commit or vanish together.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod lock;
mod storage;

use std::time::Duration;

use nutype::nutype;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};
use thiserror::Error;

pub use lock::{PostgresLockLease, PostgresLockManager};
pub use storage::PostgresStorage;

/// Failure establishing the connection pool.
#[derive(Debug, Error)]
pub enum PostgresError {
    /// The pool could not be created.
    #[error("failed to create postgres connection pool")]
    ConnectionFailed(#[source] sqlx::Error),

    /// Schema setup failed.
    #[error("failed to run schema setup")]
    MigrationFailed(#[source] sqlx::Error),
}

/// Maximum number of database connections in the pool.
///
/// Backed by `NonZeroU32`: a zero-connection pool is unrepresentable.
#[nutype(derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRef, Into))]
pub struct MaxConnections(std::num::NonZeroU32);

/// Connection pool configuration.
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    /// Maximum number of connections in the pool (default: 10).
    pub max_connections: MaxConnections,
    /// Timeout for acquiring a connection from the pool (default: 30s).
    pub acquire_timeout: Duration,
    /// Idle timeout for pooled connections (default: 10 minutes).
    pub idle_timeout: Duration,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        const DEFAULT_MAX_CONNECTIONS: std::num::NonZeroU32 = match std::num::NonZeroU32::new(10) {
            Some(v) => v,
            None => unreachable!(),
        };

        Self {
            max_connections: MaxConnections::new(DEFAULT_MAX_CONNECTIONS),
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

/// Builds a connection pool with the given configuration.
pub async fn connect(
    connection_string: &str,
    config: &PostgresConfig,
) -> Result<Pool<Postgres>, PostgresError> {
    let max_connections: std::num::NonZeroU32 = config.max_connections.into();
    PgPoolOptions::new()
        .max_connections(max_connections.get())
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .connect(connection_string)
        .await
        .map_err(PostgresError::ConnectionFailed)
}
