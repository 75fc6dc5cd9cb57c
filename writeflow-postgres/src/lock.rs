//! Lock-table based [`LockManager`].
//!
//! One row per lock name in `scheduler_locks`. Acquisition is a single
//! upsert guarded by `locked_until <= NOW()`, so exactly one replica wins a
//! tick; release moves `locked_until` back to `locked_at + min_hold`, which
//! keeps a fast run holding the lock for its minimum time. A crashed holder
//! is bounded by `max_hold`: its row simply expires.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::{query, Pool, Postgres};
use tracing::{debug, warn};
use writeflow::LockManager;

/// Lock manager over the `scheduler_locks` table.
#[derive(Debug, Clone)]
pub struct PostgresLockManager {
    pool: Pool<Postgres>,
}

/// A held lock row.
pub struct PostgresLockLease {
    name: String,
    min_hold: Duration,
}

impl PostgresLockManager {
    /// Wraps an existing connection pool.
    pub fn from_pool(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LockManager for PostgresLockManager {
    type Lease = PostgresLockLease;

    async fn try_acquire(
        &self,
        name: &str,
        min_hold: Duration,
        max_hold: Duration,
    ) -> Option<Self::Lease> {
        let result = query(
            "INSERT INTO scheduler_locks (name, locked_at, locked_until)
             VALUES ($1, NOW(), NOW() + make_interval(secs => $2))
             ON CONFLICT (name) DO UPDATE
             SET locked_at = NOW(),
                 locked_until = NOW() + make_interval(secs => $2)
             WHERE scheduler_locks.locked_until <= NOW()",
        )
        .bind(name)
        .bind(max_hold.as_secs_f64())
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) if done.rows_affected() == 1 => Some(PostgresLockLease {
                name: name.to_string(),
                min_hold,
            }),
            Ok(_) => None,
            Err(error) => {
                // Acquisition failure means "skip this tick", never an error
                // surfaced to the scheduler.
                warn!(%error, name, "lock acquisition failed");
                None
            }
        }
    }

    async fn release(&self, lease: Self::Lease) {
        let result = query(
            "UPDATE scheduler_locks
             SET locked_until = GREATEST(NOW(), locked_at + make_interval(secs => $2))
             WHERE name = $1",
        )
        .bind(&lease.name)
        .bind(lease.min_hold.as_secs_f64())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => debug!(name = %lease.name, "lock released"),
            Err(error) => {
                // The row expires at max_hold on its own.
                warn!(%error, name = %lease.name, "lock release failed");
            }
        }
    }
}
