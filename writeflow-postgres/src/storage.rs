//! [`Storage`] implementation over `PostgreSQL`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{query, Pool, Postgres, Row, Transaction};
use tracing::{info, instrument};
use writeflow::{
    CounterTotals, DeadLetterRecord, EntityId, EventId, EventType, OutboxRecord, RankingEntry,
    RankingMetric, RankingPeriod, Storage, StorageError, StorageResult,
};

use crate::PostgresError;

/// `PostgreSQL`-backed durable storage.
///
/// The unit of work is an `sqlx` transaction started on the shared pool;
/// everything staged through it commits atomically.
#[derive(Debug, Clone)]
pub struct PostgresStorage {
    pool: Pool<Postgres>,
}

impl PostgresStorage {
    /// Wraps an existing connection pool.
    pub fn from_pool(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// The underlying pool, for callers that share it.
    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }

    /// Creates the outbox, dead-letter, aggregate, and lock tables if they
    /// do not exist yet.
    pub async fn setup_schema(&self) -> Result<(), PostgresError> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS outbox (
                id BIGINT PRIMARY KEY,
                event_type VARCHAR(100) NOT NULL,
                payload TEXT NOT NULL,
                retry_count INT NOT NULL DEFAULT 0,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )",
            "CREATE INDEX IF NOT EXISTS idx_outbox_created_at ON outbox(created_at)",
            "CREATE TABLE IF NOT EXISTS dead_letter (
                event_id BIGINT PRIMARY KEY,
                event_type VARCHAR(100) NOT NULL,
                retry_count INT NOT NULL,
                failure_source VARCHAR(20) NOT NULL,
                last_error VARCHAR(2000) NOT NULL,
                payload TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )",
            "CREATE TABLE IF NOT EXISTS counter_aggregates (
                entity_id BIGINT PRIMARY KEY,
                view_count BIGINT NOT NULL DEFAULT 0,
                like_count BIGINT NOT NULL DEFAULT 0,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )",
            "CREATE TABLE IF NOT EXISTS scheduler_locks (
                name VARCHAR(255) PRIMARY KEY,
                locked_at TIMESTAMPTZ NOT NULL,
                locked_until TIMESTAMPTZ NOT NULL
            )",
        ];

        for statement in statements {
            query(statement)
                .execute(&self.pool)
                .await
                .map_err(PostgresError::MigrationFailed)?;
        }
        info!("writeflow schema ready");
        Ok(())
    }
}

fn map_sqlx_error(error: sqlx::Error, operation: &'static str) -> StorageError {
    StorageError::backend(operation, error.to_string())
}

fn outbox_record_from_row(row: &PgRow, operation: &'static str) -> StorageResult<OutboxRecord> {
    let id: i64 = row.try_get("id").map_err(|e| map_sqlx_error(e, operation))?;
    let event_type: String = row
        .try_get("event_type")
        .map_err(|e| map_sqlx_error(e, operation))?;
    let payload: String = row
        .try_get("payload")
        .map_err(|e| map_sqlx_error(e, operation))?;
    let retry_count: i32 = row
        .try_get("retry_count")
        .map_err(|e| map_sqlx_error(e, operation))?;
    let created_at: DateTime<Utc> = row
        .try_get("created_at")
        .map_err(|e| map_sqlx_error(e, operation))?;

    let event_id = EventId::try_new(id)
        .map_err(|e| StorageError::backend(operation, format!("corrupt outbox id: {e}")))?;
    let event_type = EventType::from_wire(&event_type).ok_or_else(|| {
        StorageError::backend(operation, format!("unknown event type '{event_type}'"))
    })?;
    let retry_count = u32::try_from(retry_count)
        .map_err(|e| StorageError::backend(operation, format!("negative retry count: {e}")))?;

    Ok(OutboxRecord {
        event_id,
        event_type,
        payload,
        retry_count,
        created_at,
    })
}

#[async_trait]
impl Storage for PostgresStorage {
    type UnitOfWork = Transaction<'static, Postgres>;

    async fn begin(&self) -> StorageResult<Self::UnitOfWork> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error(e, "begin"))
    }

    async fn commit(&self, uow: Self::UnitOfWork) -> StorageResult<()> {
        uow.commit().await.map_err(|e| map_sqlx_error(e, "commit"))
    }

    async fn rollback(&self, uow: Self::UnitOfWork) -> StorageResult<()> {
        uow.rollback()
            .await
            .map_err(|e| map_sqlx_error(e, "rollback"))
    }

    #[instrument(name = "postgres.append_outbox", skip(self, uow, record), fields(event_id = %record.event_id))]
    async fn append_outbox(
        &self,
        uow: &mut Self::UnitOfWork,
        record: &OutboxRecord,
    ) -> StorageResult<()> {
        query(
            "INSERT INTO outbox (id, event_type, payload, retry_count, created_at)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(i64::from(record.event_id))
        .bind(record.event_type.as_str())
        .bind(&record.payload)
        .bind(i32::try_from(record.retry_count).unwrap_or(i32::MAX))
        .bind(record.created_at)
        .execute(&mut **uow)
        .await
        .map_err(|e| map_sqlx_error(e, "append_outbox"))?;
        Ok(())
    }

    #[instrument(name = "postgres.fetch_relayable", skip(self))]
    async fn fetch_relayable(
        &self,
        older_than: Duration,
        max_retries: u32,
        limit: usize,
    ) -> StorageResult<Vec<OutboxRecord>> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than)
                .map_err(|e| StorageError::backend("fetch_relayable", e.to_string()))?;

        let rows = query(
            "SELECT id, event_type, payload, retry_count, created_at
             FROM outbox
             WHERE created_at <= $1 AND retry_count < $2
             ORDER BY created_at ASC
             LIMIT $3",
        )
        .bind(cutoff)
        .bind(i64::from(max_retries))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error(e, "fetch_relayable"))?;

        rows.iter()
            .map(|row| outbox_record_from_row(row, "fetch_relayable"))
            .collect()
    }

    async fn delete_outbox(&self, event_id: EventId) -> StorageResult<()> {
        query("DELETE FROM outbox WHERE id = $1")
            .bind(i64::from(event_id))
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(e, "delete_outbox"))?;
        Ok(())
    }

    async fn bump_outbox_retry(&self, event_id: EventId) -> StorageResult<u32> {
        let row = query(
            "UPDATE outbox
             SET retry_count = retry_count + 1, updated_at = NOW()
             WHERE id = $1
             RETURNING retry_count",
        )
        .bind(i64::from(event_id))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error(e, "bump_outbox_retry"))?
        .ok_or(StorageError::RecordNotFound(event_id))?;

        let retry_count: i32 = row
            .try_get("retry_count")
            .map_err(|e| map_sqlx_error(e, "bump_outbox_retry"))?;
        u32::try_from(retry_count)
            .map_err(|e| StorageError::backend("bump_outbox_retry", e.to_string()))
    }

    #[instrument(name = "postgres.append_dead_letter", skip(self, record), fields(event_id = %record.event_id))]
    async fn append_dead_letter(&self, record: &DeadLetterRecord) -> StorageResult<()> {
        // Write-once: a second relay racing on the same record must not fail
        // the pass.
        query(
            "INSERT INTO dead_letter
                 (event_id, event_type, retry_count, failure_source, last_error, payload, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (event_id) DO NOTHING",
        )
        .bind(i64::from(record.event_id))
        .bind(record.event_type.as_str())
        .bind(i32::try_from(record.retry_count).unwrap_or(i32::MAX))
        .bind(record.failure_source.to_string())
        .bind(&record.last_error)
        .bind(&record.payload)
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error(e, "append_dead_letter"))?;
        Ok(())
    }

    #[instrument(name = "postgres.apply_counter_deltas", skip(self, uow))]
    async fn apply_counter_deltas(
        &self,
        uow: &mut Self::UnitOfWork,
        entity_id: EntityId,
        view_delta: i64,
        like_delta: i64,
    ) -> StorageResult<CounterTotals> {
        let row = query(
            "UPDATE counter_aggregates
             SET view_count = view_count + $2,
                 like_count = like_count + $3,
                 updated_at = NOW()
             WHERE entity_id = $1
             RETURNING view_count, like_count",
        )
        .bind(i64::from(entity_id))
        .bind(view_delta)
        .bind(like_delta)
        .fetch_optional(&mut **uow)
        .await
        .map_err(|e| map_sqlx_error(e, "apply_counter_deltas"))?
        .ok_or(StorageError::EntityMissing(entity_id))?;

        let view_count: i64 = row
            .try_get("view_count")
            .map_err(|e| map_sqlx_error(e, "apply_counter_deltas"))?;
        let like_count: i64 = row
            .try_get("like_count")
            .map_err(|e| map_sqlx_error(e, "apply_counter_deltas"))?;
        Ok(CounterTotals {
            view_count,
            like_count,
        })
    }

    #[instrument(name = "postgres.top_entities", skip(self))]
    async fn top_entities(
        &self,
        metric: RankingMetric,
        _period: RankingPeriod,
        limit: usize,
    ) -> StorageResult<Vec<RankingEntry>> {
        // Aggregates carry lifetime totals; windowed rankings live in the
        // downstream read models fed by the ranking events.
        let sql = match metric {
            RankingMetric::Views => {
                "SELECT entity_id, view_count AS score
                 FROM counter_aggregates
                 WHERE view_count > 0
                 ORDER BY view_count DESC, entity_id ASC
                 LIMIT $1"
            }
            RankingMetric::Likes => {
                "SELECT entity_id, like_count AS score
                 FROM counter_aggregates
                 WHERE like_count > 0
                 ORDER BY like_count DESC, entity_id ASC
                 LIMIT $1"
            }
        };

        let rows = query(sql)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(e, "top_entities"))?;

        rows.iter()
            .map(|row| {
                let entity_id: i64 = row
                    .try_get("entity_id")
                    .map_err(|e| map_sqlx_error(e, "top_entities"))?;
                let score: i64 = row
                    .try_get("score")
                    .map_err(|e| map_sqlx_error(e, "top_entities"))?;
                let entity_id = EntityId::try_new(entity_id).map_err(|e| {
                    StorageError::backend("top_entities", format!("corrupt entity id: {e}"))
                })?;
                Ok(RankingEntry { entity_id, score })
            })
            .collect()
    }
}
