//! Durable storage seam: outbox records, dead letters, counter aggregates.
//!
//! [`Storage`] is a unit-of-work trait: the business caller opens a unit of
//! work, mutates its own state, lets [`crate::OutboxWriter`] append the event
//! record through the same unit of work, and commits. Either both the fact
//! and its outbox record become durable, or neither does.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::StorageResult;
use crate::event::EventType;
use crate::types::{EntityId, EventId};

/// Upper bound on the stored dead-letter error message.
pub const MAX_DEAD_LETTER_ERROR_LEN: usize = 2000;

/// An event awaiting relay to the broker.
///
/// Created in the same transaction as the domain mutation that caused it.
/// `retry_count` is mutated only by the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxRecord {
    /// Snowflake id of the event; also the record's identity.
    pub event_id: EventId,
    /// The event's registered type.
    pub event_type: EventType,
    /// The serialized wire envelope.
    pub payload: String,
    /// Failed relay attempts so far.
    pub retry_count: u32,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
}

impl OutboxRecord {
    /// Creates a fresh, never-relayed record.
    pub fn new(event_id: EventId, event_type: EventType, payload: String) -> Self {
        Self {
            event_id,
            event_type,
            payload,
            retry_count: 0,
            created_at: Utc::now(),
        }
    }
}

/// Which component routed a message to the dead-letter store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureSource {
    /// The outbox relay exhausted its publish retries.
    Relay,
    /// The consumer (or broker redelivery) gave up on the message.
    Consumer,
}

impl std::fmt::Display for FailureSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Relay => "RELAY",
            Self::Consumer => "CONSUMER",
        })
    }
}

/// Terminal record for a message that exhausted its retries.
///
/// Write-once, kept for forensic inspection; never reprocessed
/// automatically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterRecord {
    /// Id of the failed event.
    pub event_id: EventId,
    /// The event's registered type.
    pub event_type: EventType,
    /// Retry attempts spent before giving up.
    pub retry_count: u32,
    /// Which component gave up.
    pub failure_source: FailureSource,
    /// The last failure, truncated to [`MAX_DEAD_LETTER_ERROR_LEN`] chars.
    pub last_error: String,
    /// The original serialized envelope.
    pub payload: String,
    /// When the record was written.
    pub created_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    /// Builds a dead-letter record from the outbox record that failed.
    pub fn from_outbox(record: &OutboxRecord, source: FailureSource, last_error: &str) -> Self {
        Self {
            event_id: record.event_id,
            event_type: record.event_type,
            retry_count: record.retry_count,
            failure_source: source,
            last_error: truncate_error(last_error),
            payload: record.payload.clone(),
            created_at: Utc::now(),
        }
    }
}

/// Truncates an error message to the dead-letter column limit without
/// splitting a character.
pub fn truncate_error(message: &str) -> String {
    message.chars().take(MAX_DEAD_LETTER_ERROR_LEN).collect()
}

/// Durable counter fields on the owning entity after a delta apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterTotals {
    /// Total view count in the system of record.
    pub view_count: i64,
    /// Total like count in the system of record.
    pub like_count: i64,
}

/// The metric a ranking snapshot orders by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RankingMetric {
    /// Order by durable view totals.
    Views,
    /// Order by durable like totals.
    Likes,
}

/// The window a ranking snapshot covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RankingPeriod {
    /// Trailing day.
    Day,
    /// Trailing week.
    Week,
}

/// One row of a top-N ranking snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankingEntry {
    /// The ranked entity.
    pub entity_id: EntityId,
    /// Its score under the snapshot's metric.
    pub score: i64,
}

/// Durable storage for outbox records, dead letters, and counter aggregates.
///
/// `UnitOfWork` is the ambient transaction the business caller holds while
/// publishing: for the relational adapter it is a database transaction, for
/// the in-memory adapter a staged buffer applied on commit.
#[async_trait]
pub trait Storage: Send + Sync {
    /// The adapter's transaction handle.
    type UnitOfWork: Send;

    /// Opens a unit of work.
    async fn begin(&self) -> StorageResult<Self::UnitOfWork>;

    /// Commits a unit of work, making all staged writes durable atomically.
    async fn commit(&self, uow: Self::UnitOfWork) -> StorageResult<()>;

    /// Discards a unit of work; nothing staged through it survives.
    async fn rollback(&self, uow: Self::UnitOfWork) -> StorageResult<()>;

    /// Stages an outbox record inside the caller's unit of work.
    async fn append_outbox(
        &self,
        uow: &mut Self::UnitOfWork,
        record: &OutboxRecord,
    ) -> StorageResult<()>;

    /// Fetches committed records older than `older_than` with fewer than
    /// `max_retries` failed attempts, oldest first, up to `limit`.
    async fn fetch_relayable(
        &self,
        older_than: Duration,
        max_retries: u32,
        limit: usize,
    ) -> StorageResult<Vec<OutboxRecord>>;

    /// Removes a relayed (or dead-lettered) record from the outbox.
    async fn delete_outbox(&self, event_id: EventId) -> StorageResult<()>;

    /// Increments a record's retry count, returning the new count.
    async fn bump_outbox_retry(&self, event_id: EventId) -> StorageResult<u32>;

    /// Appends a terminal dead-letter record.
    async fn append_dead_letter(&self, record: &DeadLetterRecord) -> StorageResult<()>;

    /// Applies reconciled deltas to the durable aggregate inside the given
    /// unit of work, returning the new totals.
    ///
    /// Fails with [`crate::StorageError::EntityMissing`] when the aggregate
    /// row is gone (entity deleted concurrently).
    async fn apply_counter_deltas(
        &self,
        uow: &mut Self::UnitOfWork,
        entity_id: EntityId,
        view_delta: i64,
        like_delta: i64,
    ) -> StorageResult<CounterTotals>;

    /// Queries the current top-N ranking from durable aggregates.
    async fn top_entities(
        &self,
        metric: RankingMetric,
        period: RankingPeriod,
        limit: usize,
    ) -> StorageResult<Vec<RankingEntry>>;
}
