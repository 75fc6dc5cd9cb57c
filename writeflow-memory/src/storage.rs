//! In-memory durable storage with staged unit-of-work commit.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use writeflow::{
    CounterTotals, DeadLetterRecord, EntityId, EventId, OutboxRecord, RankingEntry, RankingMetric,
    RankingPeriod, Storage, StorageError, StorageResult,
};

/// Thread-safe in-memory implementation of [`Storage`].
///
/// Writes staged through a [`MemoryUnitOfWork`] become visible only at
/// commit, all at once; a rolled-back unit of work leaves no trace. That is
/// exactly the atomicity the outbox pattern leans on, so the same tests can
/// run against this store and the relational one.
#[derive(Clone, Default)]
pub struct InMemoryStorage {
    inner: Arc<RwLock<State>>,
}

#[derive(Default)]
struct State {
    // BTreeMap keyed by snowflake id keeps outbox records in creation order.
    outbox: BTreeMap<EventId, OutboxRecord>,
    dead_letters: Vec<DeadLetterRecord>,
    aggregates: HashMap<EntityId, CounterTotals>,
}

/// Staged writes awaiting commit.
#[derive(Default)]
pub struct MemoryUnitOfWork {
    staged_outbox: Vec<OutboxRecord>,
    staged_deltas: Vec<(EntityId, i64, i64)>,
}

impl InMemoryStorage {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the durable aggregate row for an entity.
    pub fn insert_aggregate(&self, entity_id: EntityId, totals: CounterTotals) {
        let mut state = self.inner.write().expect("RwLock poisoned");
        state.aggregates.insert(entity_id, totals);
    }

    /// Removes an entity's aggregate row, simulating a concurrent delete.
    pub fn remove_aggregate(&self, entity_id: EntityId) {
        let mut state = self.inner.write().expect("RwLock poisoned");
        state.aggregates.remove(&entity_id);
    }

    /// Reads the durable aggregate for an entity.
    pub fn aggregate(&self, entity_id: EntityId) -> Option<CounterTotals> {
        let state = self.inner.read().expect("RwLock poisoned");
        state.aggregates.get(&entity_id).copied()
    }

    /// All committed outbox records, oldest first.
    pub fn outbox_records(&self) -> Vec<OutboxRecord> {
        let state = self.inner.read().expect("RwLock poisoned");
        state.outbox.values().cloned().collect()
    }

    /// All dead-letter records, in arrival order.
    pub fn dead_letters(&self) -> Vec<DeadLetterRecord> {
        let state = self.inner.read().expect("RwLock poisoned");
        state.dead_letters.clone()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    type UnitOfWork = MemoryUnitOfWork;

    async fn begin(&self) -> StorageResult<Self::UnitOfWork> {
        Ok(MemoryUnitOfWork::default())
    }

    async fn commit(&self, uow: Self::UnitOfWork) -> StorageResult<()> {
        let mut state = self.inner.write().expect("RwLock poisoned");

        // Re-check staged deltas against live rows: the entity may have been
        // deleted between the staged apply and this commit.
        for (entity_id, _, _) in &uow.staged_deltas {
            if !state.aggregates.contains_key(entity_id) {
                return Err(StorageError::EntityMissing(*entity_id));
            }
        }

        for record in uow.staged_outbox {
            state.outbox.insert(record.event_id, record);
        }
        for (entity_id, view_delta, like_delta) in uow.staged_deltas {
            let totals = state
                .aggregates
                .get_mut(&entity_id)
                .expect("presence checked above");
            totals.view_count += view_delta;
            totals.like_count += like_delta;
        }
        Ok(())
    }

    async fn rollback(&self, _uow: Self::UnitOfWork) -> StorageResult<()> {
        // Dropping the staged buffer is the rollback.
        Ok(())
    }

    async fn append_outbox(
        &self,
        uow: &mut Self::UnitOfWork,
        record: &OutboxRecord,
    ) -> StorageResult<()> {
        uow.staged_outbox.push(record.clone());
        Ok(())
    }

    async fn fetch_relayable(
        &self,
        older_than: Duration,
        max_retries: u32,
        limit: usize,
    ) -> StorageResult<Vec<OutboxRecord>> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than)
                .map_err(|e| StorageError::backend("fetch_relayable", e.to_string()))?;

        let state = self.inner.read().expect("RwLock poisoned");
        Ok(state
            .outbox
            .values()
            .filter(|record| record.created_at <= cutoff && record.retry_count < max_retries)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn delete_outbox(&self, event_id: EventId) -> StorageResult<()> {
        let mut state = self.inner.write().expect("RwLock poisoned");
        state.outbox.remove(&event_id);
        Ok(())
    }

    async fn bump_outbox_retry(&self, event_id: EventId) -> StorageResult<u32> {
        let mut state = self.inner.write().expect("RwLock poisoned");
        let record = state
            .outbox
            .get_mut(&event_id)
            .ok_or(StorageError::RecordNotFound(event_id))?;
        record.retry_count += 1;
        Ok(record.retry_count)
    }

    async fn append_dead_letter(&self, record: &DeadLetterRecord) -> StorageResult<()> {
        let mut state = self.inner.write().expect("RwLock poisoned");
        state.dead_letters.push(record.clone());
        Ok(())
    }

    async fn apply_counter_deltas(
        &self,
        uow: &mut Self::UnitOfWork,
        entity_id: EntityId,
        view_delta: i64,
        like_delta: i64,
    ) -> StorageResult<CounterTotals> {
        let state = self.inner.read().expect("RwLock poisoned");
        let committed = state
            .aggregates
            .get(&entity_id)
            .copied()
            .ok_or(StorageError::EntityMissing(entity_id))?;

        // Totals as this unit of work would observe them: committed values
        // plus everything staged so far for the same entity.
        let mut totals = committed;
        for (staged_entity, staged_view, staged_like) in &uow.staged_deltas {
            if *staged_entity == entity_id {
                totals.view_count += staged_view;
                totals.like_count += staged_like;
            }
        }
        totals.view_count += view_delta;
        totals.like_count += like_delta;

        uow.staged_deltas.push((entity_id, view_delta, like_delta));
        Ok(totals)
    }

    async fn top_entities(
        &self,
        metric: RankingMetric,
        _period: RankingPeriod,
        limit: usize,
    ) -> StorageResult<Vec<RankingEntry>> {
        // The in-memory store keeps no windowed history; every period ranks
        // over the lifetime totals.
        let state = self.inner.read().expect("RwLock poisoned");
        let mut entries: Vec<RankingEntry> = state
            .aggregates
            .iter()
            .map(|(entity_id, totals)| RankingEntry {
                entity_id: *entity_id,
                score: match metric {
                    RankingMetric::Views => totals.view_count,
                    RankingMetric::Likes => totals.like_count,
                },
            })
            .filter(|entry| entry.score > 0)
            .collect();
        entries.sort_by(|a, b| b.score.cmp(&a.score).then(a.entity_id.cmp(&b.entity_id)));
        entries.truncate(limit);
        Ok(entries)
    }
}
