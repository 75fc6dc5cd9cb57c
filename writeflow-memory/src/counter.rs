//! In-memory atomic counter store.
//!
//! One mutex guards the whole counter state, so every compound operation is
//! a single indivisible step — the same guarantee the Redis adapter gets
//! from server-side script execution.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use writeflow::{CounterResult, CounterSnapshot, CounterStore, EntityId, LikeOutcome, UserId};

/// Thread-safe in-memory implementation of [`CounterStore`].
#[derive(Default)]
pub struct InMemoryCounterStore {
    inner: Mutex<State>,
}

#[derive(Default)]
struct State {
    view_deltas: HashMap<EntityId, i64>,
    like_deltas: HashMap<EntityId, i64>,
    user_likes: HashMap<EntityId, HashSet<UserId>>,
    like_set_expiry: HashMap<EntityId, Instant>,
    pending: BTreeSet<EntityId>,
}

impl State {
    /// Drops a like-set whose TTL has lapsed. Expiry clears only the
    /// idempotency set, never the pending delta — mirroring a store-side
    /// TTL on the set key alone.
    fn purge_expired(&mut self, entity_id: EntityId, now: Instant) {
        if let Some(expiry) = self.like_set_expiry.get(&entity_id) {
            if now >= *expiry {
                self.like_set_expiry.remove(&entity_id);
                self.user_likes.remove(&entity_id);
            }
        }
    }
}

impl InMemoryCounterStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn increment_view(&self, entity_id: EntityId) -> CounterResult<i64> {
        let mut state = self.inner.lock().expect("Mutex poisoned");
        let delta = state.view_deltas.entry(entity_id).or_insert(0);
        *delta += 1;
        let delta = *delta;
        state.pending.insert(entity_id);
        Ok(delta)
    }

    async fn like(
        &self,
        entity_id: EntityId,
        user_id: UserId,
        ttl: Duration,
    ) -> CounterResult<LikeOutcome> {
        let now = Instant::now();
        let mut state = self.inner.lock().expect("Mutex poisoned");
        state.purge_expired(entity_id, now);

        let likes = state.user_likes.entry(entity_id).or_default();
        if !likes.insert(user_id) {
            return Ok(LikeOutcome::NOOP);
        }

        let delta = state.like_deltas.entry(entity_id).or_insert(0);
        *delta += 1;
        let delta = *delta;
        state.pending.insert(entity_id);
        state
            .like_set_expiry
            .entry(entity_id)
            .or_insert_with(|| now + ttl);
        Ok(LikeOutcome::applied(delta))
    }

    async fn unlike(&self, entity_id: EntityId, user_id: UserId) -> CounterResult<LikeOutcome> {
        let now = Instant::now();
        let mut state = self.inner.lock().expect("Mutex poisoned");
        state.purge_expired(entity_id, now);

        let removed = state
            .user_likes
            .get_mut(&entity_id)
            .is_some_and(|likes| likes.remove(&user_id));
        if !removed {
            return Ok(LikeOutcome::NOOP);
        }

        let delta = state.like_deltas.entry(entity_id).or_insert(0);
        *delta -= 1;
        let delta = *delta;
        state.pending.insert(entity_id);
        Ok(LikeOutcome::applied(delta))
    }

    async fn claim_view_delta(&self, entity_id: EntityId) -> CounterResult<Option<i64>> {
        let mut state = self.inner.lock().expect("Mutex poisoned");
        Ok(state.view_deltas.remove(&entity_id))
    }

    async fn claim_like_delta(&self, entity_id: EntityId) -> CounterResult<Option<i64>> {
        let mut state = self.inner.lock().expect("Mutex poisoned");
        Ok(state.like_deltas.remove(&entity_id))
    }

    async fn counters_and_liked(
        &self,
        entity_id: EntityId,
        user_id: Option<UserId>,
    ) -> CounterResult<CounterSnapshot> {
        let now = Instant::now();
        let mut state = self.inner.lock().expect("Mutex poisoned");
        state.purge_expired(entity_id, now);

        Ok(CounterSnapshot {
            view_delta: state.view_deltas.get(&entity_id).copied().unwrap_or(0),
            like_delta: state.like_deltas.get(&entity_id).copied().unwrap_or(0),
            liked_by_user: user_id.is_some_and(|user| {
                state
                    .user_likes
                    .get(&entity_id)
                    .is_some_and(|likes| likes.contains(&user))
            }),
        })
    }

    async fn pending_entities(&self) -> CounterResult<Vec<EntityId>> {
        let state = self.inner.lock().expect("Mutex poisoned");
        Ok(state.pending.iter().copied().collect())
    }

    async fn clear_pending(&self, entity_id: EntityId) -> CounterResult<()> {
        let mut state = self.inner.lock().expect("Mutex poisoned");
        state.pending.remove(&entity_id);
        Ok(())
    }
}
