//! Hot-path counter seam.
//!
//! High-frequency increments (views, likes) never touch the system of record
//! per request; they land in a counter store whose compound operations run as
//! single atomic steps (the Redis adapter executes them as server-side Lua
//! scripts). Without that atomicity, "check the like-set, then increment,
//! then mark dirty" is three round trips and a TOCTOU race: two concurrent
//! likes from one user would corrupt the signed delta.
//!
//! The shared mutable state lives entirely behind this trait, owned by the
//! external store; no client-side locking exists anywhere on the hot path.

use std::time::Duration;

use async_trait::async_trait;

use crate::errors::CounterResult;
use crate::types::{EntityId, UserId};

/// Result of a like/unlike attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LikeOutcome {
    /// Whether the operation changed state. `false` means a duplicate like
    /// (or an unlike with no prior like): a no-op.
    pub applied: bool,
    /// The pending like delta after the operation, `-1` when not applied.
    pub like_delta: i64,
}

impl LikeOutcome {
    /// The idempotent no-op outcome.
    pub const NOOP: Self = Self {
        applied: false,
        like_delta: -1,
    };

    /// An applied outcome with the new pending delta.
    pub const fn applied(like_delta: i64) -> Self {
        Self {
            applied: true,
            like_delta,
        }
    }
}

/// Read-only snapshot of an entity's pending counters.
///
/// The durable aggregate value must be added by the caller to produce the
/// reader-facing total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CounterSnapshot {
    /// Pending view delta.
    pub view_delta: i64,
    /// Pending like delta (signed).
    pub like_delta: i64,
    /// Whether the queried user currently holds an active like.
    pub liked_by_user: bool,
}

/// Atomic per-entity counter store.
///
/// Every method is one indivisible step from the caller's perspective;
/// concurrent callers never observe a partial update.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increments the pending view delta and marks the entity pending.
    /// Returns the new pending delta.
    async fn increment_view(&self, entity_id: EntityId) -> CounterResult<i64>;

    /// Records a like if `user_id` has not already liked `entity_id`:
    /// adds the user to the like-set, increments the pending like delta,
    /// marks the entity pending, and sets a TTL on the like-set if it has
    /// none yet. A duplicate like is a no-op returning [`LikeOutcome::NOOP`].
    async fn like(
        &self,
        entity_id: EntityId,
        user_id: UserId,
        ttl: Duration,
    ) -> CounterResult<LikeOutcome>;

    /// Withdraws a like symmetrically; a no-op if the user was not in the
    /// like-set.
    async fn unlike(&self, entity_id: EntityId, user_id: UserId) -> CounterResult<LikeOutcome>;

    /// Atomically reads and deletes the pending view delta, claiming it for
    /// the reconciler. A concurrent writer's next increment starts a fresh
    /// delta instead of racing a partially-read one. `None` if absent.
    async fn claim_view_delta(&self, entity_id: EntityId) -> CounterResult<Option<i64>>;

    /// Atomically reads and deletes the pending like delta. `None` if
    /// absent.
    async fn claim_like_delta(&self, entity_id: EntityId) -> CounterResult<Option<i64>>;

    /// Read-only snapshot of pending deltas and the user's like status.
    async fn counters_and_liked(
        &self,
        entity_id: EntityId,
        user_id: Option<UserId>,
    ) -> CounterResult<CounterSnapshot>;

    /// All entity ids with a nonzero pending delta.
    async fn pending_entities(&self) -> CounterResult<Vec<EntityId>>;

    /// Removes an entity from the pending set, after its deltas were folded
    /// into the durable aggregate.
    async fn clear_pending(&self, entity_id: EntityId) -> CounterResult<()>;
}
