//! Redis adapter for the `writeflow` hot-path counter store.
//!
//! Every compound counter operation executes as one server-side Lua script,
//! so "check the like-set, increment the delta, mark the entity pending" is
//! a single atomic step for every concurrent caller. That property is the
//! whole point of the adapter: no client-side locking, no TOCTOU window
//! between the membership check and the increment, and a reconciler claim
//! (`GET` + `DEL` in one script) that can never race a writer's increment
//! into a torn read.
//!
//! Key schema, one triple per entity plus one global set:
//!
//! - `viewCount:{entityId}` — pending view delta (monotonic accumulator)
//! - `likeCount:{entityId}` — pending like delta (signed)
//! - `userLikes:{entityId}` — set of user ids holding an active like
//! - `pendingEntities` — entity ids with a nonzero pending delta
//!
//! A TTL is applied to `userLikes:{entityId}` on first insert only.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, Script};
use tracing::instrument;
use writeflow::{
    CounterError, CounterResult, CounterSnapshot, CounterStore, EntityId, LikeOutcome, UserId,
};

const PENDING_ENTITIES_KEY: &str = "pendingEntities";

// INCR the pending view delta and mark the entity pending.
// KEYS: viewCount:{e}, pendingEntities. ARGV: entityId.
const INCREMENT_VIEW: &str = r"
local delta = redis.call('INCR', KEYS[1])
redis.call('SADD', KEYS[2], ARGV[1])
return delta
";

// Set-guarded like. The TTL is only applied while the set has none, so the
// idempotency window starts at the first like, not the latest.
// KEYS: userLikes:{e}, likeCount:{e}, pendingEntities.
// ARGV: userId, entityId, ttlSeconds.
const LIKE: &str = r"
if redis.call('SISMEMBER', KEYS[1], ARGV[1]) == 1 then
  return {0, -1}
end
redis.call('SADD', KEYS[1], ARGV[1])
local delta = redis.call('INCR', KEYS[2])
redis.call('SADD', KEYS[3], ARGV[2])
if redis.call('TTL', KEYS[1]) < 0 then
  redis.call('EXPIRE', KEYS[1], ARGV[3])
end
return {1, delta}
";

// Symmetric removal; a user outside the set is a no-op.
// KEYS: userLikes:{e}, likeCount:{e}, pendingEntities.
// ARGV: userId, entityId.
const UNLIKE: &str = r"
if redis.call('SREM', KEYS[1], ARGV[1]) == 0 then
  return {0, -1}
end
local delta = redis.call('DECR', KEYS[2])
redis.call('SADD', KEYS[3], ARGV[2])
return {1, delta}
";

// Atomic get-and-delete: the reconciler's claim step.
// KEYS: the scalar key.
const GET_AND_DELETE: &str = r"
local value = redis.call('GET', KEYS[1])
if value then
  redis.call('DEL', KEYS[1])
end
return value
";

// Read-only snapshot of both deltas and the caller's like membership.
// KEYS: viewCount:{e}, likeCount:{e}, userLikes:{e}. ARGV: userId or ''.
const COUNTERS_AND_LIKED: &str = r"
local view = redis.call('GET', KEYS[1])
local like = redis.call('GET', KEYS[2])
local liked = 0
if ARGV[1] ~= '' then
  liked = redis.call('SISMEMBER', KEYS[3], ARGV[1])
end
return {view or '0', like or '0', liked}
";

fn view_count_key(entity_id: EntityId) -> String {
    format!("viewCount:{entity_id}")
}

fn like_count_key(entity_id: EntityId) -> String {
    format!("likeCount:{entity_id}")
}

fn user_likes_key(entity_id: EntityId) -> String {
    format!("userLikes:{entity_id}")
}

/// Redis-backed implementation of [`CounterStore`].
///
/// Cheap to clone; the underlying multiplexed connection is shared.
#[derive(Clone)]
pub struct RedisCounterStore {
    conn: MultiplexedConnection,
    increment_view: Script,
    like: Script,
    unlike: Script,
    get_and_delete: Script,
    counters_and_liked: Script,
}

impl RedisCounterStore {
    /// Connects to the given Redis URL (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> CounterResult<Self> {
        let client = Client::open(url)
            .map_err(|error| CounterError::backend("connect", error.to_string()))?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|error| CounterError::backend("connect", error.to_string()))?;
        Ok(Self::from_connection(conn))
    }

    /// Wraps an existing multiplexed connection.
    pub fn from_connection(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            increment_view: Script::new(INCREMENT_VIEW),
            like: Script::new(LIKE),
            unlike: Script::new(UNLIKE),
            get_and_delete: Script::new(GET_AND_DELETE),
            counters_and_liked: Script::new(COUNTERS_AND_LIKED),
        }
    }

    async fn claim(&self, key: String, operation: &'static str) -> CounterResult<Option<i64>> {
        let mut conn = self.conn.clone();
        let value: Option<i64> = self
            .get_and_delete
            .key(key)
            .invoke_async(&mut conn)
            .await
            .map_err(|error| CounterError::backend(operation, error.to_string()))?;
        Ok(value)
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    #[instrument(name = "redis.increment_view", skip(self))]
    async fn increment_view(&self, entity_id: EntityId) -> CounterResult<i64> {
        let mut conn = self.conn.clone();
        let delta: i64 = self
            .increment_view
            .key(view_count_key(entity_id))
            .key(PENDING_ENTITIES_KEY)
            .arg(i64::from(entity_id))
            .invoke_async(&mut conn)
            .await
            .map_err(|error| CounterError::backend("increment_view", error.to_string()))?;
        Ok(delta)
    }

    #[instrument(name = "redis.like", skip(self, ttl))]
    async fn like(
        &self,
        entity_id: EntityId,
        user_id: UserId,
        ttl: Duration,
    ) -> CounterResult<LikeOutcome> {
        let mut conn = self.conn.clone();
        let (applied, like_delta): (i64, i64) = self
            .like
            .key(user_likes_key(entity_id))
            .key(like_count_key(entity_id))
            .key(PENDING_ENTITIES_KEY)
            .arg(i64::from(user_id))
            .arg(i64::from(entity_id))
            .arg(ttl.as_secs())
            .invoke_async(&mut conn)
            .await
            .map_err(|error| CounterError::backend("like", error.to_string()))?;
        Ok(LikeOutcome {
            applied: applied == 1,
            like_delta,
        })
    }

    #[instrument(name = "redis.unlike", skip(self))]
    async fn unlike(&self, entity_id: EntityId, user_id: UserId) -> CounterResult<LikeOutcome> {
        let mut conn = self.conn.clone();
        let (applied, like_delta): (i64, i64) = self
            .unlike
            .key(user_likes_key(entity_id))
            .key(like_count_key(entity_id))
            .key(PENDING_ENTITIES_KEY)
            .arg(i64::from(user_id))
            .arg(i64::from(entity_id))
            .invoke_async(&mut conn)
            .await
            .map_err(|error| CounterError::backend("unlike", error.to_string()))?;
        Ok(LikeOutcome {
            applied: applied == 1,
            like_delta,
        })
    }

    #[instrument(name = "redis.claim_view_delta", skip(self))]
    async fn claim_view_delta(&self, entity_id: EntityId) -> CounterResult<Option<i64>> {
        self.claim(view_count_key(entity_id), "claim_view_delta").await
    }

    #[instrument(name = "redis.claim_like_delta", skip(self))]
    async fn claim_like_delta(&self, entity_id: EntityId) -> CounterResult<Option<i64>> {
        self.claim(like_count_key(entity_id), "claim_like_delta").await
    }

    #[instrument(name = "redis.counters_and_liked", skip(self))]
    async fn counters_and_liked(
        &self,
        entity_id: EntityId,
        user_id: Option<UserId>,
    ) -> CounterResult<CounterSnapshot> {
        let mut conn = self.conn.clone();
        let user_arg = user_id.map_or(String::new(), |user| i64::from(user).to_string());
        let (view_delta, like_delta, liked): (i64, i64, i64) = self
            .counters_and_liked
            .key(view_count_key(entity_id))
            .key(like_count_key(entity_id))
            .key(user_likes_key(entity_id))
            .arg(user_arg)
            .invoke_async(&mut conn)
            .await
            .map_err(|error| CounterError::backend("counters_and_liked", error.to_string()))?;
        Ok(CounterSnapshot {
            view_delta,
            like_delta,
            liked_by_user: liked == 1,
        })
    }

    #[instrument(name = "redis.pending_entities", skip(self))]
    async fn pending_entities(&self) -> CounterResult<Vec<EntityId>> {
        let mut conn = self.conn.clone();
        let raw: Vec<i64> = conn
            .smembers(PENDING_ENTITIES_KEY)
            .await
            .map_err(|error| CounterError::backend("pending_entities", error.to_string()))?;

        raw.into_iter()
            .map(|id| {
                EntityId::try_new(id).map_err(|error| CounterError::MalformedValue {
                    key: PENDING_ENTITIES_KEY.to_string(),
                    detail: error.to_string(),
                })
            })
            .collect()
    }

    #[instrument(name = "redis.clear_pending", skip(self))]
    async fn clear_pending(&self, entity_id: EntityId) -> CounterResult<()> {
        let mut conn = self.conn.clone();
        let _removed: i64 = conn
            .srem(PENDING_ENTITIES_KEY, i64::from(entity_id))
            .await
            .map_err(|error| CounterError::backend("clear_pending", error.to_string()))?;
        Ok(())
    }
}
