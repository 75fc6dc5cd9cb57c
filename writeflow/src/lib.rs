//! Write-path consistency core for a community platform backend.
//!
//! `writeflow` turns a user action (view, like, comment) into three things:
//!
//! - a durable, exactly-once-created fact, identified by a snowflake id,
//! - a low-latency counter update absorbed by a hot-path counter store,
//! - an eventually-consistent durable aggregate, folded back in by a
//!   reconciliation pass without double-counting or lost updates.
//!
//! The crate defines the domain types and the traits at the storage, counter,
//! broker, and lock seams; adapter crates (`writeflow-memory`,
//! `writeflow-redis`, `writeflow-postgres`) provide the implementations.
//!
//! # Components
//!
//! - [`Snowflake`]: node-unique, monotonically-increasing 64-bit ids.
//! - [`OutboxWriter`]: appends an event record inside the caller's open unit
//!   of work, so the event exists iff the fact committed.
//! - [`OutboxRelay`]: drains committed outbox records to the broker with a
//!   retry cap and dead-letter routing.
//! - [`ConsumerRunner`]: at-least-once consumption with a 1:1 handler-per-type
//!   dispatch table.
//! - [`CounterReconciler`]: claims pending hot-path deltas and applies them to
//!   the durable aggregate, one isolated transaction per entity.
//! - [`RankingScheduler`]: cluster-exclusive top-N snapshot job.

pub mod broker;
pub mod consumer;
pub mod counter;
pub mod errors;
pub mod event;
pub mod outbox;
pub mod ranking;
pub mod reconciler;
pub mod relay;
pub mod retry;
pub mod snowflake;
pub mod store;
pub mod types;

pub use broker::{BrokerSubscription, Delivery, MessageBroker};
pub use consumer::{ConsumerRunner, EventHandler, HandlerRegistry};
pub use counter::{CounterSnapshot, CounterStore, LikeOutcome};
pub use errors::{
    BrokerError, BrokerResult, CodecError, ConsumerError, ConsumerResult, CounterError,
    CounterResult, HandlerError, OutboxError, OutboxResult, RankingError, ReconcileError,
    StorageError, StorageResult,
};
pub use event::{EventEnvelope, EventPayload, EventType};
pub use outbox::OutboxWriter;
pub use ranking::{LockManager, RankingConfig, RankingScheduler};
pub use reconciler::{CounterReconciler, ReconcileReport, ReconcilerConfig};
pub use relay::{OutboxRelay, RelayConfig, RelayPass};
pub use retry::RetryStrategy;
pub use snowflake::Snowflake;
pub use store::{
    CounterTotals, DeadLetterRecord, FailureSource, OutboxRecord, RankingEntry, RankingMetric,
    RankingPeriod, Storage,
};
pub use types::{ConsumerGroup, EntityId, EventId, NodeId, Topic, UserId};
