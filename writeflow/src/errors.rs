//! Error types for the write-path subsystem.
//!
//! One error enum per seam, so callers can tell configuration mistakes
//! (unsupported event type, duplicate handler) apart from backend failures
//! that the retry machinery is supposed to absorb. Infra failures on the
//! asynchronous side (relay, consumer, reconciler) never propagate to the
//! user-facing request; the only synchronous failure a business caller sees
//! is the outbox append inside its own transaction, which is exactly the
//! failure that means the fact itself did not commit.

use thiserror::Error;

use crate::event::EventType;
use crate::types::{EntityId, EventId, Topic};

/// Result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
/// Result alias for outbox publishing.
pub type OutboxResult<T> = Result<T, OutboxError>;
/// Result alias for counter-store operations.
pub type CounterResult<T> = Result<T, CounterError>;
/// Result alias for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;
/// Result alias for consumer wiring and dispatch.
pub type ConsumerResult<T> = Result<T, ConsumerError>;

/// Failures encoding or decoding the event envelope wire format.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Serializing an envelope or payload to JSON failed.
    #[error("failed to encode event envelope: {0}")]
    Encode(#[source] serde_json::Error),

    /// The raw message was not a well-formed envelope.
    #[error("failed to decode event envelope: {0}")]
    Decode(#[source] serde_json::Error),

    /// The envelope named an event type this system does not know.
    /// Unprocessable: route to the dead-letter topic, never crash the loop.
    #[error("unknown event type '{0}'")]
    UnknownEventType(String),

    /// The event id field was not a valid snowflake id.
    #[error("invalid event id '{0}'")]
    InvalidEventId(String),
}

/// Failures at the durable storage seam (outbox, dead letters, aggregates).
#[derive(Debug, Error)]
pub enum StorageError {
    /// The aggregate row for an entity no longer exists, e.g. the entity was
    /// deleted concurrently with a reconciliation pass.
    #[error("entity {0} no longer exists")]
    EntityMissing(EntityId),

    /// An outbox record that should exist was not found.
    #[error("outbox record {0} not found")]
    RecordNotFound(EventId),

    /// The storage backend failed.
    #[error("storage backend failure during {operation}: {detail}")]
    Backend {
        /// The logical operation that failed.
        operation: &'static str,
        /// Backend-specific failure detail.
        detail: String,
    },
}

impl StorageError {
    /// Shorthand for a backend failure with an operation label.
    pub fn backend(operation: &'static str, detail: impl Into<String>) -> Self {
        Self::Backend {
            operation,
            detail: detail.into(),
        }
    }
}

/// Failures publishing through the transactional outbox.
#[derive(Debug, Error)]
pub enum OutboxError {
    /// The publisher is not registered for this event type. A programming
    /// or configuration error, not a runtime client error.
    #[error("event type {0} is not registered for this publisher")]
    UnsupportedEventType(EventType),

    /// Envelope serialization failed.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The outbox append itself failed; the enclosing business transaction
    /// must fail with it.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Failures at the hot-path counter store.
#[derive(Debug, Error)]
pub enum CounterError {
    /// The counter backend failed.
    #[error("counter store failure during {operation}: {detail}")]
    Backend {
        /// The scripted operation that failed.
        operation: &'static str,
        /// Backend-specific failure detail.
        detail: String,
    },

    /// A stored counter value could not be interpreted as an integer.
    #[error("malformed counter value for key '{key}': {detail}")]
    MalformedValue {
        /// The key holding the malformed value.
        key: String,
        /// What was wrong with it.
        detail: String,
    },
}

impl CounterError {
    /// Shorthand for a backend failure with an operation label.
    pub fn backend(operation: &'static str, detail: impl Into<String>) -> Self {
        Self::Backend {
            operation,
            detail: detail.into(),
        }
    }
}

/// Failures at the message broker seam.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Publishing to a topic failed.
    #[error("failed to publish to topic '{topic}': {detail}")]
    PublishFailed {
        /// The target topic.
        topic: Topic,
        /// Broker-specific failure detail.
        detail: String,
    },

    /// The subscription's topic was closed; no further deliveries.
    #[error("subscription to topic '{topic}' closed")]
    SubscriptionClosed {
        /// The topic that closed.
        topic: Topic,
    },

    /// An acknowledgment referenced a delivery the broker is not tracking.
    #[error("unknown delivery tag {0}")]
    UnknownDelivery(u64),
}

/// Failures wiring or running an event consumer.
#[derive(Debug, Error)]
pub enum ConsumerError {
    /// A handler for this event type is already registered; dispatch is a
    /// hard 1:1 table.
    #[error("handler for event type {0} already registered")]
    DuplicateHandler(EventType),

    /// No handler is registered for this event type.
    #[error("no handler registered for event type {0}")]
    MissingHandler(EventType),

    /// Envelope decoding failed.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The broker failed.
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Failure returned by an event handler.
///
/// Handlers classify their own failures: a retryable failure withholds the
/// acknowledgment and rides the broker's redelivery-with-backoff up to the
/// attempt cap; a non-retryable one (a business-rule violation that
/// redelivery cannot fix) is acknowledged and logged instead of looping to
/// the dead-letter topic.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
    retryable: bool,
}

impl HandlerError {
    /// A failure that redelivery may resolve (transient infra failure).
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// A failure redelivery cannot fix; acknowledge and log.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    /// Whether the broker should redeliver this message.
    pub const fn is_retryable(&self) -> bool {
        self.retryable
    }
}

/// Per-entity failure during a reconciliation pass. Isolated: one entity's
/// error never affects its siblings in the same pass.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Claiming or clearing hot-path state failed.
    #[error(transparent)]
    Counter(#[from] CounterError),

    /// The durable apply failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Publishing the follow-up event failed.
    #[error(transparent)]
    Outbox(#[from] OutboxError),
}

/// Per-combination failure during a ranking pass.
#[derive(Debug, Error)]
pub enum RankingError {
    /// The ranking query failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Publishing the ranking-updated event failed.
    #[error(transparent)]
    Outbox(#[from] OutboxError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_error_classification() {
        assert!(HandlerError::retryable("broker hiccup").is_retryable());
        assert!(!HandlerError::fatal("board gone").is_retryable());
    }

    #[test]
    fn unsupported_event_type_names_the_type() {
        let error = OutboxError::UnsupportedEventType(EventType::BoardCreated);
        assert!(error.to_string().contains("BOARD_CREATED"));
    }
}
