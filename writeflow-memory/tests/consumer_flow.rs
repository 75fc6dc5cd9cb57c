//! Consumer flow: at-least-once dispatch, broker redelivery with backoff,
//! and dead-letter routing that always advances the offset.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use writeflow::event::{BoardReactionPayload, EventPayload};
use writeflow::{
    ConsumerGroup, ConsumerRunner, EntityId, EventEnvelope, EventHandler, EventId, EventType,
    HandlerError, HandlerRegistry, MessageBroker, NodeId, RetryStrategy, Snowflake, Topic, UserId,
};
use writeflow_memory::{InMemoryBroker, InMemoryBrokerConfig};

fn topic() -> Topic {
    Topic::try_new("community-command").unwrap()
}

fn group() -> ConsumerGroup {
    ConsumerGroup::try_new("community-read").unwrap()
}

fn fast_broker(max_attempts: u32) -> Arc<InMemoryBroker> {
    Arc::new(InMemoryBroker::with_config(InMemoryBrokerConfig {
        max_attempts,
        retry: RetryStrategy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            backoff_multiplier: 1.0,
            use_jitter: false,
        },
    }))
}

fn liked_envelope(event_id: i64) -> String {
    EventEnvelope::new(
        EventId::try_new(event_id).unwrap(),
        &EventPayload::BoardLiked(BoardReactionPayload {
            board_id: EntityId::try_new(42).unwrap(),
            user_id: UserId::try_new(7).unwrap(),
        }),
    )
    .unwrap()
    .encode()
    .unwrap()
}

async fn wait_until(description: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for: {description}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

struct RecordingHandler {
    seen: Mutex<Vec<EventId>>,
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle(
        &self,
        envelope: &EventEnvelope,
        _payload: EventPayload,
    ) -> Result<(), HandlerError> {
        self.seen.lock().unwrap().push(envelope.event_id);
        Ok(())
    }
}

struct AlwaysFailingHandler {
    attempts: AtomicU32,
    retryable: bool,
}

#[async_trait]
impl EventHandler for AlwaysFailingHandler {
    async fn handle(
        &self,
        _envelope: &EventEnvelope,
        _payload: EventPayload,
    ) -> Result<(), HandlerError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.retryable {
            Err(HandlerError::retryable("read model unavailable"))
        } else {
            Err(HandlerError::fatal("board no longer exists"))
        }
    }
}

#[tokio::test]
async fn handled_events_are_acknowledged_and_the_offset_advances() {
    let broker = fast_broker(3);
    let handler = Arc::new(RecordingHandler {
        seen: Mutex::new(Vec::new()),
    });

    let mut registry = HandlerRegistry::new();
    registry
        .register(EventType::BoardLiked, handler.clone())
        .unwrap();

    let runner = Arc::new(ConsumerRunner::new(
        Arc::clone(&broker),
        topic(),
        group(),
        Arc::new(registry),
    ));
    runner.start().await.unwrap();

    let ids = Snowflake::new(NodeId::try_new(0).unwrap());
    let first = ids.next_id();
    let second = ids.next_id();
    broker
        .publish(&topic(), &liked_envelope(first.into()))
        .await
        .unwrap();
    broker
        .publish(&topic(), &liked_envelope(second.into()))
        .await
        .unwrap();

    wait_until("both events handled", || {
        handler.seen.lock().unwrap().len() == 2
    })
    .await;
    runner.stop().await;

    assert_eq!(*handler.seen.lock().unwrap(), vec![first, second]);
    assert_eq!(broker.committed_offset(&topic(), &group()), 2);
    assert!(broker.published(&topic().dead_letter()).is_empty());
}

#[tokio::test]
async fn retryable_failure_dead_letters_after_exactly_the_attempt_cap() {
    let broker = fast_broker(3);
    let handler = Arc::new(AlwaysFailingHandler {
        attempts: AtomicU32::new(0),
        retryable: true,
    });

    let mut registry = HandlerRegistry::new();
    registry
        .register(EventType::BoardLiked, handler.clone())
        .unwrap();

    let runner = Arc::new(ConsumerRunner::new(
        Arc::clone(&broker),
        topic(),
        group(),
        Arc::new(registry),
    ));
    runner.start().await.unwrap();

    broker
        .publish(&topic(), &liked_envelope(1))
        .await
        .unwrap();

    wait_until("message dead-lettered", || {
        !broker.published(&topic().dead_letter()).is_empty()
    })
    .await;

    // The offset still advances: no infinite reprocessing loop.
    wait_until("offset advanced", || {
        broker.committed_offset(&topic(), &group()) == 1
    })
    .await;
    runner.stop().await;

    assert_eq!(handler.attempts.load(Ordering::SeqCst), 3);
    assert_eq!(
        broker.published(&topic().dead_letter()),
        vec![liked_envelope(1)]
    );
}

#[tokio::test]
async fn non_retryable_failure_is_acknowledged_without_dead_lettering() {
    let broker = fast_broker(3);
    let handler = Arc::new(AlwaysFailingHandler {
        attempts: AtomicU32::new(0),
        retryable: false,
    });

    let mut registry = HandlerRegistry::new();
    registry
        .register(EventType::BoardLiked, handler.clone())
        .unwrap();

    let runner = Arc::new(ConsumerRunner::new(
        Arc::clone(&broker),
        topic(),
        group(),
        Arc::new(registry),
    ));
    runner.start().await.unwrap();

    broker
        .publish(&topic(), &liked_envelope(1))
        .await
        .unwrap();

    wait_until("offset advanced", || {
        broker.committed_offset(&topic(), &group()) == 1
    })
    .await;
    runner.stop().await;

    // Exactly one attempt, nothing dead-lettered.
    assert_eq!(handler.attempts.load(Ordering::SeqCst), 1);
    assert!(broker.published(&topic().dead_letter()).is_empty());
}

#[tokio::test]
async fn malformed_messages_go_straight_to_the_dead_letter_topic() {
    let broker = fast_broker(3);
    let handler = Arc::new(RecordingHandler {
        seen: Mutex::new(Vec::new()),
    });

    let mut registry = HandlerRegistry::new();
    registry
        .register(EventType::BoardLiked, handler.clone())
        .unwrap();

    let runner = Arc::new(ConsumerRunner::new(
        Arc::clone(&broker),
        topic(),
        group(),
        Arc::new(registry),
    ));
    runner.start().await.unwrap();

    broker.publish(&topic(), "not json at all").await.unwrap();
    broker
        .publish(
            &topic(),
            r#"{"eventId":"1","type":"BOARD_EXPLODED","payload":{}}"#,
        )
        .await
        .unwrap();
    broker
        .publish(&topic(), &liked_envelope(5))
        .await
        .unwrap();

    // The healthy message behind the two poison ones still gets handled.
    wait_until("healthy event handled", || {
        handler.seen.lock().unwrap().len() == 1
    })
    .await;
    runner.stop().await;

    assert_eq!(broker.published(&topic().dead_letter()).len(), 2);
    assert_eq!(broker.committed_offset(&topic(), &group()), 3);
}

#[tokio::test]
async fn unregistered_type_with_no_handler_is_unprocessable() {
    let broker = fast_broker(3);
    // Registry knows comment events only; a liked event has no handler.
    let mut registry = HandlerRegistry::new();
    registry
        .register(
            EventType::CommentCreated,
            Arc::new(RecordingHandler {
                seen: Mutex::new(Vec::new()),
            }),
        )
        .unwrap();

    let runner = Arc::new(ConsumerRunner::new(
        Arc::clone(&broker),
        topic(),
        group(),
        Arc::new(registry),
    ));
    runner.start().await.unwrap();

    broker
        .publish(&topic(), &liked_envelope(1))
        .await
        .unwrap();

    wait_until("message dead-lettered", || {
        !broker.published(&topic().dead_letter()).is_empty()
    })
    .await;
    runner.stop().await;

    assert_eq!(broker.committed_offset(&topic(), &group()), 1);
}
