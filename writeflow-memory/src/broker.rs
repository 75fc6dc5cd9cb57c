//! In-memory message broker with at-least-once delivery semantics.
//!
//! Topics are retained logs; each consumer group owns a committed offset and
//! at most one in-flight delivery. A nacked delivery is redelivered after an
//! exponential backoff until the attempt cap, then auto-routed to the
//! topic's companion dead-letter topic — the same contract a production
//! broker's retry topology provides, so consumer tests exercise the real
//! failure paths.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use writeflow::{
    BrokerError, BrokerResult, BrokerSubscription, ConsumerGroup, Delivery, MessageBroker,
    RetryStrategy, Topic,
};

/// Broker delivery tuning.
#[derive(Debug, Clone)]
pub struct InMemoryBrokerConfig {
    /// Delivery attempts per message before dead-letter routing.
    pub max_attempts: u32,
    /// Backoff schedule between redeliveries.
    pub retry: RetryStrategy,
}

impl Default for InMemoryBrokerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry: RetryStrategy {
                max_attempts: 3,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(100),
                backoff_multiplier: 2.0,
                use_jitter: false,
            },
        }
    }
}

/// Thread-safe in-memory implementation of [`MessageBroker`].
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    config: Arc<InMemoryBrokerConfig>,
    inner: Arc<Mutex<BrokerState>>,
}

#[derive(Default)]
struct BrokerState {
    logs: HashMap<Topic, Vec<String>>,
    cursors: HashMap<CursorKey, GroupCursor>,
    closed: HashMap<Topic, bool>,
    publish_failures: HashMap<Topic, u32>,
}

type CursorKey = (Topic, ConsumerGroup);

#[derive(Default)]
struct GroupCursor {
    next_index: usize,
    next_tag: u64,
    inflight: Option<Inflight>,
}

struct Inflight {
    tag: u64,
    index: usize,
    attempt: u32,
    awaiting_ack: bool,
    not_before: Instant,
}

impl InMemoryBroker {
    /// Creates a broker with default delivery tuning.
    pub fn new() -> Self {
        Self::with_config(InMemoryBrokerConfig::default())
    }

    /// Creates a broker with the given delivery tuning.
    pub fn with_config(config: InMemoryBrokerConfig) -> Self {
        Self {
            config: Arc::new(config),
            inner: Arc::new(Mutex::new(BrokerState::default())),
        }
    }

    /// All messages ever published to a topic, in publish order.
    pub fn published(&self, topic: &Topic) -> Vec<String> {
        let state = self.inner.lock().expect("Mutex poisoned");
        state.logs.get(topic).cloned().unwrap_or_default()
    }

    /// The committed offset of a consumer group on a topic.
    pub fn committed_offset(&self, topic: &Topic, group: &ConsumerGroup) -> usize {
        let state = self.inner.lock().expect("Mutex poisoned");
        state
            .cursors
            .get(&(topic.clone(), group.clone()))
            .map_or(0, |cursor| cursor.next_index)
    }

    /// Closes a topic: once drained, subscriptions see
    /// [`BrokerError::SubscriptionClosed`].
    pub fn close_topic(&self, topic: &Topic) {
        let mut state = self.inner.lock().expect("Mutex poisoned");
        state.closed.insert(topic.clone(), true);
    }

    /// Makes the next `count` publishes to `topic` fail, for exercising the
    /// relay's retry and dead-letter paths.
    pub fn inject_publish_failures(&self, topic: &Topic, count: u32) {
        let mut state = self.inner.lock().expect("Mutex poisoned");
        state.publish_failures.insert(topic.clone(), count);
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    type Subscription = InMemorySubscription;

    async fn publish(&self, topic: &Topic, message: &str) -> BrokerResult<()> {
        let mut state = self.inner.lock().expect("Mutex poisoned");

        if let Some(remaining) = state.publish_failures.get_mut(topic) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(BrokerError::PublishFailed {
                    topic: topic.clone(),
                    detail: "injected publish failure".to_string(),
                });
            }
        }

        state.logs.entry(topic.clone()).or_default().push(message.to_string());
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &Topic,
        group: &ConsumerGroup,
    ) -> BrokerResult<Self::Subscription> {
        let mut state = self.inner.lock().expect("Mutex poisoned");
        state
            .cursors
            .entry((topic.clone(), group.clone()))
            .or_default();
        Ok(InMemorySubscription {
            config: Arc::clone(&self.config),
            inner: Arc::clone(&self.inner),
            topic: topic.clone(),
            group: group.clone(),
        })
    }
}

/// A consumer-group subscription handle.
pub struct InMemorySubscription {
    config: Arc<InMemoryBrokerConfig>,
    inner: Arc<Mutex<BrokerState>>,
    topic: Topic,
    group: ConsumerGroup,
}

impl InMemorySubscription {
    fn key(&self) -> CursorKey {
        (self.topic.clone(), self.group.clone())
    }

    /// One poll step: `Ok(Some)` hands out a delivery, `Ok(None)` means
    /// nothing deliverable right now.
    fn try_next(&self) -> BrokerResult<Option<Delivery>> {
        let now = Instant::now();
        let mut state = self.inner.lock().expect("Mutex poisoned");
        let state = &mut *state;

        let log_len = state.logs.get(&self.topic).map_or(0, Vec::len);
        let closed = state.closed.get(&self.topic).copied().unwrap_or(false);
        let cursor = state
            .cursors
            .get_mut(&self.key())
            .expect("cursor created at subscribe");

        if let Some(inflight) = cursor.inflight.as_mut() {
            if !inflight.awaiting_ack && now >= inflight.not_before {
                inflight.awaiting_ack = true;
                let payload = state.logs[&self.topic][inflight.index].clone();
                return Ok(Some(Delivery {
                    tag: inflight.tag,
                    payload,
                    attempt: inflight.attempt,
                }));
            }
            return Ok(None);
        }

        if cursor.next_index < log_len {
            let tag = cursor.next_tag;
            cursor.next_tag += 1;
            cursor.inflight = Some(Inflight {
                tag,
                index: cursor.next_index,
                attempt: 1,
                awaiting_ack: true,
                not_before: now,
            });
            let payload = state.logs[&self.topic][cursor.next_index].clone();
            return Ok(Some(Delivery {
                tag,
                payload,
                attempt: 1,
            }));
        }

        if closed {
            return Err(BrokerError::SubscriptionClosed {
                topic: self.topic.clone(),
            });
        }
        Ok(None)
    }

    fn take_inflight(&self, delivery: &Delivery) -> BrokerResult<(Inflight, usize)> {
        let mut state = self.inner.lock().expect("Mutex poisoned");
        let cursor = state
            .cursors
            .get_mut(&self.key())
            .expect("cursor created at subscribe");

        let matches = cursor
            .inflight
            .as_ref()
            .is_some_and(|inflight| inflight.tag == delivery.tag && inflight.awaiting_ack);
        if !matches {
            return Err(BrokerError::UnknownDelivery(delivery.tag));
        }

        let inflight = cursor.inflight.take().expect("matched above");
        let index = inflight.index;
        Ok((inflight, index))
    }
}

#[async_trait]
impl BrokerSubscription for InMemorySubscription {
    async fn next_delivery(&mut self) -> BrokerResult<Delivery> {
        loop {
            match self.try_next()? {
                Some(delivery) => return Ok(delivery),
                None => tokio::time::sleep(Duration::from_millis(2)).await,
            }
        }
    }

    async fn ack(&mut self, delivery: &Delivery) -> BrokerResult<()> {
        let (_, index) = self.take_inflight(delivery)?;
        let mut state = self.inner.lock().expect("Mutex poisoned");
        let key = self.key();
        let cursor = state.cursors.get_mut(&key).expect("cursor exists");
        cursor.next_index = index + 1;
        Ok(())
    }

    async fn nack(&mut self, delivery: &Delivery) -> BrokerResult<()> {
        let (mut inflight, index) = self.take_inflight(delivery)?;

        if inflight.attempt >= self.config.max_attempts {
            // Attempts exhausted: auto-route to the dead-letter topic and
            // advance the offset so the group never loops on the message.
            let dead_letter_topic = self.topic.dead_letter();
            let mut state = self.inner.lock().expect("Mutex poisoned");
            let payload = state.logs[&self.topic][index].clone();
            state
                .logs
                .entry(dead_letter_topic)
                .or_default()
                .push(payload);
            let key = self.key();
            let cursor = state.cursors.get_mut(&key).expect("cursor exists");
            cursor.next_index = index + 1;
            return Ok(());
        }

        let delay = self.config.retry.delay_for(inflight.attempt);
        inflight.attempt += 1;
        inflight.awaiting_ack = false;
        inflight.not_before = Instant::now() + delay;

        let mut state = self.inner.lock().expect("Mutex poisoned");
        let key = self.key();
        let cursor = state.cursors.get_mut(&key).expect("cursor exists");
        cursor.inflight = Some(inflight);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topic() -> Topic {
        Topic::try_new("community-command").unwrap()
    }

    fn group() -> ConsumerGroup {
        ConsumerGroup::try_new("community-read").unwrap()
    }

    fn fast_config() -> InMemoryBrokerConfig {
        InMemoryBrokerConfig {
            max_attempts: 3,
            retry: RetryStrategy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                backoff_multiplier: 1.0,
                use_jitter: false,
            },
        }
    }

    #[tokio::test]
    async fn delivers_in_publish_order() {
        let broker = InMemoryBroker::with_config(fast_config());
        broker.publish(&topic(), "one").await.unwrap();
        broker.publish(&topic(), "two").await.unwrap();

        let mut sub = broker.subscribe(&topic(), &group()).await.unwrap();
        let first = sub.next_delivery().await.unwrap();
        assert_eq!(first.payload, "one");
        sub.ack(&first).await.unwrap();

        let second = sub.next_delivery().await.unwrap();
        assert_eq!(second.payload, "two");
        assert_eq!(second.attempt, 1);
    }

    #[tokio::test]
    async fn nack_redelivers_with_incremented_attempt() {
        let broker = InMemoryBroker::with_config(fast_config());
        broker.publish(&topic(), "flaky").await.unwrap();

        let mut sub = broker.subscribe(&topic(), &group()).await.unwrap();
        let first = sub.next_delivery().await.unwrap();
        assert_eq!(first.attempt, 1);
        sub.nack(&first).await.unwrap();

        let second = sub.next_delivery().await.unwrap();
        assert_eq!(second.attempt, 2);
        assert_eq!(second.payload, "flaky");
    }

    #[tokio::test]
    async fn exhausted_attempts_route_to_dead_letter_topic() {
        let broker = InMemoryBroker::with_config(fast_config());
        broker.publish(&topic(), "poison").await.unwrap();
        broker.publish(&topic(), "healthy").await.unwrap();

        let mut sub = broker.subscribe(&topic(), &group()).await.unwrap();
        for _ in 0..3 {
            let delivery = sub.next_delivery().await.unwrap();
            sub.nack(&delivery).await.unwrap();
        }

        // The poison message is gone from the main flow; the next delivery
        // is the healthy one and the offset advanced past the poison.
        let next = sub.next_delivery().await.unwrap();
        assert_eq!(next.payload, "healthy");
        assert_eq!(broker.published(&topic().dead_letter()), vec!["poison"]);
        assert_eq!(broker.committed_offset(&topic(), &group()), 1);
    }

    #[tokio::test]
    async fn stale_tags_are_rejected() {
        let broker = InMemoryBroker::with_config(fast_config());
        broker.publish(&topic(), "msg").await.unwrap();

        let mut sub = broker.subscribe(&topic(), &group()).await.unwrap();
        let delivery = sub.next_delivery().await.unwrap();
        sub.ack(&delivery).await.unwrap();

        assert!(matches!(
            sub.ack(&delivery).await,
            Err(BrokerError::UnknownDelivery(_))
        ));
    }

    #[tokio::test]
    async fn closed_topic_ends_the_subscription_after_drain() {
        let broker = InMemoryBroker::with_config(fast_config());
        broker.publish(&topic(), "last").await.unwrap();
        broker.close_topic(&topic());

        let mut sub = broker.subscribe(&topic(), &group()).await.unwrap();
        let delivery = sub.next_delivery().await.unwrap();
        sub.ack(&delivery).await.unwrap();

        assert!(matches!(
            sub.next_delivery().await,
            Err(BrokerError::SubscriptionClosed { .. })
        ));
    }
}
