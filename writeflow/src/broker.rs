//! Message broker seam.
//!
//! The relay publishes serialized envelopes to a topic; consumers subscribe
//! with a stable group id and acknowledge per delivery. Redelivery with
//! backoff and automatic dead-letter routing after the attempt cap are the
//! broker's responsibility — the consumer only decides ack vs. nack.

use async_trait::async_trait;

use crate::errors::BrokerResult;
use crate::types::{ConsumerGroup, Topic};

/// One message handed to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Broker-assigned tag, valid for ack/nack on the owning subscription.
    pub tag: u64,
    /// The raw serialized envelope.
    pub payload: String,
    /// 1-based delivery attempt. Anything above 1 is a redelivery.
    pub attempt: u32,
}

/// A consumer-group subscription to one topic.
#[async_trait]
pub trait BrokerSubscription: Send {
    /// Waits for the next delivery.
    ///
    /// Returns [`crate::BrokerError::SubscriptionClosed`] once the topic is
    /// closed and drained; the consumer loop treats that as shutdown.
    async fn next_delivery(&mut self) -> BrokerResult<Delivery>;

    /// Acknowledges a delivery; the offset advances and the message is done.
    async fn ack(&mut self, delivery: &Delivery) -> BrokerResult<()>;

    /// Refuses a delivery. The broker redelivers with backoff until the
    /// attempt cap, then routes the message to the companion dead-letter
    /// topic; the offset advances either way.
    async fn nack(&mut self, delivery: &Delivery) -> BrokerResult<()>;
}

/// A message broker with topic-based publish/subscribe.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// The subscription handle type.
    type Subscription: BrokerSubscription;

    /// Publishes a serialized envelope to a topic.
    async fn publish(&self, topic: &Topic, message: &str) -> BrokerResult<()>;

    /// Subscribes a consumer group to a topic.
    async fn subscribe(
        &self,
        topic: &Topic,
        group: &ConsumerGroup,
    ) -> BrokerResult<Self::Subscription>;
}
