//! Event consumption with a 1:1 handler-per-type dispatch table.
//!
//! A [`ConsumerRunner`] subscribes one consumer group to one topic, decodes
//! each delivery, and dispatches to the single handler registered for its
//! event type. The acknowledgment is withheld on retryable failures, letting
//! the broker's redelivery-with-backoff run up to its attempt cap before the
//! message auto-routes to the dead-letter topic. Delivery is at-least-once,
//! never exactly-once: handlers must be idempotent, keyed on the event id.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerSubscription, Delivery, MessageBroker};
use crate::errors::{BrokerError, ConsumerError, ConsumerResult, HandlerError};
use crate::event::{EventEnvelope, EventPayload, EventType};
use crate::types::{ConsumerGroup, Topic};

/// Processes one decoded event.
///
/// Implementations must be idempotent under redelivery. Failures are
/// classified by the handler itself: retryable failures ride the broker's
/// redelivery, non-retryable ones are acknowledged and logged.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Applies the event to the handler's read model or side effect.
    async fn handle(
        &self,
        envelope: &EventEnvelope,
        payload: EventPayload,
    ) -> Result<(), HandlerError>;
}

/// Hard 1:1 mapping from event type to handler.
///
/// Registering two handlers for one type is a configuration error — dispatch
/// here is a closed table, not a multi-subscriber bus.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<EventType, Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the handler for an event type.
    pub fn register(
        &mut self,
        event_type: EventType,
        handler: Arc<dyn EventHandler>,
    ) -> ConsumerResult<()> {
        if self.handlers.contains_key(&event_type) {
            return Err(ConsumerError::DuplicateHandler(event_type));
        }
        self.handlers.insert(event_type, handler);
        Ok(())
    }

    /// Looks up the handler for an event type.
    pub fn handler_for(&self, event_type: EventType) -> Option<&Arc<dyn EventHandler>> {
        self.handlers.get(&event_type)
    }

    /// The event types this registry can dispatch.
    pub fn registered_types(&self) -> impl Iterator<Item = EventType> + '_ {
        self.handlers.keys().copied()
    }
}

/// Background loop consuming one (topic, group) pair.
pub struct ConsumerRunner<B: MessageBroker> {
    broker: Arc<B>,
    topic: Topic,
    group: ConsumerGroup,
    registry: Arc<HandlerRegistry>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<B> ConsumerRunner<B>
where
    B: MessageBroker + 'static,
    B::Subscription: 'static,
{
    /// Creates a runner for the given topic and consumer group.
    pub fn new(
        broker: Arc<B>,
        topic: Topic,
        group: ConsumerGroup,
        registry: Arc<HandlerRegistry>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            broker,
            topic,
            group,
            registry,
            shutdown,
            task: Mutex::new(None),
        }
    }

    /// Subscribes and spawns the consume loop. Idempotent while running.
    pub async fn start(self: &Arc<Self>) -> ConsumerResult<()> {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return Ok(());
        }

        let mut subscription = self.broker.subscribe(&self.topic, &self.group).await?;
        let runner = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        *task = Some(tokio::spawn(async move {
            info!(topic = %runner.topic, group = %runner.group, "consumer started");
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    delivery = subscription.next_delivery() => match delivery {
                        Ok(delivery) => runner.process(&mut subscription, delivery).await,
                        Err(BrokerError::SubscriptionClosed { .. }) => break,
                        Err(error) => {
                            error!(%error, "subscription failed, stopping consumer");
                            break;
                        }
                    }
                }
            }
            info!(topic = %runner.topic, group = %runner.group, "consumer stopped");
        }));
        Ok(())
    }

    /// Signals the loop to stop and waits for it.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
    }

    async fn process(&self, subscription: &mut B::Subscription, delivery: Delivery) {
        let decoded = EventEnvelope::decode(&delivery.payload)
            .and_then(|envelope| envelope.typed_payload().map(|payload| (envelope, payload)));

        let (envelope, payload) = match decoded {
            Ok(decoded) => decoded,
            Err(codec_error) => {
                // Poison message: no amount of redelivery fixes a malformed
                // envelope or an unregistered type. Route it straight to the
                // dead-letter topic and advance the offset.
                error!(%codec_error, "unprocessable message, routing to dead-letter topic");
                self.route_to_dead_letter(subscription, &delivery).await;
                return;
            }
        };

        let Some(handler) = self.registry.handler_for(envelope.event_type) else {
            error!(event_type = %envelope.event_type, "no handler registered, routing to dead-letter topic");
            self.route_to_dead_letter(subscription, &delivery).await;
            return;
        };

        match handler.handle(&envelope, payload).await {
            Ok(()) => {
                debug!(event_id = %envelope.event_id, event_type = %envelope.event_type, "event handled");
                self.ack(subscription, &delivery).await;
            }
            Err(handler_error) if handler_error.is_retryable() => {
                warn!(
                    event_id = %envelope.event_id,
                    attempt = delivery.attempt,
                    %handler_error,
                    "handler failed, withholding ack for redelivery"
                );
                if let Err(error) = subscription.nack(&delivery).await {
                    error!(%error, "nack failed");
                }
            }
            Err(handler_error) => {
                error!(
                    event_id = %envelope.event_id,
                    %handler_error,
                    "non-retryable handler failure, acknowledging"
                );
                self.ack(subscription, &delivery).await;
            }
        }
    }

    async fn route_to_dead_letter(&self, subscription: &mut B::Subscription, delivery: &Delivery) {
        let dead_letter_topic = self.topic.dead_letter();
        if let Err(error) = self
            .broker
            .publish(&dead_letter_topic, &delivery.payload)
            .await
        {
            error!(%error, topic = %dead_letter_topic, "failed to dead-letter message");
        }
        self.ack(subscription, delivery).await;
    }

    async fn ack(&self, subscription: &mut B::Subscription, delivery: &Delivery) {
        if let Err(error) = subscription.ack(delivery).await {
            error!(%error, "ack failed; redelivery expected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopHandler;

    #[async_trait]
    impl EventHandler for NoopHandler {
        async fn handle(
            &self,
            _envelope: &EventEnvelope,
            _payload: EventPayload,
        ) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    #[test]
    fn registry_rejects_duplicate_registration() {
        let mut registry = HandlerRegistry::new();
        registry
            .register(EventType::BoardCreated, Arc::new(NoopHandler))
            .unwrap();

        let duplicate = registry.register(EventType::BoardCreated, Arc::new(NoopHandler));
        assert!(matches!(
            duplicate,
            Err(ConsumerError::DuplicateHandler(EventType::BoardCreated))
        ));
    }

    #[test]
    fn registry_dispatch_is_per_type() {
        let mut registry = HandlerRegistry::new();
        registry
            .register(EventType::BoardLiked, Arc::new(NoopHandler))
            .unwrap();

        assert!(registry.handler_for(EventType::BoardLiked).is_some());
        assert!(registry.handler_for(EventType::BoardUnliked).is_none());
    }
}
