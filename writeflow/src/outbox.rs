//! Transactional outbox writer.
//!
//! [`OutboxWriter::publish`] runs inside the caller's already-open unit of
//! work: it mints a snowflake id, serializes the envelope, and stages exactly
//! one [`OutboxRecord`] through that unit of work. Committing the business
//! transaction and persisting the record are therefore atomic — the event
//! exists if and only if the fact it describes durably committed. Relay to
//! the broker happens asynchronously, decoupling commit durability from
//! broker availability.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, instrument};

use crate::errors::{OutboxError, OutboxResult};
use crate::event::{EventEnvelope, EventPayload, EventType};
use crate::snowflake::Snowflake;
use crate::store::{OutboxRecord, Storage};
use crate::types::EventId;

/// Publishes events through the transactional outbox.
///
/// A writer declares the event types it is allowed to emit at construction;
/// publishing an undeclared type is rejected as a configuration error rather
/// than silently accepted.
pub struct OutboxWriter<S: Storage> {
    storage: Arc<S>,
    ids: Arc<Snowflake>,
    supported: HashSet<EventType>,
}

impl<S: Storage> OutboxWriter<S> {
    /// Creates a writer registered for the given event types.
    pub fn new(
        storage: Arc<S>,
        ids: Arc<Snowflake>,
        supported: impl IntoIterator<Item = EventType>,
    ) -> Self {
        Self {
            storage,
            ids,
            supported: supported.into_iter().collect(),
        }
    }

    /// Creates a writer registered for the whole event-type set.
    pub fn for_all_types(storage: Arc<S>, ids: Arc<Snowflake>) -> Self {
        Self::new(storage, ids, EventType::ALL)
    }

    /// Stages exactly one outbox record for `payload` inside the caller's
    /// open unit of work, returning the minted event id.
    #[instrument(
        name = "outbox.publish",
        skip(self, uow, payload),
        fields(event_type = %payload.event_type())
    )]
    pub async fn publish(
        &self,
        uow: &mut S::UnitOfWork,
        payload: &EventPayload,
    ) -> OutboxResult<EventId> {
        let event_type = payload.event_type();
        if !self.supported.contains(&event_type) {
            return Err(OutboxError::UnsupportedEventType(event_type));
        }

        let event_id = self.ids.next_id();
        let envelope = EventEnvelope::new(event_id, payload)?;
        let record = OutboxRecord::new(event_id, event_type, envelope.encode()?);

        self.storage.append_outbox(uow, &record).await?;

        debug!(event_id = %event_id, "staged outbox record");
        Ok(event_id)
    }
}
