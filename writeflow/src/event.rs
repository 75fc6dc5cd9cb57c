//! Event model and wire codec.
//!
//! Event types form a closed, enumerable set; the payload is a tagged union
//! with one variant per type, and dispatch downstream is keyed on the
//! discriminant. The wire format is a JSON envelope
//! `{"eventId": "<i64>", "type": "<TYPE>", "payload": {...}}` — the id is
//! carried as a decimal string so 64-bit values survive JSON number
//! precision, and consumers ignore unknown payload fields for forward
//! compatibility.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::CodecError;
use crate::store::{RankingEntry, RankingMetric, RankingPeriod};
use crate::types::{EntityId, EventId, UserId};

/// The closed set of event types this system produces and consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    /// A board (article) was created.
    BoardCreated,
    /// A board was updated.
    BoardUpdated,
    /// A board was deleted.
    BoardDeleted,
    /// A user liked a board.
    BoardLiked,
    /// A user withdrew a like.
    BoardUnliked,
    /// Reconciled view total for a board changed.
    BoardViewed,
    /// A comment was created.
    CommentCreated,
    /// A comment was updated.
    CommentUpdated,
    /// A comment was deleted.
    CommentDeleted,
    /// A ranking snapshot was recomputed.
    RankingUpdated,
    /// An email notification should be sent.
    EmailNotification,
    /// Hot-path view increment signal.
    IncrementView,
}

impl EventType {
    /// Every member of the closed set, in declaration order.
    pub const ALL: [Self; 12] = [
        Self::BoardCreated,
        Self::BoardUpdated,
        Self::BoardDeleted,
        Self::BoardLiked,
        Self::BoardUnliked,
        Self::BoardViewed,
        Self::CommentCreated,
        Self::CommentUpdated,
        Self::CommentDeleted,
        Self::RankingUpdated,
        Self::EmailNotification,
        Self::IncrementView,
    ];

    /// The wire name of this type.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BoardCreated => "BOARD_CREATED",
            Self::BoardUpdated => "BOARD_UPDATED",
            Self::BoardDeleted => "BOARD_DELETED",
            Self::BoardLiked => "BOARD_LIKED",
            Self::BoardUnliked => "BOARD_UNLIKED",
            Self::BoardViewed => "BOARD_VIEWED",
            Self::CommentCreated => "COMMENT_CREATED",
            Self::CommentUpdated => "COMMENT_UPDATED",
            Self::CommentDeleted => "COMMENT_DELETED",
            Self::RankingUpdated => "RANKING_UPDATED",
            Self::EmailNotification => "EMAIL_NOTIFICATION",
            Self::IncrementView => "INCREMENT_VIEW",
        }
    }

    /// Parses a wire name; `None` for anything outside the registered set.
    pub fn from_wire(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == raw)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of a board lifecycle event (created/updated/deleted).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardPayload {
    /// The board the event is about.
    pub board_id: EntityId,
    /// The author.
    pub writer_id: UserId,
    /// Board title at event time.
    pub title: String,
    /// Board content at event time.
    pub content: String,
}

/// Payload of a like/unlike event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardReactionPayload {
    /// The board being reacted to.
    pub board_id: EntityId,
    /// The reacting user.
    pub user_id: UserId,
}

/// Payload of a reconciled-view-total event. Carries the new durable total,
/// not the raw delta, so read-model consumers need no offset tracking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardViewPayload {
    /// The board whose total changed.
    pub board_id: EntityId,
    /// The new durable view total.
    pub view_count: i64,
}

/// Payload of a comment lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentPayload {
    /// The comment the event is about.
    pub comment_id: EntityId,
    /// The board the comment belongs to.
    pub board_id: EntityId,
    /// The comment author.
    pub writer_id: UserId,
    /// Comment content at event time.
    pub content: String,
}

/// Payload of a ranking snapshot event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankingPayload {
    /// The ranked metric.
    pub metric: RankingMetric,
    /// The ranking window.
    pub period: RankingPeriod,
    /// Top entities, best first.
    pub entries: Vec<RankingEntry>,
}

/// Payload of an email notification request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailPayload {
    /// The recipient.
    pub recipient_id: UserId,
    /// Mail subject.
    pub subject: String,
    /// Mail body.
    pub body: String,
}

/// Payload of a hot-path view increment signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewDeltaPayload {
    /// The board that was viewed.
    pub board_id: EntityId,
    /// The pending (not yet reconciled) delta after this increment.
    pub pending_delta: i64,
}

/// Tagged union of every event payload, one variant per [`EventType`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPayload {
    /// See [`EventType::BoardCreated`].
    BoardCreated(BoardPayload),
    /// See [`EventType::BoardUpdated`].
    BoardUpdated(BoardPayload),
    /// See [`EventType::BoardDeleted`].
    BoardDeleted(BoardPayload),
    /// See [`EventType::BoardLiked`].
    BoardLiked(BoardReactionPayload),
    /// See [`EventType::BoardUnliked`].
    BoardUnliked(BoardReactionPayload),
    /// See [`EventType::BoardViewed`].
    BoardViewed(BoardViewPayload),
    /// See [`EventType::CommentCreated`].
    CommentCreated(CommentPayload),
    /// See [`EventType::CommentUpdated`].
    CommentUpdated(CommentPayload),
    /// See [`EventType::CommentDeleted`].
    CommentDeleted(CommentPayload),
    /// See [`EventType::RankingUpdated`].
    RankingUpdated(RankingPayload),
    /// See [`EventType::EmailNotification`].
    EmailNotification(EmailPayload),
    /// See [`EventType::IncrementView`].
    IncrementView(ViewDeltaPayload),
}

impl EventPayload {
    /// The discriminant of this payload.
    pub const fn event_type(&self) -> EventType {
        match self {
            Self::BoardCreated(_) => EventType::BoardCreated,
            Self::BoardUpdated(_) => EventType::BoardUpdated,
            Self::BoardDeleted(_) => EventType::BoardDeleted,
            Self::BoardLiked(_) => EventType::BoardLiked,
            Self::BoardUnliked(_) => EventType::BoardUnliked,
            Self::BoardViewed(_) => EventType::BoardViewed,
            Self::CommentCreated(_) => EventType::CommentCreated,
            Self::CommentUpdated(_) => EventType::CommentUpdated,
            Self::CommentDeleted(_) => EventType::CommentDeleted,
            Self::RankingUpdated(_) => EventType::RankingUpdated,
            Self::EmailNotification(_) => EventType::EmailNotification,
            Self::IncrementView(_) => EventType::IncrementView,
        }
    }

    fn to_value(&self) -> Result<Value, CodecError> {
        let value = match self {
            Self::BoardCreated(p) | Self::BoardUpdated(p) | Self::BoardDeleted(p) => {
                serde_json::to_value(p)
            }
            Self::BoardLiked(p) | Self::BoardUnliked(p) => serde_json::to_value(p),
            Self::BoardViewed(p) => serde_json::to_value(p),
            Self::CommentCreated(p) | Self::CommentUpdated(p) | Self::CommentDeleted(p) => {
                serde_json::to_value(p)
            }
            Self::RankingUpdated(p) => serde_json::to_value(p),
            Self::EmailNotification(p) => serde_json::to_value(p),
            Self::IncrementView(p) => serde_json::to_value(p),
        };
        value.map_err(CodecError::Encode)
    }

    fn from_value(event_type: EventType, value: Value) -> Result<Self, CodecError> {
        fn decode<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, CodecError> {
            serde_json::from_value(value).map_err(CodecError::Decode)
        }

        Ok(match event_type {
            EventType::BoardCreated => Self::BoardCreated(decode(value)?),
            EventType::BoardUpdated => Self::BoardUpdated(decode(value)?),
            EventType::BoardDeleted => Self::BoardDeleted(decode(value)?),
            EventType::BoardLiked => Self::BoardLiked(decode(value)?),
            EventType::BoardUnliked => Self::BoardUnliked(decode(value)?),
            EventType::BoardViewed => Self::BoardViewed(decode(value)?),
            EventType::CommentCreated => Self::CommentCreated(decode(value)?),
            EventType::CommentUpdated => Self::CommentUpdated(decode(value)?),
            EventType::CommentDeleted => Self::CommentDeleted(decode(value)?),
            EventType::RankingUpdated => Self::RankingUpdated(decode(value)?),
            EventType::EmailNotification => Self::EmailNotification(decode(value)?),
            EventType::IncrementView => Self::IncrementView(decode(value)?),
        })
    }
}

/// The durable wire envelope: `{eventId, type, payload}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    /// Snowflake id, serialized as a decimal string.
    #[serde(with = "id_string")]
    pub event_id: EventId,
    /// The registered event type.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Type-specific payload object. Kept as raw JSON so unknown fields
    /// survive re-encoding.
    pub payload: Value,
}

/// Decode-side shape: the type field stays a plain string until it is
/// checked against the registered set.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEnvelope {
    event_id: String,
    #[serde(rename = "type")]
    event_type: String,
    payload: Value,
}

impl EventEnvelope {
    /// Wraps a typed payload into an envelope under the given id.
    pub fn new(event_id: EventId, payload: &EventPayload) -> Result<Self, CodecError> {
        Ok(Self {
            event_id,
            event_type: payload.event_type(),
            payload: payload.to_value()?,
        })
    }

    /// Serializes the envelope to its JSON wire form.
    pub fn encode(&self) -> Result<String, CodecError> {
        serde_json::to_string(self).map_err(CodecError::Encode)
    }

    /// Parses a raw wire message.
    ///
    /// An unregistered `type` or malformed id yields a [`CodecError`]; the
    /// consumer routes such messages to the dead-letter topic rather than
    /// crashing its loop.
    pub fn decode(raw: &str) -> Result<Self, CodecError> {
        let raw: RawEnvelope = serde_json::from_str(raw).map_err(CodecError::Decode)?;

        let event_type = EventType::from_wire(&raw.event_type)
            .ok_or_else(|| CodecError::UnknownEventType(raw.event_type.clone()))?;

        let event_id = raw
            .event_id
            .parse::<i64>()
            .ok()
            .and_then(|id| EventId::try_new(id).ok())
            .ok_or_else(|| CodecError::InvalidEventId(raw.event_id.clone()))?;

        Ok(Self {
            event_id,
            event_type,
            payload: raw.payload,
        })
    }

    /// Decodes the payload into its typed representation.
    pub fn typed_payload(&self) -> Result<EventPayload, CodecError> {
        EventPayload::from_value(self.event_type, self.payload.clone())
    }
}

mod id_string {
    use serde::{Deserializer, Serializer};

    use crate::types::EventId;

    pub fn serialize<S: Serializer>(id: &EventId, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&i64::from(*id))
    }

    #[allow(dead_code)] // Envelope decoding goes through RawEnvelope, kept for symmetry
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<EventId, D::Error> {
        use serde::de::Error;
        use serde::Deserialize;

        let raw = String::deserialize(deserializer)?;
        let parsed: i64 = raw.parse().map_err(D::Error::custom)?;
        EventId::try_new(parsed).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn board_payload() -> EventPayload {
        EventPayload::BoardCreated(BoardPayload {
            board_id: EntityId::try_new(42).unwrap(),
            writer_id: UserId::try_new(7).unwrap(),
            title: "hello".to_string(),
            content: "world".to_string(),
        })
    }

    #[test]
    fn envelope_roundtrips_through_wire_format() {
        let id = EventId::try_new(123_456_789_012_345).unwrap();
        let envelope = EventEnvelope::new(id, &board_payload()).unwrap();

        let raw = envelope.encode().unwrap();
        let decoded = EventEnvelope::decode(&raw).unwrap();

        assert_eq!(decoded, envelope);
        assert_eq!(decoded.typed_payload().unwrap(), board_payload());
    }

    #[test]
    fn event_id_is_a_string_on_the_wire() {
        let id = EventId::try_new(9_007_199_254_740_993).unwrap(); // > 2^53
        let envelope = EventEnvelope::new(id, &board_payload()).unwrap();
        let raw = envelope.encode().unwrap();

        assert!(raw.contains(r#""eventId":"9007199254740993""#));
    }

    #[test]
    fn unknown_type_is_rejected_not_panicked() {
        let raw = r#"{"eventId":"1","type":"BOARD_EXPLODED","payload":{}}"#;
        match EventEnvelope::decode(raw) {
            Err(CodecError::UnknownEventType(t)) => assert_eq!(t, "BOARD_EXPLODED"),
            other => panic!("expected UnknownEventType, got {other:?}"),
        }
    }

    #[test]
    fn malformed_event_id_is_rejected() {
        let raw = r#"{"eventId":"not-a-number","type":"BOARD_CREATED","payload":{}}"#;
        assert!(matches!(
            EventEnvelope::decode(raw),
            Err(CodecError::InvalidEventId(_))
        ));
    }

    #[test]
    fn unknown_payload_fields_are_ignored() {
        let raw = r#"{"eventId":"1","type":"BOARD_LIKED","payload":{"boardId":42,"userId":7,"futureField":true}}"#;
        let envelope = EventEnvelope::decode(raw).unwrap();
        let payload = envelope.typed_payload().unwrap();
        assert_eq!(
            payload,
            EventPayload::BoardLiked(BoardReactionPayload {
                board_id: EntityId::try_new(42).unwrap(),
                user_id: UserId::try_new(7).unwrap(),
            })
        );
    }

    #[test]
    fn wire_names_roundtrip_for_the_whole_set() {
        for event_type in EventType::ALL {
            assert_eq!(EventType::from_wire(event_type.as_str()), Some(event_type));
        }
        assert_eq!(EventType::from_wire("SOMETHING_ELSE"), None);
    }
}
