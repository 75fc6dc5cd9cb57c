//! Core identifier types for the write-path subsystem.
//!
//! All types use smart constructors so that a value, once constructed, is
//! valid everywhere it flows. Misconfiguration (a node id outside the 10-bit
//! range, an empty topic name) fails at construction time, never at the point
//! of use.

use nutype::nutype;

/// Identifier of one generator node in the cluster.
///
/// The snowflake layout reserves 10 bits for the node, so node ids live in
/// `0..=1023`. Disjoint node-id assignment is what makes ids unique across
/// processes; an out-of-range id is rejected here rather than producing
/// colliding ids at runtime.
#[nutype(
    validate(less_or_equal = 1023),
    derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, Into)
)]
pub struct NodeId(u16);

/// A snowflake identifier: 41 bits of elapsed milliseconds, 10 bits of node
/// id, 12 bits of per-millisecond sequence. The sign bit is unused, so every
/// id is non-negative.
///
/// Ids identify both domain facts and the events derived from them; the pair
/// `(event type, event id)` is unique across the whole system.
#[nutype(
    validate(greater_or_equal = 0),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Display,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct EventId(i64);

/// Identifier of a hot-path entity (a board, an article).
#[nutype(
    validate(greater_or_equal = 0),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Display,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct EntityId(i64);

/// Identifier of an acting user.
#[nutype(
    validate(greater_or_equal = 0),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Display,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct UserId(i64);

/// A broker topic name.
///
/// Each logical stream gets one topic; the companion dead-letter topic is
/// derived by suffix convention, see [`Topic::dead_letter`].
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct Topic(String);

impl Topic {
    /// Returns the companion dead-letter topic (`<topic>.dlt`).
    pub fn dead_letter(&self) -> Self {
        Self::try_new(format!("{}.dlt", self.as_ref()))
            .expect("suffixing a non-empty topic name keeps it non-empty")
    }
}

/// A broker consumer group id, stable per logical consumer.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct ConsumerGroup(String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_rejects_values_outside_ten_bits() {
        assert!(NodeId::try_new(0).is_ok());
        assert!(NodeId::try_new(1023).is_ok());
        assert!(NodeId::try_new(1024).is_err());
        assert!(NodeId::try_new(u16::MAX).is_err());
    }

    #[test]
    fn event_id_rejects_negative_values() {
        assert!(EventId::try_new(0).is_ok());
        assert!(EventId::try_new(i64::MAX).is_ok());
        assert!(EventId::try_new(-1).is_err());
    }

    #[test]
    fn topic_derives_dead_letter_by_suffix() {
        let topic = Topic::try_new("community-command").unwrap();
        assert_eq!(topic.dead_letter().as_ref(), "community-command.dlt");
    }

    #[test]
    fn topic_rejects_empty_names() {
        assert!(Topic::try_new("").is_err());
        assert!(Topic::try_new("   ").is_err());
    }

    #[test]
    fn consumer_group_trims_whitespace() {
        let group = ConsumerGroup::try_new("  community-read ").unwrap();
        assert_eq!(group.as_ref(), "community-read");
    }
}
