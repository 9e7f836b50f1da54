//! Identity and ordering types for convo-sync.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Reserved prefix for client-generated message ids.
///
/// Server-assigned ids never start with this prefix.
pub const TEMP_ID_PREFIX: &str = "temp-";

/// Identifier of a message within a conversation.
///
/// Either server-assigned (opaque string) or a temporary id created by the
/// client for an optimistic entry (see [`MessageId::temporary`]).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Wrap a server-assigned id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh temporary id for an optimistic entry.
    pub fn temporary() -> Self {
        Self(format!("{}{}", TEMP_ID_PREFIX, uuid::Uuid::new_v4()))
    }

    /// Whether this id was generated locally and awaits replacement.
    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMP_ID_PREFIX)
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self.0)
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Identifier of a conversation (channel).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    /// Wrap a channel id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelId({})", self.0)
    }
}

impl From<&str> for ChannelId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Identifier of a participant.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Wrap a user id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserId({})", self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Groups the messages of one multi-attachment post.
///
/// UUID v4 format.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(uuid::Uuid);

impl BatchId {
    /// Create a new random BatchId.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Parse a BatchId from its hyphenated string form.
    pub fn parse(s: &str) -> Option<Self> {
        uuid::Uuid::parse_str(s).ok().map(Self)
    }

    /// Get the inner UUID.
    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BatchId({})", self.0)
    }
}

/// Milliseconds since the Unix epoch.
///
/// Messages in a conversation are ordered by this value; ties are broken
/// by message id.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Create a Timestamp from raw milliseconds.
    pub fn new(millis: u64) -> Self {
        Self(millis)
    }

    /// The current wall-clock time.
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self(millis)
    }

    /// The epoch, meaning "nothing seen yet".
    pub fn zero() -> Self {
        Self(0)
    }

    /// Get the raw millisecond value.
    pub fn value(&self) -> u64 {
        self.0
    }

    /// Add milliseconds without wrapping.
    pub fn saturating_add_millis(&self, millis: u64) -> Self {
        Self(self.0.saturating_add(millis))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temporary_ids_carry_prefix() {
        let id = MessageId::temporary();
        assert!(id.is_temporary());
        assert!(id.as_str().starts_with(TEMP_ID_PREFIX));
    }

    #[test]
    fn server_ids_are_not_temporary() {
        assert!(!MessageId::new("m1").is_temporary());
        assert!(!MessageId::new("tempest").is_temporary());
    }

    #[test]
    fn temporary_ids_are_unique() {
        assert_ne!(MessageId::temporary(), MessageId::temporary());
    }

    #[test]
    fn message_id_serializes_as_plain_string() {
        let json = serde_json::to_string(&MessageId::new("m42")).unwrap();
        assert_eq!(json, "\"m42\"");
    }

    #[test]
    fn batch_id_parse_roundtrip() {
        let original = BatchId::new();
        let parsed = BatchId::parse(&original.to_string()).unwrap();
        assert_eq!(original, parsed);
        assert!(BatchId::parse("not-a-uuid").is_none());
    }

    #[test]
    fn timestamp_ordering() {
        assert!(Timestamp::new(100) < Timestamp::new(200));
        assert_eq!(Timestamp::zero().value(), 0);
    }

    #[test]
    fn timestamp_saturating_add() {
        let t = Timestamp::new(u64::MAX);
        assert_eq!(t.saturating_add_millis(5).value(), u64::MAX);
    }

    #[test]
    fn timestamp_now_is_after_epoch() {
        assert!(Timestamp::now() > Timestamp::zero());
    }
}
