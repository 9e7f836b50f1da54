//! Conversation-level records: channels, reactions, read cursors.

use serde::{Deserialize, Serialize};

use crate::{ChannelId, FeedError, MessageId, Timestamp, UserId};

/// A conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    /// Channel id.
    pub id: ChannelId,
    /// Display name.
    pub name: String,
    /// Display description.
    #[serde(default)]
    pub description: Option<String>,
    /// Owner; may always author and pin.
    #[serde(default)]
    pub owner_id: Option<UserId>,
    /// Weak reference to the pinned message.
    #[serde(default)]
    pub pinned_message_id: Option<MessageId>,
    /// Participant count summary.
    #[serde(default)]
    pub member_count: u32,
    /// When set, only the owner may author new messages.
    #[serde(default)]
    pub restricted: bool,
}

impl Channel {
    /// Whether `user` may author new messages here.
    pub fn can_author(&self, user: &UserId) -> bool {
        !self.restricted || self.owner_id.as_ref() == Some(user)
    }

    /// Decode a JSON row.
    pub fn from_row(row: &serde_json::Value) -> Result<Self, FeedError> {
        serde_json::from_value(row.clone()).map_err(FeedError::Deserialization)
    }
}

/// One user's emoji on one message.
///
/// At most one instance exists per (message, user, emoji).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reaction {
    /// Message reacted to.
    pub message_id: MessageId,
    /// User who reacted.
    pub user_id: UserId,
    /// Emoji symbol.
    pub emoji: String,
}

impl Reaction {
    /// Create a reaction record.
    pub fn new(message_id: MessageId, user_id: UserId, emoji: impl Into<String>) -> Self {
        Self {
            message_id,
            user_id,
            emoji: emoji.into(),
        }
    }

    /// Decode a JSON row; extra columns (row id, channel id) are ignored.
    pub fn from_row(row: &serde_json::Value) -> Result<Self, FeedError> {
        serde_json::from_value(row.clone()).map_err(FeedError::Deserialization)
    }
}

/// Last message a user is considered to have seen in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadCursor {
    /// Conversation.
    pub channel_id: ChannelId,
    /// Reader.
    pub user_id: UserId,
    /// When the read was recorded.
    pub last_read_at: Timestamp,
    /// Newest message visible at that time.
    #[serde(default)]
    pub last_message_id: Option<MessageId>,
}
