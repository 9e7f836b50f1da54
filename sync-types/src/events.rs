//! Change events delivered by the hosted data service.
//!
//! The service pushes untyped [`RawChange`] rows; [`FeedEvent::decode`]
//! turns them into typed events the engine can apply.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Channel, FeedError, Message, MessageId, Reaction};

/// Tables the engine reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Table {
    /// Conversation messages.
    #[serde(rename = "messages")]
    Messages,
    /// Emoji reactions.
    #[serde(rename = "message_reactions")]
    Reactions,
    /// Conversations.
    #[serde(rename = "channels")]
    Channels,
    /// Per-user read cursors.
    #[serde(rename = "channel_reads")]
    ReadCursors,
}

impl Table {
    /// Stable table name used by the service.
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Messages => "messages",
            Table::Reactions => "message_reactions",
            Table::Channels => "channels",
            Table::ReadCursors => "channel_reads",
        }
    }

    /// Column that scopes rows of this table to one conversation.
    pub fn channel_column(&self) -> &'static str {
        match self {
            Table::Channels => "id",
            _ => "channel_id",
        }
    }
}

impl std::str::FromStr for Table {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "messages" => Ok(Table::Messages),
            "message_reactions" => Ok(Table::Reactions),
            "channels" => Ok(Table::Channels),
            "channel_reads" => Ok(Table::ReadCursors),
            other => Err(FeedError::UnknownTable(other.to_string())),
        }
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of row change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    /// Row created.
    Insert,
    /// Row modified.
    Update,
    /// Row removed.
    Delete,
}

/// A row change as pushed by the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawChange {
    /// Table the row belongs to.
    pub table: Table,
    /// What happened.
    pub kind: ChangeKind,
    /// Row after the change (insert, update).
    #[serde(default)]
    pub new: Option<Value>,
    /// Row before the change (delete).
    #[serde(default)]
    pub old: Option<Value>,
}

impl RawChange {
    /// Build an insert change.
    pub fn insert(table: Table, row: Value) -> Self {
        Self {
            table,
            kind: ChangeKind::Insert,
            new: Some(row),
            old: None,
        }
    }

    /// Build an update change.
    pub fn update(table: Table, row: Value) -> Self {
        Self {
            table,
            kind: ChangeKind::Update,
            new: Some(row),
            old: None,
        }
    }

    /// Build a delete change.
    pub fn delete(table: Table, old: Value) -> Self {
        Self {
            table,
            kind: ChangeKind::Delete,
            new: None,
            old: Some(old),
        }
    }

    fn new_row(&self) -> Result<&Value, FeedError> {
        self.new.as_ref().ok_or(FeedError::MissingRow("new"))
    }

    fn old_row(&self) -> Result<&Value, FeedError> {
        self.old.as_ref().ok_or(FeedError::MissingRow("old"))
    }
}

/// Field-level change to an existing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchChange {
    /// Clear content and attachment, set the deleted flag.
    SoftDelete,
    /// Bump the view counter to the given value.
    ViewCount(u64),
    /// Replace the record wholesale (edits).
    Refresh(Message),
}

/// An update addressed to a message by id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagePatch {
    /// Target message.
    pub id: MessageId,
    /// What changed.
    pub change: PatchChange,
}

impl MessagePatch {
    /// Soft-delete patch.
    pub fn soft_delete(id: MessageId) -> Self {
        Self {
            id,
            change: PatchChange::SoftDelete,
        }
    }

    /// View-count patch.
    pub fn view_count(id: MessageId, count: u64) -> Self {
        Self {
            id,
            change: PatchChange::ViewCount(count),
        }
    }

    /// Full-record refresh patch.
    pub fn refresh(message: Message) -> Self {
        Self {
            id: message.id.clone(),
            change: PatchChange::Refresh(message),
        }
    }
}

/// A typed change the engine applies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    /// A message was created.
    MessageInserted(Message),
    /// A message changed.
    MessageUpdated(MessagePatch),
    /// A message row was removed outright.
    MessageRemoved(MessageId),
    /// A reaction was added.
    ReactionAdded(Reaction),
    /// A reaction was removed.
    ReactionRemoved(Reaction),
    /// Channel metadata (including the pin) changed.
    ChannelUpdated(Channel),
}

impl FeedEvent {
    /// Decode a raw change.
    ///
    /// Returns `Ok(None)` for changes the engine does not consume.
    pub fn decode(change: &RawChange) -> Result<Option<Self>, FeedError> {
        let event = match (change.table, change.kind) {
            (Table::Messages, ChangeKind::Insert) => {
                FeedEvent::MessageInserted(Message::from_row(change.new_row()?)?)
            }
            (Table::Messages, ChangeKind::Update) => {
                let message = Message::from_row(change.new_row()?)?;
                if message.is_deleted() {
                    FeedEvent::MessageUpdated(MessagePatch::soft_delete(message.id))
                } else {
                    FeedEvent::MessageUpdated(MessagePatch::refresh(message))
                }
            }
            (Table::Messages, ChangeKind::Delete) => {
                let id = change
                    .old_row()?
                    .get("id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| FeedError::InvalidRecord("deleted row without id".into()))?;
                FeedEvent::MessageRemoved(MessageId::new(id))
            }
            (Table::Reactions, ChangeKind::Insert) => {
                FeedEvent::ReactionAdded(Reaction::from_row(change.new_row()?)?)
            }
            (Table::Reactions, ChangeKind::Delete) => {
                FeedEvent::ReactionRemoved(Reaction::from_row(change.old_row()?)?)
            }
            (Table::Channels, ChangeKind::Insert | ChangeKind::Update) => {
                FeedEvent::ChannelUpdated(Channel::from_row(change.new_row()?)?)
            }
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}
