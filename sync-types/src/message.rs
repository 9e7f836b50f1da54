//! Message model.
//!
//! A [`Message`] carries its shape as a tagged [`MessageBody`] instead of a
//! bag of optional columns. [`MessageRecord`] is the flat row the hosted
//! data service stores; conversion between the two lives here so the rest
//! of the engine never interprets column presence.

use serde::{Deserialize, Serialize};

use crate::{BatchId, ChannelId, FeedError, MessageId, Timestamp, UserId};

/// Mime type assumed when a row carries a file url but no type.
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Scheme used for attachment previews that have not been uploaded yet.
pub const LOCAL_PREVIEW_SCHEME: &str = "local-preview://";

/// A file attached to a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Durable public url, or a local preview url for optimistic entries.
    pub url: String,
    /// Mime type of the file.
    pub mime_type: String,
    /// Display name of the file.
    pub name: String,
}

impl Attachment {
    /// Create an attachment reference.
    pub fn new(url: impl Into<String>, mime_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            mime_type: mime_type.into(),
            name: name.into(),
        }
    }

    /// Preview reference for a file that is still being uploaded.
    pub fn local_preview(owner: &MessageId, name: &str, mime_type: &str) -> Self {
        Self::new(
            format!("{}{}/{}", LOCAL_PREVIEW_SCHEME, owner, name),
            mime_type,
            name,
        )
    }

    /// Whether the url points at a local preview rather than blob storage.
    pub fn is_local_preview(&self) -> bool {
        self.url.starts_with(LOCAL_PREVIEW_SCHEME)
    }
}

/// What a message shows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageBody {
    /// Plain text.
    Text {
        /// The text.
        content: String,
    },
    /// A single file, optionally captioned.
    Attachment {
        /// Caption shown with the file.
        caption: Option<String>,
        /// The file reference.
        attachment: Attachment,
    },
    /// Soft-deleted: content and attachment cleared, identity retained.
    Tombstone,
}

/// Discriminator of a [`MessageBody`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Plain text.
    Text,
    /// File with optional caption.
    Attachment,
    /// Soft-deleted.
    Tombstone,
}

/// A message in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Unique within the conversation.
    pub id: MessageId,
    /// Conversation this message belongs to.
    pub channel_id: ChannelId,
    /// Author.
    pub author_id: UserId,
    /// Content.
    pub body: MessageBody,
    /// Creation time; the primary ordering key.
    pub created_at: Timestamp,
    /// Message this one replies to (weak reference by id).
    pub reply_to: Option<MessageId>,
    /// Number of views recorded server-side.
    pub view_count: u64,
    /// Groups messages sent together as one post.
    pub batch_id: Option<BatchId>,
}

impl Message {
    /// Create a text message with no reply target or batch.
    pub fn text(
        id: MessageId,
        channel_id: ChannelId,
        author_id: UserId,
        content: impl Into<String>,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id,
            channel_id,
            author_id,
            body: MessageBody::Text {
                content: content.into(),
            },
            created_at,
            reply_to: None,
            view_count: 0,
            batch_id: None,
        }
    }

    /// The kind of body this message carries.
    pub fn kind(&self) -> MessageKind {
        match self.body {
            MessageBody::Text { .. } => MessageKind::Text,
            MessageBody::Attachment { .. } => MessageKind::Attachment,
            MessageBody::Tombstone => MessageKind::Tombstone,
        }
    }

    /// Text content or caption, if any.
    pub fn content(&self) -> Option<&str> {
        match &self.body {
            MessageBody::Text { content } => Some(content),
            MessageBody::Attachment { caption, .. } => caption.as_deref(),
            MessageBody::Tombstone => None,
        }
    }

    /// Attachment reference, if any.
    pub fn attachment(&self) -> Option<&Attachment> {
        match &self.body {
            MessageBody::Attachment { attachment, .. } => Some(attachment),
            _ => None,
        }
    }

    /// Whether the message was soft-deleted.
    pub fn is_deleted(&self) -> bool {
        matches!(self.body, MessageBody::Tombstone)
    }

    /// Whether the message is part of a multi-attachment post.
    pub fn is_batched(&self) -> bool {
        self.batch_id.is_some()
    }

    /// Clear content and attachment, keeping identity and position.
    pub fn into_tombstone(mut self) -> Self {
        self.body = MessageBody::Tombstone;
        self
    }

    /// Sort key: creation time, then id.
    pub fn order_key(&self) -> (Timestamp, &MessageId) {
        (self.created_at, &self.id)
    }

    /// Decode a JSON row.
    pub fn from_row(row: &serde_json::Value) -> Result<Self, FeedError> {
        let record: MessageRecord =
            serde_json::from_value(row.clone()).map_err(FeedError::Deserialization)?;
        Self::try_from(record)
    }

    /// Encode as a JSON row.
    pub fn to_row(&self) -> Result<serde_json::Value, FeedError> {
        serde_json::to_value(MessageRecord::from(self)).map_err(FeedError::Serialization)
    }
}

/// Flat row as stored by the hosted data service.
///
/// Optional columns may be missing on older schemas and default when absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Assigned by the server on insert.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    /// Conversation id.
    pub channel_id: ChannelId,
    /// Author id.
    pub author_id: UserId,
    /// Text or caption.
    #[serde(default)]
    pub content: Option<String>,
    /// Durable attachment url.
    #[serde(default)]
    pub file_url: Option<String>,
    /// Attachment mime type.
    #[serde(default)]
    pub file_type: Option<String>,
    /// Attachment display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    /// Defaulted by the server on insert.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<Timestamp>,
    /// Soft-deletion flag.
    #[serde(default)]
    pub is_deleted: bool,
    /// Reply target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageId>,
    /// View counter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view_count: Option<u64>,
    /// Batch group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<BatchId>,
}

impl MessageRecord {
    /// Columns a reduced-field write may omit when the server schema lacks them.
    pub const OPTIONAL_COLUMNS: [&'static str; 4] = ["reply_to", "view_count", "batch_id", "file_name"];
}

impl TryFrom<MessageRecord> for Message {
    type Error = FeedError;

    fn try_from(record: MessageRecord) -> Result<Self, Self::Error> {
        let id = record
            .id
            .ok_or_else(|| FeedError::InvalidRecord("message row without id".into()))?;
        let created_at = record
            .created_at
            .ok_or_else(|| FeedError::InvalidRecord(format!("message {} without created_at", id)))?;

        let body = if record.is_deleted {
            MessageBody::Tombstone
        } else if let Some(url) = record.file_url {
            let name = record
                .file_name
                .unwrap_or_else(|| url.rsplit('/').next().unwrap_or_default().to_string());
            MessageBody::Attachment {
                caption: record.content,
                attachment: Attachment {
                    url,
                    mime_type: record.file_type.unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string()),
                    name,
                },
            }
        } else if let Some(content) = record.content {
            MessageBody::Text { content }
        } else {
            return Err(FeedError::InvalidRecord(format!(
                "message {} has neither content nor attachment",
                id
            )));
        };

        Ok(Self {
            id,
            channel_id: record.channel_id,
            author_id: record.author_id,
            body,
            created_at,
            reply_to: record.reply_to,
            view_count: record.view_count.unwrap_or(0),
            batch_id: record.batch_id,
        })
    }
}

impl From<&Message> for MessageRecord {
    fn from(message: &Message) -> Self {
        let mut record = MessageRecord {
            id: Some(message.id.clone()),
            channel_id: message.channel_id.clone(),
            author_id: message.author_id.clone(),
            created_at: Some(message.created_at),
            reply_to: message.reply_to.clone(),
            view_count: Some(message.view_count),
            batch_id: message.batch_id,
            ..Default::default()
        };
        match &message.body {
            MessageBody::Text { content } => record.content = Some(content.clone()),
            MessageBody::Attachment {
                caption,
                attachment,
            } => {
                record.content = caption.clone();
                record.file_url = Some(attachment.url.clone());
                record.file_type = Some(attachment.mime_type.clone());
                record.file_name = Some(attachment.name.clone());
            }
            MessageBody::Tombstone => record.is_deleted = true,
        }
        record
    }
}
