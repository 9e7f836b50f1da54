//! Optimistic send pipeline.
//!
//! A [`Draft`] is split into one [`DraftPart`] per message that will exist
//! server-side. Each part is rendered optimistically under a temporary id,
//! its attachment (if any) is uploaded, and the authoritative write is made
//! through the transactional `send_message` RPC. The engine splices the
//! returned record in place of the temporary entry.
//!
//! Multi-attachment drafts become a batch: N messages sharing one
//! [`BatchId`]. The caption and reply target ride on the first part only;
//! [`Draft::into_parts`] is the single place that builds parts, so the
//! convention cannot be bypassed.

use std::sync::Arc;

use convo_sync_types::{
    Attachment, BatchId, ChannelId, FeedError, Message, MessageBody, MessageId, MessageRecord,
    Table, Timestamp, UserId,
};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::backend::{rpc, BackendError, BlobStore, ChannelBackend};
use crate::error::EngineError;

/// A file to attach, not yet uploaded.
#[derive(Clone, PartialEq, Eq)]
pub struct AttachmentUpload {
    /// Display name, also used in the storage path.
    pub name: String,
    /// Mime type.
    pub mime_type: String,
    /// File contents.
    pub bytes: Vec<u8>,
}

impl AttachmentUpload {
    /// Create an upload.
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            bytes,
        }
    }
}

impl std::fmt::Debug for AttachmentUpload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachmentUpload")
            .field("name", &self.name)
            .field("mime_type", &self.mime_type)
            .field("bytes", &format!("[{} bytes]", self.bytes.len()))
            .finish()
    }
}

/// What the user composed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Draft {
    /// Text, or the caption when attachments are present.
    pub content: Option<String>,
    /// Files to attach.
    pub attachments: Vec<AttachmentUpload>,
    /// Message being replied to.
    pub reply_to: Option<MessageId>,
}

impl Draft {
    /// A plain text draft.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Default::default()
        }
    }

    /// Add an attachment.
    pub fn attach(mut self, upload: AttachmentUpload) -> Self {
        self.attachments.push(upload);
        self
    }

    /// Reply to `id`.
    pub fn replying_to(mut self, id: MessageId) -> Self {
        self.reply_to = Some(id);
        self
    }

    /// Whether there is nothing to send (blank text, no attachments).
    pub fn is_empty(&self) -> bool {
        self.attachments.is_empty()
            && self
                .content
                .as_deref()
                .map(|c| c.trim().is_empty())
                .unwrap_or(true)
    }

    /// Split into the messages that will be written.
    ///
    /// Caption and reply target go to part 0 only. A batch id is generated
    /// when there is more than one part.
    pub fn into_parts(self) -> Vec<DraftPart> {
        let mut content = self.content.filter(|c| !c.trim().is_empty());
        let mut reply_to = self.reply_to;

        if self.attachments.is_empty() {
            return vec![DraftPart {
                text: content,
                attachment: None,
                reply_to,
                batch_id: None,
            }];
        }

        let batch_id = (self.attachments.len() > 1).then(BatchId::new);
        self.attachments
            .into_iter()
            .map(|upload| DraftPart {
                text: content.take(),
                attachment: Some(upload),
                reply_to: reply_to.take(),
                batch_id,
            })
            .collect()
    }
}

/// One message of a draft.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DraftPart {
    /// Text or caption.
    pub text: Option<String>,
    /// File to upload.
    pub attachment: Option<AttachmentUpload>,
    /// Reply target.
    pub reply_to: Option<MessageId>,
    /// Batch group.
    pub batch_id: Option<BatchId>,
}

impl DraftPart {
    /// The optimistic rendering of this part, with a local attachment preview.
    pub fn optimistic(
        &self,
        temp_id: MessageId,
        channel_id: ChannelId,
        author_id: UserId,
        created_at: Timestamp,
    ) -> Message {
        let body = match &self.attachment {
            Some(upload) => MessageBody::Attachment {
                caption: self.text.clone(),
                attachment: Attachment::local_preview(&temp_id, &upload.name, &upload.mime_type),
            },
            None => MessageBody::Text {
                content: self.text.clone().unwrap_or_default(),
            },
        };
        Message {
            id: temp_id,
            channel_id,
            author_id,
            body,
            created_at,
            reply_to: self.reply_to.clone(),
            view_count: 0,
            batch_id: self.batch_id,
        }
    }
}

/// Uploads and authoritative writes.
pub struct SendPipeline<B: ChannelBackend, S: BlobStore> {
    backend: Arc<B>,
    blobs: Arc<S>,
    bucket: String,
}

impl<B: ChannelBackend, S: BlobStore> SendPipeline<B, S> {
    /// Create a pipeline uploading into `bucket`.
    pub fn new(backend: Arc<B>, blobs: Arc<S>, bucket: impl Into<String>) -> Self {
        Self {
            backend,
            blobs,
            bucket: bucket.into(),
        }
    }

    /// Upload a file and return its durable reference.
    pub async fn upload(
        &self,
        channel_id: &ChannelId,
        upload: &AttachmentUpload,
    ) -> Result<Attachment, BackendError> {
        let path = format!("{}/{}-{}", channel_id, Uuid::new_v4(), upload.name);
        self.blobs
            .upload(&self.bucket, &path, &upload.bytes, &upload.mime_type)
            .await?;
        let url = self.blobs.public_url(&self.bucket, &path);
        tracing::debug!("Uploaded {} ({} bytes) to {}", upload.name, upload.bytes.len(), url);
        Ok(Attachment::new(url, upload.mime_type.clone(), upload.name.clone()))
    }

    /// Upload (if needed) and write one part. Returns the stored message.
    pub async fn deliver(
        &self,
        part: &DraftPart,
        channel_id: &ChannelId,
        author_id: &UserId,
    ) -> Result<Message, EngineError> {
        let mut record = MessageRecord {
            channel_id: channel_id.clone(),
            author_id: author_id.clone(),
            content: part.text.clone(),
            reply_to: part.reply_to.clone(),
            batch_id: part.batch_id,
            ..Default::default()
        };
        if let Some(upload) = &part.attachment {
            let attachment = self.upload(channel_id, upload).await?;
            record.file_url = Some(attachment.url);
            record.file_type = Some(attachment.mime_type);
            record.file_name = Some(attachment.name);
        }
        self.write(record).await
    }

    /// Authoritative write, falling back to a reduced-field insert when the
    /// server schema lacks an optional column.
    pub async fn write(&self, record: MessageRecord) -> Result<Message, EngineError> {
        let row = serde_json::to_value(&record).map_err(FeedError::Serialization)?;

        let stored = match self
            .backend
            .rpc(rpc::SEND_MESSAGE, json!({ "record": row }))
            .await
        {
            Ok(stored) => stored,
            Err(BackendError::SchemaMismatch { column }) => {
                tracing::warn!(
                    "Column {} missing server-side, retrying with reduced fields",
                    column
                );
                self.backend
                    .insert(Table::Messages, strip_optional_columns(row))
                    .await?
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Message::from_row(&stored)?)
    }
}

fn strip_optional_columns(mut row: Value) -> Value {
    if let Value::Object(fields) = &mut row {
        for column in MessageRecord::OPTIONAL_COLUMNS {
            fields.remove(column);
        }
    }
    row
}
