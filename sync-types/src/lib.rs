//! # sync-types
//!
//! Data model and change-event types for convo-sync.
//!
//! This crate provides the foundational types used across all convo-sync crates:
//! - [`MessageId`], [`ChannelId`], [`UserId`], [`BatchId`], [`Timestamp`] - Identity and ordering types
//! - [`Message`] / [`MessageBody`] - Messages as tagged variants, [`MessageRecord`] rows
//! - [`Channel`], [`Reaction`], [`ReadCursor`] - Conversation-level records
//! - [`RawChange`] / [`FeedEvent`] - Untyped and typed change notifications
//! - [`FeedError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod channel;
mod error;
mod events;
mod ids;
mod message;

pub use channel::{Channel, ReadCursor, Reaction};
pub use error::FeedError;
pub use events::{ChangeKind, FeedEvent, MessagePatch, PatchChange, RawChange, Table};
pub use ids::{BatchId, ChannelId, MessageId, Timestamp, UserId, TEMP_ID_PREFIX};
pub use message::{
    Attachment, Message, MessageBody, MessageKind, MessageRecord, DEFAULT_MIME_TYPE,
    LOCAL_PREVIEW_SCHEME,
};
