//! # sync-client
//!
//! Conversation sync engine for convo-sync.
//!
//! Keeps a local, ordered, de-duplicated view of one conversation consistent
//! with a hosted data service that offers push notifications, queries and
//! RPCs but no ordering guarantees.
//!
//! ## Features
//!
//! - **Optimistic sends**: messages render immediately under a temporary id
//!   and are swapped in place for the server record on acknowledgement
//! - **Push plus poll**: a change feed for latency, a watermark poll for
//!   correctness across gaps; both feed one idempotent apply path
//! - **Collaborator abstraction**: pluggable [`ChannelBackend`] and
//!   [`BlobStore`] (in-memory implementations included)
//! - **Pure State Machine**: uses sync-core for side-effect-free logic
//!
//! ## Example
//!
//! ```ignore
//! use convo_sync_client::{ConversationEngine, Draft, EngineConfig, MemoryBackend, MemoryBlobStore};
//!
//! let backend = Arc::new(MemoryBackend::new().connect_as(UserId::new("alice")));
//! let engine = ConversationEngine::new(
//!     ChannelId::new("general"),
//!     UserId::new("alice"),
//!     EngineConfig::default(),
//!     backend,
//!     Arc::new(MemoryBlobStore::new()),
//! );
//!
//! engine.open().await?;
//! engine.send(Draft::text("hello")).await?;
//! let messages = engine.snapshot().await;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod feed;
pub mod poller;
pub mod sender;

pub use backend::{
    rpc, BackendError, BlobStore, ChannelBackend, ChannelStatus, FeedSignal, Filter,
    MemoryBackend, MemoryBlobStore, Order, Query, SignalCallback, SubscriptionHandle,
};
pub use config::{ConfigError, EngineConfig};
pub use engine::{ConversationEngine, EngineEvent, SendReceipt};
pub use error::EngineError;
pub use feed::{ChangeFeed, FeedNotice, FeedSubscription, NoticeSink};
pub use poller::{PollGuard, PollingFallback};
pub use sender::{AttachmentUpload, Draft, DraftPart, SendPipeline};
