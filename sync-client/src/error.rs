//! Error types for sync-client.

use convo_sync_core::LedgerError;
use convo_sync_types::FeedError;
use thiserror::Error;

use crate::backend::BackendError;

/// Engine errors surfaced to the application.
///
/// Nothing here is fatal to the process: the worst outcome of any of these
/// is a temporarily stale view, healed by the next poll.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The backend could not be reached. Retrying may succeed.
    #[error("network error: {0}")]
    Network(String),

    /// The backend refused the operation for this user.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The operation referenced something not present (yet).
    #[error("stale reference: {0}")]
    Stale(String),

    /// A column is missing server-side and no reduced write was possible.
    #[error("schema mismatch: column {column} does not exist")]
    SchemaMismatch {
        /// The missing column.
        column: String,
    },

    /// The backend rejected the write.
    #[error("rejected: {0}")]
    Rejected(String),

    /// The draft cannot be sent as is.
    #[error("invalid draft: {0}")]
    InvalidDraft(String),

    /// Too many sends are awaiting acknowledgement.
    #[error("too many sends in flight (capacity: {capacity})")]
    TooManyInFlight {
        /// Maximum number of in-flight sends.
        capacity: usize,
    },

    /// A row returned by the backend could not be decoded.
    #[error("decode error: {0}")]
    Decode(#[from] FeedError),

    /// The conversation has not been opened.
    #[error("conversation not open")]
    NotOpen,
}

impl EngineError {
    /// Whether retrying the same operation may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

impl From<BackendError> for EngineError {
    fn from(error: BackendError) -> Self {
        match error {
            BackendError::Network(reason) => Self::Network(reason),
            BackendError::Unauthorized(reason) => Self::Unauthorized(reason),
            BackendError::NotFound(what) => Self::Stale(what),
            BackendError::SchemaMismatch { column } => Self::SchemaMismatch { column },
            BackendError::Rejected(reason) => Self::Rejected(reason),
        }
    }
}

impl From<LedgerError> for EngineError {
    fn from(error: LedgerError) -> Self {
        match error {
            LedgerError::Full { capacity } => Self::TooManyInFlight { capacity },
            LedgerError::AlreadyInFlight(id) => Self::InvalidDraft(format!("{} already sending", id)),
        }
    }
}
