//! Error types for convo-sync records and events.

use thiserror::Error;

/// Errors raised while decoding records delivered by the collaborator.
#[derive(Debug, Error)]
pub enum FeedError {
    /// JSON row could not be deserialized into the expected record.
    #[error("deserialization failed: {0}")]
    Deserialization(#[source] serde_json::Error),

    /// Record could not be serialized into a JSON row.
    #[error("serialization failed: {0}")]
    Serialization(#[source] serde_json::Error),

    /// Row decoded but violates the data model.
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// Change event is missing the row it needs.
    #[error("change event missing {0} row")]
    MissingRow(&'static str),

    /// Table name not known to this engine.
    #[error("unknown table: {0}")]
    UnknownTable(String),
}
