//! Collaborator abstraction for convo-sync.
//!
//! The engine talks to two opaque hosted services:
//! - [`ChannelBackend`]: rows, queries, change subscriptions and RPCs
//! - [`BlobStore`]: attachment uploads and their public urls
//!
//! Neither promises ordering. Subscriptions are at-least-once and never
//! replay what was missed while disconnected.
//!
//! # Example
//!
//! ```ignore
//! let backend = MemoryBackend::new().connect_as(UserId::new("alice"));
//! let rows = backend
//!     .query(Table::Messages, &Query::new().eq("channel_id", "general").limit(50))
//!     .await?;
//! ```

mod memory;

pub use memory::{MemoryBackend, MemoryBlobStore};

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use convo_sync_types::{RawChange, Table};
use serde_json::Value;
use thiserror::Error;

/// RPC names understood by the hosted data service.
pub mod rpc {
    /// Transactional insert of a message plus its side effects.
    pub const SEND_MESSAGE: &str = "send_message";
    /// Add the caller's emoji if absent, remove it if present.
    pub const TOGGLE_REACTION: &str = "toggle_reaction";
    /// Upsert the caller's read cursor.
    pub const MARK_READ: &str = "mark_read";
    /// Bump a message's view counter by one.
    pub const INCREMENT_VIEW_COUNT: &str = "increment_view_count";
}

/// Backend errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// The service could not be reached or timed out.
    #[error("network error: {0}")]
    Network(String),

    /// The caller may not perform this operation.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The addressed row or RPC does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A column the write used does not exist server-side.
    #[error("schema mismatch: column {column} does not exist")]
    SchemaMismatch {
        /// The missing column.
        column: String,
    },

    /// The service refused the write (constraint violation, bad args).
    #[error("rejected: {0}")]
    Rejected(String),
}

impl BackendError {
    /// Whether retrying the same call may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

/// Connection status reported on a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    /// Subscribed and receiving changes.
    Connected,
    /// Connection dropped; the service reconnects on its own.
    Disconnected {
        /// Reason given by the service.
        reason: String,
    },
    /// The subscription itself failed and must be re-established.
    Error {
        /// Reason given by the service.
        reason: String,
    },
}

/// What a subscription delivers to its callback.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedSignal {
    /// A row changed.
    Change(RawChange),
    /// The subscription's connection status changed.
    Status(ChannelStatus),
}

/// Subscription callback. Invoked from whatever task the backend runs on.
pub type SignalCallback = Arc<dyn Fn(FeedSignal) + Send + Sync>;

/// Opaque handle returned by [`ChannelBackend::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(pub u64);

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Row predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Column equals value.
    Eq {
        /// Column name.
        column: String,
        /// Expected value.
        value: Value,
    },
    /// Column strictly greater than value.
    Gt {
        /// Column name.
        column: String,
        /// Lower bound (exclusive).
        value: Value,
    },
    /// Column greater than or equal to value.
    Gte {
        /// Column name.
        column: String,
        /// Lower bound (inclusive).
        value: Value,
    },
}

impl Filter {
    /// Equality predicate.
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq {
            column: column.into(),
            value: value.into(),
        }
    }

    /// Greater-than predicate.
    pub fn gt(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Gt {
            column: column.into(),
            value: value.into(),
        }
    }

    /// Greater-than-or-equal predicate.
    pub fn gte(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Gte {
            column: column.into(),
            value: value.into(),
        }
    }

    /// Whether `row` satisfies the predicate. Missing columns never match.
    pub fn matches(&self, row: &Value) -> bool {
        match self {
            Self::Eq { column, value } => row.get(column) == Some(value),
            Self::Gt { column, value } => row
                .get(column)
                .and_then(|actual| compare_values(actual, value))
                .map(|ord| ord == Ordering::Greater)
                .unwrap_or(false),
            Self::Gte { column, value } => row
                .get(column)
                .and_then(|actual| compare_values(actual, value))
                .map(|ord| ord != Ordering::Less)
                .unwrap_or(false),
        }
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    /// Smallest first.
    Ascending,
    /// Largest first.
    Descending,
}

/// A filtered, ordered, limited read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    /// All filters must match.
    pub filters: Vec<Filter>,
    /// Sort column and direction.
    pub order_by: Option<(String, Order)>,
    /// Maximum rows returned.
    pub limit: Option<usize>,
}

impl Query {
    /// Query matching every row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an equality filter.
    pub fn eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::eq(column, value));
        self
    }

    /// Add a greater-than filter.
    pub fn gt(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::gt(column, value));
        self
    }

    /// Add a greater-than-or-equal filter.
    pub fn gte(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::gte(column, value));
        self
    }

    /// Sort by `column`.
    pub fn order(mut self, column: impl Into<String>, order: Order) -> Self {
        self.order_by = Some((column.into(), order));
        self
    }

    /// Cap the number of rows.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `row` satisfies every filter.
    pub fn matches(&self, row: &Value) -> bool {
        self.filters.iter().all(|f| f.matches(row))
    }

    /// Sort and truncate `rows` in place.
    pub fn arrange(&self, rows: &mut Vec<Value>) {
        if let Some((column, order)) = &self.order_by {
            rows.sort_by(|a, b| {
                let ord = match (a.get(column), b.get(column)) {
                    (Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
                    (Some(_), None) => Ordering::Greater,
                    (None, Some(_)) => Ordering::Less,
                    (None, None) => Ordering::Equal,
                };
                match order {
                    Order::Ascending => ord,
                    Order::Descending => ord.reverse(),
                }
            });
        }
        if let Some(limit) = self.limit {
            rows.truncate(limit);
        }
    }
}

/// Compare two JSON scalars of the same kind.
fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_u64(), y.as_u64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
        },
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// The hosted data/notification service.
///
/// Implementations handle the underlying protocol (HTTP + websocket for a
/// hosted service, in-memory for tests).
#[async_trait]
pub trait ChannelBackend: Send + Sync {
    /// Insert a row. Returns the stored row, including server defaults.
    async fn insert(&self, table: Table, record: Value) -> Result<Value, BackendError>;

    /// Merge `patch` into the row with the given id. Returns the stored row.
    async fn update(&self, table: Table, id: &str, patch: Value) -> Result<Value, BackendError>;

    /// Read rows.
    async fn query(&self, table: Table, query: &Query) -> Result<Vec<Value>, BackendError>;

    /// Subscribe to changes of rows matching `filter`.
    ///
    /// The callback receives a [`ChannelStatus::Connected`] once the
    /// subscription is established.
    async fn subscribe(
        &self,
        table: Table,
        filter: Filter,
        callback: SignalCallback,
    ) -> Result<SubscriptionHandle, BackendError>;

    /// Drop a subscription. Unknown handles are ignored.
    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), BackendError>;

    /// Call a server-side procedure.
    async fn rpc(&self, name: &str, args: Value) -> Result<Value, BackendError>;
}

/// Attachment storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` at `path` inside `bucket`.
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: &[u8],
        mime_type: &str,
    ) -> Result<(), BackendError>;

    /// Durable public url of an uploaded object.
    fn public_url(&self, bucket: &str, path: &str) -> String;
}
