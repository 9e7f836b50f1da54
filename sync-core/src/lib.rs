//! # sync-core
//!
//! Pure reconciliation logic for convo-sync (no I/O, instant tests).
//!
//! This crate implements the message store, the subscription state machine
//! and the bookkeeping around them without any network access, enabling
//! fast unit tests.
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input and produce output
//! without side effects. This enables:
//! - Instant unit tests (no mocks, no async)
//! - Deterministic behavior (same input → same output)
//! - Easy reasoning about how racing sources converge
//!
//! The actual I/O (backend calls, subscriptions, timers) is performed by
//! `sync-client`, which feeds events into these types and interprets the
//! actions they produce.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dedup;
pub mod ledger;
pub mod lifecycle;
pub mod pins;
pub mod reactions;
pub mod state;
pub mod store;
pub mod watermark;

pub use dedup::IdentityTracker;
pub use ledger::{LedgerError, SendLedger, SendStatus};
pub use lifecycle::{LifecycleEvent, MessageLifecycle};
pub use pins::{PinState, PinTracker, ReadState};
pub use reactions::{ReactionAggregator, ReactionSummary};
pub use state::{calculate_backoff, FeedAction, FeedInput, FeedState, FeedStatus};
pub use store::{InsertOutcome, MessageStore, ReplaceOutcome, UpdateOutcome};
pub use watermark::Watermark;
