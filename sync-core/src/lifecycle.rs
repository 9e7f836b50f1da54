//! Per-message lifecycle state machine.
//!
//! ```text
//! Optimistic ──Acknowledged──► Confirmed ──SoftDeleted──► Deleted
//!     │                          ▲    │
//!     └──Retracted──► Retracted  └Edited┘
//! ```
//!
//! `Confirmed` and `Deleted` are terminal with respect to identity: a
//! deleted message's id is never reused, and edits only move within
//! `Confirmed`. Like the feed state machine, invalid transitions leave the
//! state unchanged.

/// Where a message is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageLifecycle {
    /// Shown locally, not yet acknowledged by the server.
    Optimistic,
    /// Acknowledged or received from the server.
    Confirmed,
    /// Soft-deleted; retained as a tombstone.
    Deleted,
    /// Send failed or abandoned; removed from the store.
    Retracted,
}

/// Inputs to [`MessageLifecycle::on_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The authoritative write succeeded.
    Acknowledged,
    /// Content was edited server-side.
    Edited,
    /// The message was soft-deleted.
    SoftDeleted,
    /// The optimistic entry was withdrawn.
    Retracted,
}

impl MessageLifecycle {
    /// Apply an event; invalid transitions keep the current state.
    pub fn on_event(self, event: LifecycleEvent) -> Self {
        match (self, event) {
            (Self::Optimistic, LifecycleEvent::Acknowledged) => Self::Confirmed,
            (Self::Optimistic, LifecycleEvent::Retracted) => Self::Retracted,
            (Self::Confirmed, LifecycleEvent::Edited) => Self::Confirmed,
            (Self::Confirmed, LifecycleEvent::SoftDeleted) => Self::Deleted,
            (state, _) => state,
        }
    }

    /// Whether the entry is visible in the store snapshot.
    pub fn is_visible(&self) -> bool {
        !matches!(self, Self::Retracted)
    }

    /// Whether the entry is still awaiting server confirmation.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Optimistic)
    }
}
