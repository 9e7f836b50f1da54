//! Identity tracking for convo-sync.
//!
//! Every candidate event, whether it arrived via the change feed or the
//! polling fallback, is gated by the [`IdentityTracker`]. An id is
//! registered in the same call that mutates the message store, so there is
//! no window in which a second copy of the same message can slip in.

use std::collections::HashSet;
use convo_sync_types::MessageId;

/// Set of message ids already applied to the store.
#[derive(Debug, Clone, Default)]
pub struct IdentityTracker {
    applied: HashSet<MessageId>,
}

impl IdentityTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `id` was already applied.
    pub fn contains(&self, id: &MessageId) -> bool {
        self.applied.contains(id)
    }

    /// Record `id` as applied.
    ///
    /// Returns `false` if it was already present.
    pub fn register(&mut self, id: MessageId) -> bool {
        self.applied.insert(id)
    }

    /// Drop `id` from the applied set.
    ///
    /// Only temporary ids are ever forgotten: a server id that was applied
    /// stays registered so a stale poll cannot resurrect it.
    pub fn forget(&mut self, id: &MessageId) -> bool {
        if !id.is_temporary() {
            return false;
        }
        self.applied.remove(id)
    }

    /// Number of registered ids.
    pub fn len(&self) -> usize {
        self.applied.len()
    }

    /// Whether no id is registered.
    pub fn is_empty(&self) -> bool {
        self.applied.is_empty()
    }

    /// Clear all state.
    pub fn clear(&mut self) {
        self.applied.clear();
    }
}
