//! Message store (reconciler) for convo-sync.
//!
//! The store is the single ordered, deduplicated list of messages that the
//! presentation layer reads. Three racing sources mutate it:
//! - Optimistic local sends (temporary ids)
//! - Push events from the change feed
//! - Results of the polling fallback
//!
//! None of them is trusted for ordering. Every insert lands at its sorted
//! position by `(created_at, id)`, and every mutation is idempotent, so any
//! interleaving of the three sources converges on the same list.

use convo_sync_types::{Message, MessageBody, MessageId, MessagePatch, PatchChange, Timestamp};

use crate::dedup::IdentityTracker;
use crate::lifecycle::{LifecycleEvent, MessageLifecycle};
use crate::watermark::Watermark;

/// Result of [`MessageStore::apply_insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Inserted at the given position.
    Inserted {
        /// Index in the snapshot.
        index: usize,
    },
    /// The id was already applied; nothing changed.
    Duplicate,
}

/// Result of [`MessageStore::apply_update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The entry changed.
    Applied,
    /// The patch matched the current state (e.g. a repeated delete).
    Unchanged,
    /// The target is not materialized locally; a later poll will bring it.
    Dropped,
}

/// Result of [`MessageStore::replace_temporary`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceOutcome {
    /// The temporary entry was swapped for the authoritative one in place.
    Replaced,
    /// The authoritative id had already arrived; the temporary entry was dropped.
    Merged,
    /// The temporary entry was gone (abandoned); the authoritative one was inserted.
    Inserted,
}

#[derive(Debug, Clone)]
struct Entry {
    message: Message,
    lifecycle: MessageLifecycle,
}

/// Ordered, deduplicated message list for one conversation.
#[derive(Debug, Clone, Default)]
pub struct MessageStore {
    entries: Vec<Entry>,
    identities: IdentityTracker,
    watermark: Watermark,
}

impl MessageStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a message at its sorted position.
    ///
    /// No-op if the id was already applied. Temporary ids enter as
    /// `Optimistic`, everything else as `Confirmed` (or `Deleted` when the
    /// record is already a tombstone).
    pub fn apply_insert(&mut self, message: Message) -> InsertOutcome {
        if self.identities.contains(&message.id) {
            tracing::debug!("Duplicate insert ignored: {}", message.id);
            return InsertOutcome::Duplicate;
        }

        let lifecycle = if message.id.is_temporary() {
            MessageLifecycle::Optimistic
        } else if message.is_deleted() {
            MessageLifecycle::Deleted
        } else {
            MessageLifecycle::Confirmed
        };

        if !message.id.is_temporary() {
            self.watermark.observe(message.created_at);
        }
        self.identities.register(message.id.clone());

        let index = self.sorted_position(&message);
        self.entries.insert(index, Entry { message, lifecycle });
        InsertOutcome::Inserted { index }
    }

    /// Merge a field-level change into an existing entry.
    ///
    /// Patches for ids not present locally are dropped, as are patches
    /// addressed to temporary ids (the server never knows them).
    pub fn apply_update(&mut self, patch: MessagePatch) -> UpdateOutcome {
        let Some(index) = self.index_of(&patch.id) else {
            tracing::debug!("Update for unknown message dropped: {}", patch.id);
            return UpdateOutcome::Dropped;
        };
        if patch.id.is_temporary() {
            return UpdateOutcome::Dropped;
        }

        match patch.change {
            PatchChange::SoftDelete => self.soft_delete_at(index),
            PatchChange::ViewCount(count) => {
                let entry = &mut self.entries[index];
                if count > entry.message.view_count {
                    entry.message.view_count = count;
                    UpdateOutcome::Applied
                } else {
                    UpdateOutcome::Unchanged
                }
            }
            PatchChange::Refresh(fresh) => self.refresh_at(index, fresh),
        }
    }

    /// Remove an entry outright.
    ///
    /// Used for optimistic entries that never reached the server, and for
    /// explicit row removals pushed by the feed. Returns whether an entry
    /// was removed.
    pub fn apply_delete(&mut self, id: &MessageId) -> bool {
        let Some(index) = self.index_of(id) else {
            return false;
        };
        self.entries.remove(index);
        self.identities.forget(id);
        true
    }

    /// Swap a temporary entry for its authoritative counterpart.
    ///
    /// The authoritative id is registered in the same call, so a push event
    /// for it that is applied afterwards is a duplicate.
    pub fn replace_temporary(&mut self, temp_id: &MessageId, authoritative: Message) -> ReplaceOutcome {
        let temp_index = self.index_of(temp_id);

        if self.identities.contains(&authoritative.id) {
            // The feed won the race; keep its copy and drop ours.
            if let Some(index) = temp_index {
                self.entries.remove(index);
                self.identities.forget(temp_id);
            }
            return ReplaceOutcome::Merged;
        }

        let Some(index) = temp_index else {
            self.apply_insert(authoritative);
            return ReplaceOutcome::Inserted;
        };

        self.identities.forget(temp_id);
        self.identities.register(authoritative.id.clone());
        self.watermark.observe(authoritative.created_at);

        let entry = &mut self.entries[index];
        entry.lifecycle = entry.lifecycle.on_event(LifecycleEvent::Acknowledged);
        entry.message = authoritative;
        self.reposition(index);
        ReplaceOutcome::Replaced
    }

    /// Ordered copy of all visible messages.
    pub fn snapshot(&self) -> Vec<Message> {
        self.entries.iter().map(|e| e.message.clone()).collect()
    }

    /// Iterate messages in order without cloning.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Message> {
        self.entries.iter().map(|e| &e.message)
    }

    /// Look up a message by id.
    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.index_of(id).map(|i| &self.entries[i].message)
    }

    /// Lifecycle state of a visible message.
    pub fn lifecycle(&self, id: &MessageId) -> Option<MessageLifecycle> {
        self.index_of(id).map(|i| self.entries[i].lifecycle)
    }

    /// Whether the id was ever applied (including tombstones and removals).
    pub fn has_seen(&self, id: &MessageId) -> bool {
        self.identities.contains(id)
    }

    /// Number of visible messages.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Number of messages the presentation layer shows (tombstones included).
    pub fn visible_len(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.lifecycle.is_visible())
            .count()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of optimistic entries awaiting confirmation.
    pub fn pending_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.lifecycle.is_pending())
            .count()
    }

    /// Newest visible message.
    pub fn last(&self) -> Option<&Message> {
        self.entries.last().map(|e| &e.message)
    }

    /// Newest authoritative creation time seen, for polling.
    pub fn watermark(&self) -> Timestamp {
        self.watermark.value()
    }

    fn soft_delete_at(&mut self, index: usize) -> UpdateOutcome {
        let entry = &mut self.entries[index];
        if entry.message.is_deleted() {
            return UpdateOutcome::Unchanged;
        }
        entry.message.body = MessageBody::Tombstone;
        entry.lifecycle = entry.lifecycle.on_event(LifecycleEvent::SoftDeleted);
        UpdateOutcome::Applied
    }

    fn refresh_at(&mut self, index: usize, fresh: Message) -> UpdateOutcome {
        if fresh.is_deleted() {
            return self.soft_delete_at(index);
        }

        let entry = &mut self.entries[index];
        if entry.message.is_deleted() {
            // Deleted is terminal: only the counter may still move.
            if fresh.view_count > entry.message.view_count {
                entry.message.view_count = fresh.view_count;
                return UpdateOutcome::Applied;
            }
            return UpdateOutcome::Unchanged;
        }
        if entry.message == fresh {
            return UpdateOutcome::Unchanged;
        }

        self.watermark.observe(fresh.created_at);
        entry.lifecycle = entry.lifecycle.on_event(LifecycleEvent::Edited);
        entry.message = fresh;
        self.reposition(index);
        UpdateOutcome::Applied
    }

    fn index_of(&self, id: &MessageId) -> Option<usize> {
        // Recent messages are touched most; scan from the tail.
        self.entries.iter().rposition(|e| &e.message.id == id)
    }

    fn sorted_position(&self, message: &Message) -> usize {
        let key = message.order_key();
        self.entries
            .partition_point(|e| e.message.order_key() < key)
    }

    /// Move the entry at `index` if its key no longer fits between neighbours.
    fn reposition(&mut self, index: usize) {
        let key = self.entries[index].message.order_key();
        let before_ok = index == 0 || self.entries[index - 1].message.order_key() <= key;
        let after_ok = index + 1 >= self.entries.len()
            || key <= self.entries[index + 1].message.order_key();
        if before_ok && after_ok {
            return;
        }

        let entry = self.entries.remove(index);
        let target = self.sorted_position(&entry.message);
        self.entries.insert(target, entry);
    }
}
