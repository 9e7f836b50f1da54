//! Reaction aggregation for convo-sync.
//!
//! Reactions are kept as a flat list of (message, user, emoji) records per
//! message, updated incrementally from push events. The grouped view folds
//! that list into per-emoji counts on demand.
//!
//! Toggling is not applied locally: the view only reflects records the
//! server has pushed back, so a toggle and its own push event can never
//! double-count.

use std::collections::{BTreeMap, HashMap};
use convo_sync_types::{MessageId, Reaction, UserId};

/// Grouped reaction count for one emoji on one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReactionSummary {
    /// Number of users who reacted with this emoji.
    pub count: usize,
    /// Whether the current user is among them.
    pub reacted_by_me: bool,
}

/// Per-message reaction records.
#[derive(Debug, Clone, Default)]
pub struct ReactionAggregator {
    by_message: HashMap<MessageId, Vec<Reaction>>,
}

impl ReactionAggregator {
    /// Create an empty aggregator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the records for one message (initial load).
    pub fn load(&mut self, message_id: &MessageId, records: Vec<Reaction>) {
        let mut unique: Vec<Reaction> = Vec::with_capacity(records.len());
        for record in records {
            if record.message_id == *message_id && !unique.contains(&record) {
                unique.push(record);
            }
        }
        self.by_message.insert(message_id.clone(), unique);
    }

    /// Apply a pushed insert. Returns `false` if the record already existed.
    pub fn apply_added(&mut self, reaction: Reaction) -> bool {
        let records = self.by_message.entry(reaction.message_id.clone()).or_default();
        if records.contains(&reaction) {
            return false;
        }
        records.push(reaction);
        true
    }

    /// Apply a pushed delete. Returns `false` if the record was absent.
    pub fn apply_removed(&mut self, reaction: &Reaction) -> bool {
        let Some(records) = self.by_message.get_mut(&reaction.message_id) else {
            return false;
        };
        let before = records.len();
        records.retain(|r| r != reaction);
        let removed = records.len() != before;
        if records.is_empty() {
            self.by_message.remove(&reaction.message_id);
        }
        removed
    }

    /// Whether `user` currently has `emoji` on `message_id`.
    pub fn has_reacted(&self, message_id: &MessageId, user: &UserId, emoji: &str) -> bool {
        self.by_message
            .get(message_id)
            .map(|records| {
                records
                    .iter()
                    .any(|r| &r.user_id == user && r.emoji == emoji)
            })
            .unwrap_or(false)
    }

    /// Fold the records of one message into per-emoji summaries.
    pub fn grouped_view(
        &self,
        message_id: &MessageId,
        current_user: &UserId,
    ) -> BTreeMap<String, ReactionSummary> {
        let mut grouped: BTreeMap<String, ReactionSummary> = BTreeMap::new();
        if let Some(records) = self.by_message.get(message_id) {
            for record in records {
                let summary = grouped.entry(record.emoji.clone()).or_default();
                summary.count += 1;
                if &record.user_id == current_user {
                    summary.reacted_by_me = true;
                }
            }
        }
        grouped
    }

    /// Drop all records of a message (retracted or removed).
    pub fn forget_message(&mut self, message_id: &MessageId) {
        self.by_message.remove(message_id);
    }

    /// Total number of records held.
    pub fn len(&self) -> usize {
        self.by_message.values().map(Vec::len).sum()
    }

    /// Whether no records are held.
    pub fn is_empty(&self) -> bool {
        self.by_message.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(message: &str, user: &str, emoji: &str) -> Reaction {
        Reaction::new(MessageId::new(message), UserId::new(user), emoji)
    }

    fn me() -> UserId {
        UserId::new("alice")
    }

    #[test]
    fn grouped_view_counts_per_emoji() {
        let mut agg = ReactionAggregator::new();
        agg.apply_added(r("m1", "alice", "👍"));
        agg.apply_added(r("m1", "bob", "👍"));
        agg.apply_added(r("m1", "bob", "🎉"));

        let view = agg.grouped_view(&MessageId::new("m1"), &me());

        assert_eq!(
            view["👍"],
            ReactionSummary {
                count: 2,
                reacted_by_me: true
            }
        );
        assert_eq!(
            view["🎉"],
            ReactionSummary {
                count: 1,
                reacted_by_me: false
            }
        );
    }

    #[test]
    fn duplicate_add_is_idempotent() {
        let mut agg = ReactionAggregator::new();
        assert!(agg.apply_added(r("m1", "bob", "👍")));
        assert!(!agg.apply_added(r("m1", "bob", "👍")));

        let view = agg.grouped_view(&MessageId::new("m1"), &me());
        assert_eq!(view["👍"].count, 1);
    }

    #[test]
    fn add_then_remove_restores_previous_view() {
        let mut agg = ReactionAggregator::new();
        agg.apply_added(r("m1", "bob", "👍"));
        let before = agg.grouped_view(&MessageId::new("m1"), &me());

        agg.apply_added(r("m1", "alice", "👍"));
        agg.apply_removed(&r("m1", "alice", "👍"));

        assert_eq!(agg.grouped_view(&MessageId::new("m1"), &me()), before);
    }

    #[test]
    fn removing_absent_record_is_noop() {
        let mut agg = ReactionAggregator::new();
        assert!(!agg.apply_removed(&r("m1", "bob", "👍")));
        agg.apply_added(r("m1", "bob", "🎉"));
        assert!(!agg.apply_removed(&r("m1", "bob", "👍")));
        assert_eq!(agg.len(), 1);
    }

    #[test]
    fn has_reacted_checks_user_and_emoji() {
        let mut agg = ReactionAggregator::new();
        agg.apply_added(r("m1", "alice", "👍"));

        assert!(agg.has_reacted(&MessageId::new("m1"), &me(), "👍"));
        assert!(!agg.has_reacted(&MessageId::new("m1"), &me(), "🎉"));
        assert!(!agg.has_reacted(&MessageId::new("m2"), &me(), "👍"));
    }

    #[test]
    fn load_deduplicates_and_filters() {
        let mut agg = ReactionAggregator::new();
        agg.load(
            &MessageId::new("m1"),
            vec![
                r("m1", "bob", "👍"),
                r("m1", "bob", "👍"),
                r("m2", "bob", "👍"),
            ],
        );
        assert_eq!(agg.len(), 1);
    }

    #[test]
    fn empty_view_for_unknown_message() {
        let agg = ReactionAggregator::new();
        assert!(agg.grouped_view(&MessageId::new("m1"), &me()).is_empty());
        assert!(agg.is_empty());
    }

    #[test]
    fn forget_message_drops_records() {
        let mut agg = ReactionAggregator::new();
        agg.apply_added(r("m1", "bob", "👍"));
        agg.forget_message(&MessageId::new("m1"));
        assert!(agg.is_empty());
    }
}
