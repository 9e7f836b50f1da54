//! Pin and read-state tracking for convo-sync.
//!
//! The channel's pinned reference is weak: it names a message by id and must
//! be resolved by lookup. [`PinTracker`] records which id needs resolving and
//! what the lookup found; a pin whose target cannot be found (or is later
//! deleted) resolves to "no pin" instead of an error.
//!
//! [`ReadState`] decides when the read cursor needs a new remote mark.

use convo_sync_types::{Channel, MessageId, Timestamp};

/// Resolution state of the channel's pinned reference.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PinState {
    /// Nothing pinned, or the pinned target is gone.
    #[default]
    None,
    /// A pin was announced and its target is being looked up.
    Resolving(MessageId),
    /// The pinned target exists.
    Pinned(MessageId),
}

/// Tracks the channel's single pinned message.
#[derive(Debug, Clone, Default)]
pub struct PinTracker {
    state: PinState,
}

impl PinTracker {
    /// Create a tracker with nothing pinned.
    pub fn new() -> Self {
        Self::default()
    }

    /// Process a channel update.
    ///
    /// Returns the id that must now be resolved, if the pin changed.
    pub fn on_channel_update(&mut self, channel: &Channel) -> Option<MessageId> {
        match &channel.pinned_message_id {
            None => {
                self.state = PinState::None;
                None
            }
            Some(id) => {
                let unchanged = matches!(
                    &self.state,
                    PinState::Pinned(current) | PinState::Resolving(current) if current == id
                );
                if unchanged {
                    return None;
                }
                self.state = PinState::Resolving(id.clone());
                Some(id.clone())
            }
        }
    }

    /// Record the outcome of looking up `id`.
    ///
    /// Stale results for an id that is no longer being resolved are ignored.
    pub fn resolve(&mut self, id: &MessageId, found: bool) {
        if !matches!(&self.state, PinState::Resolving(current) if current == id) {
            tracing::debug!("Stale pin resolution ignored: {}", id);
            return;
        }
        self.state = if found {
            PinState::Pinned(id.clone())
        } else {
            PinState::None
        };
    }

    /// Clear the pin if `id` was its target.
    pub fn on_message_deleted(&mut self, id: &MessageId) {
        let hit = matches!(
            &self.state,
            PinState::Pinned(current) | PinState::Resolving(current) if current == id
        );
        if hit {
            self.state = PinState::None;
        }
    }

    /// The resolved pinned id, if any.
    pub fn pinned_id(&self) -> Option<&MessageId> {
        match &self.state {
            PinState::Pinned(id) => Some(id),
            _ => None,
        }
    }

    /// Current state.
    pub fn state(&self) -> &PinState {
        &self.state
    }
}

/// Read-cursor bookkeeping for the active conversation.
#[derive(Debug, Clone, Default)]
pub struct ReadState {
    marked_count: Option<usize>,
    last_read_at: Option<Timestamp>,
    last_message_id: Option<MessageId>,
}

impl ReadState {
    /// Create an empty read state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Observe the visible message count.
    ///
    /// Returns `true` when the count differs from the last observed one,
    /// meaning a remote mark should be issued.
    pub fn observe_visible(&mut self, count: usize) -> bool {
        if self.marked_count == Some(count) {
            return false;
        }
        self.marked_count = Some(count);
        true
    }

    /// Record a read mark locally.
    pub fn record_read(&mut self, at: Timestamp, last_message_id: Option<MessageId>) {
        self.last_read_at = Some(at);
        self.last_message_id = last_message_id;
    }

    /// When the last mark was recorded.
    pub fn last_read_at(&self) -> Option<Timestamp> {
        self.last_read_at
    }

    /// Newest message covered by the last mark.
    pub fn last_message_id(&self) -> Option<&MessageId> {
        self.last_message_id.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convo_sync_types::ChannelId;

    fn channel(pinned: Option<&str>) -> Channel {
        Channel {
            id: ChannelId::new("general"),
            name: "General".into(),
            description: None,
            owner_id: None,
            pinned_message_id: pinned.map(MessageId::new),
            member_count: 2,
            restricted: false,
        }
    }

    // ===========================================
    // Pin Tests
    // ===========================================

    #[test]
    fn new_pin_requests_resolution() {
        let mut pins = PinTracker::new();
        let to_resolve = pins.on_channel_update(&channel(Some("m7")));

        assert_eq!(to_resolve, Some(MessageId::new("m7")));
        assert_eq!(pins.state(), &PinState::Resolving(MessageId::new("m7")));
        assert!(pins.pinned_id().is_none());
    }

    #[test]
    fn successful_resolution_pins() {
        let mut pins = PinTracker::new();
        pins.on_channel_update(&channel(Some("m7")));
        pins.resolve(&MessageId::new("m7"), true);

        assert_eq!(pins.pinned_id(), Some(&MessageId::new("m7")));
    }

    #[test]
    fn failed_resolution_means_no_pin() {
        let mut pins = PinTracker::new();
        pins.on_channel_update(&channel(Some("m7")));
        pins.resolve(&MessageId::new("m7"), false);

        assert_eq!(pins.state(), &PinState::None);
    }

    #[test]
    fn deleting_pinned_message_clears_pin() {
        let mut pins = PinTracker::new();
        pins.on_channel_update(&channel(Some("m7")));
        pins.resolve(&MessageId::new("m7"), true);

        pins.on_message_deleted(&MessageId::new("m7"));

        assert!(pins.pinned_id().is_none());
    }

    #[test]
    fn deleting_other_message_keeps_pin() {
        let mut pins = PinTracker::new();
        pins.on_channel_update(&channel(Some("m7")));
        pins.resolve(&MessageId::new("m7"), true);

        pins.on_message_deleted(&MessageId::new("m8"));

        assert_eq!(pins.pinned_id(), Some(&MessageId::new("m7")));
    }

    #[test]
    fn same_pin_does_not_re_resolve() {
        let mut pins = PinTracker::new();
        pins.on_channel_update(&channel(Some("m7")));
        pins.resolve(&MessageId::new("m7"), true);

        assert_eq!(pins.on_channel_update(&channel(Some("m7"))), None);
    }

    #[test]
    fn unpin_clears_state() {
        let mut pins = PinTracker::new();
        pins.on_channel_update(&channel(Some("m7")));
        pins.resolve(&MessageId::new("m7"), true);

        assert_eq!(pins.on_channel_update(&channel(None)), None);
        assert_eq!(pins.state(), &PinState::None);
    }

    #[test]
    fn stale_resolution_is_ignored() {
        let mut pins = PinTracker::new();
        pins.on_channel_update(&channel(Some("m7")));
        pins.on_channel_update(&channel(Some("m8")));

        pins.resolve(&MessageId::new("m7"), true);

        assert_eq!(pins.state(), &PinState::Resolving(MessageId::new("m8")));
    }

    // ===========================================
    // Read State Tests
    // ===========================================

    #[test]
    fn first_observation_requests_mark() {
        let mut read = ReadState::new();
        assert!(read.observe_visible(0));
    }

    #[test]
    fn unchanged_count_does_not_request_mark() {
        let mut read = ReadState::new();
        read.observe_visible(3);
        assert!(!read.observe_visible(3));
        assert!(read.observe_visible(4));
    }

    #[test]
    fn record_read_keeps_cursor() {
        let mut read = ReadState::new();
        read.record_read(Timestamp::new(42), Some(MessageId::new("m3")));

        assert_eq!(read.last_read_at(), Some(Timestamp::new(42)));
        assert_eq!(read.last_message_id(), Some(&MessageId::new("m3")));
    }
}
