//! Poll watermark tracking for convo-sync.
//!
//! The polling fallback asks for "messages created at or after T". The
//! [`Watermark`] holds T:
//! - Advances to the newest authoritative timestamp seen
//! - Never moves backwards, whatever order results arrive in
//! - Ignores optimistic entries, whose timestamps come from the local clock
//!
//! A late poll result or an out-of-order push event can therefore never make
//! the next poll skip a range it has not covered.

use convo_sync_types::Timestamp;

/// Monotonic "newest timestamp seen" marker for polling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Watermark {
    newest: Timestamp,
}

impl Watermark {
    /// Create a watermark at the epoch (poll everything).
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a watermark starting at a specific timestamp.
    ///
    /// This is useful when resuming from a persisted state.
    pub fn with_timestamp(at: Timestamp) -> Self {
        Self { newest: at }
    }

    /// Record an authoritative timestamp.
    ///
    /// Returns `true` if the watermark advanced.
    pub fn observe(&mut self, at: Timestamp) -> bool {
        if at > self.newest {
            self.newest = at;
            true
        } else {
            false
        }
    }

    /// The newest timestamp seen so far.
    pub fn value(&self) -> Timestamp {
        self.newest
    }

    /// Whether nothing has been observed yet.
    pub fn is_unset(&self) -> bool {
        self.newest == Timestamp::zero()
    }

    /// Reset to a specific timestamp, discarding progress.
    pub fn reset(&mut self, at: Timestamp) {
        self.newest = at;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watermark_starts_at_epoch() {
        let watermark = Watermark::new();
        assert_eq!(watermark.value(), Timestamp::zero());
        assert!(watermark.is_unset());
    }

    #[test]
    fn watermark_advances_on_newer() {
        let mut watermark = Watermark::new();

        assert!(watermark.observe(Timestamp::new(5)));
        assert!(watermark.observe(Timestamp::new(9)));

        assert_eq!(watermark.value(), Timestamp::new(9));
    }

    #[test]
    fn out_of_order_observations_never_regress() {
        let mut watermark = Watermark::new();

        watermark.observe(Timestamp::new(50));
        assert!(!watermark.observe(Timestamp::new(20))); // Late arrival
        assert!(!watermark.observe(Timestamp::new(50))); // Duplicate

        assert_eq!(watermark.value(), Timestamp::new(50));
    }

    #[test]
    fn with_timestamp_initializes_correctly() {
        let watermark = Watermark::with_timestamp(Timestamp::new(100));
        assert_eq!(watermark.value(), Timestamp::new(100));
        assert!(!watermark.is_unset());
    }

    #[test]
    fn reset_can_move_backwards() {
        let mut watermark = Watermark::with_timestamp(Timestamp::new(100));
        watermark.reset(Timestamp::new(10));
        assert_eq!(watermark.value(), Timestamp::new(10));
    }
}
