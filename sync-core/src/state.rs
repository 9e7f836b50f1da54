//! Change-feed subscription state machine for convo-sync.
//!
//! This module provides a pure, side-effect-free state machine for the
//! lifecycle of a conversation's push subscription. The state machine takes
//! events as input and produces a new state plus a list of actions to execute.
//!
//! Whenever the subscription is not `Live`, the polling fallback is the
//! primary correctness mechanism. The feed never replays missed events, so
//! every transition into `Live` asks for an immediate poll to heal the gap.
//!
//! The actual I/O (subscribing, polling, timers) is performed by sync-client,
//! not by this module.

use std::time::Duration;

/// Subscription state machine - NO I/O, just state transitions.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FeedState {
    /// Not subscribed.
    #[default]
    Idle,
    /// Subscribe call in progress.
    Subscribing {
        /// Failed attempts before this one.
        attempt: u32,
    },
    /// Subscribed and receiving push events.
    Live,
    /// Subscription exists but the connection dropped; the service is
    /// reconnecting on its own.
    Interrupted,
    /// Subscription failed, waiting to retry.
    Retrying {
        /// Number of failed attempts so far.
        attempt: u32,
    },
}

impl FeedState {
    /// Create a new state machine in the Idle state.
    pub fn new() -> Self {
        Self::Idle
    }

    /// Process an event and return the new state plus actions to execute.
    ///
    /// This is a pure function - no side effects. The caller (sync-client)
    /// is responsible for executing the returned actions.
    pub fn on_event(self, event: FeedInput) -> (Self, Vec<FeedAction>) {
        match (self, event) {
            // From Idle
            (Self::Idle, FeedInput::SubscribeRequested) => {
                (Self::Subscribing { attempt: 0 }, vec![FeedAction::Subscribe])
            }

            // From Subscribing
            (Self::Subscribing { .. }, FeedInput::Subscribed) => (
                Self::Live,
                vec![
                    FeedAction::PollNow,
                    FeedAction::EmitEvent(FeedStatus::Live),
                ],
            ),
            (Self::Subscribing { attempt }, FeedInput::SubscribeFailed { error }) => {
                Self::retry_after(attempt.saturating_add(1), error)
            }

            // From Live
            (Self::Live, FeedInput::ConnectionLost { reason }) => (
                Self::Interrupted,
                vec![FeedAction::EmitEvent(FeedStatus::Interrupted { reason })],
            ),
            (Self::Live, FeedInput::SubscribeFailed { error }) => Self::retry_after(1, error),

            // From Interrupted
            (Self::Interrupted, FeedInput::ConnectionRestored | FeedInput::Subscribed) => (
                Self::Live,
                vec![
                    FeedAction::PollNow,
                    FeedAction::EmitEvent(FeedStatus::Restored),
                ],
            ),
            (Self::Interrupted, FeedInput::SubscribeFailed { error }) => {
                Self::retry_after(1, error)
            }

            // From Retrying
            (Self::Retrying { attempt }, FeedInput::RetryTimer) => (
                Self::Subscribing { attempt },
                vec![FeedAction::Unsubscribe, FeedAction::Subscribe],
            ),
            (Self::Retrying { .. }, FeedInput::UnsubscribeRequested) => {
                (Self::Idle, vec![FeedAction::CancelRetry])
            }

            // Leaving from any subscribed state
            (
                Self::Subscribing { .. } | Self::Live | Self::Interrupted,
                FeedInput::UnsubscribeRequested,
            ) => (Self::Idle, vec![FeedAction::Unsubscribe]),

            // Invalid transitions - stay in current state
            (state, _) => (state, vec![]),
        }
    }

    fn retry_after(attempt: u32, error: String) -> (Self, Vec<FeedAction>) {
        (
            Self::Retrying { attempt },
            vec![
                FeedAction::EmitEvent(FeedStatus::SubscribeFailed { attempt, error }),
                FeedAction::StartRetryTimer {
                    delay: calculate_backoff(attempt),
                },
            ],
        )
    }

    /// Check if push events are flowing.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Live)
    }

    /// Whether polling is currently the primary source of correctness.
    pub fn polling_is_primary(&self) -> bool {
        !self.is_live()
    }
}

/// Events that can occur in the subscription lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedInput {
    /// Engine opened the conversation.
    SubscribeRequested,
    /// Service confirmed the subscription.
    Subscribed,
    /// Subscribing failed, or the channel reported an error.
    SubscribeFailed {
        /// Error message describing the failure.
        error: String,
    },
    /// Connection to the service dropped.
    ConnectionLost {
        /// Reason for disconnection.
        reason: String,
    },
    /// Connection to the service came back.
    ConnectionRestored,
    /// Retry timer fired.
    RetryTimer,
    /// Engine closed the conversation.
    UnsubscribeRequested,
}

/// Actions to be executed by the sync-client.
///
/// These are instructions, not side effects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedAction {
    /// Subscribe to the conversation's tables.
    Subscribe,
    /// Drop existing subscriptions.
    Unsubscribe,
    /// Run the polling fallback immediately.
    PollNow,
    /// Start a timer for resubscribing.
    StartRetryTimer {
        /// Delay before attempting again.
        delay: Duration,
    },
    /// Cancel any pending retry timer.
    CancelRetry,
    /// Emit a status change to the application.
    EmitEvent(FeedStatus),
}

/// Feed status changes emitted to the application layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedStatus {
    /// Push events are flowing.
    Live,
    /// Connection dropped; polling is primary until restored.
    Interrupted {
        /// Reason for disconnection.
        reason: String,
    },
    /// Connection restored after an interruption.
    Restored,
    /// Subscribing failed.
    SubscribeFailed {
        /// Which attempt this was.
        attempt: u32,
        /// Error message describing the failure.
        error: String,
    },
}

/// Calculate resubscribe backoff with jitter.
///
/// Uses exponential backoff with random jitter so that many clients do not
/// resubscribe in lockstep after a service restart.
///
/// Formula: min(30s, 2^attempt seconds) + random(0..5000ms)
pub fn calculate_backoff(attempt: u32) -> Duration {
    // Base: 2^attempt seconds, capped at 30 seconds
    let base_secs = 2u64.pow(attempt.min(5)).min(30);
    let base = Duration::from_secs(base_secs);

    let jitter = Duration::from_millis(random_jitter_ms());

    base + jitter
}

/// Generate random jitter between 0 and 5000 milliseconds.
fn random_jitter_ms() -> u64 {
    let mut bytes = [0u8; 8];
    if getrandom::getrandom(&mut bytes).is_err() {
        return 0;
    }
    let random = u64::from_le_bytes(bytes);
    random % 5001 // 0..5000 inclusive
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_idle() {
        let state = FeedState::new();
        assert!(matches!(state, FeedState::Idle));
        assert!(state.polling_is_primary());
    }

    #[test]
    fn subscribe_request_transitions_to_subscribing() {
        let (state, actions) = FeedState::Idle.on_event(FeedInput::SubscribeRequested);

        assert!(matches!(state, FeedState::Subscribing { attempt: 0 }));
        assert!(actions.iter().any(|a| matches!(a, FeedAction::Subscribe)));
    }

    #[test]
    fn subscribed_goes_live_and_polls() {
        let (state, actions) =
            FeedState::Subscribing { attempt: 0 }.on_event(FeedInput::Subscribed);

        assert!(state.is_live());
        assert!(!state.polling_is_primary());
        assert!(actions.iter().any(|a| matches!(a, FeedAction::PollNow)));
        assert!(actions
            .iter()
            .any(|a| matches!(a, FeedAction::EmitEvent(FeedStatus::Live))));
    }

    #[test]
    fn subscribe_failure_schedules_retry() {
        let (state, actions) = FeedState::Subscribing { attempt: 0 }.on_event(
            FeedInput::SubscribeFailed {
                error: "timeout".into(),
            },
        );

        assert!(matches!(state, FeedState::Retrying { attempt: 1 }));
        assert!(actions
            .iter()
            .any(|a| matches!(a, FeedAction::StartRetryTimer { .. })));
    }

    #[test]
    fn repeated_failures_increment_attempt() {
        let (state, _) = FeedState::Retrying { attempt: 2 }.on_event(FeedInput::RetryTimer);
        assert!(matches!(state, FeedState::Subscribing { attempt: 2 }));

        let (state, actions) = state.on_event(FeedInput::SubscribeFailed {
            error: "timeout".into(),
        });
        assert!(matches!(state, FeedState::Retrying { attempt: 3 }));
        assert!(actions.iter().any(|a| matches!(
            a,
            FeedAction::EmitEvent(FeedStatus::SubscribeFailed { attempt: 3, .. })
        )));
    }

    #[test]
    fn retry_timer_resubscribes() {
        let (state, actions) = FeedState::Retrying { attempt: 1 }.on_event(FeedInput::RetryTimer);

        assert!(matches!(state, FeedState::Subscribing { attempt: 1 }));
        assert_eq!(actions, vec![FeedAction::Unsubscribe, FeedAction::Subscribe]);
    }

    #[test]
    fn connection_loss_makes_polling_primary() {
        let (state, actions) = FeedState::Live.on_event(FeedInput::ConnectionLost {
            reason: "socket closed".into(),
        });

        assert!(matches!(state, FeedState::Interrupted));
        assert!(state.polling_is_primary());
        assert!(actions.iter().any(|a| matches!(
            a,
            FeedAction::EmitEvent(FeedStatus::Interrupted { .. })
        )));
    }

    #[test]
    fn restore_polls_to_heal_gap() {
        let (state, actions) = FeedState::Interrupted.on_event(FeedInput::ConnectionRestored);

        assert!(state.is_live());
        assert!(actions.iter().any(|a| matches!(a, FeedAction::PollNow)));
        assert!(actions
            .iter()
            .any(|a| matches!(a, FeedAction::EmitEvent(FeedStatus::Restored))));
    }

    #[test]
    fn channel_error_while_live_retries() {
        let (state, _) = FeedState::Live.on_event(FeedInput::SubscribeFailed {
            error: "channel error".into(),
        });
        assert!(matches!(state, FeedState::Retrying { attempt: 1 }));
    }

    #[test]
    fn unsubscribe_from_live() {
        let (state, actions) = FeedState::Live.on_event(FeedInput::UnsubscribeRequested);

        assert!(matches!(state, FeedState::Idle));
        assert_eq!(actions, vec![FeedAction::Unsubscribe]);
    }

    #[test]
    fn unsubscribe_from_retrying_cancels_timer() {
        let (state, actions) =
            FeedState::Retrying { attempt: 2 }.on_event(FeedInput::UnsubscribeRequested);

        assert!(matches!(state, FeedState::Idle));
        assert_eq!(actions, vec![FeedAction::CancelRetry]);
    }

    #[test]
    fn invalid_transitions_keep_state() {
        let (state, actions) = FeedState::Idle.on_event(FeedInput::ConnectionRestored);
        assert!(matches!(state, FeedState::Idle));
        assert!(actions.is_empty());

        let (state, actions) = FeedState::Live.on_event(FeedInput::RetryTimer);
        assert!(state.is_live());
        assert!(actions.is_empty());
    }

    #[test]
    fn backoff_increases_with_attempt() {
        assert!(calculate_backoff(1) >= Duration::from_secs(2));
        assert!(calculate_backoff(3) >= Duration::from_secs(8));
    }

    #[test]
    fn backoff_capped_at_30_seconds_plus_jitter() {
        let delay = calculate_backoff(10);
        assert!(
            delay <= Duration::from_secs(35),
            "Retry delay must be capped at ~35s (30s base + 5s jitter), got {:?}",
            delay
        );
    }
}
