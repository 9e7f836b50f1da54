//! ConversationEngine - the main interface for convo-sync.
//!
//! One engine owns everything known about one conversation: the message
//! store, reactions, the pin, the read cursor, the subscription state and
//! the in-flight sends. Several engines can coexist in one process.
//!
//! # Architecture
//!
//! ```text
//! ChangeFeed ──┐
//! Poller ──────┼──> inbox (mpsc) ──> drain()/run() ──> ConversationState
//! Retry timer ─┘                                         (sync-core)
//!
//! Application ──> send/toggle/pin ──> ChannelBackend ──> local apply
//! ```
//!
//! Push events, poll results and retry timers never mutate state from the
//! task they arrive on. They are queued and applied in arrival order by a
//! single consumer, either [`ConversationEngine::run`] (spawned) or
//! [`ConversationEngine::drain`] (manual pumping, used by tests).
//!
//! # Example
//!
//! ```ignore
//! let engine = Arc::new(ConversationEngine::new(
//!     ChannelId::new("general"),
//!     UserId::new("alice"),
//!     EngineConfig::default(),
//!     backend,
//!     blobs,
//! ));
//! engine.open().await?;
//! let _loop = Arc::clone(&engine).spawn_loop();
//! let _poller = Arc::clone(&engine).spawn_poller();
//!
//! engine.send(Draft::text("hi")).await?;
//! ```

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use convo_sync_core::{
    FeedAction, FeedInput, FeedState, FeedStatus, InsertOutcome, MessageStore, PinState,
    PinTracker, ReactionAggregator, ReactionSummary, ReadState, SendLedger, UpdateOutcome,
};
use convo_sync_types::{
    BatchId, Channel, ChannelId, FeedEvent, Message, MessageId, MessagePatch, PatchChange,
    Reaction, ReadCursor, Table, Timestamp, UserId,
};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::backend::{rpc, BlobStore, ChannelBackend, ChannelStatus, Order, Query};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::feed::{ChangeFeed, FeedNotice, FeedSubscription, NoticeSink};
use crate::poller::PollingFallback;
use crate::sender::{Draft, SendPipeline};

/// Capacity of the [`EngineEvent`] broadcast channel.
const EVENT_CAPACITY: usize = 256;

/// Change notifications for the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// The message list changed.
    MessagesChanged {
        /// Number of visible messages (tombstones included).
        visible: usize,
    },
    /// Reactions on a message changed.
    ReactionsChanged(MessageId),
    /// The resolved pin changed.
    PinChanged(Option<MessageId>),
    /// Channel metadata changed.
    ChannelUpdated(Channel),
    /// Subscription status changed.
    Feed(FeedStatus),
    /// An optimistic send was retracted.
    SendFailed {
        /// Temporary id of the retracted entry.
        temp_id: MessageId,
        /// What went wrong.
        error: String,
    },
}

/// Outcome of a successful [`ConversationEngine::send`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    /// Server ids of the written messages, in send order.
    pub message_ids: Vec<MessageId>,
    /// Batch the messages share, for multi-attachment sends.
    pub batch_id: Option<BatchId>,
}

#[derive(Debug)]
enum Inbound {
    Notice(FeedNotice),
    Polled(Vec<Message>),
    RetrySubscribe,
    Shutdown,
}

/// Async work that follows a state mutation, run after the lock is released.
enum Followup {
    Feed(FeedInput),
    ResolvePin(MessageId),
    MarkRead,
}

/// Everything the engine knows about its conversation.
struct ConversationState {
    channel: Option<Channel>,
    store: MessageStore,
    reactions: ReactionAggregator,
    pins: PinTracker,
    pinned_message: Option<Message>,
    read: ReadState,
    feed: FeedState,
    ledger: SendLedger,
}

impl ConversationState {
    fn new(max_in_flight: usize) -> Self {
        Self {
            channel: None,
            store: MessageStore::new(),
            reactions: ReactionAggregator::new(),
            pins: PinTracker::new(),
            pinned_message: None,
            read: ReadState::new(),
            feed: FeedState::new(),
            ledger: SendLedger::new(max_in_flight),
        }
    }

    fn is_open(&self) -> bool {
        self.channel.is_some()
    }
}

/// Sync engine for one conversation.
pub struct ConversationEngine<B: ChannelBackend, S: BlobStore> {
    channel_id: ChannelId,
    user_id: UserId,
    config: EngineConfig,
    backend: Arc<B>,
    feed: ChangeFeed<B>,
    poller: PollingFallback<B>,
    sender: SendPipeline<B, S>,
    state: Arc<Mutex<ConversationState>>,
    subscription: Mutex<Option<FeedSubscription>>,
    retry_timer: Mutex<Option<JoinHandle<()>>>,
    inbox: mpsc::UnboundedSender<Inbound>,
    inbox_rx: Mutex<mpsc::UnboundedReceiver<Inbound>>,
    events: broadcast::Sender<EngineEvent>,
}

impl<B, S> ConversationEngine<B, S>
where
    B: ChannelBackend + 'static,
    S: BlobStore + 'static,
{
    /// Create an engine for `channel_id`, acting as `user_id`.
    ///
    /// Nothing is loaded until [`open`](Self::open) is called.
    pub fn new(
        channel_id: ChannelId,
        user_id: UserId,
        config: EngineConfig,
        backend: Arc<B>,
        blobs: Arc<S>,
    ) -> Self {
        let (inbox, inbox_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            feed: ChangeFeed::new(Arc::clone(&backend)),
            poller: PollingFallback::new(Arc::clone(&backend), config.poll_page_limit),
            sender: SendPipeline::new(
                Arc::clone(&backend),
                blobs,
                config.attachment_bucket.clone(),
            ),
            state: Arc::new(Mutex::new(ConversationState::new(
                config.max_in_flight_sends,
            ))),
            subscription: Mutex::new(None),
            retry_timer: Mutex::new(None),
            inbox,
            inbox_rx: Mutex::new(inbox_rx),
            events,
            channel_id,
            user_id,
            config,
            backend,
        }
    }

    /// The conversation this engine syncs.
    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    /// The acting user.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// The engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ===== Lifecycle =====

    /// Load the conversation and subscribe to its changes.
    ///
    /// Loads the channel row (and resolves its pin), the newest page of
    /// messages and their reactions, then subscribes and marks the
    /// conversation read. Opening an open engine is a no-op.
    pub async fn open(&self) -> Result<(), EngineError> {
        if self.is_open().await {
            tracing::debug!("Conversation {} already open", self.channel_id);
            return Ok(());
        }
        tracing::info!("Opening conversation {} as {}", self.channel_id, self.user_id);

        let channel = self.fetch_channel().await?;
        let messages = self.fetch_initial_page().await?;
        let reactions = self.fetch_reactions().await?;

        // Leftovers from a previous session, including its Shutdown.
        if let Ok(mut rx) = self.inbox_rx.try_lock() {
            while rx.try_recv().is_ok() {}
        }

        let to_resolve = {
            let mut state = self.state.lock().await;
            *state = ConversationState::new(self.config.max_in_flight_sends);
            for message in messages {
                state.store.apply_insert(message);
            }
            for (message_id, records) in reactions {
                state.reactions.load(&message_id, records);
            }
            let to_resolve = state.pins.on_channel_update(&channel);
            state.channel = Some(channel);
            to_resolve
        };
        if let Some(id) = to_resolve {
            self.resolve_pin(id).await;
        }
        self.emit_messages_changed().await;

        self.feed_input(FeedInput::SubscribeRequested).await;
        self.mark_read().await;
        Ok(())
    }

    /// Unsubscribe and stop the consumer loop.
    ///
    /// The local view is kept for display but no longer updated; every
    /// remote operation returns [`EngineError::NotOpen`] until reopened.
    pub async fn close(&self) {
        self.feed_input(FeedInput::UnsubscribeRequested).await;
        self.cancel_retry().await;
        self.drop_subscription().await;
        {
            let mut state = self.state.lock().await;
            state.channel = None;
            state.feed = FeedState::Idle;
        }
        let _ = self.inbox.send(Inbound::Shutdown);
        tracing::info!("Closed conversation {}", self.channel_id);
    }

    /// Whether the conversation is open.
    pub async fn is_open(&self) -> bool {
        self.state.lock().await.is_open()
    }

    // ===== Event Loop =====

    /// Apply everything queued so far. Returns the number of items applied.
    ///
    /// Returns immediately if [`run`](Self::run) owns the queue.
    pub async fn drain(&self) -> usize {
        let mut applied = 0;
        loop {
            let next = match self.inbox_rx.try_lock() {
                Ok(mut rx) => rx.try_recv(),
                Err(_) => return applied,
            };
            match next {
                Ok(Inbound::Shutdown) => continue,
                Ok(inbound) => {
                    self.handle(inbound).await;
                    applied += 1;
                }
                Err(_) => return applied,
            }
        }
    }

    /// Apply queued items as they arrive, until [`close`](Self::close).
    pub async fn run(&self) {
        let mut rx = self.inbox_rx.lock().await;
        tracing::info!("Event loop started for {}", self.channel_id);
        while let Some(inbound) = rx.recv().await {
            if matches!(inbound, Inbound::Shutdown) {
                break;
            }
            self.handle(inbound).await;
        }
        tracing::info!("Event loop stopped for {}", self.channel_id);
    }

    /// Spawn [`run`](Self::run) on the current runtime.
    pub fn spawn_loop(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    /// Spawn the periodic fallback poll.
    ///
    /// Polls every `poll_interval_secs` regardless of subscription state.
    /// Each poll runs on its own task, so a stalled poll does not delay the
    /// schedule; a tick that finds the previous poll outstanding is skipped.
    /// The task ends once the conversation is closed.
    pub fn spawn_poller(self: Arc<Self>) -> JoinHandle<()> {
        let period = self.config.poll_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // First tick completes immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if !self.is_open().await {
                    tracing::debug!("Poller for {} stopping", self.channel_id);
                    break;
                }
                let engine = Arc::clone(&self);
                tokio::spawn(async move {
                    if let Err(e) = engine.poll_now().await {
                        tracing::warn!("Scheduled poll for {} failed: {}", engine.channel_id, e);
                    }
                });
            }
        })
    }

    /// Fetch messages created at or after the watermark and queue the ones
    /// not applied yet.
    ///
    /// Returns the number of messages queued, or 0 if another poll is
    /// still outstanding.
    pub async fn poll_now(&self) -> Result<usize, EngineError> {
        let Some(_guard) = self.poller.try_begin() else {
            tracing::debug!("Poll for {} skipped: previous poll outstanding", self.channel_id);
            return Ok(0);
        };

        let since = {
            let state = self.state.lock().await;
            if !state.is_open() {
                return Err(EngineError::NotOpen);
            }
            state.store.watermark()
        };

        let mut messages = self.poller.poll_since(&self.channel_id, since).await?;
        {
            // The inclusive boundary refetches rows applied at the watermark.
            let state = self.state.lock().await;
            messages.retain(|m| !state.store.has_seen(&m.id));
        }
        let fetched = messages.len();
        if fetched > 0 {
            let _ = self.inbox.send(Inbound::Polled(messages));
        }
        Ok(fetched)
    }

    async fn handle(&self, inbound: Inbound) {
        let followups = {
            let mut state = self.state.lock().await;
            match inbound {
                Inbound::Notice(FeedNotice::Event(event)) if state.is_open() => {
                    self.apply_event(&mut state, event)
                }
                Inbound::Notice(FeedNotice::Status(status)) => {
                    vec![Followup::Feed(status_input(&state.feed, status))]
                }
                Inbound::Polled(messages) if state.is_open() => {
                    self.apply_polled(&mut state, messages)
                }
                Inbound::RetrySubscribe => vec![Followup::Feed(FeedInput::RetryTimer)],
                _ => Vec::new(),
            }
        };
        self.run_followups(followups).await;
    }

    async fn run_followups(&self, followups: Vec<Followup>) {
        for followup in followups {
            match followup {
                Followup::Feed(input) => self.feed_input(input).await,
                Followup::ResolvePin(id) => self.resolve_pin(id).await,
                Followup::MarkRead => self.issue_mark_read().await,
            }
        }
    }

    /// Apply a locally produced event through the same path as pushed ones.
    async fn apply_local(&self, event: FeedEvent) {
        let followups = {
            let mut state = self.state.lock().await;
            self.apply_event(&mut state, event)
        };
        self.run_followups(followups).await;
    }

    fn apply_event(&self, state: &mut ConversationState, event: FeedEvent) -> Vec<Followup> {
        let mut followups = Vec::new();

        match event {
            FeedEvent::MessageInserted(message) => {
                if message.channel_id != self.channel_id {
                    return followups;
                }
                if let InsertOutcome::Inserted { .. } = state.store.apply_insert(message) {
                    self.after_store_change(state, &mut followups);
                }
            }
            FeedEvent::MessageUpdated(patch) => {
                let id = patch.id.clone();
                let deletes = match &patch.change {
                    PatchChange::SoftDelete => true,
                    PatchChange::Refresh(message) => message.is_deleted(),
                    PatchChange::ViewCount(_) => false,
                };
                // The pinned target may live outside the loaded page.
                if deletes {
                    self.clear_pin_for(state, &id);
                } else {
                    refresh_pinned_copy(state, &patch);
                }
                match state.store.apply_update(patch) {
                    UpdateOutcome::Applied => {
                        self.emit(EngineEvent::MessagesChanged {
                            visible: state.store.visible_len(),
                        });
                    }
                    UpdateOutcome::Unchanged => {}
                    UpdateOutcome::Dropped => {
                        tracing::debug!("Update for {} dropped; a poll will fetch it", id);
                    }
                }
            }
            FeedEvent::MessageRemoved(id) => {
                state.reactions.forget_message(&id);
                self.clear_pin_for(state, &id);
                if state.store.apply_delete(&id) {
                    self.after_store_change(state, &mut followups);
                }
            }
            FeedEvent::ReactionAdded(reaction) => {
                let id = reaction.message_id.clone();
                if state.reactions.apply_added(reaction) {
                    self.emit(EngineEvent::ReactionsChanged(id));
                }
            }
            FeedEvent::ReactionRemoved(reaction) => {
                if state.reactions.apply_removed(&reaction) {
                    self.emit(EngineEvent::ReactionsChanged(reaction.message_id));
                }
            }
            FeedEvent::ChannelUpdated(channel) => {
                if channel.id != self.channel_id {
                    return followups;
                }
                let was_pinned = state.pins.pinned_id().is_some();
                if let Some(id) = state.pins.on_channel_update(&channel) {
                    followups.push(Followup::ResolvePin(id));
                } else if was_pinned && state.pins.pinned_id().is_none() {
                    state.pinned_message = None;
                    self.emit(EngineEvent::PinChanged(None));
                }
                state.channel = Some(channel.clone());
                self.emit(EngineEvent::ChannelUpdated(channel));
            }
        }

        followups
    }

    fn apply_polled(&self, state: &mut ConversationState, messages: Vec<Message>) -> Vec<Followup> {
        let mut followups = Vec::new();
        let total = messages.len();
        let mut inserted = 0;
        for message in messages {
            if message.channel_id != self.channel_id {
                continue;
            }
            if let InsertOutcome::Inserted { .. } = state.store.apply_insert(message) {
                inserted += 1;
            }
        }

        tracing::debug!(
            "Poll for {} applied {} of {} message(s)",
            self.channel_id,
            inserted,
            total
        );
        if inserted > 0 {
            self.after_store_change(state, &mut followups);
        }
        followups
    }

    fn after_store_change(&self, state: &mut ConversationState, followups: &mut Vec<Followup>) {
        let visible = state.store.visible_len();
        self.emit(EngineEvent::MessagesChanged { visible });
        if self.config.mark_read_on_change && state.read.observe_visible(visible) {
            followups.push(Followup::MarkRead);
        }
    }

    fn clear_pin_for(&self, state: &mut ConversationState, id: &MessageId) {
        let was_pinned = state.pins.pinned_id() == Some(id);
        state.pins.on_message_deleted(id);
        if was_pinned {
            tracing::info!("Pinned message {} deleted, clearing pin", id);
            state.pinned_message = None;
            self.emit(EngineEvent::PinChanged(None));
        }
    }

    // ===== Subscription =====

    /// Feed an input to the subscription state machine and execute the
    /// resulting actions, including any inputs those actions produce.
    async fn feed_input(&self, input: FeedInput) {
        let mut inputs = VecDeque::from([input]);

        while let Some(input) = inputs.pop_front() {
            let actions = {
                let mut state = self.state.lock().await;
                let (next, actions) = state.feed.clone().on_event(input);
                state.feed = next;
                actions
            };
            for action in actions {
                if let Some(next) = self.execute(action).await {
                    inputs.push_back(next);
                }
            }
        }
    }

    async fn execute(&self, action: FeedAction) -> Option<FeedInput> {
        match action {
            FeedAction::Subscribe => {
                match self.feed.subscribe(&self.channel_id, self.notice_sink()).await {
                    Ok(subscription) => {
                        *self.subscription.lock().await = Some(subscription);
                        None
                    }
                    Err(e) => Some(FeedInput::SubscribeFailed {
                        error: e.to_string(),
                    }),
                }
            }
            FeedAction::Unsubscribe => {
                self.drop_subscription().await;
                None
            }
            FeedAction::PollNow => {
                if let Err(e) = self.poll_now().await {
                    tracing::warn!("Gap-healing poll for {} failed: {}", self.channel_id, e);
                }
                None
            }
            FeedAction::StartRetryTimer { delay } => {
                tracing::debug!("Resubscribing to {} in {:?}", self.channel_id, delay);
                let inbox = self.inbox.clone();
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = inbox.send(Inbound::RetrySubscribe);
                });
                if let Some(previous) = self.retry_timer.lock().await.replace(timer) {
                    previous.abort();
                }
                None
            }
            FeedAction::CancelRetry => {
                self.cancel_retry().await;
                None
            }
            FeedAction::EmitEvent(status) => {
                match &status {
                    FeedStatus::Live => tracing::info!("Feed for {} is live", self.channel_id),
                    FeedStatus::Restored => {
                        tracing::info!("Feed for {} restored", self.channel_id)
                    }
                    FeedStatus::Interrupted { reason } => tracing::warn!(
                        "Feed for {} interrupted ({}), polling is primary",
                        self.channel_id,
                        reason
                    ),
                    FeedStatus::SubscribeFailed { attempt, error } => tracing::warn!(
                        "Subscribing to {} failed (attempt {}): {}",
                        self.channel_id,
                        attempt,
                        error
                    ),
                }
                self.emit(EngineEvent::Feed(status));
                None
            }
        }
    }

    fn notice_sink(&self) -> NoticeSink {
        let inbox = self.inbox.clone();
        Arc::new(move |notice| {
            let _ = inbox.send(Inbound::Notice(notice));
        })
    }

    async fn drop_subscription(&self) {
        let Some(subscription) = self.subscription.lock().await.take() else {
            return;
        };
        if let Err(e) = self.feed.unsubscribe(subscription).await {
            tracing::warn!("Unsubscribing from {} failed: {}", self.channel_id, e);
        }
    }

    async fn cancel_retry(&self) {
        if let Some(timer) = self.retry_timer.lock().await.take() {
            timer.abort();
        }
    }

    // ===== Sending =====

    /// Send a draft optimistically.
    ///
    /// Every part appears in the store at once under a temporary id. Parts
    /// are then uploaded and written in order; each acknowledgement replaces
    /// its temporary entry in place. If a part fails, it and every part not
    /// yet written are retracted and the error is returned; parts already
    /// written stay. A poll follows every attempt.
    pub async fn send(&self, draft: Draft) -> Result<SendReceipt, EngineError> {
        if draft.is_empty() {
            return Err(EngineError::InvalidDraft("nothing to send".into()));
        }
        let parts = draft.into_parts();
        let batch_id = parts.first().and_then(|p| p.batch_id);
        let now = Timestamp::now();

        let temp_ids = {
            let mut state = self.state.lock().await;
            let channel = state.channel.as_ref().ok_or(EngineError::NotOpen)?;
            if !channel.can_author(&self.user_id) {
                return Err(EngineError::Unauthorized(format!(
                    "only the owner may post in {}",
                    self.channel_id
                )));
            }

            let mut temp_ids = Vec::with_capacity(parts.len());
            for part in &parts {
                let temp_id = MessageId::temporary();
                if let Err(e) = state.ledger.begin(temp_id.clone(), part.batch_id) {
                    for id in &temp_ids {
                        state.ledger.finish(id);
                    }
                    return Err(e.into());
                }
                temp_ids.push(temp_id);
            }

            for (offset, (part, temp_id)) in parts.iter().zip(&temp_ids).enumerate() {
                let optimistic = part.optimistic(
                    temp_id.clone(),
                    self.channel_id.clone(),
                    self.user_id.clone(),
                    now.saturating_add_millis(offset as u64),
                );
                state.store.apply_insert(optimistic);
            }
            self.emit(EngineEvent::MessagesChanged {
                visible: state.store.visible_len(),
            });
            temp_ids
        };

        let mut message_ids = Vec::with_capacity(parts.len());
        for (index, (part, temp_id)) in parts.iter().zip(&temp_ids).enumerate() {
            if self.state.lock().await.ledger.is_abandoned(temp_id) {
                tracing::debug!("Skipping abandoned send {}", temp_id);
                self.state.lock().await.ledger.finish(temp_id);
                continue;
            }

            match self.sender.deliver(part, &self.channel_id, &self.user_id).await {
                Ok(message) => {
                    let mut state = self.state.lock().await;
                    let status = state.ledger.finish(temp_id);
                    let id = message.id.clone();
                    let outcome = state.store.replace_temporary(temp_id, message);
                    tracing::debug!(
                        "Send {} acknowledged as {} ({:?}, {:?})",
                        temp_id,
                        id,
                        outcome,
                        status
                    );
                    self.emit(EngineEvent::MessagesChanged {
                        visible: state.store.visible_len(),
                    });
                    message_ids.push(id);
                }
                Err(error) => {
                    tracing::warn!("Send {} failed: {}", temp_id, error);
                    {
                        let mut state = self.state.lock().await;
                        for retracted in &temp_ids[index..] {
                            state.ledger.finish(retracted);
                            state.store.apply_delete(retracted);
                        }
                        self.emit(EngineEvent::MessagesChanged {
                            visible: state.store.visible_len(),
                        });
                    }
                    self.emit(EngineEvent::SendFailed {
                        temp_id: temp_id.clone(),
                        error: error.to_string(),
                    });
                    self.poll_after_send().await;
                    return Err(error);
                }
            }
        }

        self.poll_after_send().await;
        self.maybe_mark_read().await;
        Ok(SendReceipt {
            message_ids,
            batch_id,
        })
    }

    /// Withdraw an in-flight send and retract its entry.
    ///
    /// Best-effort: a write the server already accepted still lands, and the
    /// message then appears through the normal paths. Returns `false` if
    /// `temp_id` is not an active send.
    pub async fn abandon(&self, temp_id: &MessageId) -> bool {
        let mut state = self.state.lock().await;
        if !state.ledger.abandon(temp_id) {
            return false;
        }
        state.store.apply_delete(temp_id);
        tracing::info!("Abandoned send {}", temp_id);
        self.emit(EngineEvent::MessagesChanged {
            visible: state.store.visible_len(),
        });
        true
    }

    /// Temporary ids of sends awaiting the server, oldest first.
    pub async fn pending_sends(&self) -> Vec<MessageId> {
        self.state.lock().await.ledger.pending_ids()
    }

    async fn poll_after_send(&self) {
        if let Err(e) = self.poll_now().await {
            tracing::debug!("Post-send poll for {} failed: {}", self.channel_id, e);
        }
    }

    // ===== Message Operations =====

    /// Replace a message's text (or caption).
    pub async fn edit_message(&self, id: &MessageId, content: &str) -> Result<(), EngineError> {
        self.ensure_confirmed(id).await?;
        let row = self
            .backend
            .update(Table::Messages, id.as_str(), json!({ "content": content }))
            .await?;
        let message = Message::from_row(&row)?;
        self.apply_local(FeedEvent::MessageUpdated(MessagePatch::refresh(message)))
            .await;
        Ok(())
    }

    /// Soft-delete a message. Its id stays reserved as a tombstone.
    pub async fn delete_message(&self, id: &MessageId) -> Result<(), EngineError> {
        self.ensure_confirmed(id).await?;
        self.backend
            .update(
                Table::Messages,
                id.as_str(),
                json!({
                    "is_deleted": true,
                    "content": null,
                    "file_url": null,
                    "file_type": null,
                }),
            )
            .await?;
        self.apply_local(FeedEvent::MessageUpdated(MessagePatch::soft_delete(id.clone())))
            .await;
        Ok(())
    }

    /// Count a view. Returns the new view count.
    pub async fn record_view(&self, id: &MessageId) -> Result<u64, EngineError> {
        self.ensure_confirmed(id).await?;
        let result = self
            .backend
            .rpc(rpc::INCREMENT_VIEW_COUNT, json!({ "message_id": id.as_str() }))
            .await?;
        let count = result
            .get("view_count")
            .and_then(Value::as_u64)
            .ok_or_else(|| EngineError::Rejected("view count missing from result".into()))?;
        self.apply_local(FeedEvent::MessageUpdated(MessagePatch::view_count(id.clone(), count)))
            .await;
        Ok(count)
    }

    // ===== Reactions =====

    /// Flip the current user's `emoji` on a message.
    ///
    /// Returns whether the reaction is now present. The local view changes
    /// only when the resulting push event arrives.
    pub async fn toggle_reaction(&self, id: &MessageId, emoji: &str) -> Result<bool, EngineError> {
        self.ensure_confirmed(id).await?;
        let result = self
            .backend
            .rpc(
                rpc::TOGGLE_REACTION,
                json!({
                    "message_id": id.as_str(),
                    "user_id": self.user_id.as_str(),
                    "emoji": emoji,
                }),
            )
            .await?;
        let added = result.get("added").and_then(Value::as_bool).unwrap_or(false);
        tracing::debug!(
            "Reaction {} on {} {}",
            emoji,
            id,
            if added { "added" } else { "removed" }
        );
        Ok(added)
    }

    /// Reactions on a message, grouped by emoji.
    pub async fn grouped_reactions(&self, id: &MessageId) -> BTreeMap<String, ReactionSummary> {
        self.state
            .lock()
            .await
            .reactions
            .grouped_view(id, &self.user_id)
    }

    // ===== Pin & Read State =====

    /// Pin a message. The backend decides whether the user may.
    pub async fn pin(&self, id: &MessageId) -> Result<(), EngineError> {
        self.ensure_confirmed(id).await?;
        self.write_pin(json!(id.as_str())).await
    }

    /// Clear the pin.
    pub async fn unpin(&self) -> Result<(), EngineError> {
        self.ensure_open().await?;
        self.write_pin(Value::Null).await
    }

    async fn write_pin(&self, pinned: Value) -> Result<(), EngineError> {
        let row = self
            .backend
            .update(
                Table::Channels,
                self.channel_id.as_str(),
                json!({ "pinned_message_id": pinned }),
            )
            .await?;
        let channel = Channel::from_row(&row)?;
        self.apply_local(FeedEvent::ChannelUpdated(channel)).await;
        Ok(())
    }

    /// The resolved pinned message, if any.
    pub async fn pinned(&self) -> Option<Message> {
        let state = self.state.lock().await;
        let id = state.pins.pinned_id()?;
        state
            .store
            .get(id)
            .cloned()
            .or_else(|| state.pinned_message.clone())
            .filter(|m| !m.is_deleted())
    }

    async fn resolve_pin(&self, id: MessageId) {
        let local = self.state.lock().await.store.get(&id).cloned();
        let target = match local {
            Some(message) => Some(message),
            None => match self.fetch_message(&id).await {
                Ok(found) => found,
                Err(e) => {
                    tracing::warn!("Pin lookup for {} failed: {}", id, e);
                    None
                }
            },
        };
        let target = target.filter(|m| !m.is_deleted());

        let mut state = self.state.lock().await;
        let was_resolving =
            matches!(state.pins.state(), PinState::Resolving(current) if *current == id);
        state.pins.resolve(&id, target.is_some());
        if !was_resolving {
            return;
        }

        if state.pins.pinned_id() == Some(&id) {
            tracing::debug!("Pin resolved to {}", id);
            state.pinned_message = target;
            self.emit(EngineEvent::PinChanged(Some(id)));
        } else {
            tracing::debug!("Pinned message {} not found, showing no pin", id);
            state.pinned_message = None;
            self.emit(EngineEvent::PinChanged(None));
        }
    }

    /// Mark the conversation read up to the newest confirmed message.
    ///
    /// Best-effort: failures are logged and otherwise ignored.
    pub async fn mark_read(&self) {
        {
            let mut state = self.state.lock().await;
            if !state.is_open() {
                return;
            }
            let visible = state.store.visible_len();
            state.read.observe_visible(visible);
        }
        self.issue_mark_read().await;
    }

    async fn maybe_mark_read(&self) {
        let changed = {
            let mut state = self.state.lock().await;
            let visible = state.store.visible_len();
            self.config.mark_read_on_change && state.read.observe_visible(visible)
        };
        if changed {
            self.issue_mark_read().await;
        }
    }

    async fn issue_mark_read(&self) {
        let last = {
            let state = self.state.lock().await;
            let last = state
                .store
                .iter()
                .rev()
                .find(|m| !m.id.is_temporary())
                .map(|m| m.id.clone());
            last
        };
        let args = json!({
            "channel_id": self.channel_id.as_str(),
            "user_id": self.user_id.as_str(),
            "last_message_id": last.as_ref().map(MessageId::as_str),
        });

        match self.backend.rpc(rpc::MARK_READ, args).await {
            Ok(_) => {
                tracing::debug!("Marked {} read", self.channel_id);
                self.state
                    .lock()
                    .await
                    .read
                    .record_read(Timestamp::now(), last);
            }
            Err(e) => tracing::warn!("Marking {} read failed: {}", self.channel_id, e),
        }
    }

    /// The last read mark recorded by this engine.
    pub async fn read_cursor(&self) -> Option<ReadCursor> {
        let state = self.state.lock().await;
        let last_read_at = state.read.last_read_at()?;
        Some(ReadCursor {
            channel_id: self.channel_id.clone(),
            user_id: self.user_id.clone(),
            last_read_at,
            last_message_id: state.read.last_message_id().cloned(),
        })
    }

    // ===== Views =====

    /// Ordered copy of the message list.
    pub async fn snapshot(&self) -> Vec<Message> {
        self.state.lock().await.store.snapshot()
    }

    /// Current subscription state.
    pub async fn feed_state(&self) -> FeedState {
        self.state.lock().await.feed.clone()
    }

    /// Current channel metadata.
    pub async fn channel(&self) -> Option<Channel> {
        self.state.lock().await.channel.clone()
    }

    /// Receive [`EngineEvent`]s from now on.
    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: EngineEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    async fn emit_messages_changed(&self) {
        let visible = self.state.lock().await.store.visible_len();
        self.emit(EngineEvent::MessagesChanged { visible });
    }

    // ===== Backend Reads =====

    async fn ensure_open(&self) -> Result<(), EngineError> {
        if self.is_open().await {
            Ok(())
        } else {
            Err(EngineError::NotOpen)
        }
    }

    async fn ensure_confirmed(&self, id: &MessageId) -> Result<(), EngineError> {
        self.ensure_open().await?;
        if id.is_temporary() {
            return Err(EngineError::Stale(format!("{} is not confirmed yet", id)));
        }
        Ok(())
    }

    async fn fetch_channel(&self) -> Result<Channel, EngineError> {
        let rows = self
            .backend
            .query(
                Table::Channels,
                &Query::new().eq("id", self.channel_id.as_str()).limit(1),
            )
            .await?;
        let row = rows
            .first()
            .ok_or_else(|| EngineError::Stale(format!("channel {}", self.channel_id)))?;
        Ok(Channel::from_row(row)?)
    }

    async fn fetch_initial_page(&self) -> Result<Vec<Message>, EngineError> {
        let rows = self
            .backend
            .query(
                Table::Messages,
                &Query::new()
                    .eq("channel_id", self.channel_id.as_str())
                    .order("created_at", Order::Descending)
                    .limit(self.config.initial_page_size),
            )
            .await?;
        Ok(decode_rows(&rows, Message::from_row))
    }

    async fn fetch_reactions(&self) -> Result<HashMap<MessageId, Vec<Reaction>>, EngineError> {
        let rows = self
            .backend
            .query(
                Table::Reactions,
                &Query::new().eq("channel_id", self.channel_id.as_str()),
            )
            .await?;
        let mut grouped: HashMap<MessageId, Vec<Reaction>> = HashMap::new();
        for reaction in decode_rows(&rows, Reaction::from_row) {
            grouped
                .entry(reaction.message_id.clone())
                .or_default()
                .push(reaction);
        }
        Ok(grouped)
    }

    async fn fetch_message(&self, id: &MessageId) -> Result<Option<Message>, EngineError> {
        if id.is_temporary() {
            return Ok(None);
        }
        let rows = self
            .backend
            .query(Table::Messages, &Query::new().eq("id", id.as_str()).limit(1))
            .await?;
        rows.first()
            .map(Message::from_row)
            .transpose()
            .map_err(EngineError::from)
    }
}

/// Keep the cached pinned copy in step with edits and view counts.
fn refresh_pinned_copy(state: &mut ConversationState, patch: &MessagePatch) {
    let Some(cached) = state.pinned_message.as_mut().filter(|m| m.id == patch.id) else {
        return;
    };
    match &patch.change {
        PatchChange::Refresh(message) => *cached = message.clone(),
        PatchChange::ViewCount(count) => cached.view_count = *count,
        PatchChange::SoftDelete => {}
    }
}

/// Map a subscription status onto the state machine's inputs.
fn status_input(feed: &FeedState, status: ChannelStatus) -> FeedInput {
    match status {
        ChannelStatus::Connected if matches!(feed, FeedState::Interrupted) => {
            FeedInput::ConnectionRestored
        }
        ChannelStatus::Connected => FeedInput::Subscribed,
        ChannelStatus::Disconnected { reason } => FeedInput::ConnectionLost { reason },
        ChannelStatus::Error { reason } => FeedInput::SubscribeFailed { error: reason },
    }
}

fn decode_rows<T, E: std::fmt::Display>(
    rows: &[Value],
    decode: impl Fn(&Value) -> Result<T, E>,
) -> Vec<T> {
    rows.iter()
        .filter_map(|row| match decode(row) {
            Ok(item) => Some(item),
            Err(e) => {
                tracing::warn!("Skipping malformed row: {}", e);
                None
            }
        })
        .collect()
}
