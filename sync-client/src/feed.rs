//! Change feed client.
//!
//! Subscribes to the three tables that make up a conversation (messages,
//! reactions, the channel row itself) and turns raw row changes into typed
//! [`FeedEvent`]s. Rows that fail to decode are logged and skipped: a later
//! poll delivers the message in full.
//!
//! Connection status is forwarded from the messages subscription only, so a
//! single connection drop surfaces once rather than once per table.

use std::sync::Arc;

use convo_sync_types::{ChannelId, FeedEvent, Table};

use crate::backend::{
    BackendError, ChannelBackend, ChannelStatus, FeedSignal, Filter, SignalCallback,
    SubscriptionHandle,
};

/// What the feed hands to its consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedNotice {
    /// A decoded change.
    Event(FeedEvent),
    /// Connection status of the conversation's subscription.
    Status(ChannelStatus),
}

/// Consumer callback for [`FeedNotice`]s.
pub type NoticeSink = Arc<dyn Fn(FeedNotice) + Send + Sync>;

/// Live subscriptions of one conversation.
#[derive(Debug)]
pub struct FeedSubscription {
    channel_id: ChannelId,
    handles: Vec<SubscriptionHandle>,
}

impl FeedSubscription {
    /// The conversation this subscription covers.
    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    /// Number of underlying table subscriptions.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether no table subscriptions are held.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

/// Change feed client over a [`ChannelBackend`].
pub struct ChangeFeed<B: ChannelBackend> {
    backend: Arc<B>,
}

impl<B: ChannelBackend> ChangeFeed<B> {
    /// Create a feed client.
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }

    /// Subscribe to every table of a conversation.
    ///
    /// If any table fails to subscribe, the ones already established are
    /// dropped again and the error is returned.
    pub async fn subscribe(
        &self,
        channel_id: &ChannelId,
        sink: NoticeSink,
    ) -> Result<FeedSubscription, BackendError> {
        let mut handles = Vec::with_capacity(3);

        for table in [Table::Messages, Table::Reactions, Table::Channels] {
            let filter = Filter::eq(table.channel_column(), channel_id.as_str());
            let callback = decoding_callback(table, Arc::clone(&sink));

            match self.backend.subscribe(table, filter, callback).await {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    tracing::warn!("Subscribing to {} for {} failed: {}", table, channel_id, e);
                    for handle in handles {
                        let _ = self.backend.unsubscribe(handle).await;
                    }
                    return Err(e);
                }
            }
        }

        tracing::debug!("Subscribed to change feed for {}", channel_id);
        Ok(FeedSubscription {
            channel_id: channel_id.clone(),
            handles,
        })
    }

    /// Drop all table subscriptions of a conversation.
    pub async fn unsubscribe(&self, subscription: FeedSubscription) -> Result<(), BackendError> {
        for handle in subscription.handles {
            self.backend.unsubscribe(handle).await?;
        }
        tracing::debug!("Unsubscribed change feed for {}", subscription.channel_id);
        Ok(())
    }
}

fn decoding_callback(table: Table, sink: NoticeSink) -> SignalCallback {
    Arc::new(move |signal| match signal {
        FeedSignal::Change(change) => match FeedEvent::decode(&change) {
            Ok(Some(event)) => sink(FeedNotice::Event(event)),
            Ok(None) => {}
            Err(e) => tracing::warn!("Skipping malformed {} change: {}", table, e),
        },
        FeedSignal::Status(status) => {
            if table == Table::Messages {
                sink(FeedNotice::Status(status));
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use convo_sync_types::MessageId;
    use serde_json::json;
    use std::sync::Mutex;

    fn recorder() -> (NoticeSink, Arc<Mutex<Vec<FeedNotice>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: NoticeSink = Arc::new(move |notice| sink.lock().unwrap().push(notice));
        (callback, seen)
    }

    fn events(seen: &Arc<Mutex<Vec<FeedNotice>>>) -> Vec<FeedEvent> {
        seen.lock()
            .unwrap()
            .iter()
            .filter_map(|n| match n {
                FeedNotice::Event(e) => Some(e.clone()),
                FeedNotice::Status(_) => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn subscribe_covers_three_tables_and_reports_once() {
        let backend = Arc::new(MemoryBackend::new());
        let feed = ChangeFeed::new(Arc::clone(&backend));
        let (sink, seen) = recorder();

        let sub = feed.subscribe(&ChannelId::new("general"), sink).await.unwrap();

        assert_eq!(sub.len(), 3);
        assert_eq!(backend.subscriber_count(), 3);
        let statuses = seen.lock().unwrap().clone();
        assert_eq!(statuses, vec![FeedNotice::Status(ChannelStatus::Connected)]);
    }

    #[tokio::test]
    async fn inserts_decode_to_typed_events() {
        let backend = Arc::new(MemoryBackend::new());
        let feed = ChangeFeed::new(Arc::clone(&backend));
        let (sink, seen) = recorder();
        feed.subscribe(&ChannelId::new("general"), sink).await.unwrap();

        backend
            .insert(
                Table::Messages,
                json!({"channel_id": "general", "author_id": "bob", "content": "hey"}),
            )
            .await
            .unwrap();

        match events(&seen).as_slice() {
            [FeedEvent::MessageInserted(msg)] => assert_eq!(msg.id, MessageId::new("m1")),
            other => panic!("Expected one MessageInserted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn malformed_rows_are_skipped() {
        let backend = Arc::new(MemoryBackend::new());
        let feed = ChangeFeed::new(Arc::clone(&backend));
        let (sink, seen) = recorder();
        feed.subscribe(&ChannelId::new("general"), sink).await.unwrap();

        // Neither content nor attachment.
        backend
            .insert(
                Table::Messages,
                json!({"channel_id": "general", "author_id": "bob"}),
            )
            .await
            .unwrap();

        assert!(events(&seen).is_empty());
    }

    #[tokio::test]
    async fn failed_subscribe_rolls_back() {
        let backend = Arc::new(MemoryBackend::new());
        let feed = ChangeFeed::new(Arc::clone(&backend));
        let (sink, _seen) = recorder();
        backend.fail_next_subscribe(BackendError::Network("timeout".into()));

        let result = feed.subscribe(&ChannelId::new("general"), sink).await;

        assert!(result.is_err());
        assert_eq!(backend.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn unsubscribe_drops_everything() {
        let backend = Arc::new(MemoryBackend::new());
        let feed = ChangeFeed::new(Arc::clone(&backend));
        let (sink, _seen) = recorder();
        let sub = feed.subscribe(&ChannelId::new("general"), sink).await.unwrap();

        feed.unsubscribe(sub).await.unwrap();

        assert_eq!(backend.subscriber_count(), 0);
    }
}
