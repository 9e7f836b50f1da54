//! Polling fallback.
//!
//! Asks the backend for messages created at or after the store's watermark.
//! The boundary is inclusive so a dropped event that shares the watermark's
//! millisecond is still fetched; the rows already applied at that instant
//! come back too and are discarded by the same dedup path as push events. Overlapping polls are avoided: a poll that
//! starts while another is outstanding is skipped, not queued.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use convo_sync_types::{ChannelId, Message, Table, Timestamp};

use crate::backend::{BackendError, ChannelBackend, Order, Query};

/// Held while a poll is outstanding; releases the in-flight flag on drop.
#[derive(Debug)]
pub struct PollGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for PollGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// "Messages created at or after T" queries against a [`ChannelBackend`].
pub struct PollingFallback<B: ChannelBackend> {
    backend: Arc<B>,
    page_limit: usize,
    in_flight: AtomicBool,
}

impl<B: ChannelBackend> PollingFallback<B> {
    /// Create a poller returning at most `page_limit` messages per call.
    pub fn new(backend: Arc<B>, page_limit: usize) -> Self {
        Self {
            backend,
            page_limit,
            in_flight: AtomicBool::new(false),
        }
    }

    /// Claim the in-flight slot. Returns `None` if a poll is outstanding.
    pub fn try_begin(&self) -> Option<PollGuard<'_>> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| PollGuard {
                flag: &self.in_flight,
            })
    }

    /// Whether a poll is outstanding.
    pub fn is_polling(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Messages in `channel_id` created at or after `since`, oldest first.
    ///
    /// Rows that fail to decode are skipped with a warning.
    pub async fn poll_since(
        &self,
        channel_id: &ChannelId,
        since: Timestamp,
    ) -> Result<Vec<Message>, BackendError> {
        let query = Query::new()
            .eq("channel_id", channel_id.as_str())
            .gte("created_at", since.value())
            .order("created_at", Order::Ascending)
            .limit(self.page_limit);

        let rows = self.backend.query(Table::Messages, &query).await?;
        let messages: Vec<Message> = rows
            .iter()
            .filter_map(|row| match Message::from_row(row) {
                Ok(message) => Some(message),
                Err(e) => {
                    tracing::warn!("Skipping malformed polled row: {}", e);
                    None
                }
            })
            .collect();

        tracing::debug!(
            "Polled {} message(s) in {} since {}",
            messages.len(),
            channel_id,
            since
        );
        Ok(messages)
    }
}
