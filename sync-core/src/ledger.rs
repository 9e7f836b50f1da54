//! Send ledger for convo-sync.
//!
//! Tracks outgoing optimistic sends between the local insert and the server
//! acknowledgement:
//! - FIFO ordering of in-flight temporary ids
//! - Abandonment (the user withdrew the send before it was acknowledged)
//! - A max size so a stalled backend cannot grow the pending set unbounded
//!
//! The ledger is used by sync-client's send pipeline. A temporary id is
//! registered with `begin()` and stays in flight until `finish()` reports
//! whether the user still wanted it.

use std::collections::{HashMap, VecDeque};

use convo_sync_types::{BatchId, MessageId};
use thiserror::Error;

/// Error type for ledger operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// Too many sends are in flight.
    #[error("send ledger full (capacity: {capacity})")]
    Full {
        /// Maximum number of in-flight sends.
        capacity: usize,
    },

    /// The temporary id is already in flight.
    #[error("send already in flight: {0}")]
    AlreadyInFlight(MessageId),
}

/// Status of an in-flight send when it finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// The user is still waiting for this send.
    Active,
    /// The user withdrew the send; its optimistic entry is already gone.
    Abandoned,
}

#[derive(Debug, Clone)]
struct PendingSend {
    batch_id: Option<BatchId>,
    status: SendStatus,
}

/// In-flight optimistic sends.
///
/// Sends flow through the ledger in this order:
/// 1. `begin()` - the optimistic entry was inserted
/// 2. `abandon()` - optional, the user withdrew it
/// 3. `finish()` - the server answered (either way)
#[derive(Debug)]
pub struct SendLedger {
    max_in_flight: usize,
    order: VecDeque<MessageId>,
    pending: HashMap<MessageId, PendingSend>,
}

impl SendLedger {
    /// Create a ledger allowing at most `max_in_flight` concurrent sends.
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            max_in_flight,
            order: VecDeque::new(),
            pending: HashMap::new(),
        }
    }

    /// Register an optimistic send.
    pub fn begin(&mut self, temp_id: MessageId, batch_id: Option<BatchId>) -> Result<(), LedgerError> {
        if self.pending.contains_key(&temp_id) {
            return Err(LedgerError::AlreadyInFlight(temp_id));
        }
        if self.pending.len() >= self.max_in_flight {
            return Err(LedgerError::Full {
                capacity: self.max_in_flight,
            });
        }
        self.order.push_back(temp_id.clone());
        self.pending.insert(
            temp_id,
            PendingSend {
                batch_id,
                status: SendStatus::Active,
            },
        );
        Ok(())
    }

    /// Mark a send as withdrawn.
    ///
    /// Returns `true` if the send was active and is now abandoned.
    pub fn abandon(&mut self, temp_id: &MessageId) -> bool {
        match self.pending.get_mut(temp_id) {
            Some(send) if send.status == SendStatus::Active => {
                send.status = SendStatus::Abandoned;
                true
            }
            _ => false,
        }
    }

    /// Remove a send from the ledger once the server has answered.
    ///
    /// Returns `None` if the id was never registered.
    pub fn finish(&mut self, temp_id: &MessageId) -> Option<SendStatus> {
        let send = self.pending.remove(temp_id)?;
        self.order.retain(|id| id != temp_id);
        Some(send.status)
    }

    /// Check if a send has been withdrawn.
    pub fn is_abandoned(&self, temp_id: &MessageId) -> bool {
        self.pending
            .get(temp_id)
            .map(|s| s.status == SendStatus::Abandoned)
            .unwrap_or(false)
    }

    /// Check if a send is still awaiting the server.
    pub fn is_pending(&self, temp_id: &MessageId) -> bool {
        self.pending.contains_key(temp_id)
    }

    /// Batch the send belongs to, if any.
    pub fn batch_of(&self, temp_id: &MessageId) -> Option<BatchId> {
        self.pending.get(temp_id).and_then(|s| s.batch_id)
    }

    /// Number of sends in flight (including abandoned ones).
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Check if nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// In-flight temporary ids, oldest first.
    pub fn pending_ids(&self) -> Vec<MessageId> {
        self.order.iter().cloned().collect()
    }

    /// Forget every in-flight send.
    pub fn clear(&mut self) {
        self.order.clear();
        self.pending.clear();
    }
}
