//! Per-endpoint offline operation queue.
//!
//! Mutations issued while disconnected are applied optimistically to local
//! state and parked here for replay. On reconnect the session drains the
//! queue in FIFO order and sends each intent once; there is no per-operation
//! acknowledgement and the queue is cleared regardless of send failures
//! (at-most-once, best-effort, by explicit contract). Durability comes from
//! the endpoint cache, which persists the queue alongside the snapshot.

use crate::model::Timestamp;
use crate::protocol::Intent;
use serde::{Deserialize, Serialize};

/// One parked mutation, stamped when it entered the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedIntent {
    pub intent: Intent,
    pub queued_at: Timestamp,
}

/// FIFO of not-yet-sent intents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OfflineQueue {
    items: Vec<QueuedIntent>,
}

impl OfflineQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, intent: Intent, now: Timestamp) {
        self.items.push(QueuedIntent {
            intent,
            queued_at: now,
        });
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[QueuedIntent] {
        &self.items
    }

    /// Take everything, oldest first, leaving the queue empty. The caller
    /// sends what it can; anything it fails to send is gone by design.
    pub fn drain(&mut self) -> Vec<QueuedIntent> {
        std::mem::take(&mut self.items)
    }
}
