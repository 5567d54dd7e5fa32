//! Per-conversation unread counts reconciled from two sources.
//!
//! The most recently completed REST poll is authoritative; push deltas are
//! low-latency hints superseded by the next poll. The global count is never
//! stored, only summed at read time.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use shared::{domain::ConversationId, protocol::UnreadCountEntry};

#[derive(Default)]
pub struct ReadStateReconciler {
    counts: HashMap<ConversationId, u32>,
    last_read_at: HashMap<ConversationId, DateTime<Utc>>,
}

impl ReadStateReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces local state with a completed REST aggregate. Conversations
    /// absent from the aggregate carry no unread messages.
    pub fn apply_poll(&mut self, entries: &[UnreadCountEntry]) {
        self.counts = entries
            .iter()
            .map(|entry| (entry.conversation_id, entry.count))
            .collect();
    }

    /// Push-delivered hint: a new message for a conversation the viewer does
    /// not have open increments its count. Open conversations stay at zero;
    /// the accompanying mark-read call settles them server-side.
    pub fn note_incoming(&mut self, conversation_id: ConversationId, conversation_open: bool) {
        if conversation_open {
            return;
        }
        *self.counts.entry(conversation_id).or_insert(0) += 1;
    }

    /// Optimistic zero when the viewer opens/focuses a conversation.
    pub fn mark_read(&mut self, conversation_id: ConversationId) {
        self.counts.insert(conversation_id, 0);
        self.last_read_at.insert(conversation_id, Utc::now());
    }

    /// Applies the server's answer to a mark-read call. The server count
    /// wins over the optimistic zero, never a local guess.
    pub fn reconcile_mark_read(&mut self, conversation_id: ConversationId, server_count: u32) {
        self.counts.insert(conversation_id, server_count);
    }

    pub fn unread(&self, conversation_id: ConversationId) -> u32 {
        self.counts.get(&conversation_id).copied().unwrap_or(0)
    }

    /// Derived projection; summed at read time so the header badge can
    /// never drift from the per-conversation badges.
    pub fn total_unread(&self) -> u32 {
        self.counts.values().sum()
    }

    pub fn last_read_at(&self, conversation_id: ConversationId) -> Option<DateTime<Utc>> {
        self.last_read_at.get(&conversation_id).copied()
    }
}

#[cfg(test)]
#[path = "tests/read_state_tests.rs"]
mod tests;
