//! Sidebar projection: pure function of the message store and read state.

use chrono::{DateTime, Utc};
use shared::domain::{Conversation, ConversationId, UserId};

use crate::{message_store::MessageStore, read_state::ReadStateReconciler};

#[derive(Debug, Clone)]
pub struct ConversationListEntry {
    pub conversation_id: ConversationId,
    pub display_name: String,
    pub unread: u32,
    pub last_message_at: Option<DateTime<Utc>>,
    pub preview: Option<String>,
}

/// Derives the sidebar ordering: unread-first, then recency. No state of
/// its own; recomputed on every relevant change.
pub fn project(
    conversations: &[Conversation],
    store: &MessageStore,
    read_state: &ReadStateReconciler,
    viewer: UserId,
) -> Vec<ConversationListEntry> {
    let mut entries: Vec<ConversationListEntry> = conversations
        .iter()
        .map(|conversation| {
            let last = store.last_message(conversation.conversation_id, viewer);
            ConversationListEntry {
                conversation_id: conversation.conversation_id,
                display_name: conversation.display_name(),
                unread: read_state.unread(conversation.conversation_id),
                last_message_at: last.map(|message| message.sent_at),
                preview: last.map(|message| {
                    if message.recalled_for_everyone {
                        "Message recalled".to_string()
                    } else if let Some(body) = &message.body {
                        body.clone()
                    } else {
                        "[image]".to_string()
                    }
                }),
            }
        })
        .collect();

    entries.sort_by(|a, b| {
        (b.unread > 0)
            .cmp(&(a.unread > 0))
            .then(b.last_message_at.cmp(&a.last_message_at))
    });
    entries
}
