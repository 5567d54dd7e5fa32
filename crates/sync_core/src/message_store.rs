//! Ordered, deduplicated per-conversation message collections.
//!
//! The store merges three sources through the same rules: REST-fetched
//! history pages, push-delivered frames, and locally-originated optimistic
//! entries. Identity is id-based; ordering is strict `(sent_at, id)`.

use std::{
    cmp::Ordering,
    collections::HashMap,
    fmt,
};

use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, MessageId, UserId},
    protocol::{MessagePayload, RecallScope, ServerFrame},
};

/// Message identity: server-assigned once confirmed, a temporary client ref
/// before that. A local ref is replaced, never duplicated, on confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChatId {
    Confirmed(MessageId),
    Local(String),
}

impl ChatId {
    pub fn local(client_ref: impl Into<String>) -> Self {
        ChatId::Local(client_ref.into())
    }
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatId::Confirmed(id) => write!(f, "{}", id.0),
            ChatId::Local(client_ref) => write!(f, "{client_ref}"),
        }
    }
}

impl Ord for ChatId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (ChatId::Confirmed(a), ChatId::Confirmed(b)) => a.cmp(b),
            (ChatId::Local(a), ChatId::Local(b)) => a.cmp(b),
            // Server-assigned ids sort before still-pending locals at the
            // same timestamp.
            (ChatId::Confirmed(_), ChatId::Local(_)) => Ordering::Less,
            (ChatId::Local(_), ChatId::Confirmed(_)) => Ordering::Greater,
        }
    }
}

impl PartialOrd for ChatId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Local-only delivery state; never sent to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Pending,
    Confirmed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub id: ChatId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub body: Option<String>,
    pub image_url: Option<String>,
    pub sent_at: DateTime<Utc>,
    pub edited: bool,
    pub edited_at: Option<DateTime<Utc>>,
    pub recalled_by_sender: bool,
    pub recalled_for_everyone: bool,
    /// Read flag as observed by the current viewer.
    pub read: bool,
    pub status: DeliveryStatus,
    /// Edit-in-flight indicator for presentation.
    pub saving: bool,
}

impl ChatMessage {
    pub fn from_payload(payload: MessagePayload) -> Self {
        Self {
            id: ChatId::Confirmed(payload.message_id),
            conversation_id: payload.conversation_id,
            sender_id: payload.sender_id,
            body: payload.body,
            image_url: payload.image_url,
            sent_at: payload.sent_at,
            edited: payload.edited,
            edited_at: payload.edited_at,
            recalled_by_sender: payload.recalled_by_sender,
            recalled_for_everyone: payload.recalled_for_everyone,
            read: false,
            status: DeliveryStatus::Confirmed,
            saving: false,
        }
    }

    /// Recall-for-everyone stays visible (redacted placeholder); a
    /// self-only recall hides the row from the sender's own view only.
    pub fn visible_to(&self, viewer: UserId) -> bool {
        !(self.recalled_by_sender && !self.recalled_for_everyone && self.sender_id == viewer)
    }

    fn patch_from_payload(&mut self, payload: &MessagePayload) {
        self.body = payload.body.clone();
        self.image_url = payload.image_url.clone();
        self.edited = payload.edited;
        self.edited_at = payload.edited_at;
        self.recalled_by_sender = payload.recalled_by_sender;
        self.recalled_for_everyone = payload.recalled_for_everyone;
    }
}

/// A maximal consecutive run of messages from the same sender, used for
/// avatar/sender-label collapsing.
#[derive(Debug, Clone)]
pub struct MessageRun {
    pub sender_id: UserId,
    pub messages: Vec<ChatMessage>,
}

/// Result of merging an inbound push frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Applied,
    Duplicate,
    /// The frame referenced a message this store has never seen; the caller
    /// should repair by refetching history, not treat it as an error.
    UnknownMessage,
    Ignored,
}

#[derive(Default)]
pub struct MessageStore {
    conversations: HashMap<ConversationId, Vec<ChatMessage>>,
    ids: HashMap<ChatId, ConversationId>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Conversations that hold at least one message locally; the resync
    /// set after a reconnection gap.
    pub fn conversation_ids(&self) -> Vec<ConversationId> {
        self.conversations.keys().copied().collect()
    }

    pub fn messages(&self, conversation_id: ConversationId) -> &[ChatMessage] {
        self.conversations
            .get(&conversation_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn get(&self, id: &ChatId) -> Option<&ChatMessage> {
        let conversation_id = self.ids.get(id)?;
        self.conversations
            .get(conversation_id)?
            .iter()
            .find(|message| message.id == *id)
    }

    fn get_mut(&mut self, id: &ChatId) -> Option<&mut ChatMessage> {
        let conversation_id = *self.ids.get(id)?;
        self.conversations
            .get_mut(&conversation_id)?
            .iter_mut()
            .find(|message| message.id == *id)
    }

    fn insert_sorted(&mut self, message: ChatMessage) {
        self.ids.insert(message.id.clone(), message.conversation_id);
        let list = self.conversations.entry(message.conversation_id).or_default();
        let position = list.partition_point(|existing| {
            (existing.sent_at, &existing.id) <= (message.sent_at, &message.id)
        });
        list.insert(position, message);
    }

    fn remove(&mut self, id: &ChatId) -> Option<ChatMessage> {
        let conversation_id = self.ids.remove(id)?;
        let list = self.conversations.get_mut(&conversation_id)?;
        let position = list.iter().position(|message| message.id == *id)?;
        Some(list.remove(position))
    }

    /// Merges a REST-fetched history page. Existing confirmed rows are
    /// patched (last writer wins), unknown ids are inserted in order, and
    /// pending local entries are confirmed when the page already carries
    /// their echo. Local entries without a server id are never removed.
    pub fn apply_history(&mut self, conversation_id: ConversationId, page: Vec<MessagePayload>) {
        for payload in page {
            if payload.conversation_id != conversation_id {
                continue;
            }
            self.merge_confirmed(payload);
        }
    }

    /// Applies one inbound push frame.
    pub fn apply_push(&mut self, frame: &ServerFrame) -> MergeOutcome {
        match frame {
            ServerFrame::NewMessage { message } => self.merge_confirmed(message.clone()),
            ServerFrame::MessageUpdated {
                message_id,
                new_content,
                edited_at,
                ..
            } => {
                let Some(existing) = self.get_mut(&ChatId::Confirmed(*message_id)) else {
                    return MergeOutcome::UnknownMessage;
                };
                existing.body = Some(new_content.clone());
                existing.edited = true;
                existing.edited_at = Some(*edited_at);
                existing.saving = false;
                MergeOutcome::Applied
            }
            ServerFrame::MessageRecalled {
                message_id, scope, ..
            } => {
                let Some(existing) = self.get_mut(&ChatId::Confirmed(*message_id)) else {
                    return MergeOutcome::UnknownMessage;
                };
                // Recalls set flags; the row is never physically removed so
                // the UI can render a placeholder.
                existing.recalled_by_sender = true;
                if *scope == RecallScope::Everyone {
                    existing.recalled_for_everyone = true;
                }
                MergeOutcome::Applied
            }
            // Acks are consumed by the mutation pipeline; typing and errors
            // carry no message state.
            ServerFrame::SendAck { .. }
            | ServerFrame::Typing { .. }
            | ServerFrame::StopTyping { .. }
            | ServerFrame::Error(_) => MergeOutcome::Ignored,
        }
    }

    fn merge_confirmed(&mut self, payload: MessagePayload) -> MergeOutcome {
        if let Some(client_ref) = payload.client_ref.clone() {
            let local_id = ChatId::Local(client_ref.clone());
            if self.ids.contains_key(&local_id) {
                self.confirm(&client_ref, payload);
                return MergeOutcome::Applied;
            }
        }

        let id = ChatId::Confirmed(payload.message_id);
        if self.ids.contains_key(&id) {
            let timestamp_moved = self
                .get(&id)
                .map_or(false, |existing| existing.sent_at != payload.sent_at);
            if timestamp_moved {
                // Canonical timestamp moved; reinsert to keep ordering.
                if let Some(mut message) = self.remove(&id) {
                    message.patch_from_payload(&payload);
                    message.sent_at = payload.sent_at;
                    self.insert_sorted(message);
                }
            } else if let Some(existing) = self.get_mut(&id) {
                existing.patch_from_payload(&payload);
            }
            return MergeOutcome::Duplicate;
        }

        self.insert_sorted(ChatMessage::from_payload(payload));
        MergeOutcome::Applied
    }

    /// Inserts a locally-originated `pending` entry under its temporary id.
    pub fn apply_optimistic(&mut self, message: ChatMessage) -> ChatId {
        let id = message.id.clone();
        debug_assert!(matches!(id, ChatId::Local(_)));
        debug_assert!(message.status == DeliveryStatus::Pending);
        self.insert_sorted(message);
        id
    }

    /// Replaces the temporary id with the server-confirmed message. If the
    /// push echo already inserted the confirmed row, the local duplicate is
    /// dropped so exactly one entry remains.
    pub fn confirm(&mut self, client_ref: &str, payload: MessagePayload) -> bool {
        let local_id = ChatId::local(client_ref);
        let Some(local) = self.remove(&local_id) else {
            return false;
        };
        let confirmed_id = ChatId::Confirmed(payload.message_id);
        if self.ids.contains_key(&confirmed_id) {
            return true;
        }
        let mut message = ChatMessage::from_payload(payload);
        message.read = local.read;
        self.insert_sorted(message);
        true
    }

    /// Marks a pending local entry `failed`. Kept for user-visible retry,
    /// not erased.
    pub fn reject(&mut self, client_ref: &str) -> bool {
        match self.get_mut(&ChatId::local(client_ref)) {
            Some(message) => {
                message.status = DeliveryStatus::Failed;
                true
            }
            None => false,
        }
    }

    pub fn set_status(&mut self, id: &ChatId, status: DeliveryStatus) -> bool {
        match self.get_mut(id) {
            Some(message) => {
                message.status = status;
                true
            }
            None => false,
        }
    }

    /// Optimistically replaces a message body, returning the previous body
    /// for rollback, and raises the saving indicator.
    pub fn apply_local_edit(&mut self, message_id: MessageId, new_body: &str) -> Option<Option<String>> {
        let message = self.get_mut(&ChatId::Confirmed(message_id))?;
        let previous = message.body.replace(new_body.to_string());
        message.saving = true;
        Some(previous)
    }

    pub fn rollback_edit(&mut self, message_id: MessageId, previous_body: Option<String>) {
        if let Some(message) = self.get_mut(&ChatId::Confirmed(message_id)) {
            message.body = previous_body;
            message.saving = false;
        }
    }

    pub fn finish_edit(&mut self, message_id: MessageId, edited_at: DateTime<Utc>) {
        if let Some(message) = self.get_mut(&ChatId::Confirmed(message_id)) {
            message.edited = true;
            message.edited_at = Some(edited_at);
            message.saving = false;
        }
    }

    /// Sets both recall flags at once so optimistic applies and rollbacks
    /// restore the exact prior state.
    pub fn set_recall_flags(
        &mut self,
        message_id: MessageId,
        by_sender: bool,
        for_everyone: bool,
    ) -> bool {
        match self.get_mut(&ChatId::Confirmed(message_id)) {
            Some(message) => {
                message.recalled_by_sender = by_sender;
                message.recalled_for_everyone = for_everyone;
                true
            }
            None => false,
        }
    }

    /// Flips the viewer-side read flag for every message in a conversation.
    pub fn mark_conversation_read(&mut self, conversation_id: ConversationId) {
        if let Some(list) = self.conversations.get_mut(&conversation_id) {
            for message in list.iter_mut() {
                message.read = true;
            }
        }
    }

    /// Last message visible to the viewer, for sidebar previews.
    pub fn last_message(
        &self,
        conversation_id: ConversationId,
        viewer: UserId,
    ) -> Option<&ChatMessage> {
        self.messages(conversation_id)
            .iter()
            .rev()
            .find(|message| message.visible_to(viewer))
    }

    /// Pure grouping of the current state into consecutive same-sender
    /// runs; recomputed on every read.
    pub fn grouped_view(&self, conversation_id: ConversationId, viewer: UserId) -> Vec<MessageRun> {
        let mut runs: Vec<MessageRun> = Vec::new();
        for message in self.messages(conversation_id) {
            if !message.visible_to(viewer) {
                continue;
            }
            match runs.last_mut() {
                Some(run) if run.sender_id == message.sender_id => {
                    run.messages.push(message.clone());
                }
                _ => runs.push(MessageRun {
                    sender_id: message.sender_id,
                    messages: vec![message.clone()],
                }),
            }
        }
        runs
    }
}

#[cfg(test)]
#[path = "tests/message_store_tests.rs"]
mod tests;
