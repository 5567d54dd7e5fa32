use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{ConversationId, MessageId, UserId},
    error::ApiError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecallScope {
    SelfOnly,
    Everyone,
}

/// Server-confirmed message as delivered by both the REST history endpoint
/// and push events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    pub sent_at: DateTime<Utc>,
    #[serde(default)]
    pub edited: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub recalled_by_sender: bool,
    #[serde(default)]
    pub recalled_for_everyone: bool,
    /// Echo of the sender's temporary id, so the sender can match its own
    /// optimistic entry without a follow-up fetch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<String>,
}

/// Outbound send payload, shared by the websocket frame and the REST
/// fallback body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub client_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientFrame {
    JoinConversation {
        conversation_id: ConversationId,
    },
    SendMessage(SendMessageRequest),
    EditMessage {
        message_id: MessageId,
        new_content: String,
    },
    RecallMessage {
        message_id: MessageId,
        scope: RecallScope,
    },
    Typing {
        conversation_id: ConversationId,
    },
    StopTyping {
        conversation_id: ConversationId,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerFrame {
    NewMessage {
        message: MessagePayload,
    },
    /// Direct acknowledgement of a `SendMessage` frame from this session.
    SendAck {
        client_ref: String,
        message: MessagePayload,
    },
    MessageUpdated {
        conversation_id: ConversationId,
        message_id: MessageId,
        new_content: String,
        edited_at: DateTime<Utc>,
    },
    MessageRecalled {
        conversation_id: ConversationId,
        message_id: MessageId,
        scope: RecallScope,
    },
    Typing {
        conversation_id: ConversationId,
        user_id: UserId,
    },
    StopTyping {
        conversation_id: ConversationId,
        user_id: UserId,
    },
    Error(ApiError),
}

/// One row of the REST unread aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnreadCountEntry {
    pub conversation_id: ConversationId,
    pub count: u32,
}

/// Response to a mark-as-read call: the server's count after applying the
/// mark. Non-zero when a message landed between the optimistic zero and the
/// server ack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkReadResponse {
    pub conversation_id: ConversationId,
    pub count: u32,
}
