//! REST collaborator client for the consultation backend.
//!
//! The REST side stays the source of truth for history, read counts, and
//! message mutation fallback; the sync core consumes it through the
//! [`ConsultApi`] trait so tests can substitute a mock backend.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use shared::{
    domain::{Conversation, ConversationId, MessageId, UserId},
    protocol::{
        MarkReadResponse, MessagePayload, RecallScope, SendMessageRequest, UnreadCountEntry,
    },
};
use tracing::debug;

#[async_trait]
pub trait ConsultApi: Send + Sync {
    async fn list_conversations(&self) -> Result<Vec<Conversation>>;
    async fn list_messages(
        &self,
        conversation_id: ConversationId,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<Vec<MessagePayload>>;
    async fn send_message(&self, request: &SendMessageRequest) -> Result<MessagePayload>;
    async fn edit_message(&self, message_id: MessageId, new_content: &str)
        -> Result<MessagePayload>;
    async fn recall_message(&self, message_id: MessageId, scope: RecallScope) -> Result<()>;
    async fn mark_read(&self, conversation_id: ConversationId) -> Result<MarkReadResponse>;
    async fn unread_counts(&self) -> Result<Vec<UnreadCountEntry>>;
}

/// Stand-in used before a session is established.
pub struct MissingConsultApi;

#[async_trait]
impl ConsultApi for MissingConsultApi {
    async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        Err(anyhow!("consultation backend unavailable"))
    }

    async fn list_messages(
        &self,
        conversation_id: ConversationId,
        _limit: u32,
        _before: Option<MessageId>,
    ) -> Result<Vec<MessagePayload>> {
        Err(anyhow!(
            "consultation backend unavailable for conversation {}",
            conversation_id.0
        ))
    }

    async fn send_message(&self, _request: &SendMessageRequest) -> Result<MessagePayload> {
        Err(anyhow!("consultation backend unavailable"))
    }

    async fn edit_message(
        &self,
        message_id: MessageId,
        _new_content: &str,
    ) -> Result<MessagePayload> {
        Err(anyhow!(
            "consultation backend unavailable for message {}",
            message_id.0
        ))
    }

    async fn recall_message(&self, message_id: MessageId, _scope: RecallScope) -> Result<()> {
        Err(anyhow!(
            "consultation backend unavailable for message {}",
            message_id.0
        ))
    }

    async fn mark_read(&self, conversation_id: ConversationId) -> Result<MarkReadResponse> {
        Err(anyhow!(
            "consultation backend unavailable for conversation {}",
            conversation_id.0
        ))
    }

    async fn unread_counts(&self) -> Result<Vec<UnreadCountEntry>> {
        Err(anyhow!("consultation backend unavailable"))
    }
}

#[derive(Serialize)]
struct ListMessagesQuery {
    user_id: i64,
    limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    before: Option<i64>,
}

#[derive(Serialize)]
struct EditMessageBody<'a> {
    new_content: &'a str,
}

#[derive(Serialize)]
struct RecallMessageBody {
    scope: RecallScope,
}

pub struct HttpConsultApi {
    http: Client,
    base_url: String,
    token: String,
    user_id: UserId,
}

impl HttpConsultApi {
    pub fn new(base_url: impl Into<String>, user_id: UserId, token: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into(),
            token: token.into(),
            user_id,
        }
    }
}

#[async_trait]
impl ConsultApi for HttpConsultApi {
    async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        let conversations = self
            .http
            .get(format!("{}/conversations", self.base_url))
            .bearer_auth(&self.token)
            .query(&[("user_id", self.user_id.0)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(conversations)
    }

    async fn list_messages(
        &self,
        conversation_id: ConversationId,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<Vec<MessagePayload>> {
        debug!(
            conversation_id = conversation_id.0,
            limit, "fetching message history page"
        );
        let messages = self
            .http
            .get(format!(
                "{}/conversations/{}/messages",
                self.base_url, conversation_id.0
            ))
            .bearer_auth(&self.token)
            .query(&ListMessagesQuery {
                user_id: self.user_id.0,
                limit,
                before: before.map(|id| id.0),
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(messages)
    }

    async fn send_message(&self, request: &SendMessageRequest) -> Result<MessagePayload> {
        let message = self
            .http
            .post(format!("{}/messages", self.base_url))
            .bearer_auth(&self.token)
            .json(request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(message)
    }

    async fn edit_message(
        &self,
        message_id: MessageId,
        new_content: &str,
    ) -> Result<MessagePayload> {
        let message = self
            .http
            .patch(format!("{}/messages/{}", self.base_url, message_id.0))
            .bearer_auth(&self.token)
            .json(&EditMessageBody { new_content })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(message)
    }

    async fn recall_message(&self, message_id: MessageId, scope: RecallScope) -> Result<()> {
        self.http
            .post(format!("{}/messages/{}/recall", self.base_url, message_id.0))
            .bearer_auth(&self.token)
            .json(&RecallMessageBody { scope })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn mark_read(&self, conversation_id: ConversationId) -> Result<MarkReadResponse> {
        let response = self
            .http
            .post(format!(
                "{}/conversations/{}/read",
                self.base_url, conversation_id.0
            ))
            .bearer_auth(&self.token)
            .query(&[("user_id", self.user_id.0)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response)
    }

    async fn unread_counts(&self) -> Result<Vec<UnreadCountEntry>> {
        let counts = self
            .http
            .get(format!("{}/unread_counts", self.base_url))
            .bearer_auth(&self.token)
            .query(&[("user_id", self.user_id.0)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        extract::{Path, State},
        http::{HeaderMap, StatusCode},
        routing::{get, post},
        Json, Router,
    };
    use shared::protocol::SendMessageRequest;
    use tokio::{net::TcpListener, sync::Mutex};

    use super::*;

    #[derive(Clone, Default)]
    struct ServerState {
        send_bodies: Arc<Mutex<Vec<SendMessageRequest>>>,
        auth_headers: Arc<Mutex<Vec<Option<String>>>>,
        mark_read_count: Arc<Mutex<u32>>,
    }

    async fn handle_send(
        State(state): State<ServerState>,
        headers: HeaderMap,
        Json(request): Json<SendMessageRequest>,
    ) -> Json<MessagePayload> {
        state.auth_headers.lock().await.push(
            headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
        );
        let payload = MessagePayload {
            message_id: MessageId(42),
            conversation_id: request.conversation_id,
            sender_id: request.sender_id,
            body: request.message.clone(),
            image_url: request.image_url.clone(),
            sent_at: "2024-01-01T00:00:00Z".parse().expect("timestamp"),
            edited: false,
            edited_at: None,
            recalled_by_sender: false,
            recalled_for_everyone: false,
            client_ref: Some(request.client_ref.clone()),
        };
        state.send_bodies.lock().await.push(request);
        Json(payload)
    }

    async fn handle_mark_read(
        State(state): State<ServerState>,
        Path(conversation_id): Path<i64>,
    ) -> Json<MarkReadResponse> {
        let count = *state.mark_read_count.lock().await;
        Json(MarkReadResponse {
            conversation_id: ConversationId(conversation_id),
            count,
        })
    }

    async fn handle_unread(State(_): State<ServerState>) -> Json<Vec<UnreadCountEntry>> {
        Json(vec![
            UnreadCountEntry {
                conversation_id: ConversationId(1),
                count: 3,
            },
            UnreadCountEntry {
                conversation_id: ConversationId(2),
                count: 0,
            },
        ])
    }

    async fn handle_recall(Path(_message_id): Path<i64>) -> StatusCode {
        StatusCode::NO_CONTENT
    }

    async fn spawn_server() -> (String, ServerState) {
        std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let state = ServerState::default();
        let app = Router::new()
            .route("/messages", post(handle_send))
            .route("/messages/:id/recall", post(handle_recall))
            .route("/conversations/:id/read", post(handle_mark_read))
            .route("/unread_counts", get(handle_unread))
            .with_state(state.clone());
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (format!("http://{addr}"), state)
    }

    #[tokio::test]
    async fn send_message_posts_body_with_bearer_token() {
        let (base_url, state) = spawn_server().await;
        let api = HttpConsultApi::new(base_url, UserId(9), "token-abc");

        let confirmed = api
            .send_message(&SendMessageRequest {
                conversation_id: ConversationId(4),
                sender_id: UserId(9),
                client_ref: "tmp-1".to_string(),
                message: Some("hello".to_string()),
                image_url: None,
            })
            .await
            .expect("send");

        assert_eq!(confirmed.message_id, MessageId(42));
        assert_eq!(confirmed.client_ref.as_deref(), Some("tmp-1"));

        let bodies = state.send_bodies.lock().await;
        assert_eq!(bodies.len(), 1);
        assert_eq!(bodies[0].message.as_deref(), Some("hello"));

        let auth = state.auth_headers.lock().await;
        assert_eq!(auth[0].as_deref(), Some("Bearer token-abc"));
    }

    #[tokio::test]
    async fn mark_read_returns_server_count() {
        let (base_url, state) = spawn_server().await;
        *state.mark_read_count.lock().await = 2;
        let api = HttpConsultApi::new(base_url, UserId(9), "token-abc");

        let response = api.mark_read(ConversationId(4)).await.expect("mark read");
        assert_eq!(response.conversation_id, ConversationId(4));
        assert_eq!(response.count, 2);
    }

    #[tokio::test]
    async fn unread_counts_decodes_aggregate_rows() {
        let (base_url, _state) = spawn_server().await;
        let api = HttpConsultApi::new(base_url, UserId(9), "token-abc");

        let counts = api.unread_counts().await.expect("counts");
        assert_eq!(counts.len(), 2);
        assert_eq!(counts[0].count, 3);
    }

    #[tokio::test]
    async fn missing_backend_reports_unavailable() {
        let api = MissingConsultApi;
        let err = api
            .mark_read(ConversationId(1))
            .await
            .expect_err("must fail");
        assert!(err.to_string().contains("unavailable"));
    }
}
