//! Mutation pipeline: user intents become an optimistic local update plus
//! an outbound call, then converge with the server-confirmed state or roll
//! back on failure.
//!
//! Writes prefer the push channel and fall back to REST; only when both
//! paths fail does the user see a failure, and failed sends stay in the
//! store for retry.

use std::{collections::HashSet, sync::Arc};

use chrono::Utc;
use rest_api::ConsultApi;
use shared::{
    domain::{ConversationId, MessageId, UserId},
    protocol::{ClientFrame, RecallScope, SendMessageRequest},
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    message_store::{ChatId, ChatMessage, DeliveryStatus, MessageStore},
    transport::PushTransport,
};

#[derive(Debug, Error)]
pub enum MutationError {
    #[error("message needs text or an attachment")]
    EmptyMessage,
    #[error("another mutation for message {0} is already in flight")]
    Conflict(i64),
    #[error("message not found")]
    UnknownMessage,
    #[error("only failed sends can be retried")]
    NotRetryable,
    #[error("only the sender may modify this message")]
    NotSender,
    #[error("message was recalled")]
    Recalled,
    #[error("send failed on both transport and rest paths: {0}")]
    SendFailed(String),
    #[error("edit failed: {0}")]
    EditFailed(String),
    #[error("recall failed: {0}")]
    RecallFailed(String),
}

pub struct MutationPipeline {
    api: Arc<dyn ConsultApi>,
    transport: Arc<PushTransport>,
    store: Arc<Mutex<MessageStore>>,
    in_flight: Mutex<HashSet<MessageId>>,
    self_id: UserId,
}

impl MutationPipeline {
    pub fn new(
        api: Arc<dyn ConsultApi>,
        transport: Arc<PushTransport>,
        store: Arc<Mutex<MessageStore>>,
        self_id: UserId,
    ) -> Self {
        Self {
            api,
            transport,
            store,
            in_flight: Mutex::new(HashSet::new()),
            self_id,
        }
    }

    /// Optimistic send: a `pending` entry appears immediately, the push
    /// channel is tried first, REST second. The entry ends `confirmed`
    /// under its server id or `failed` (visible, retryable).
    pub async fn send_message(
        &self,
        conversation_id: ConversationId,
        text: Option<String>,
        image_url: Option<String>,
    ) -> Result<ChatId, MutationError> {
        if text.as_deref().map_or(true, str::is_empty) && image_url.is_none() {
            return Err(MutationError::EmptyMessage);
        }

        let client_ref = Uuid::new_v4().to_string();
        let optimistic = ChatMessage {
            id: ChatId::local(&client_ref),
            conversation_id,
            sender_id: self.self_id,
            body: text.clone(),
            image_url: image_url.clone(),
            sent_at: Utc::now(),
            edited: false,
            edited_at: None,
            recalled_by_sender: false,
            recalled_for_everyone: false,
            read: true,
            status: DeliveryStatus::Pending,
            saving: false,
        };
        self.store.lock().await.apply_optimistic(optimistic);

        let request = SendMessageRequest {
            conversation_id,
            sender_id: self.self_id,
            client_ref: client_ref.clone(),
            message: text,
            image_url,
        };
        self.deliver(&client_ref, request).await
    }

    /// Re-runs the send path for a previously failed local entry.
    pub async fn retry_message(&self, client_ref: &str) -> Result<ChatId, MutationError> {
        let request = {
            let mut store = self.store.lock().await;
            let message = store
                .get(&ChatId::local(client_ref))
                .ok_or(MutationError::UnknownMessage)?;
            if message.status != DeliveryStatus::Failed {
                return Err(MutationError::NotRetryable);
            }
            let request = SendMessageRequest {
                conversation_id: message.conversation_id,
                sender_id: message.sender_id,
                client_ref: client_ref.to_string(),
                message: message.body.clone(),
                image_url: message.image_url.clone(),
            };
            store.set_status(&ChatId::local(client_ref), DeliveryStatus::Pending);
            request
        };
        self.deliver(client_ref, request).await
    }

    async fn deliver(
        &self,
        client_ref: &str,
        request: SendMessageRequest,
    ) -> Result<ChatId, MutationError> {
        match self.transport.send_message(request.clone()).await {
            Ok(payload) => {
                let message_id = payload.message_id;
                self.store.lock().await.confirm(client_ref, payload);
                return Ok(ChatId::Confirmed(message_id));
            }
            Err(err) => {
                debug!(error = %err, "transport send failed; falling back to rest");
            }
        }

        match self.api.send_message(&request).await {
            Ok(payload) => {
                let message_id = payload.message_id;
                self.store.lock().await.confirm(client_ref, payload);
                Ok(ChatId::Confirmed(message_id))
            }
            Err(rest_err) => {
                warn!(
                    conversation_id = request.conversation_id.0,
                    error = %rest_err,
                    "send failed on both paths; keeping failed entry for retry"
                );
                self.store.lock().await.reject(client_ref);
                Err(MutationError::SendFailed(rest_err.to_string()))
            }
        }
    }

    /// Optimistic edit with rollback to the pre-edit body on failure. Only
    /// the sender's own, non-recalled messages may be edited.
    pub async fn edit_message(
        &self,
        message_id: MessageId,
        new_text: &str,
    ) -> Result<(), MutationError> {
        self.begin_mutation(message_id).await?;
        let result = self.edit_inner(message_id, new_text).await;
        self.in_flight.lock().await.remove(&message_id);
        result
    }

    async fn edit_inner(&self, message_id: MessageId, new_text: &str) -> Result<(), MutationError> {
        let previous = {
            let mut store = self.store.lock().await;
            let message = store
                .get(&ChatId::Confirmed(message_id))
                .ok_or(MutationError::UnknownMessage)?;
            if message.sender_id != self.self_id {
                return Err(MutationError::NotSender);
            }
            if message.recalled_by_sender || message.recalled_for_everyone {
                return Err(MutationError::Recalled);
            }
            store
                .apply_local_edit(message_id, new_text)
                .ok_or(MutationError::UnknownMessage)?
        };

        let frame = ClientFrame::EditMessage {
            message_id,
            new_content: new_text.to_string(),
        };
        if self.transport.send(&frame).await.is_ok() {
            // The MessageUpdated echo reconciles the edited flag/timestamp.
            return Ok(());
        }

        match self.api.edit_message(message_id, new_text).await {
            Ok(payload) => {
                let edited_at = payload.edited_at.unwrap_or(payload.sent_at);
                self.store.lock().await.finish_edit(message_id, edited_at);
                Ok(())
            }
            Err(err) => {
                self.store.lock().await.rollback_edit(message_id, previous);
                Err(MutationError::EditFailed(err.to_string()))
            }
        }
    }

    /// Optimistic recall for either scope; flags roll back to their prior
    /// values if both write paths fail.
    pub async fn recall_message(
        &self,
        message_id: MessageId,
        scope: RecallScope,
    ) -> Result<(), MutationError> {
        self.begin_mutation(message_id).await?;
        let result = self.recall_inner(message_id, scope).await;
        self.in_flight.lock().await.remove(&message_id);
        result
    }

    async fn recall_inner(
        &self,
        message_id: MessageId,
        scope: RecallScope,
    ) -> Result<(), MutationError> {
        let (prior_by_sender, prior_for_everyone) = {
            let mut store = self.store.lock().await;
            let message = store
                .get(&ChatId::Confirmed(message_id))
                .ok_or(MutationError::UnknownMessage)?;
            if message.sender_id != self.self_id {
                return Err(MutationError::NotSender);
            }
            if message.recalled_for_everyone {
                return Err(MutationError::Recalled);
            }
            let prior = (message.recalled_by_sender, message.recalled_for_everyone);
            let for_everyone = prior.1 || scope == RecallScope::Everyone;
            store.set_recall_flags(message_id, true, for_everyone);
            prior
        };

        let frame = ClientFrame::RecallMessage { message_id, scope };
        if self.transport.send(&frame).await.is_ok() {
            return Ok(());
        }

        match self.api.recall_message(message_id, scope).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.store
                    .lock()
                    .await
                    .set_recall_flags(message_id, prior_by_sender, prior_for_everyone);
                Err(MutationError::RecallFailed(err.to_string()))
            }
        }
    }

    /// One in-flight mutation per message id; a second request for the same
    /// id is rejected rather than raced.
    async fn begin_mutation(&self, message_id: MessageId) -> Result<(), MutationError> {
        let mut in_flight = self.in_flight.lock().await;
        if !in_flight.insert(message_id) {
            return Err(MutationError::Conflict(message_id.0));
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/mutation_tests.rs"]
mod tests;
