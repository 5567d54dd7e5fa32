use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use rest_api::ConsultApi;
use shared::{
    domain::{Conversation, ConversationId, MessageId, UserId},
    protocol::{
        MarkReadResponse, MessagePayload, RecallScope, SendMessageRequest, UnreadCountEntry,
    },
};
use tokio::sync::{Mutex, Notify};

use super::*;
use crate::{
    message_store::{ChatId, ChatMessage, DeliveryStatus, MessageStore},
    transport::PushTransport,
};

const CONV: ConversationId = ConversationId(4);
const ALICE: UserId = UserId(1);
const BOB: UserId = UserId(2);

#[derive(Default)]
struct FakeApi {
    send_failures: Mutex<u32>,
    edit_fails: bool,
    // When set, edit calls park until `edit_release` is notified, so a
    // test can hold one mutation in flight.
    edit_waits: bool,
    edit_release: Notify,
    recall_fails: bool,
    sends: Mutex<Vec<SendMessageRequest>>,
    recalls: Mutex<Vec<(MessageId, RecallScope)>>,
}

#[async_trait]
impl ConsultApi for FakeApi {
    async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        Ok(Vec::new())
    }

    async fn list_messages(
        &self,
        _conversation_id: ConversationId,
        _limit: u32,
        _before: Option<MessageId>,
    ) -> Result<Vec<MessagePayload>> {
        Ok(Vec::new())
    }

    async fn send_message(&self, request: &SendMessageRequest) -> Result<MessagePayload> {
        {
            let mut failures = self.send_failures.lock().await;
            if *failures > 0 {
                *failures -= 1;
                return Err(anyhow!("backend rejected the send"));
            }
        }
        self.sends.lock().await.push(request.clone());
        Ok(MessagePayload {
            message_id: MessageId(42),
            conversation_id: request.conversation_id,
            sender_id: request.sender_id,
            body: request.message.clone(),
            image_url: request.image_url.clone(),
            sent_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 10).unwrap(),
            edited: false,
            edited_at: None,
            recalled_by_sender: false,
            recalled_for_everyone: false,
            client_ref: Some(request.client_ref.clone()),
        })
    }

    async fn edit_message(
        &self,
        message_id: MessageId,
        new_content: &str,
    ) -> Result<MessagePayload> {
        if self.edit_waits {
            self.edit_release.notified().await;
        }
        if self.edit_fails {
            return Err(anyhow!("backend rejected the edit"));
        }
        Ok(MessagePayload {
            message_id,
            conversation_id: CONV,
            sender_id: ALICE,
            body: Some(new_content.to_string()),
            image_url: None,
            sent_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            edited: true,
            edited_at: Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 1, 0).unwrap()),
            recalled_by_sender: false,
            recalled_for_everyone: false,
            client_ref: None,
        })
    }

    async fn recall_message(&self, message_id: MessageId, scope: RecallScope) -> Result<()> {
        if self.recall_fails {
            return Err(anyhow!("backend rejected the recall"));
        }
        self.recalls.lock().await.push((message_id, scope));
        Ok(())
    }

    async fn mark_read(&self, conversation_id: ConversationId) -> Result<MarkReadResponse> {
        Ok(MarkReadResponse {
            conversation_id,
            count: 0,
        })
    }

    async fn unread_counts(&self) -> Result<Vec<UnreadCountEntry>> {
        Ok(Vec::new())
    }
}

fn seeded_payload(id: i64, sender: UserId, body: &str) -> MessagePayload {
    MessagePayload {
        message_id: MessageId(id),
        conversation_id: CONV,
        sender_id: sender,
        body: Some(body.to_string()),
        image_url: None,
        sent_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        edited: false,
        edited_at: None,
        recalled_by_sender: false,
        recalled_for_everyone: false,
        client_ref: None,
    }
}

// Dials nothing; every transport send fails synchronously, which forces
// the pipeline onto its REST fallback path.
fn offline_pipeline(api: Arc<FakeApi>) -> (MutationPipeline, Arc<Mutex<MessageStore>>) {
    let store = Arc::new(Mutex::new(MessageStore::new()));
    let transport = PushTransport::new("http://127.0.0.1:1");
    let pipeline = MutationPipeline::new(api, transport, Arc::clone(&store), ALICE);
    (pipeline, store)
}

#[tokio::test]
async fn offline_send_falls_back_to_rest_and_confirms() {
    let api = Arc::new(FakeApi::default());
    let (pipeline, store) = offline_pipeline(Arc::clone(&api));

    let id = pipeline
        .send_message(CONV, Some("Hello".to_string()), None)
        .await
        .expect("send");

    assert_eq!(id, ChatId::Confirmed(MessageId(42)));
    let store = store.lock().await;
    let messages = store.messages(CONV);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, ChatId::Confirmed(MessageId(42)));
    assert_eq!(messages[0].body.as_deref(), Some("Hello"));
    assert_eq!(messages[0].status, DeliveryStatus::Confirmed);
    assert_eq!(api.sends.lock().await.len(), 1);
}

#[tokio::test]
async fn empty_send_is_rejected_before_any_entry_appears() {
    let (pipeline, store) = offline_pipeline(Arc::new(FakeApi::default()));

    let err = pipeline
        .send_message(CONV, Some(String::new()), None)
        .await
        .expect_err("must fail");
    assert!(matches!(err, MutationError::EmptyMessage));
    assert!(store.lock().await.messages(CONV).is_empty());
}

#[tokio::test]
async fn failed_send_stays_retryable_and_retry_confirms() {
    let api = Arc::new(FakeApi {
        send_failures: Mutex::new(1),
        ..FakeApi::default()
    });
    let (pipeline, store) = offline_pipeline(Arc::clone(&api));

    let err = pipeline
        .send_message(CONV, Some("Hello".to_string()), None)
        .await
        .expect_err("both paths fail");
    assert!(matches!(err, MutationError::SendFailed(_)));

    let client_ref = {
        let store = store.lock().await;
        let messages = store.messages(CONV);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].status, DeliveryStatus::Failed);
        match &messages[0].id {
            ChatId::Local(client_ref) => client_ref.clone(),
            other => panic!("expected a local id, got {other}"),
        }
    };

    let id = pipeline.retry_message(&client_ref).await.expect("retry");
    assert_eq!(id, ChatId::Confirmed(MessageId(42)));
    let store = store.lock().await;
    // The retry reused the original client ref, so the backend can dedup.
    assert_eq!(api.sends.lock().await[0].client_ref, client_ref);
    assert_eq!(store.messages(CONV).len(), 1);
}

#[tokio::test]
async fn retry_requires_a_failed_entry() {
    let (pipeline, _store) = offline_pipeline(Arc::new(FakeApi::default()));
    let err = pipeline
        .retry_message("no-such-ref")
        .await
        .expect_err("must fail");
    assert!(matches!(err, MutationError::UnknownMessage));
}

#[tokio::test]
async fn edit_applies_via_rest_fallback() {
    let api = Arc::new(FakeApi::default());
    let (pipeline, store) = offline_pipeline(api);
    store
        .lock()
        .await
        .apply_history(CONV, vec![seeded_payload(1, ALICE, "foo")]);

    pipeline
        .edit_message(MessageId(1), "bar")
        .await
        .expect("edit");

    let store = store.lock().await;
    let message = store.get(&ChatId::Confirmed(MessageId(1))).unwrap();
    assert_eq!(message.body.as_deref(), Some("bar"));
    assert!(message.edited);
    assert!(!message.saving);
}

#[tokio::test]
async fn failed_edit_reverts_to_previous_body() {
    let api = Arc::new(FakeApi {
        edit_fails: true,
        ..FakeApi::default()
    });
    let (pipeline, store) = offline_pipeline(api);
    store
        .lock()
        .await
        .apply_history(CONV, vec![seeded_payload(1, ALICE, "foo")]);

    let err = pipeline
        .edit_message(MessageId(1), "bar")
        .await
        .expect_err("both paths fail");
    assert!(matches!(err, MutationError::EditFailed(_)));

    let store = store.lock().await;
    let message = store.get(&ChatId::Confirmed(MessageId(1))).unwrap();
    assert_eq!(message.body.as_deref(), Some("foo"));
    assert!(!message.saving);
}

#[tokio::test]
async fn edit_rejects_other_senders_and_recalled_messages() {
    let (pipeline, store) = offline_pipeline(Arc::new(FakeApi::default()));
    {
        let mut store = store.lock().await;
        store.apply_history(
            CONV,
            vec![seeded_payload(1, BOB, "theirs"), seeded_payload(2, ALICE, "mine")],
        );
        store.set_recall_flags(MessageId(2), true, true);
    }

    let err = pipeline
        .edit_message(MessageId(1), "nope")
        .await
        .expect_err("must fail");
    assert!(matches!(err, MutationError::NotSender));

    let err = pipeline
        .edit_message(MessageId(2), "nope")
        .await
        .expect_err("must fail");
    assert!(matches!(err, MutationError::Recalled));
}

#[tokio::test]
async fn second_mutation_on_the_same_message_conflicts() {
    let api = Arc::new(FakeApi {
        edit_waits: true,
        ..FakeApi::default()
    });
    let (pipeline, store) = offline_pipeline(Arc::clone(&api));
    store
        .lock()
        .await
        .apply_history(CONV, vec![seeded_payload(1, ALICE, "foo")]);

    let pipeline = Arc::new(pipeline);
    let first = tokio::spawn({
        let pipeline = Arc::clone(&pipeline);
        async move { pipeline.edit_message(MessageId(1), "bar").await }
    });
    // Let the first edit reach the parked backend call.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let err = pipeline
        .recall_message(MessageId(1), RecallScope::SelfOnly)
        .await
        .expect_err("must conflict");
    assert!(matches!(err, MutationError::Conflict(1)));

    api.edit_release.notify_one();
    first.await.expect("join").expect("edit");

    // The losing recall left no trace; the edit went through.
    let store = store.lock().await;
    let message = store.get(&ChatId::Confirmed(MessageId(1))).unwrap();
    assert_eq!(message.body.as_deref(), Some("bar"));
    assert!(!message.recalled_by_sender);
}

#[tokio::test]
async fn retry_of_a_pending_entry_is_rejected() {
    let (pipeline, store) = offline_pipeline(Arc::new(FakeApi::default()));
    store.lock().await.apply_optimistic(ChatMessage {
        id: ChatId::local("tmp-1"),
        conversation_id: CONV,
        sender_id: ALICE,
        body: Some("still sending".to_string()),
        image_url: None,
        sent_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        edited: false,
        edited_at: None,
        recalled_by_sender: false,
        recalled_for_everyone: false,
        read: true,
        status: DeliveryStatus::Pending,
        saving: false,
    });

    let err = pipeline
        .retry_message("tmp-1")
        .await
        .expect_err("must fail");
    assert!(matches!(err, MutationError::NotRetryable));
}

#[tokio::test]
async fn recall_for_everyone_applies_via_rest() {
    let api = Arc::new(FakeApi::default());
    let (pipeline, store) = offline_pipeline(Arc::clone(&api));
    store
        .lock()
        .await
        .apply_history(CONV, vec![seeded_payload(7, ALICE, "oops")]);

    pipeline
        .recall_message(MessageId(7), RecallScope::Everyone)
        .await
        .expect("recall");

    let store = store.lock().await;
    let message = store.get(&ChatId::Confirmed(MessageId(7))).unwrap();
    assert!(message.recalled_by_sender);
    assert!(message.recalled_for_everyone);
    assert_eq!(
        api.recalls.lock().await.as_slice(),
        &[(MessageId(7), RecallScope::Everyone)]
    );
}

#[tokio::test]
async fn failed_recall_restores_prior_flags() {
    let api = Arc::new(FakeApi {
        recall_fails: true,
        ..FakeApi::default()
    });
    let (pipeline, store) = offline_pipeline(api);
    {
        let mut store = store.lock().await;
        store.apply_history(CONV, vec![seeded_payload(8, ALICE, "typo")]);
        // Already hidden from the sender's own view.
        store.set_recall_flags(MessageId(8), true, false);
    }

    let err = pipeline
        .recall_message(MessageId(8), RecallScope::Everyone)
        .await
        .expect_err("both paths fail");
    assert!(matches!(err, MutationError::RecallFailed(_)));

    let store = store.lock().await;
    let message = store.get(&ChatId::Confirmed(MessageId(8))).unwrap();
    assert!(message.recalled_by_sender);
    assert!(!message.recalled_for_everyone);
}

#[tokio::test]
async fn recalling_an_already_recalled_message_fails() {
    let (pipeline, store) = offline_pipeline(Arc::new(FakeApi::default()));
    {
        let mut store = store.lock().await;
        store.apply_history(CONV, vec![seeded_payload(7, ALICE, "gone")]);
        store.set_recall_flags(MessageId(7), true, true);
    }

    let err = pipeline
        .recall_message(MessageId(7), RecallScope::Everyone)
        .await
        .expect_err("must fail");
    assert!(matches!(err, MutationError::Recalled));
}
