//! Real-time conversation synchronization engine.
//!
//! Maintains a live, low-latency view of one or more conversations against
//! a push channel while the REST API stays the source of truth for history,
//! read counts, and mutation fallback. [`SyncClient`] owns the single
//! transport instance per session, dispatches inbound frames into the
//! message store and read-state reconciler, and fans state changes out to
//! UI subscribers.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use rest_api::ConsultApi;
use shared::{
    domain::{Conversation, ConversationId, MessageId, UserId},
    protocol::{ClientFrame, RecallScope, ServerFrame},
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{info, warn};

pub mod message_store;
pub mod mutation;
pub mod projection;
pub mod read_state;
pub mod transport;

use message_store::{ChatId, MergeOutcome, MessageRun, MessageStore};
use mutation::{MutationError, MutationPipeline};
use projection::ConversationListEntry;
use read_state::ReadStateReconciler;
use transport::{ConnectionState, PushTransport, TransportEvent};

const UNREAD_POLL_INTERVAL: Duration = Duration::from_secs(30);
const HISTORY_PAGE_SIZE: u32 = 50;
const TYPING_TTL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub enum SyncEvent {
    ConversationsUpdated,
    MessagesUpdated {
        conversation_id: ConversationId,
    },
    UnreadChanged {
        total: u32,
    },
    TypingChanged {
        conversation_id: ConversationId,
    },
    /// Connection banner surface: persistent but dismissable, with manual
    /// retry; never a blocking modal.
    Connection {
        state: ConnectionState,
        error: Option<String>,
    },
    /// Token rejected locally or by the server; the session must re-login.
    AuthRequired,
    ResyncCompleted {
        conversation_id: ConversationId,
    },
    Error(String),
}

struct SyncClientState {
    conversations: Vec<Conversation>,
    active_conversation: Option<ConversationId>,
    typing: HashMap<(ConversationId, UserId), Instant>,
    pump_task: Option<JoinHandle<()>>,
    poll_task: Option<JoinHandle<()>>,
}

pub struct SyncClient {
    api: Arc<dyn ConsultApi>,
    transport: Arc<PushTransport>,
    store: Arc<Mutex<MessageStore>>,
    read_state: Arc<Mutex<ReadStateReconciler>>,
    mutations: MutationPipeline,
    inner: Mutex<SyncClientState>,
    events: broadcast::Sender<SyncEvent>,
    self_id: UserId,
}

impl SyncClient {
    pub fn new(
        api: Arc<dyn ConsultApi>,
        transport: Arc<PushTransport>,
        self_id: UserId,
    ) -> Arc<Self> {
        let store = Arc::new(Mutex::new(MessageStore::new()));
        let (events, _) = broadcast::channel(1024);
        let mutations = MutationPipeline::new(
            Arc::clone(&api),
            Arc::clone(&transport),
            Arc::clone(&store),
            self_id,
        );
        Arc::new(Self {
            api,
            transport,
            store,
            read_state: Arc::new(Mutex::new(ReadStateReconciler::new())),
            mutations,
            inner: Mutex::new(SyncClientState {
                conversations: Vec::new(),
                active_conversation: None,
                typing: HashMap::new(),
                pump_task: None,
                poll_task: None,
            }),
            events,
            self_id,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.transport.state()
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    /// Cold start: connect the push channel, load the conversation list and
    /// unread aggregate over REST, then start the frame pump and the
    /// periodic unread poll.
    pub async fn start(self: &Arc<Self>, token: &str) -> Result<()> {
        self.transport
            .connect(self.self_id, token)
            .await
            .context("failed to connect push channel")?;

        let conversations = self
            .api
            .list_conversations()
            .await
            .context("failed to load conversation list")?;
        {
            let mut inner = self.inner.lock().await;
            inner.conversations = conversations;
        }
        self.emit(SyncEvent::ConversationsUpdated);

        self.refresh_unread_counts().await?;

        let mut inner = self.inner.lock().await;

        let client = Arc::clone(self);
        let mut transport_events = self.transport.subscribe_events();
        inner.pump_task = Some(tokio::spawn(async move {
            while let Ok(event) = transport_events.recv().await {
                client.handle_transport_event(event).await;
            }
        }));

        let client = Arc::clone(self);
        inner.poll_task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(UNREAD_POLL_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(err) = client.refresh_unread_counts().await {
                    warn!(error = %err, "unread poll failed; keeping previous counts");
                }
            }
        }));

        Ok(())
    }

    /// Session teardown (logout or component teardown).
    pub async fn shutdown(&self) {
        let (pump, poll) = {
            let mut inner = self.inner.lock().await;
            (inner.pump_task.take(), inner.poll_task.take())
        };
        if let Some(task) = pump {
            task.abort();
        }
        if let Some(task) = poll {
            task.abort();
        }
        self.transport.disconnect().await;
    }

    /// Opens/focuses a conversation: subscribes the channel, loads the
    /// latest history page, and marks it read (optimistic zero first, the
    /// server's count wins on the ack).
    pub async fn open_conversation(&self, conversation_id: ConversationId) -> Result<()> {
        {
            let mut inner = self.inner.lock().await;
            let previous = inner.active_conversation.replace(conversation_id);
            if let Some(previous) = previous {
                if previous != conversation_id {
                    inner
                        .typing
                        .retain(|(typing_conversation, _), _| *typing_conversation != previous);
                }
            }
        }

        self.transport.join_conversation(conversation_id).await;

        let page = self
            .api
            .list_messages(conversation_id, HISTORY_PAGE_SIZE, None)
            .await
            .with_context(|| {
                format!(
                    "failed to fetch history for conversation {}",
                    conversation_id.0
                )
            })?;
        {
            let mut store = self.store.lock().await;
            store.apply_history(conversation_id, page);
            store.mark_conversation_read(conversation_id);
        }
        self.read_state.lock().await.mark_read(conversation_id);
        self.emit(SyncEvent::MessagesUpdated { conversation_id });
        self.emit_unread_changed().await;

        match self.api.mark_read(conversation_id).await {
            Ok(response) => {
                self.read_state
                    .lock()
                    .await
                    .reconcile_mark_read(response.conversation_id, response.count);
                self.emit_unread_changed().await;
            }
            Err(err) => {
                // Optimistic zero stands; the next unread poll repairs any
                // divergence.
                warn!(
                    conversation_id = conversation_id.0,
                    error = %err,
                    "mark-read call failed"
                );
            }
        }
        Ok(())
    }

    pub async fn close_active_conversation(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(previous) = inner.active_conversation.take() {
            inner
                .typing
                .retain(|(typing_conversation, _), _| *typing_conversation != previous);
        }
    }

    pub async fn active_conversation(&self) -> Option<ConversationId> {
        self.inner.lock().await.active_conversation
    }

    /// On-demand REST aggregate poll; also runs on a timer.
    pub async fn refresh_unread_counts(&self) -> Result<()> {
        let counts = self
            .api
            .unread_counts()
            .await
            .context("failed to poll unread counts")?;
        self.read_state.lock().await.apply_poll(&counts);
        self.emit_unread_changed().await;
        Ok(())
    }

    async fn emit_unread_changed(&self) {
        let total = self.read_state.lock().await.total_unread();
        self.emit(SyncEvent::UnreadChanged { total });
    }

    /// Sidebar projection, recomputed from current state on every call.
    pub async fn conversation_list(&self) -> Vec<ConversationListEntry> {
        let inner = self.inner.lock().await;
        let store = self.store.lock().await;
        let read_state = self.read_state.lock().await;
        projection::project(&inner.conversations, &store, &read_state, self.self_id)
    }

    pub async fn grouped_messages(&self, conversation_id: ConversationId) -> Vec<MessageRun> {
        self.store
            .lock()
            .await
            .grouped_view(conversation_id, self.self_id)
    }

    pub async fn total_unread(&self) -> u32 {
        self.read_state.lock().await.total_unread()
    }

    pub async fn send_message(
        &self,
        conversation_id: ConversationId,
        text: Option<String>,
        image_url: Option<String>,
    ) -> Result<ChatId, MutationError> {
        let result = self
            .mutations
            .send_message(conversation_id, text, image_url)
            .await;
        self.emit(SyncEvent::MessagesUpdated { conversation_id });
        result
    }

    pub async fn retry_message(
        &self,
        conversation_id: ConversationId,
        client_ref: &str,
    ) -> Result<ChatId, MutationError> {
        let result = self.mutations.retry_message(client_ref).await;
        self.emit(SyncEvent::MessagesUpdated { conversation_id });
        result
    }

    pub async fn edit_message(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        new_text: &str,
    ) -> Result<(), MutationError> {
        let result = self.mutations.edit_message(message_id, new_text).await;
        self.emit(SyncEvent::MessagesUpdated { conversation_id });
        result
    }

    pub async fn recall_message(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        scope: RecallScope,
    ) -> Result<(), MutationError> {
        let result = self.mutations.recall_message(message_id, scope).await;
        self.emit(SyncEvent::MessagesUpdated { conversation_id });
        result
    }

    /// Fire-and-forget typing hint; dropped silently when the channel is
    /// down.
    pub async fn set_typing(&self, conversation_id: ConversationId, active: bool) {
        let frame = if active {
            ClientFrame::Typing { conversation_id }
        } else {
            ClientFrame::StopTyping { conversation_id }
        };
        let _ = self.transport.send(&frame).await;
    }

    /// Participants currently typing in a conversation, expiring stale
    /// indicators.
    pub async fn typing_users(&self, conversation_id: ConversationId) -> Vec<UserId> {
        let inner = self.inner.lock().await;
        inner
            .typing
            .iter()
            .filter(|((typing_conversation, _), seen_at)| {
                *typing_conversation == conversation_id && seen_at.elapsed() < TYPING_TTL
            })
            .map(|((_, user_id), _)| *user_id)
            .collect()
    }

    async fn handle_transport_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Connected { resumed } => {
                self.emit(SyncEvent::Connection {
                    state: ConnectionState::Connected,
                    error: None,
                });
                if resumed {
                    self.resync_after_reconnect().await;
                }
            }
            TransportEvent::Frame(frame) => self.handle_frame(frame).await,
            TransportEvent::ConnectionLost { error } => {
                self.emit(SyncEvent::Connection {
                    state: ConnectionState::Reconnecting,
                    error: Some(error),
                });
            }
            TransportEvent::Disconnected { error } => {
                self.emit(SyncEvent::Connection {
                    state: ConnectionState::Disconnected,
                    error,
                });
            }
            TransportEvent::AuthExpired => {
                self.emit(SyncEvent::AuthRequired);
            }
        }
    }

    async fn handle_frame(self: &Arc<Self>, frame: ServerFrame) {
        match &frame {
            ServerFrame::NewMessage { message } => {
                let conversation_id = message.conversation_id;
                let sender_id = message.sender_id;
                let outcome = self.store.lock().await.apply_push(&frame);
                if outcome == MergeOutcome::Applied && sender_id != self.self_id {
                    let open = self.inner.lock().await.active_conversation == Some(conversation_id);
                    self.read_state
                        .lock()
                        .await
                        .note_incoming(conversation_id, open);
                    if open {
                        // Viewer is looking at it; settle the server-side
                        // count without blocking the pump.
                        let client = Arc::clone(self);
                        tokio::spawn(async move {
                            client.settle_open_conversation(conversation_id).await;
                        });
                    }
                    self.emit_unread_changed().await;
                }
                self.emit(SyncEvent::MessagesUpdated { conversation_id });
            }
            ServerFrame::MessageUpdated {
                conversation_id, ..
            }
            | ServerFrame::MessageRecalled {
                conversation_id, ..
            } => {
                let conversation_id = *conversation_id;
                let outcome = self.store.lock().await.apply_push(&frame);
                if outcome == MergeOutcome::UnknownMessage {
                    // Update for a message this client has never seen:
                    // eventual consistency, repaired by a history refetch.
                    info!(
                        conversation_id = conversation_id.0,
                        "push update referenced unknown message; refetching history"
                    );
                    let client = Arc::clone(self);
                    tokio::spawn(async move {
                        client.refetch_history(conversation_id).await;
                    });
                }
                self.emit(SyncEvent::MessagesUpdated { conversation_id });
            }
            ServerFrame::Typing {
                conversation_id,
                user_id,
            } => {
                if *user_id != self.self_id {
                    let mut inner = self.inner.lock().await;
                    inner
                        .typing
                        .insert((*conversation_id, *user_id), Instant::now());
                    let conversation_id = *conversation_id;
                    drop(inner);
                    self.emit(SyncEvent::TypingChanged { conversation_id });
                }
            }
            ServerFrame::StopTyping {
                conversation_id,
                user_id,
            } => {
                let mut inner = self.inner.lock().await;
                inner.typing.remove(&(*conversation_id, *user_id));
                let conversation_id = *conversation_id;
                drop(inner);
                self.emit(SyncEvent::TypingChanged { conversation_id });
            }
            ServerFrame::SendAck { .. } => {
                // Resolved inside the transport; the confirm happens in the
                // mutation pipeline.
            }
            ServerFrame::Error(api_error) => {
                self.emit(SyncEvent::Error(format!("server error: {api_error}")));
            }
        }
    }

    async fn settle_open_conversation(&self, conversation_id: ConversationId) {
        self.store
            .lock()
            .await
            .mark_conversation_read(conversation_id);
        match self.api.mark_read(conversation_id).await {
            Ok(response) => {
                self.read_state
                    .lock()
                    .await
                    .reconcile_mark_read(response.conversation_id, response.count);
                self.emit_unread_changed().await;
            }
            Err(err) => {
                warn!(
                    conversation_id = conversation_id.0,
                    error = %err,
                    "mark-read call failed"
                );
            }
        }
    }

    /// No ordering is assumed across a connection drop: every joined
    /// conversation is refetched so any gap is repaired exactly once by the
    /// id-based merge. The joined set, not the store, drives the resync —
    /// a conversation whose history was empty before the drop still needs
    /// its refetch.
    async fn resync_after_reconnect(&self) {
        let mut conversation_ids = self.transport.joined_conversations().await;
        for conversation_id in self.store.lock().await.conversation_ids() {
            if !conversation_ids.contains(&conversation_id) {
                conversation_ids.push(conversation_id);
            }
        }
        info!(
            conversations = conversation_ids.len(),
            "reconnected; resyncing history"
        );
        for conversation_id in conversation_ids {
            self.refetch_history(conversation_id).await;
            self.emit(SyncEvent::ResyncCompleted { conversation_id });
        }
        if let Err(err) = self.refresh_unread_counts().await {
            warn!(error = %err, "unread repoll after reconnect failed");
        }
    }

    async fn refetch_history(&self, conversation_id: ConversationId) {
        match self
            .api
            .list_messages(conversation_id, HISTORY_PAGE_SIZE, None)
            .await
        {
            Ok(page) => {
                self.store
                    .lock()
                    .await
                    .apply_history(conversation_id, page);
                self.emit(SyncEvent::MessagesUpdated { conversation_id });
            }
            Err(err) => {
                warn!(
                    conversation_id = conversation_id.0,
                    error = %err,
                    "history refetch failed"
                );
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
