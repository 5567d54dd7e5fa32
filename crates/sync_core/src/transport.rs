//! Push-channel transport: one bidirectional websocket per user session.
//!
//! Owns the connection lifecycle (`disconnected → connecting → connected`,
//! `connected → reconnecting` on non-logout drops) and the reconnection
//! policy. Inbound frames fan out over a broadcast channel; outbound sends
//! fail synchronously when the channel is down so callers can fall back to
//! REST instead of silently dropping the event.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use shared::{
    domain::{ConversationId, UserId},
    protocol::{ClientFrame, MessagePayload, SendMessageRequest, ServerFrame},
};
use thiserror::Error;
use tokio::{
    net::TcpStream,
    sync::{broadcast, mpsc, oneshot, watch, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const SEND_ACK_TIMEOUT: Duration = Duration::from_secs(5);
const OUTBOUND_QUEUE_DEPTH: usize = 64;

/// Capped exponential backoff for reconnection attempts.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 8,
        }
    }
}

impl ReconnectPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(exponent));
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("auth token missing, malformed, or expired")]
    Auth,
    #[error("transport connect failed: {0}")]
    Connect(String),
    #[error("push channel is not connected")]
    NotConnected,
    #[error("timed out waiting for server acknowledgement")]
    AckTimeout,
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Channel established; `resumed` is true after a reconnect, which
    /// callers must treat as a gap: refetch history to repair ordering.
    Connected { resumed: bool },
    Frame(ServerFrame),
    /// Transport-level drop that was not an explicit logout; reconnection
    /// is in progress.
    ConnectionLost { error: String },
    /// Terminal: explicit disconnect, exhausted retries, or fatal auth.
    Disconnected { error: Option<String> },
    /// Token failed local validation during (re)connect; surfaced for
    /// re-authentication, never retried blindly.
    AuthExpired,
}

#[derive(Deserialize)]
struct TokenClaims {
    #[serde(default)]
    exp: Option<i64>,
}

/// Local well-formedness/expiry check before each (re)connect attempt.
/// Signature verification is the server's job; token issuance and refresh
/// are external collaborators.
pub(crate) fn validate_token(token: &str) -> Result<(), TransportError> {
    let token = token.trim();
    if token.is_empty() {
        return Err(TransportError::Auth);
    }
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return Err(TransportError::Auth);
    }
    let payload = URL_SAFE_NO_PAD
        .decode(parts[1].as_bytes())
        .map_err(|_| TransportError::Auth)?;
    let claims: TokenClaims =
        serde_json::from_slice(&payload).map_err(|_| TransportError::Auth)?;
    if let Some(exp) = claims.exp {
        if exp <= Utc::now().timestamp() {
            return Err(TransportError::Auth);
        }
    }
    Ok(())
}

struct TransportInner {
    session: Option<(UserId, String)>,
    joined: HashSet<ConversationId>,
    outbound: Option<mpsc::Sender<Message>>,
    pending_acks: HashMap<String, oneshot::Sender<MessagePayload>>,
    driver: Option<JoinHandle<()>>,
    explicit_disconnect: bool,
}

pub struct PushTransport {
    server_url: String,
    policy: ReconnectPolicy,
    state_tx: watch::Sender<ConnectionState>,
    events: broadcast::Sender<TransportEvent>,
    inner: Mutex<TransportInner>,
}

impl PushTransport {
    pub fn new(server_url: impl Into<String>) -> Arc<Self> {
        Self::with_policy(server_url, ReconnectPolicy::default())
    }

    pub fn with_policy(server_url: impl Into<String>, policy: ReconnectPolicy) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            server_url: server_url.into(),
            policy,
            state_tx,
            events,
            inner: Mutex::new(TransportInner {
                session: None,
                joined: HashSet::new(),
                outbound: None,
                pending_acks: HashMap::new(),
                driver: None,
                explicit_disconnect: false,
            }),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    /// Establishes the channel. Duplicate calls while a channel exists are
    /// idempotent no-ops; a second parallel channel is never spawned.
    pub async fn connect(self: &Arc<Self>, user_id: UserId, token: &str) -> Result<(), TransportError> {
        {
            let mut inner = self.inner.lock().await;
            if self.state() != ConnectionState::Disconnected {
                return Ok(());
            }
            validate_token(token)?;
            inner.session = Some((user_id, token.to_string()));
            inner.explicit_disconnect = false;
            self.set_state(ConnectionState::Connecting);
        }

        let mut ws = match self.dial(user_id, token).await {
            Ok(ws) => ws,
            Err(err) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(err);
            }
        };

        self.flush_joins(&mut ws).await;
        self.attach(ws, false).await;
        Ok(())
    }

    async fn dial(&self, user_id: UserId, token: &str) -> Result<WsStream, TransportError> {
        let ws_base = if self.server_url.starts_with("https://") {
            self.server_url.replacen("https://", "wss://", 1)
        } else if self.server_url.starts_with("http://") {
            self.server_url.replacen("http://", "ws://", 1)
        } else {
            return Err(TransportError::Connect(
                "server url must start with http:// or https://".to_string(),
            ));
        };
        let ws_url = format!("{ws_base}/ws?user_id={}&token={token}", user_id.0);
        let (ws, _) = connect_async(&ws_url)
            .await
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        Ok(ws)
    }

    /// Re-announces every joined conversation on a fresh socket.
    async fn flush_joins(&self, ws: &mut WsStream) {
        let joined: Vec<ConversationId> = {
            let inner = self.inner.lock().await;
            inner.joined.iter().copied().collect()
        };
        for conversation_id in joined {
            let frame = ClientFrame::JoinConversation { conversation_id };
            if let Ok(text) = serde_json::to_string(&frame) {
                let _ = ws.send(Message::Text(text)).await;
            }
        }
    }

    async fn attach(self: &Arc<Self>, ws: WsStream, resumed: bool) {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        {
            let mut inner = self.inner.lock().await;
            if inner.explicit_disconnect {
                return;
            }
            inner.outbound = Some(outbound_tx);
            let transport = Arc::clone(self);
            inner.driver = Some(tokio::spawn(async move {
                transport.drive(ws, outbound_rx).await;
            }));
        }
        self.set_state(ConnectionState::Connected);
        self.emit(TransportEvent::Connected { resumed });
    }

    async fn drive(self: Arc<Self>, mut ws: WsStream, mut outbound_rx: mpsc::Receiver<Message>) {
        loop {
            let reason = self.pump(&mut ws, &mut outbound_rx).await;

            {
                let mut inner = self.inner.lock().await;
                inner.pending_acks.clear();
                if inner.explicit_disconnect {
                    return;
                }
            }

            let error = reason.unwrap_or_else(|| "connection closed by server".to_string());
            warn!(error = %error, "push channel dropped; reconnecting");
            self.set_state(ConnectionState::Reconnecting);
            self.emit(TransportEvent::ConnectionLost {
                error: error.clone(),
            });

            match self.reconnect().await {
                Some(new_ws) => {
                    ws = new_ws;
                    self.set_state(ConnectionState::Connected);
                    self.emit(TransportEvent::Connected { resumed: true });
                }
                None => {
                    self.set_state(ConnectionState::Disconnected);
                    self.emit(TransportEvent::Disconnected { error: Some(error) });
                    return;
                }
            }
        }
    }

    /// Runs one socket until it ends, moving frames in both directions.
    /// Returns the failure reason, or `None` on a clean close.
    async fn pump(
        &self,
        ws: &mut WsStream,
        outbound_rx: &mut mpsc::Receiver<Message>,
    ) -> Option<String> {
        loop {
            tokio::select! {
                inbound = ws.next() => match inbound {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerFrame>(&text) {
                        Ok(frame) => self.dispatch(frame).await,
                        Err(err) => warn!(error = %err, "invalid server frame"),
                    },
                    Some(Ok(Message::Close(_))) | None => return None,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return Some(err.to_string()),
                },
                outbound = outbound_rx.recv() => match outbound {
                    Some(message) => {
                        if let Err(err) = ws.send(message).await {
                            return Some(err.to_string());
                        }
                    }
                    None => return None,
                },
            }
        }
    }

    async fn dispatch(&self, frame: ServerFrame) {
        if let ServerFrame::SendAck {
            client_ref,
            message,
        } = &frame
        {
            let waiter = {
                let mut inner = self.inner.lock().await;
                inner.pending_acks.remove(client_ref)
            };
            if let Some(waiter) = waiter {
                let _ = waiter.send(message.clone());
            }
        }
        self.emit(TransportEvent::Frame(frame));
    }

    /// Backoff loop. The token is re-validated before every attempt: a
    /// stale token escalates immediately instead of retrying into the same
    /// auth failure.
    async fn reconnect(&self) -> Option<WsStream> {
        for attempt in 1..=self.policy.max_attempts {
            let (user_id, token) = {
                let inner = self.inner.lock().await;
                if inner.explicit_disconnect {
                    return None;
                }
                inner.session.clone()?
            };

            if validate_token(&token).is_err() {
                warn!("token expired during reconnection; escalating for re-auth");
                self.emit(TransportEvent::AuthExpired);
                return None;
            }

            tokio::time::sleep(self.policy.delay_for(attempt)).await;

            match self.dial(user_id, &token).await {
                Ok(mut ws) => {
                    info!(attempt, "push channel reconnected");
                    self.flush_joins(&mut ws).await;
                    return Some(ws);
                }
                Err(err) => {
                    warn!(attempt, max_attempts = self.policy.max_attempts, error = %err, "reconnect attempt failed");
                }
            }
        }
        None
    }

    /// Idempotent: subscribing twice yields exactly one subscription. When
    /// the channel is not up yet, the join is queued and announced on
    /// connect.
    pub async fn join_conversation(&self, conversation_id: ConversationId) {
        let outbound = {
            let mut inner = self.inner.lock().await;
            if !inner.joined.insert(conversation_id) {
                return;
            }
            if self.state() == ConnectionState::Connected {
                inner.outbound.clone()
            } else {
                None
            }
        };
        if let Some(outbound) = outbound {
            let frame = ClientFrame::JoinConversation { conversation_id };
            if let Ok(text) = serde_json::to_string(&frame) {
                let _ = outbound.send(Message::Text(text)).await;
            }
        }
    }

    /// Conversations this session has subscribed to, whether or not the
    /// channel is currently up. Drives the post-reconnect resync set.
    pub async fn joined_conversations(&self) -> Vec<ConversationId> {
        let inner = self.inner.lock().await;
        inner.joined.iter().copied().collect()
    }

    /// Pushes an outbound frame. Fails synchronously when not connected so
    /// the mutation pipeline can fall back to REST.
    pub async fn send(&self, frame: &ClientFrame) -> Result<(), TransportError> {
        if self.state() != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }
        let outbound = {
            let inner = self.inner.lock().await;
            inner.outbound.clone().ok_or(TransportError::NotConnected)?
        };
        let text = serde_json::to_string(frame)
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        outbound
            .send(Message::Text(text))
            .await
            .map_err(|_| TransportError::NotConnected)
    }

    /// Sends a message and waits for the server acknowledgement carrying
    /// the confirmed payload. Ack loss counts as a send failure.
    pub async fn send_message(
        &self,
        request: SendMessageRequest,
    ) -> Result<MessagePayload, TransportError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock().await;
            inner
                .pending_acks
                .insert(request.client_ref.clone(), ack_tx);
        }
        let client_ref = request.client_ref.clone();

        if let Err(err) = self.send(&ClientFrame::SendMessage(request)).await {
            self.inner.lock().await.pending_acks.remove(&client_ref);
            return Err(err);
        }

        match tokio::time::timeout(SEND_ACK_TIMEOUT, ack_rx).await {
            Ok(Ok(payload)) => Ok(payload),
            _ => {
                self.inner.lock().await.pending_acks.remove(&client_ref);
                Err(TransportError::AckTimeout)
            }
        }
    }

    /// Tears the channel down. Always safe to call, idempotent; pending
    /// backoff timers die with the driver task.
    pub async fn disconnect(&self) {
        let driver = {
            let mut inner = self.inner.lock().await;
            inner.explicit_disconnect = true;
            inner.session = None;
            inner.outbound = None;
            inner.pending_acks.clear();
            inner.driver.take()
        };
        if let Some(driver) = driver {
            driver.abort();
        }
        if self.state() != ConnectionState::Disconnected {
            self.set_state(ConnectionState::Disconnected);
            self.emit(TransportEvent::Disconnected { error: None });
        }
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
