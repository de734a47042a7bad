use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{NaiveDate, Utc};
use reqwest::{Client, StatusCode};
use shared::{
    domain::{ChatId, ChatMessage, MessageId, MessageStatus, Role, UserId},
    error::ApiError,
    protocol::{ChatRef, CreateChatRequest, ReceiptKind, SendMessageRequest, TransportEvent},
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{info, warn};

use crate::{
    connection::{ConnectionManager, ConnectionState},
    receipts::ReceiptTracker,
    store::MessageStore,
    transport::EventChannel,
    SessionError, EVENT_CHANNEL_CAPACITY,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionLifecycle {
    Uninitialized,
    Resolving,
    Active,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub base_url: String,
    pub user_id: UserId,
    pub role: Role,
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    ConnectionChanged(ConnectionState),
    /// A message entered the store: an optimistic local entry or a newly
    /// accepted inbound one. Duplicates never re-emit this.
    MessageAccepted(ChatMessage),
    MessageUpdated {
        message_id: MessageId,
        status: MessageStatus,
    },
    SessionEnded {
        ended_by: UserId,
    },
    Error(String),
}

#[derive(Debug, Clone)]
pub struct DaySection {
    pub day: NaiveDate,
    pub messages: Vec<ChatMessage>,
}

/// Read-only view handed to the UI collaborator.
#[derive(Debug, Clone)]
pub struct ChatSnapshot {
    pub lifecycle: SessionLifecycle,
    pub connection: ConnectionState,
    pub days: Vec<DaySection>,
}

type MessageCallback = Box<dyn Fn(&ChatMessage) + Send + Sync>;

/// Resolves/creates the chat identity and orchestrates connection, store,
/// and receipts. All state mutation happens behind one lock, so transport
/// events are applied strictly in delivery order while REST calls are
/// outstanding.
pub struct ChatSession {
    http: Client,
    config: SessionConfig,
    connection: ConnectionManager,
    inner: Mutex<SessionInner>,
    events: broadcast::Sender<ClientEvent>,
    on_message: std::sync::Mutex<Option<MessageCallback>>,
}

struct SessionInner {
    lifecycle: SessionLifecycle,
    chat_id: Option<ChatId>,
    partner_id: Option<UserId>,
    store: MessageStore,
    receipts: ReceiptTracker,
    pump: Option<JoinHandle<()>>,
}

impl ChatSession {
    pub fn new(config: SessionConfig, channel: Arc<dyn EventChannel>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let receipts = ReceiptTracker::new(config.user_id.clone());
        Arc::new(Self {
            http: Client::new(),
            config,
            connection: ConnectionManager::new(channel),
            inner: Mutex::new(SessionInner {
                lifecycle: SessionLifecycle::Uninitialized,
                chat_id: None,
                partner_id: None,
                store: MessageStore::new(),
                receipts,
                pump: None,
            }),
            events,
            on_message: std::sync::Mutex::new(None),
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Registers the callback fired synchronously, in arrival order, once
    /// per newly accepted inbound message.
    pub fn on_message(&self, callback: impl Fn(&ChatMessage) + Send + Sync + 'static) {
        *self.on_message.lock().expect("callback lock poisoned") = Some(Box::new(callback));
    }

    pub async fn lifecycle(&self) -> SessionLifecycle {
        self.inner.lock().await.lifecycle
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.connection.state().await
    }

    pub async fn chat_id(&self) -> Option<ChatId> {
        self.inner.lock().await.chat_id.clone()
    }

    pub async fn snapshot(&self) -> ChatSnapshot {
        let connection = self.connection.state().await;
        let inner = self.inner.lock().await;
        ChatSnapshot {
            lifecycle: inner.lifecycle,
            connection,
            days: inner
                .store
                .days()
                .map(|(day, messages)| DaySection {
                    day,
                    messages: messages.into_iter().cloned().collect(),
                })
                .collect(),
        }
    }

    /// Resolves an existing chat with the partner (or creates one), joins
    /// its room, and hydrates the store from the full history. Moves the
    /// session `uninitialized -> resolving -> active`; any failure restores
    /// `uninitialized` for a user-initiated retry.
    pub async fn resolve(self: &Arc<Self>, partner_id: UserId) -> Result<ChatId, SessionError> {
        {
            let mut inner = self.inner.lock().await;
            if inner.lifecycle != SessionLifecycle::Uninitialized {
                return Err(SessionError::NotReady("session is already resolving or active"));
            }
            inner.lifecycle = SessionLifecycle::Resolving;
        }

        match self.resolve_impl(&partner_id).await {
            Ok(chat_id) => {
                self.inner.lock().await.lifecycle = SessionLifecycle::Active;
                info!(chat_id = %chat_id, partner_id = %partner_id, "chat session active");
                Ok(chat_id)
            }
            Err(err) => {
                self.teardown(true).await;
                Err(err)
            }
        }
    }

    async fn resolve_impl(self: &Arc<Self>, partner_id: &UserId) -> Result<ChatId, SessionError> {
        let chat_id = self
            .find_or_create_chat(partner_id)
            .await
            .map_err(SessionError::SessionResolution)?;

        {
            let mut inner = self.inner.lock().await;
            inner.chat_id = Some(chat_id.clone());
            inner.partner_id = Some(partner_id.clone());
        }

        if self.connection.state().await != ConnectionState::Connected {
            let receiver = self.connection.connect().await?;
            self.spawn_pump(receiver).await;
            self.emit(ClientEvent::ConnectionChanged(ConnectionState::Connected));
        }

        self.connection
            .join(&chat_id, &self.config.user_id, self.config.role)
            .await
            .map_err(SessionError::SessionResolution)?;
        self.connection
            .start_heartbeat(chat_id.clone(), self.config.user_id.clone())
            .await;

        let history = self
            .fetch_history(&chat_id)
            .await
            .map_err(SessionError::SessionResolution)?;
        {
            let mut inner = self.inner.lock().await;
            for message in history {
                inner.store.append(message);
            }
        }

        Ok(chat_id)
    }

    async fn find_or_create_chat(&self, partner_id: &UserId) -> Result<ChatId> {
        let response = self
            .http
            .get(format!("{}/chat/find", self.config.base_url))
            .query(&[
                ("userId", self.config.user_id.as_str()),
                ("partnerId", partner_id.as_str()),
            ])
            .send()
            .await
            .context("chat lookup request failed")?;

        if response.status() != StatusCode::NOT_FOUND {
            let found: ChatRef = check(response).await?.json().await?;
            return Ok(found.chat_id.into());
        }

        let response = self
            .http
            .post(format!("{}/chat", self.config.base_url))
            .json(&CreateChatRequest {
                user_id: self.config.user_id.clone(),
                partner_id: partner_id.clone(),
                roles: vec![self.config.role, self.config.role.counterpart()],
            })
            .send()
            .await
            .context("chat creation request failed")?;
        let created: ChatRef = check(response).await?.json().await?;
        Ok(created.chat_id.into())
    }

    async fn fetch_history(&self, chat_id: &ChatId) -> Result<Vec<ChatMessage>> {
        let response = self
            .http
            .get(format!("{}/chat/{chat_id}/messages", self.config.base_url))
            .send()
            .await
            .context("history fetch failed")?;
        Ok(check(response).await?.json().await?)
    }

    /// Creates an optimistic `sending` entry, submits it, and reconciles the
    /// entry with the server-confirmed message. Validation failures make no
    /// network call.
    pub async fn send(&self, content: &str) -> Result<MessageId, SessionError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(SessionError::NotReady("message content is empty"));
        }

        let (chat_id, optimistic) = {
            let mut inner = self.inner.lock().await;
            if inner.lifecycle != SessionLifecycle::Active {
                return Err(SessionError::NotReady("no active chat session"));
            }
            let chat_id = inner
                .chat_id
                .clone()
                .ok_or(SessionError::NotReady("no chat identity resolved"))?;
            let message = ChatMessage {
                id: MessageId::local(),
                chat_id: chat_id.clone(),
                sender_id: self.config.user_id.clone(),
                content: content.to_string(),
                created_at: Utc::now(),
                status: MessageStatus::Sending,
                read_at: None,
            };
            inner.store.append(message.clone());
            (chat_id, message)
        };
        self.emit(ClientEvent::MessageAccepted(optimistic.clone()));

        match self.submit(&chat_id, content).await {
            Ok(confirmed) => {
                // A receipt may already have been applied on top of the
                // confirmation; report whatever the store settled on.
                let status = {
                    let mut inner = self.inner.lock().await;
                    let SessionInner {
                        store, receipts, ..
                    } = &mut *inner;
                    receipts.confirm_sent(store, &optimistic.id, confirmed.clone());
                    store
                        .get(&confirmed.id)
                        .map(|m| m.status)
                        .unwrap_or(MessageStatus::Sent)
                };
                self.emit(ClientEvent::MessageUpdated {
                    message_id: confirmed.id.clone(),
                    status,
                });
                // Lightweight live-update so co-present peers render the
                // message without a refetch; best-effort.
                let live = TransportEvent::NewMessage {
                    message: confirmed.clone(),
                };
                if let Err(err) = self.connection_publish(live).await {
                    warn!(message_id = %confirmed.id, "live-update broadcast failed: {err}");
                }
                Ok(confirmed.id)
            }
            Err(err) => {
                {
                    let mut inner = self.inner.lock().await;
                    let SessionInner {
                        store, receipts, ..
                    } = &mut *inner;
                    receipts.mark_failed(store, &optimistic.id);
                }
                self.emit(ClientEvent::MessageUpdated {
                    message_id: optimistic.id.clone(),
                    status: MessageStatus::Error,
                });
                Err(SessionError::SendFailure(err))
            }
        }
    }

    async fn submit(&self, chat_id: &ChatId, content: &str) -> Result<ChatMessage> {
        let response = self
            .http
            .post(format!("{}/chat/{chat_id}/messages", self.config.base_url))
            .json(&SendMessageRequest {
                content: content.to_string(),
            })
            .send()
            .await
            .context("message submission request failed")?;
        Ok(check(response).await?.json().await?)
    }

    /// Resubmits an errored entry's content as a fresh message. The failed
    /// entry remains for audit.
    pub async fn retry(&self, message_id: &MessageId) -> Result<MessageId, SessionError> {
        let content = {
            let inner = self.inner.lock().await;
            inner
                .store
                .get(message_id)
                .filter(|m| m.status == MessageStatus::Error)
                .map(|m| m.content.clone())
        };
        let Some(content) = content else {
            return Err(SessionError::NotReady("no failed message to retry"));
        };
        self.send(&content).await
    }

    /// Broadcasts an end-of-session declaration, clears the store, and
    /// returns the session to `uninitialized`.
    pub async fn end(&self) -> Result<(), SessionError> {
        let chat_id = self.inner.lock().await.chat_id.clone();
        let Some(chat_id) = chat_id else {
            return Err(SessionError::NotReady("no chat identity resolved"));
        };
        if self.connection.state().await != ConnectionState::Connected {
            return Err(SessionError::NotReady("transport is not connected"));
        }

        let declaration = TransportEvent::SessionEnded {
            chat_id,
            ended_by: self.config.user_id.clone(),
        };
        if let Err(err) = self.connection_publish(declaration).await {
            warn!("end-of-session broadcast failed: {err}");
        }

        self.teardown(true).await;
        self.emit(ClientEvent::ConnectionChanged(ConnectionState::Disconnected));
        Ok(())
    }

    /// Drives the visibility-gated read acknowledgements: restoring
    /// visibility acknowledges every unread remote message in one batch.
    pub async fn set_visible(&self, visible: bool) {
        let receipts = {
            let mut inner = self.inner.lock().await;
            let was_visible = inner.receipts.is_visible();
            inner.receipts.set_visible(visible);
            if visible && !was_visible {
                let SessionInner {
                    store, receipts, ..
                } = &mut *inner;
                receipts.acknowledge_visible(store)
            } else {
                Vec::new()
            }
        };
        for receipt in receipts {
            if let Err(err) = self.connection_publish(receipt.into()).await {
                warn!("read acknowledgement failed: {err}");
            }
        }
    }

    async fn connection_publish(&self, event: TransportEvent) -> Result<()> {
        self.connection.publish(event).await
    }

    async fn spawn_pump(self: &Arc<Self>, mut receiver: broadcast::Receiver<TransportEvent>) {
        let session = Arc::clone(self);
        let task = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => session.handle_transport_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "transport receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        if !session.recover_connection(&mut receiver).await {
                            break;
                        }
                    }
                }
            }
        });
        self.inner.lock().await.pump = Some(task);
    }

    /// Exactly one reconnect attempt per unexpected drop. Success re-issues
    /// the room join and refetches the history once; failure leaves the
    /// session disconnected but otherwise intact.
    async fn recover_connection(
        &self,
        receiver: &mut broadcast::Receiver<TransportEvent>,
    ) -> bool {
        let (chat_id, active) = {
            let inner = self.inner.lock().await;
            (
                inner.chat_id.clone(),
                inner.lifecycle == SessionLifecycle::Active,
            )
        };
        let (Some(chat_id), true) = (chat_id, active) else {
            return false;
        };

        info!(chat_id = %chat_id, "transport dropped; attempting reconnect");
        self.emit(ClientEvent::ConnectionChanged(ConnectionState::Reconnecting));
        match self.connection.reconnect().await {
            Ok(new_receiver) => {
                *receiver = new_receiver;
                self.connection.mark_rejoin_required().await;
                if let Err(err) = self
                    .connection
                    .join(&chat_id, &self.config.user_id, self.config.role)
                    .await
                {
                    warn!(chat_id = %chat_id, "room rejoin failed: {err}");
                }
                match self.fetch_history(&chat_id).await {
                    Ok(history) => {
                        let mut inner = self.inner.lock().await;
                        for message in history {
                            inner.store.append(message);
                        }
                    }
                    Err(err) => {
                        self.emit(ClientEvent::Error(format!(
                            "history refetch after reconnect failed: {err}"
                        )));
                    }
                }
                self.emit(ClientEvent::ConnectionChanged(ConnectionState::Connected));
                true
            }
            Err(err) => {
                // The channel is gone for good; stop re-announcing membership
                // against it.
                self.connection.stop_heartbeat().await;
                self.emit(ClientEvent::Error(format!("reconnect failed: {err}")));
                self.emit(ClientEvent::ConnectionChanged(ConnectionState::Disconnected));
                false
            }
        }
    }

    async fn handle_transport_event(self: &Arc<Self>, event: TransportEvent) {
        if let Some(receipt) = event.as_receipt() {
            let changed = {
                let mut inner = self.inner.lock().await;
                if inner.chat_id.as_ref() != Some(&receipt.chat_id) {
                    return;
                }
                let SessionInner {
                    store, receipts, ..
                } = &mut *inner;
                receipts.apply(store, &receipt)
            };
            if changed {
                let status = match receipt.kind {
                    ReceiptKind::Delivered => MessageStatus::Delivered,
                    ReceiptKind::Read => MessageStatus::Read,
                };
                self.emit(ClientEvent::MessageUpdated {
                    message_id: receipt.message_id,
                    status,
                });
            }
            return;
        }

        match event {
            TransportEvent::NewMessage { message } => self.handle_inbound_message(message).await,
            TransportEvent::SessionEnded { chat_id, ended_by } => {
                if ended_by == self.config.user_id {
                    return;
                }
                let matches = { self.inner.lock().await.chat_id.as_ref() == Some(&chat_id) };
                if matches {
                    info!(chat_id = %chat_id, ended_by = %ended_by, "session ended by peer");
                    self.teardown(false).await;
                    self.emit(ClientEvent::SessionEnded { ended_by });
                }
            }
            // Membership declarations and presence are server-facing;
            // receipts were consumed above.
            _ => {}
        }
    }

    async fn handle_inbound_message(&self, message: ChatMessage) {
        let (receipts_owed, flushed_status) = {
            let mut inner = self.inner.lock().await;
            if inner.chat_id.as_ref() != Some(&message.chat_id) {
                return;
            }
            if !inner.store.append(message.clone()) {
                // Duplicate suppressed; nothing re-fires.
                return;
            }
            let SessionInner {
                store, receipts, ..
            } = &mut *inner;
            let owed = receipts.acknowledge_inbound(store, &message);
            // The echo of one's own send may trail a receipt for it.
            let flushed = if receipts.flush_pending(store, &message.id) {
                store.get(&message.id).map(|m| m.status)
            } else {
                None
            };
            (owed, flushed)
        };

        if let Some(callback) = &*self.on_message.lock().expect("callback lock poisoned") {
            callback(&message);
        }
        self.emit(ClientEvent::MessageAccepted(message.clone()));
        if let Some(status) = flushed_status {
            self.emit(ClientEvent::MessageUpdated {
                message_id: message.id,
                status,
            });
        }

        for receipt in receipts_owed {
            if let Err(err) = self.connection_publish(receipt.into()).await {
                warn!("receipt publish failed: {err}");
            }
        }
    }

    /// Releases everything the active session owns: heartbeat, room
    /// membership, the event subscription, and the store. Peer-initiated
    /// teardown runs on the pump itself and must not abort it; the loop
    /// exits on its own once the channel closes.
    async fn teardown(&self, abort_pump: bool) {
        self.connection.stop_heartbeat().await;
        let chat_id = self.inner.lock().await.chat_id.clone();
        if let Some(chat_id) = chat_id {
            if let Err(err) = self.connection.leave(&chat_id, &self.config.user_id).await {
                warn!(chat_id = %chat_id, "room leave failed: {err}");
            }
        }
        {
            let mut inner = self.inner.lock().await;
            if let Some(pump) = inner.pump.take() {
                if abort_pump {
                    pump.abort();
                }
            }
            inner.store.clear();
            inner.receipts.clear_pending();
            inner.chat_id = None;
            inner.partner_id = None;
            inner.lifecycle = SessionLifecycle::Uninitialized;
        }
        if let Err(err) = self.connection.disconnect().await {
            warn!("transport disconnect failed: {err}");
        }
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }
}

/// Surfaces the collaborator's structured error body when one is present.
async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    match response.json::<ApiError>().await {
        Ok(api_error) => Err(anyhow::Error::new(api_error)),
        Err(_) => Err(anyhow!("request failed with status {status}")),
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
