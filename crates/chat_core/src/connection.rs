use std::{collections::HashSet, sync::Arc};

use anyhow::Result;
use shared::{
    domain::{ChatId, Role, UserId},
    protocol::TransportEvent,
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
    time::timeout,
};
use tracing::{info, warn};

use crate::{transport::EventChannel, SessionError, CONNECT_TIMEOUT, HEARTBEAT_INTERVAL};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Owns the transport channel lifecycle, the reconnection policy, and the
/// periodic room-membership heartbeat.
pub struct ConnectionManager {
    channel: Arc<dyn EventChannel>,
    inner: Mutex<ConnectionInner>,
}

struct ConnectionInner {
    state: ConnectionState,
    joined: HashSet<ChatId>,
    heartbeat: Option<JoinHandle<()>>,
}

impl ConnectionManager {
    pub fn new(channel: Arc<dyn EventChannel>) -> Self {
        Self {
            channel,
            inner: Mutex::new(ConnectionInner {
                state: ConnectionState::Disconnected,
                joined: HashSet::new(),
                heartbeat: None,
            }),
        }
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    /// Attempts the transport handshake under [`CONNECT_TIMEOUT`]. On expiry
    /// the attempt is abandoned and reported; nothing retries automatically.
    pub async fn connect(&self) -> Result<broadcast::Receiver<TransportEvent>, SessionError> {
        self.handshake(ConnectionState::Connecting).await
    }

    pub async fn reconnect(&self) -> Result<broadcast::Receiver<TransportEvent>, SessionError> {
        self.handshake(ConnectionState::Reconnecting).await
    }

    async fn handshake(
        &self,
        attempt_state: ConnectionState,
    ) -> Result<broadcast::Receiver<TransportEvent>, SessionError> {
        self.set_state(attempt_state).await;
        match timeout(CONNECT_TIMEOUT, self.channel.connect()).await {
            Ok(Ok(receiver)) => {
                self.set_state(ConnectionState::Connected).await;
                Ok(receiver)
            }
            Ok(Err(err)) => {
                self.set_state(ConnectionState::Disconnected).await;
                Err(SessionError::SessionResolution(
                    err.context("transport handshake failed"),
                ))
            }
            Err(_) => {
                self.set_state(ConnectionState::Disconnected).await;
                Err(SessionError::ConnectionTimeout)
            }
        }
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.stop_heartbeat().await;
        {
            let mut inner = self.inner.lock().await;
            inner.joined.clear();
            inner.state = ConnectionState::Disconnected;
        }
        self.channel.disconnect().await
    }

    /// Publishes a declaration over the channel; fails when not connected.
    pub async fn publish(&self, event: TransportEvent) -> Result<()> {
        self.channel.publish(event).await
    }

    /// Idempotent: a second join for the same chat publishes nothing.
    pub async fn join(&self, chat_id: &ChatId, user_id: &UserId, role: Role) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.joined.contains(chat_id) {
            return Ok(());
        }
        self.channel
            .publish(TransportEvent::JoinRoom {
                chat_id: chat_id.clone(),
                user_id: user_id.clone(),
                role,
            })
            .await?;
        inner.joined.insert(chat_id.clone());
        info!(chat_id = %chat_id, "joined chat room");
        Ok(())
    }

    pub async fn leave(&self, chat_id: &ChatId, user_id: &UserId) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if !inner.joined.remove(chat_id) {
            return Ok(());
        }
        self.channel
            .publish(TransportEvent::LeaveRoom {
                chat_id: chat_id.clone(),
                user_id: user_id.clone(),
            })
            .await?;
        info!(chat_id = %chat_id, "left chat room");
        Ok(())
    }

    /// Clears the joined-room set so the next `join` is re-issued over the
    /// fresh connection.
    pub async fn mark_rejoin_required(&self) {
        self.inner.lock().await.joined.clear();
    }

    /// Re-announces room membership at a fixed interval while connected.
    /// Publish failures are best-effort and swallowed.
    pub async fn start_heartbeat(&self, chat_id: ChatId, user_id: UserId) {
        let channel = Arc::clone(&self.channel);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let presence = TransportEvent::Presence {
                    chat_id: chat_id.clone(),
                    user_id: user_id.clone(),
                };
                if let Err(err) = channel.publish(presence).await {
                    warn!(chat_id = %chat_id, "presence heartbeat failed: {err}");
                }
            }
        });

        let mut inner = self.inner.lock().await;
        if let Some(previous) = inner.heartbeat.replace(task) {
            previous.abort();
        }
    }

    pub async fn stop_heartbeat(&self) {
        if let Some(task) = self.inner.lock().await.heartbeat.take() {
            task.abort();
        }
    }

    async fn set_state(&self, state: ConnectionState) {
        let mut inner = self.inner.lock().await;
        if inner.state != state {
            info!(from = ?inner.state, to = ?state, "connection state changed");
            inner.state = state;
        }
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
