use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;

use super::*;

struct StubChannel {
    link: Mutex<Option<broadcast::Sender<TransportEvent>>>,
    published: Mutex<Vec<TransportEvent>>,
    fail_publish: Mutex<bool>,
    hang_connect: bool,
}

impl StubChannel {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            link: Mutex::new(None),
            published: Mutex::new(Vec::new()),
            fail_publish: Mutex::new(false),
            hang_connect: false,
        })
    }

    fn hanging() -> Arc<Self> {
        Arc::new(Self {
            link: Mutex::new(None),
            published: Mutex::new(Vec::new()),
            fail_publish: Mutex::new(false),
            hang_connect: true,
        })
    }

    async fn published(&self) -> Vec<TransportEvent> {
        self.published.lock().await.clone()
    }
}

#[async_trait]
impl EventChannel for StubChannel {
    async fn connect(&self) -> Result<broadcast::Receiver<TransportEvent>> {
        if self.hang_connect {
            futures::future::pending::<()>().await;
        }
        let (tx, rx) = broadcast::channel(16);
        *self.link.lock().await = Some(tx);
        Ok(rx)
    }

    async fn disconnect(&self) -> Result<()> {
        self.link.lock().await.take();
        Ok(())
    }

    async fn publish(&self, event: TransportEvent) -> Result<()> {
        if *self.fail_publish.lock().await {
            return Err(anyhow!("link down"));
        }
        if self.link.lock().await.is_none() {
            return Err(anyhow!("transport is not connected"));
        }
        self.published.lock().await.push(event);
        Ok(())
    }
}

fn chat() -> ChatId {
    ChatId::new("chat-1")
}

fn user() -> UserId {
    UserId::new("mentor-1")
}

fn join_count(events: &[TransportEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, TransportEvent::JoinRoom { .. }))
        .count()
}

#[tokio::test(start_paused = true)]
async fn connect_abandons_the_attempt_after_the_timeout() {
    let manager = ConnectionManager::new(StubChannel::hanging());

    let err = manager.connect().await.expect_err("must time out");

    assert!(matches!(err, SessionError::ConnectionTimeout));
    assert_eq!(manager.state().await, ConnectionState::Disconnected);
}

#[tokio::test]
async fn connect_moves_to_connected_on_success() {
    let manager = ConnectionManager::new(StubChannel::new());

    manager.connect().await.expect("connect");

    assert_eq!(manager.state().await, ConnectionState::Connected);
}

#[tokio::test]
async fn double_join_publishes_a_single_declaration() {
    let channel = StubChannel::new();
    let manager = ConnectionManager::new(channel.clone());
    manager.connect().await.expect("connect");

    manager
        .join(&chat(), &user(), Role::Mentor)
        .await
        .expect("first join");
    manager
        .join(&chat(), &user(), Role::Mentor)
        .await
        .expect("second join");

    assert_eq!(join_count(&channel.published().await), 1);
}

#[tokio::test]
async fn leave_without_join_publishes_nothing() {
    let channel = StubChannel::new();
    let manager = ConnectionManager::new(channel.clone());
    manager.connect().await.expect("connect");

    manager.leave(&chat(), &user()).await.expect("leave");

    assert!(channel.published().await.is_empty());
}

#[tokio::test]
async fn rejoin_is_reissued_after_mark_rejoin_required() {
    let channel = StubChannel::new();
    let manager = ConnectionManager::new(channel.clone());
    manager.connect().await.expect("connect");

    manager
        .join(&chat(), &user(), Role::Mentor)
        .await
        .expect("join");
    manager.mark_rejoin_required().await;
    manager
        .join(&chat(), &user(), Role::Mentor)
        .await
        .expect("rejoin");

    assert_eq!(join_count(&channel.published().await), 2);
}

#[tokio::test(start_paused = true)]
async fn heartbeat_reannounces_membership_and_swallows_failures() {
    let channel = StubChannel::new();
    let manager = ConnectionManager::new(channel.clone());
    manager.connect().await.expect("connect");

    manager.start_heartbeat(chat(), user()).await;
    tokio::time::sleep(HEARTBEAT_INTERVAL * 2 + Duration::from_millis(50)).await;

    let presence_count = |events: &[TransportEvent]| {
        events
            .iter()
            .filter(|e| matches!(e, TransportEvent::Presence { .. }))
            .count()
    };
    assert_eq!(presence_count(&channel.published().await), 2);

    // A failed announcement is best-effort and must not stop the ticker.
    *channel.fail_publish.lock().await = true;
    tokio::time::sleep(HEARTBEAT_INTERVAL).await;
    *channel.fail_publish.lock().await = false;
    tokio::time::sleep(HEARTBEAT_INTERVAL).await;

    assert_eq!(presence_count(&channel.published().await), 3);

    manager.stop_heartbeat().await;
    tokio::time::sleep(HEARTBEAT_INTERVAL * 2).await;
    assert_eq!(presence_count(&channel.published().await), 3);
}

#[tokio::test]
async fn disconnect_clears_membership_state() {
    let channel = StubChannel::new();
    let manager = ConnectionManager::new(channel.clone());
    manager.connect().await.expect("connect");
    manager
        .join(&chat(), &user(), Role::Mentor)
        .await
        .expect("join");

    manager.disconnect().await.expect("disconnect");

    assert_eq!(manager.state().await, ConnectionState::Disconnected);
    // Leaving after disconnect publishes nothing: membership was cleared.
    manager.leave(&chat(), &user()).await.expect("leave");
    assert_eq!(join_count(&channel.published().await), 1);
}
