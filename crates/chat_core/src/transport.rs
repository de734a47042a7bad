use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{stream::SplitSink, SinkExt, StreamExt};
use shared::protocol::TransportEvent;
use tokio::{net::TcpStream, sync::broadcast, sync::Mutex, task::JoinHandle};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::warn;

use crate::EVENT_CHANNEL_CAPACITY;

/// Persistent bidirectional event channel with explicit connect/disconnect
/// and named event pub/sub.
///
/// `connect` returns the event subscription for that connection's lifetime;
/// the receiver closes when the underlying channel drops, which is how
/// dependents observe an unexpected disconnect.
#[async_trait]
pub trait EventChannel: Send + Sync {
    async fn connect(&self) -> Result<broadcast::Receiver<TransportEvent>>;
    async fn disconnect(&self) -> Result<()>;
    async fn publish(&self, event: TransportEvent) -> Result<()>;
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Websocket implementation of [`EventChannel`] carrying JSON text frames.
pub struct WsEventChannel {
    endpoint: String,
    inner: Mutex<WsInner>,
}

#[derive(Default)]
struct WsInner {
    sink: Option<WsSink>,
    reader_task: Option<JoinHandle<()>>,
}

impl WsEventChannel {
    pub fn new(server_url: &str) -> Result<Self> {
        let ws_url = if server_url.starts_with("https://") {
            server_url.replacen("https://", "wss://", 1)
        } else if server_url.starts_with("http://") {
            server_url.replacen("http://", "ws://", 1)
        } else {
            return Err(anyhow!("server_url must start with http:// or https://"));
        };
        Ok(Self {
            endpoint: format!("{ws_url}/events"),
            inner: Mutex::new(WsInner::default()),
        })
    }
}

#[async_trait]
impl EventChannel for WsEventChannel {
    async fn connect(&self) -> Result<broadcast::Receiver<TransportEvent>> {
        let (ws_stream, _) = connect_async(&self.endpoint)
            .await
            .with_context(|| format!("failed to connect websocket: {}", self.endpoint))?;
        let (sink, mut reader) = ws_stream.split();
        let (tx, rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let task = tokio::spawn(async move {
            while let Some(frame) = reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<TransportEvent>(&text)
                    {
                        Ok(event) => {
                            let _ = tx.send(event);
                        }
                        Err(err) => warn!("ignoring invalid transport event: {err}"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!("websocket receive failed: {err}");
                        break;
                    }
                }
            }
            // tx drops here, closing every subscriber of this connection.
        });

        let mut inner = self.inner.lock().await;
        if let Some(previous) = inner.reader_task.take() {
            previous.abort();
        }
        inner.sink = Some(sink);
        inner.reader_task = Some(task);
        Ok(rx)
    }

    async fn disconnect(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(mut sink) = inner.sink.take() {
            let _ = sink.close().await;
        }
        if let Some(task) = inner.reader_task.take() {
            task.abort();
        }
        Ok(())
    }

    async fn publish(&self, event: TransportEvent) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let sink = inner
            .sink
            .as_mut()
            .ok_or_else(|| anyhow!("transport is not connected"))?;
        let text = serde_json::to_string(&event)?;
        sink.send(Message::Text(text))
            .await
            .context("websocket send failed")
    }
}
