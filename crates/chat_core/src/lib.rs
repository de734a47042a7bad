//! Real-time chat synchronization core: connection lifecycle, message
//! deduplication and ordering, the delivered/read receipt state machine, and
//! the session controller tying them to the REST collaborator.

use std::time::Duration;

use thiserror::Error;

pub mod connection;
pub mod receipts;
pub mod session;
pub mod store;
pub mod transport;

pub use connection::{ConnectionManager, ConnectionState};
pub use receipts::ReceiptTracker;
pub use session::{
    ChatSession, ChatSnapshot, ClientEvent, DaySection, SessionConfig, SessionLifecycle,
};
pub use store::{MessageStore, ReplaceOutcome};
pub use transport::{EventChannel, WsEventChannel};

/// Bound on a connect or reconnect handshake; expiry abandons the attempt.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Room-membership re-announcement period while a session is active.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("connect attempt exceeded {CONNECT_TIMEOUT:?}")]
    ConnectionTimeout,
    #[error("failed to resolve chat session: {0}")]
    SessionResolution(#[source] anyhow::Error),
    #[error("message submission failed: {0}")]
    SendFailure(#[source] anyhow::Error),
    #[error("operation not ready: {0}")]
    NotReady(&'static str),
}
