use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ChatId, ChatMessage, MessageId, Role, UserId};

/// Events carried over the persistent bidirectional channel. The tag matches
/// the event names the realtime gateway publishes and subscribes on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum TransportEvent {
    JoinRoom {
        chat_id: ChatId,
        user_id: UserId,
        role: Role,
    },
    LeaveRoom {
        chat_id: ChatId,
        user_id: UserId,
    },
    NewMessage {
        message: ChatMessage,
    },
    MessageDelivered {
        message_id: MessageId,
        chat_id: ChatId,
        recipient_id: UserId,
        timestamp: DateTime<Utc>,
    },
    MessageRead {
        message_id: MessageId,
        chat_id: ChatId,
        recipient_id: UserId,
        timestamp: DateTime<Utc>,
    },
    SessionEnded {
        chat_id: ChatId,
        ended_by: UserId,
    },
    /// Best-effort room-membership heartbeat; no reply is expected.
    Presence {
        chat_id: ChatId,
        user_id: UserId,
    },
}

impl TransportEvent {
    pub fn chat_id(&self) -> &ChatId {
        match self {
            Self::JoinRoom { chat_id, .. }
            | Self::LeaveRoom { chat_id, .. }
            | Self::MessageDelivered { chat_id, .. }
            | Self::MessageRead { chat_id, .. }
            | Self::SessionEnded { chat_id, .. }
            | Self::Presence { chat_id, .. } => chat_id,
            Self::NewMessage { message } => &message.chat_id,
        }
    }

    /// Views a delivery/read notification as a receipt; other events are not
    /// receipts.
    pub fn as_receipt(&self) -> Option<ReceiptEvent> {
        match self {
            Self::MessageDelivered {
                message_id,
                chat_id,
                recipient_id,
                timestamp,
            } => Some(ReceiptEvent {
                message_id: message_id.clone(),
                chat_id: chat_id.clone(),
                kind: ReceiptKind::Delivered,
                actor_id: recipient_id.clone(),
                timestamp: *timestamp,
            }),
            Self::MessageRead {
                message_id,
                chat_id,
                recipient_id,
                timestamp,
            } => Some(ReceiptEvent {
                message_id: message_id.clone(),
                chat_id: chat_id.clone(),
                kind: ReceiptKind::Read,
                actor_id: recipient_id.clone(),
                timestamp: *timestamp,
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptKind {
    Delivered,
    Read,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptEvent {
    pub message_id: MessageId,
    pub chat_id: ChatId,
    pub kind: ReceiptKind,
    pub actor_id: UserId,
    pub timestamp: DateTime<Utc>,
}

impl From<ReceiptEvent> for TransportEvent {
    fn from(receipt: ReceiptEvent) -> Self {
        match receipt.kind {
            ReceiptKind::Delivered => Self::MessageDelivered {
                message_id: receipt.message_id,
                chat_id: receipt.chat_id,
                recipient_id: receipt.actor_id,
                timestamp: receipt.timestamp,
            },
            ReceiptKind::Read => Self::MessageRead {
                message_id: receipt.message_id,
                chat_id: receipt.chat_id,
                recipient_id: receipt.actor_id,
                timestamp: receipt.timestamp,
            },
        }
    }
}

/// The REST collaborator returns the chat id either as a plain string or
/// nested inside an object. Normalized to [`ChatId`] at the session boundary.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ChatIdRef {
    Plain(String),
    Nested {
        #[serde(rename = "_id")]
        id: String,
    },
}

impl From<ChatIdRef> for ChatId {
    fn from(value: ChatIdRef) -> Self {
        match value {
            ChatIdRef::Plain(id) | ChatIdRef::Nested { id } => ChatId(id),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRef {
    pub chat_id: ChatIdRef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateChatRequest {
    pub user_id: UserId,
    pub partner_id: UserId,
    pub roles: Vec<Role>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
}
