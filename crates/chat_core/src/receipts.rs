use std::collections::HashMap;

use chrono::Utc;
use shared::{
    domain::{ChatMessage, MessageId, MessageStatus, UserId},
    protocol::{ReceiptEvent, ReceiptKind},
};

use crate::store::{MessageStore, ReplaceOutcome};

/// Per-message delivery/read state machine.
///
/// Locally authored messages advance `sending -> {sent, error}` and then
/// `sent -> delivered -> read`, monotonically. For remotely authored
/// messages the tracker produces the outbound receipts the local actor owes
/// its peer; read acknowledgements are gated on surface visibility.
///
/// A receipt can outrun the message it refers to: the server id is only
/// known locally once the REST confirmation or the transport echo lands.
/// Such receipts are held and applied when the id enters the store.
pub struct ReceiptTracker {
    local_user: UserId,
    visible: bool,
    pending: HashMap<MessageId, ReceiptEvent>,
}

impl ReceiptTracker {
    pub fn new(local_user: UserId) -> Self {
        Self {
            local_user,
            visible: true,
            pending: HashMap::new(),
        }
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
    }

    /// Server confirmation of a submission: `sending -> sent`, swapping the
    /// temporary id for the server-assigned one. A receipt that arrived
    /// before the confirmation is applied on top.
    pub fn confirm_sent(
        &mut self,
        store: &mut MessageStore,
        temp_id: &MessageId,
        mut confirmed: ChatMessage,
    ) -> ReplaceOutcome {
        if confirmed.status == MessageStatus::Sending {
            confirmed.status = MessageStatus::Sent;
        }
        let confirmed_id = confirmed.id.clone();
        let outcome = store.replace(temp_id, confirmed);
        self.flush_pending(store, &confirmed_id);
        outcome
    }

    /// Submission failure: `sending -> error`, terminal for this entry. The
    /// entry stays in the store; resubmission creates a fresh message.
    pub fn mark_failed(&self, store: &mut MessageStore, temp_id: &MessageId) -> bool {
        store.update_status(temp_id, MessageStatus::Error)
    }

    /// Applies an inbound receipt to a locally authored message. Returns
    /// false when the receipt does not advance state; re-application never
    /// regresses and never warrants re-emitting anything. A receipt for an
    /// id not yet in the store is held for a later [`Self::flush_pending`].
    pub fn apply(&mut self, store: &mut MessageStore, receipt: &ReceiptEvent) -> bool {
        let Some(current) = store.get(&receipt.message_id).map(|m| m.status) else {
            self.hold(receipt);
            return false;
        };
        let next = match (receipt.kind, current) {
            (ReceiptKind::Delivered, MessageStatus::Sent) => MessageStatus::Delivered,
            (ReceiptKind::Read, MessageStatus::Sent | MessageStatus::Delivered) => {
                MessageStatus::Read
            }
            _ => return false,
        };
        if next == MessageStatus::Read {
            store.set_read_at(&receipt.message_id, receipt.timestamp);
        }
        store.update_status(&receipt.message_id, next)
    }

    /// At most one held receipt per id; `read` outranks `delivered`.
    fn hold(&mut self, receipt: &ReceiptEvent) {
        match self.pending.get(&receipt.message_id) {
            Some(held) if held.kind == ReceiptKind::Read => {}
            _ => {
                self.pending
                    .insert(receipt.message_id.clone(), receipt.clone());
            }
        }
    }

    /// Applies the receipt held for a message that has just entered the
    /// store, if any. Returns true when the message's status advanced.
    pub fn flush_pending(&mut self, store: &mut MessageStore, message_id: &MessageId) -> bool {
        match self.pending.remove(message_id) {
            Some(receipt) => self.apply(store, &receipt),
            None => false,
        }
    }

    pub fn clear_pending(&mut self) {
        self.pending.clear();
    }

    /// Receipts owed for a newly accepted remote message: delivery is
    /// acknowledged unconditionally, reading only while the surface is
    /// visible.
    pub fn acknowledge_inbound(
        &self,
        store: &mut MessageStore,
        message: &ChatMessage,
    ) -> Vec<ReceiptEvent> {
        if message.is_authored_by(&self.local_user) {
            return Vec::new();
        }

        let now = Utc::now();
        let mut receipts = vec![ReceiptEvent {
            message_id: message.id.clone(),
            chat_id: message.chat_id.clone(),
            kind: ReceiptKind::Delivered,
            actor_id: self.local_user.clone(),
            timestamp: now,
        }];
        if self.visible {
            store.set_read_at(&message.id, now);
            receipts.push(ReceiptEvent {
                message_id: message.id.clone(),
                chat_id: message.chat_id.clone(),
                kind: ReceiptKind::Read,
                actor_id: self.local_user.clone(),
                timestamp: now,
            });
        }
        receipts
    }

    /// Hidden-to-visible transition: acknowledges every held remote message
    /// without a read timestamp, one receipt per message, in one batch.
    pub fn acknowledge_visible(&self, store: &mut MessageStore) -> Vec<ReceiptEvent> {
        let now = Utc::now();
        let pending: Vec<(MessageId, shared::domain::ChatId)> = store
            .iter()
            .filter(|m| !m.is_authored_by(&self.local_user) && m.read_at.is_none())
            .map(|m| (m.id.clone(), m.chat_id.clone()))
            .collect();

        pending
            .into_iter()
            .map(|(message_id, chat_id)| {
                store.set_read_at(&message_id, now);
                ReceiptEvent {
                    message_id,
                    chat_id,
                    kind: ReceiptKind::Read,
                    actor_id: self.local_user.clone(),
                    timestamp: now,
                }
            })
            .collect()
    }
}

#[cfg(test)]
#[path = "tests/receipts_tests.rs"]
mod tests;
