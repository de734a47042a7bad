use std::collections::HashSet;

use chrono::{DateTime, NaiveDate, Utc};
use shared::domain::{ChatMessage, MessageId, MessageStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceOutcome {
    /// The temporary entry was swapped in place for the confirmed message.
    Replaced,
    /// The temporary id was absent; the confirmed message was appended.
    Appended,
    /// The confirmed id had already arrived over the transport; the
    /// temporary entry was dropped and the existing entry kept.
    Merged,
}

/// Ordered, id-deduplicated collection of messages. Arrival order is
/// preserved; duplicate ids are silently suppressed.
#[derive(Default)]
pub struct MessageStore {
    messages: Vec<ChatMessage>,
    ids: HashSet<MessageId>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.ids.contains(id)
    }

    pub fn get(&self, id: &MessageId) -> Option<&ChatMessage> {
        self.messages.iter().find(|m| m.id == *id)
    }

    /// Returns false (and leaves the store untouched) when the id is already
    /// present.
    pub fn append(&mut self, message: ChatMessage) -> bool {
        if self.ids.contains(&message.id) {
            return false;
        }
        self.ids.insert(message.id.clone());
        self.messages.push(message);
        true
    }

    /// Atomically swaps the temporary entry for the server-confirmed one.
    /// Degrades to `append` when the temporary id is absent; merges when the
    /// confirmed id already arrived via the transport.
    pub fn replace(&mut self, temp_id: &MessageId, final_message: ChatMessage) -> ReplaceOutcome {
        if self.ids.contains(&final_message.id) {
            if let Some(position) = self.messages.iter().position(|m| m.id == *temp_id) {
                self.messages.remove(position);
                self.ids.remove(temp_id);
            }
            return ReplaceOutcome::Merged;
        }

        match self.messages.iter().position(|m| m.id == *temp_id) {
            Some(position) => {
                self.ids.remove(temp_id);
                self.ids.insert(final_message.id.clone());
                self.messages[position] = final_message;
                ReplaceOutcome::Replaced
            }
            None => {
                self.append(final_message);
                ReplaceOutcome::Appended
            }
        }
    }

    pub fn update_status(&mut self, id: &MessageId, status: MessageStatus) -> bool {
        match self.messages.iter_mut().find(|m| m.id == *id) {
            Some(message) if message.status != status => {
                message.status = status;
                true
            }
            _ => false,
        }
    }

    pub fn set_read_at(&mut self, id: &MessageId, timestamp: DateTime<Utc>) -> bool {
        match self.messages.iter_mut().find(|m| m.id == *id) {
            Some(message) if message.read_at.is_none() => {
                message.read_at = Some(timestamp);
                true
            }
            _ => false,
        }
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.ids.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChatMessage> {
        self.messages.iter()
    }

    /// Lazy, finite, restartable view of the store grouped by calendar day,
    /// ascending, with arrival order preserved within each day. Each group
    /// is computed on demand; the store is never mutated on read.
    pub fn days(&self) -> impl Iterator<Item = (NaiveDate, Vec<&ChatMessage>)> {
        let mut remaining: Vec<&ChatMessage> = self.messages.iter().collect();
        std::iter::from_fn(move || {
            let day = remaining
                .iter()
                .map(|m| m.created_at.date_naive())
                .min()?;
            let (grouped, rest) = remaining
                .drain(..)
                .partition(|m| m.created_at.date_naive() == day);
            remaining = rest;
            Some((day, grouped))
        })
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
