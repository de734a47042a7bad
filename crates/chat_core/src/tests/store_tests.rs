use chrono::{TimeZone, Utc};
use shared::domain::{ChatId, ChatMessage, MessageId, MessageStatus, UserId};

use super::*;

fn message(id: &str, day: u32, hour: u32, content: &str) -> ChatMessage {
    ChatMessage {
        id: MessageId::new(id),
        chat_id: ChatId::new("chat-1"),
        sender_id: UserId::new("mentor-1"),
        content: content.to_string(),
        created_at: Utc
            .with_ymd_and_hms(2024, 5, day, hour, 0, 0)
            .single()
            .expect("timestamp"),
        status: MessageStatus::Sent,
        read_at: None,
    }
}

#[test]
fn append_suppresses_duplicate_ids() {
    let mut store = MessageStore::new();

    assert!(store.append(message("m-1", 1, 9, "first")));
    assert!(!store.append(message("m-1", 1, 10, "imposter")));

    assert_eq!(store.len(), 1);
    assert_eq!(store.get(&MessageId::new("m-1")).expect("entry").content, "first");
}

#[test]
fn append_preserves_arrival_order() {
    let mut store = MessageStore::new();
    store.append(message("m-1", 1, 9, "a"));
    store.append(message("m-2", 1, 9, "b"));
    store.append(message("m-3", 1, 9, "c"));

    let ids: Vec<&str> = store.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["m-1", "m-2", "m-3"]);
}

#[test]
fn replace_swaps_temp_entry_in_place() {
    let mut store = MessageStore::new();
    let temp = MessageId::local();
    let mut optimistic = message("ignored", 1, 9, "hello");
    optimistic.id = temp.clone();
    optimistic.status = MessageStatus::Sending;
    store.append(optimistic);
    store.append(message("m-2", 1, 10, "later"));

    let outcome = store.replace(&temp, message("srv-1", 1, 9, "hello"));

    assert_eq!(outcome, ReplaceOutcome::Replaced);
    assert_eq!(store.len(), 2);
    assert!(!store.contains(&temp));
    let ids: Vec<&str> = store.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["srv-1", "m-2"]);
}

#[test]
fn replace_degrades_to_append_when_temp_absent() {
    let mut store = MessageStore::new();

    let outcome = store.replace(&MessageId::local(), message("srv-1", 1, 9, "hello"));

    assert_eq!(outcome, ReplaceOutcome::Appended);
    assert_eq!(store.len(), 1);
    assert!(store.contains(&MessageId::new("srv-1")));
}

#[test]
fn replace_merges_when_confirmed_id_arrived_over_transport_first() {
    let mut store = MessageStore::new();
    let temp = MessageId::local();
    let mut optimistic = message("ignored", 1, 9, "hello");
    optimistic.id = temp.clone();
    optimistic.status = MessageStatus::Sending;
    store.append(optimistic);
    // The transport echo beat the REST confirmation.
    store.append(message("srv-1", 1, 9, "hello"));

    let outcome = store.replace(&temp, message("srv-1", 1, 9, "hello"));

    assert_eq!(outcome, ReplaceOutcome::Merged);
    assert_eq!(store.len(), 1);
    assert!(store.contains(&MessageId::new("srv-1")));
    assert!(!store.contains(&temp));
}

#[test]
fn days_are_ascending_with_arrival_order_preserved_within_a_day() {
    let mut store = MessageStore::new();
    store.append(message("m-3", 2, 9, "second day"));
    store.append(message("m-1", 1, 20, "late but first day"));
    store.append(message("m-2", 1, 8, "early, arrived later"));

    let grouped: Vec<(String, Vec<&str>)> = store
        .days()
        .map(|(day, messages)| {
            (
                day.to_string(),
                messages.iter().map(|m| m.id.as_str()).collect(),
            )
        })
        .collect();

    assert_eq!(
        grouped,
        vec![
            ("2024-05-01".to_string(), vec!["m-1", "m-2"]),
            ("2024-05-02".to_string(), vec!["m-3"]),
        ]
    );
}

#[test]
fn day_view_is_restartable_and_never_mutates() {
    let mut store = MessageStore::new();
    store.append(message("m-1", 1, 9, "a"));
    store.append(message("m-2", 2, 9, "b"));

    let first: Vec<_> = store.days().map(|(day, _)| day).collect();
    let second: Vec<_> = store.days().map(|(day, _)| day).collect();

    assert_eq!(first, second);
    assert_eq!(store.len(), 2);
}

#[test]
fn partially_consumed_day_view_yields_the_earliest_day_first() {
    let mut store = MessageStore::new();
    store.append(message("m-2", 3, 9, "later day"));
    store.append(message("m-1", 1, 9, "earliest day"));

    let (day, messages) = store.days().next().expect("first day");
    assert_eq!(day.to_string(), "2024-05-01");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id.as_str(), "m-1");
    assert_eq!(store.len(), 2);
}

#[test]
fn set_read_at_applies_only_once() {
    let mut store = MessageStore::new();
    store.append(message("m-1", 1, 9, "a"));
    let first = Utc.with_ymd_and_hms(2024, 5, 3, 8, 0, 0).single().expect("ts");
    let later = Utc.with_ymd_and_hms(2024, 5, 4, 8, 0, 0).single().expect("ts");

    assert!(store.set_read_at(&MessageId::new("m-1"), first));
    assert!(!store.set_read_at(&MessageId::new("m-1"), later));
    assert_eq!(
        store.get(&MessageId::new("m-1")).expect("entry").read_at,
        Some(first)
    );
}

#[test]
fn clear_empties_both_index_and_order() {
    let mut store = MessageStore::new();
    store.append(message("m-1", 1, 9, "a"));
    store.clear();

    assert!(store.is_empty());
    // The id must be appendable again after a clear.
    assert!(store.append(message("m-1", 1, 9, "a")));
}
