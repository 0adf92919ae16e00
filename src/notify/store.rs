//! Ordered, deduplicated notification list with a persisted mirror.
//!
//! The store keeps most-recent-first order with at most one entry per
//! sender, and mirrors the full list to durable storage after every
//! mutation so a reload (or crash) loses nothing. The mirror key is
//! derived from the session token, so each session sees only its own
//! notifications.

use std::sync::Arc;

use crate::constants::notification_key;
use crate::notify::NotificationEvent;
use crate::storage::KeyValueStore;

/// Deduplicated notification list bound to the current session token.
pub struct NotificationStore {
    events: Vec<NotificationEvent>,
    store: Arc<dyn KeyValueStore>,
    token: String,
}

impl std::fmt::Debug for NotificationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationStore")
            .field("len", &self.events.len())
            .finish_non_exhaustive()
    }
}

impl NotificationStore {
    /// Create an empty store over the given storage capability.
    ///
    /// No mirror is read or written until [`restore`](Self::restore) binds
    /// a session token.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            events: Vec::new(),
            store,
            token: String::new(),
        }
    }

    /// Bind to a session token and load its persisted mirror.
    ///
    /// A missing mirror starts empty. An unparseable mirror is deleted and
    /// the store starts empty; this never fails.
    pub fn restore(&mut self, token: &str) {
        self.token = token.to_string();
        self.events.clear();

        if token.is_empty() {
            return;
        }

        let key = notification_key(token);
        let Some(json) = self.store.get(&key) else {
            return;
        };

        match serde_json::from_str(&json) {
            Ok(events) => {
                self.events = events;
                log::debug!("Restored {} persisted notifications", self.events.len());
            }
            Err(e) => {
                log::warn!("Persisted notifications unparseable, dropping: {e}");
                self.store.remove(&key);
            }
        }
    }

    /// Merge a new event: any existing entry from the same sender is
    /// removed, then the event is prepended as most recent. The mirror is
    /// updated before returning.
    pub fn merge(&mut self, event: NotificationEvent) {
        self.events.retain(|e| e.sender_id != event.sender_id);
        self.events.insert(0, event);
        self.persist();
    }

    /// Mirror the full ordered list to durable storage.
    ///
    /// Storage writes are synchronous, so the mirror is current when this
    /// returns. A blank token (logged out) makes this a no-op.
    pub fn persist(&self) {
        if self.token.is_empty() {
            return;
        }

        let json = serde_json::to_string(&self.events).expect("events serializable");
        self.store.set(&notification_key(&self.token), &json);
    }

    /// Clear the list and delete the persisted mirror.
    ///
    /// All-or-nothing: there is no per-event acknowledgement.
    pub fn consume(&mut self) {
        self.events.clear();
        if !self.token.is_empty() {
            self.store.remove(&notification_key(&self.token));
        }
        log::debug!("Notifications consumed");
    }

    /// Number of live notifications (distinct senders).
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether the live set is empty.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// The live notifications, most recent first.
    pub fn events(&self) -> &[NotificationEvent] {
        &self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn event(sender_id: i64, message: &str) -> NotificationEvent {
        NotificationEvent {
            id: None,
            sender_id,
            sender_nickname: format!("user-{sender_id}"),
            send_time: None,
            message: message.to_string(),
        }
    }

    fn bound_store() -> NotificationStore {
        let mut store = NotificationStore::new(Arc::new(MemoryStore::new()));
        store.restore("tok");
        store
    }

    #[test]
    fn test_merge_deduplicates_by_sender() {
        let mut store = bound_store();

        store.merge(event(1, "first"));
        store.merge(event(2, "second"));
        store.merge(event(1, "replacement"));

        // Two distinct senders; sender 1's replacement is most recent.
        assert_eq!(store.len(), 2);
        assert_eq!(store.events()[0].sender_id, 1);
        assert_eq!(store.events()[0].message, "replacement");
        assert_eq!(store.events()[1].sender_id, 2);
    }

    #[test]
    fn test_size_equals_distinct_senders() {
        let mut store = bound_store();

        for i in 0..10 {
            store.merge(event(i % 3, &format!("msg {i}")));
        }

        assert_eq!(store.len(), 3);
        // Most-recent-sender-first: last merge was sender 9 % 3 == 0.
        assert_eq!(store.events()[0].sender_id, 0);
    }

    #[test]
    fn test_persist_restore_roundtrip() {
        let backing: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());

        let mut store = NotificationStore::new(Arc::clone(&backing));
        store.restore("tok");
        store.merge(event(1, "a"));
        store.merge(event(2, "b"));
        let before: Vec<_> = store.events().to_vec();

        let mut reloaded = NotificationStore::new(backing);
        reloaded.restore("tok");
        assert_eq!(reloaded.events(), before.as_slice());
    }

    #[test]
    fn test_mirror_is_scoped_to_token() {
        let backing: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());

        let mut store = NotificationStore::new(Arc::clone(&backing));
        store.restore("token-a");
        store.merge(event(1, "for a"));

        let mut other = NotificationStore::new(backing);
        other.restore("token-b");
        assert!(other.is_empty());
    }

    #[test]
    fn test_restore_deletes_corrupt_mirror() {
        let backing: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        backing.set(&notification_key("tok"), "not json [[[");

        let mut store = NotificationStore::new(Arc::clone(&backing));
        store.restore("tok");

        assert!(store.is_empty());
        assert_eq!(backing.get(&notification_key("tok")), None);
    }

    #[test]
    fn test_consume_clears_memory_and_mirror() {
        let backing: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());

        let mut store = NotificationStore::new(Arc::clone(&backing));
        store.restore("tok");
        store.merge(event(1, "a"));
        assert!(backing.get(&notification_key("tok")).is_some());

        store.consume();

        assert_eq!(store.len(), 0);
        assert_eq!(backing.get(&notification_key("tok")), None);
    }

    #[test]
    fn test_unbound_store_never_touches_storage() {
        let backing: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let mut store = NotificationStore::new(Arc::clone(&backing));

        store.merge(event(1, "a"));
        store.consume();

        assert_eq!(backing.get(&notification_key("")), None);
    }
}
