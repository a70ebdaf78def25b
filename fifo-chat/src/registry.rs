//! Live set of connected clients, owned by the broker loop.
//!
//! The broker handles one frame at a time, so the registry is a plain map with
//! no interior locking.

use std::collections::BTreeMap;

use crate::frame::SenderId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientEntry {
    sender_id: SenderId,
    reply_address: String,
    consecutive_failures: u32,
}

impl ClientEntry {
    pub fn sender_id(&self) -> SenderId {
        self.sender_id
    }

    pub fn reply_address(&self) -> &str {
        &self.reply_address
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

/// Clients keyed by sender id. Iteration is in ascending id order.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: BTreeMap<SenderId, ClientEntry>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a client. Returns `false` and leaves the existing entry alone
    /// when `sender_id` is already registered.
    pub fn register(&mut self, sender_id: SenderId, reply_address: &str) -> bool {
        if self.clients.contains_key(&sender_id) {
            return false;
        }
        self.clients.insert(
            sender_id,
            ClientEntry {
                sender_id,
                reply_address: reply_address.to_string(),
                consecutive_failures: 0,
            },
        );
        true
    }

    /// Removes a client if present. Unknown ids are not an error.
    pub fn unregister(&mut self, sender_id: SenderId) -> Option<ClientEntry> {
        self.clients.remove(&sender_id)
    }

    /// Every registered client except `excluding`. Calling again restarts the walk.
    pub fn recipients(&self, excluding: SenderId) -> impl Iterator<Item = &ClientEntry> + '_ {
        self.clients
            .values()
            .filter(move |entry| entry.sender_id != excluding)
    }

    /// Updates the failure streak for a client and returns it. A success
    /// resets the streak to zero. Unknown ids report zero.
    pub fn record_delivery(&mut self, sender_id: SenderId, delivered: bool) -> u32 {
        let Some(entry) = self.clients.get_mut(&sender_id) else {
            return 0;
        };
        if delivered {
            entry.consecutive_failures = 0;
        } else {
            entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
        }
        entry.consecutive_failures
    }

    pub fn get(&self, sender_id: SenderId) -> Option<&ClientEntry> {
        self.clients.get(&sender_id)
    }

    pub fn contains(&self, sender_id: SenderId) -> bool {
        self.clients.contains_key(&sender_id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn clear(&mut self) {
        self.clients.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids<'a>(entries: impl Iterator<Item = &'a ClientEntry>) -> Vec<SenderId> {
        entries.map(ClientEntry::sender_id).collect()
    }

    #[test]
    fn duplicate_registration_keeps_first_entry() {
        let mut registry = ClientRegistry::new();

        assert!(registry.register(10, "/tmp/client_fifo_10"));
        assert!(registry.register(20, "/tmp/client_fifo_20"));
        assert!(!registry.register(10, "/tmp/elsewhere"));

        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.get(10).map(ClientEntry::reply_address),
            Some("/tmp/client_fifo_10")
        );
    }

    #[test]
    fn connect_then_disconnect_restores_previous_state() {
        let mut registry = ClientRegistry::new();
        registry.register(1, "/tmp/a");
        let before = ids(registry.recipients(0));

        registry.register(2, "/tmp/b");
        let removed = registry.unregister(2).expect("client 2 was registered");

        assert_eq!(removed.reply_address(), "/tmp/b");
        assert_eq!(ids(registry.recipients(0)), before);
    }

    #[test]
    fn unregistering_unknown_client_is_a_no_op() {
        let mut registry = ClientRegistry::new();
        registry.register(1, "/tmp/a");

        assert!(registry.unregister(1).is_some());
        assert!(registry.unregister(1).is_none());
        assert!(registry.unregister(42).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn recipients_skip_the_sender_and_can_be_walked_twice() {
        let mut registry = ClientRegistry::new();
        for id in [3, 1, 2] {
            registry.register(id, &format!("/tmp/client_fifo_{id}"));
        }

        assert_eq!(ids(registry.recipients(1)), vec![2, 3]);
        assert_eq!(ids(registry.recipients(1)), vec![2, 3]);
        assert_eq!(ids(registry.recipients(99)), vec![1, 2, 3]);
    }

    #[test]
    fn failure_streak_resets_on_success() {
        let mut registry = ClientRegistry::new();
        registry.register(5, "/tmp/e");

        assert_eq!(registry.record_delivery(5, false), 1);
        assert_eq!(registry.record_delivery(5, false), 2);
        assert_eq!(registry.record_delivery(5, true), 0);
        assert_eq!(registry.get(5).map(ClientEntry::consecutive_failures), Some(0));
        assert_eq!(registry.record_delivery(6, false), 0);
    }
}
