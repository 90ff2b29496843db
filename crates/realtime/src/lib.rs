//! Realtime connection registry (spec.md §4.9, component C9).
//!
//! Grounded on the `Slab`-of-connections + `mpsc`-channel-per-connection
//! idiom this workspace's reactive subscription tracker uses: every
//! connection gets an owning slot and a channel it can be woken up
//! through; a full or closed channel is treated as a dead connection
//! rather than an error, since delivery here is best-effort at-most-once
//! (spec.md §4.9).

use std::{
    collections::BTreeMap,
    sync::Arc,
};

use chrono::{
    DateTime,
    Utc,
};
use parking_lot::Mutex;
use scope::ScopeMap;
use slab::Slab;
use tokio::sync::mpsc;

pub type ConnectionId = usize;

#[derive(Debug, Clone)]
pub enum RealtimeEvent {
    Sync { cursor: i64, timestamp: DateTime<Utc> },
    Heartbeat { timestamp: DateTime<Utc> },
    Error { error: String, timestamp: DateTime<Utc> },
}

struct Connection {
    client_id: String,
    scope_keys: std::collections::BTreeSet<String>,
    sender: mpsc::Sender<RealtimeEvent>,
}

struct Inner {
    connections: Slab<Connection>,
    by_client: BTreeMap<String, std::collections::BTreeSet<ConnectionId>>,
}

/// Pure in-memory index of live connections (spec.md §4.9). Carries no
/// persistence of its own: a server restart drops every connection, and
/// clients rediscover missed wake-ups by pulling on reconnect.
pub struct RealtimeRegistry {
    inner: Mutex<Inner>,
}

impl Default for RealtimeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RealtimeRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                connections: Slab::new(),
                by_client: BTreeMap::new(),
            }),
        }
    }

    /// Registers a new connection under `client_id` with its initial set of
    /// scope-keys (the canonical [`scope::scope_key`] strings its active
    /// subscriptions resolve to). Returns the handle to pass to
    /// [`Self::unregister`].
    pub fn register(
        &self,
        client_id: &str,
        initial_scope_keys: Vec<String>,
        sender: mpsc::Sender<RealtimeEvent>,
    ) -> ConnectionId {
        let mut inner = self.inner.lock();
        let id = inner.connections.insert(Connection {
            client_id: client_id.to_string(),
            scope_keys: initial_scope_keys.into_iter().collect(),
            sender,
        });
        inner.by_client.entry(client_id.to_string()).or_default().insert(id);
        id
    }

    pub fn unregister(&self, conn_id: ConnectionId) {
        let mut inner = self.inner.lock();
        if !inner.connections.contains(conn_id) {
            return;
        }
        let connection = inner.connections.remove(conn_id);
        if let Some(ids) = inner.by_client.get_mut(&connection.client_id) {
            ids.remove(&conn_id);
            if ids.is_empty() {
                inner.by_client.remove(&connection.client_id);
            }
        }
    }

    /// Replaces every connection's scope-key set for `client_id` with
    /// `scope_keys` (called after a `syncOnce` round changes which scope
    /// buckets a client's active subscriptions fall into).
    pub fn update_client_scope_keys(&self, client_id: &str, scope_keys: Vec<String>) {
        let mut inner = self.inner.lock();
        let Some(ids) = inner.by_client.get(client_id).cloned() else {
            return;
        };
        let scope_keys: std::collections::BTreeSet<String> = scope_keys.into_iter().collect();
        for id in ids {
            if let Some(connection) = inner.connections.get_mut(id) {
                connection.scope_keys = scope_keys.clone();
            }
        }
    }

    /// Sends `event()` to every connection whose scope-keys intersect
    /// `scope_keys`, skipping `exclude_client_ids`. A full or closed channel
    /// unregisters the connection instead of propagating an error, per this
    /// registry's best-effort delivery contract.
    pub fn for_each_connection_in_scope_keys(
        &self,
        scope_keys: &[String],
        exclude_client_ids: &[String],
        mut event: impl FnMut(&str) -> RealtimeEvent,
    ) {
        let matches: Vec<(ConnectionId, mpsc::Sender<RealtimeEvent>, String)> = {
            let inner = self.inner.lock();
            inner
                .connections
                .iter()
                .filter(|(_, conn)| {
                    !exclude_client_ids.contains(&conn.client_id)
                        && scope_keys.iter().any(|k| conn.scope_keys.contains(k))
                })
                .map(|(id, conn)| (id, conn.sender.clone(), conn.client_id.clone()))
                .collect()
        };

        let mut dead = Vec::new();
        for (id, sender, client_id) in matches {
            let payload = event(&client_id);
            if sender.try_send(payload).is_err() {
                dead.push(id);
            }
        }
        for id in dead {
            self.unregister(id);
        }
    }

    pub fn close_client_connections(&self, client_id: &str) {
        let ids: Vec<ConnectionId> = {
            let inner = self.inner.lock();
            inner
                .by_client
                .get(client_id)
                .map(|ids| ids.iter().copied().collect())
                .unwrap_or_default()
        };
        for id in ids {
            self.unregister(id);
        }
    }

    /// Sends a heartbeat to every live connection; meant to be driven by a
    /// `tokio::time::interval` at `heartbeatIntervalMs` (spec.md §6).
    pub fn broadcast_heartbeat(&self, now: DateTime<Utc>) {
        let senders: Vec<(ConnectionId, mpsc::Sender<RealtimeEvent>)> = {
            let inner = self.inner.lock();
            inner.connections.iter().map(|(id, conn)| (id, conn.sender.clone())).collect()
        };
        let mut dead = Vec::new();
        for (id, sender) in senders {
            if sender.try_send(RealtimeEvent::Heartbeat { timestamp: now }).is_err() {
                dead.push(id);
            }
        }
        for id in dead {
            self.unregister(id);
        }
    }

    pub fn connection_count(&self) -> usize {
        self.inner.lock().connections.len()
    }
}

/// Convenience for wiring a subscription's scopes into the registry's
/// string-keyed index.
pub fn scope_key_for(scopes: &ScopeMap) -> String {
    scope::scope_key(scopes)
}

pub type SharedRegistry = Arc<RealtimeRegistry>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_to_matching_scope_key_only() {
        let registry = RealtimeRegistry::new();
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        registry.register("a", vec!["user_id=u1".to_string()], tx_a);
        registry.register("b", vec!["user_id=u2".to_string()], tx_b);

        registry.for_each_connection_in_scope_keys(&["user_id=u1".to_string()], &[], |_| RealtimeEvent::Sync {
            cursor: 5,
            timestamp: Utc::now(),
        });

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn excluded_client_is_skipped() {
        let registry = RealtimeRegistry::new();
        let (tx, mut rx) = mpsc::channel(8);
        registry.register("self", vec!["user_id=u1".to_string()], tx);

        registry.for_each_connection_in_scope_keys(
            &["user_id=u1".to_string()],
            &["self".to_string()],
            |_| RealtimeEvent::Sync {
                cursor: 1,
                timestamp: Utc::now(),
            },
        );

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dead_connection_is_pruned_on_delivery() {
        let registry = RealtimeRegistry::new();
        let (tx, rx) = mpsc::channel(1);
        let id = registry.register("a", vec!["user_id=u1".to_string()], tx);
        drop(rx);

        registry.for_each_connection_in_scope_keys(&["user_id=u1".to_string()], &[], |_| RealtimeEvent::Sync {
            cursor: 1,
            timestamp: Utc::now(),
        });

        assert_eq!(registry.connection_count(), 0);
        let _ = id;
    }

    #[tokio::test]
    async fn close_client_connections_removes_all_of_its_connections() {
        let registry = RealtimeRegistry::new();
        let (tx1, _rx1) = mpsc::channel(8);
        let (tx2, _rx2) = mpsc::channel(8);
        registry.register("a", vec!["user_id=u1".to_string()], tx1);
        registry.register("a", vec!["user_id=u1".to_string()], tx2);
        assert_eq!(registry.connection_count(), 2);

        registry.close_client_connections("a");
        assert_eq!(registry.connection_count(), 0);
    }
}
