//! Client connection registry.
//!
//! Tracks every live connection: identity, subscribed collections,
//! per-user connection counts, and liveness. Registration and the
//! collection index are updated under one write lock, so a concurrent
//! broadcast lookup sees a client either fully registered or not at all.

use crate::error::{CoreError, CoreResult};
use parking_lot::RwLock;
use pocketsync_protocol::now_millis;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// A live client connection.
#[derive(Debug, Clone)]
pub struct ClientSession {
    /// Connection-scoped id.
    pub client_id: String,
    /// Logical replica id; survives reconnects.
    pub node_id: String,
    /// Authenticated identity, if the server requires auth.
    pub principal: Option<String>,
    /// Collections the client declared at handshake.
    pub subscribed_collections: HashSet<String>,
    /// Connection time, milliseconds.
    pub connected_at: u64,
    /// Last inbound activity, milliseconds.
    pub last_activity_at: u64,
}

impl ClientSession {
    /// Creates a session record at the current time.
    pub fn new(
        client_id: impl Into<String>,
        node_id: impl Into<String>,
        principal: Option<String>,
        collections: impl IntoIterator<Item = String>,
    ) -> Self {
        let now = now_millis();
        Self {
            client_id: client_id.into(),
            node_id: node_id.into(),
            principal,
            subscribed_collections: collections.into_iter().collect(),
            connected_at: now,
            last_activity_at: now,
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    sessions: HashMap<String, ClientSession>,
    /// collection -> client ids subscribed to it.
    by_collection: HashMap<String, HashSet<String>>,
    /// principal -> active connection count.
    by_principal: HashMap<String, usize>,
}

/// Registry of live client connections.
pub struct ClientRegistry {
    inner: RwLock<RegistryInner>,
    max_clients_per_user: usize,
}

impl ClientRegistry {
    /// Creates a registry enforcing the given per-user connection cap.
    pub fn new(max_clients_per_user: usize) -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            max_clients_per_user,
        }
    }

    /// Registers a session.
    ///
    /// Fails with [`CoreError::TooManyConnections`] if the session's
    /// principal already holds the maximum number of connections.
    pub fn register(&self, session: ClientSession) -> CoreResult<()> {
        let mut inner = self.inner.write();

        if let Some(principal) = &session.principal {
            let count = inner.by_principal.get(principal).copied().unwrap_or(0);
            if count >= self.max_clients_per_user {
                return Err(CoreError::TooManyConnections {
                    max: self.max_clients_per_user,
                });
            }
            *inner.by_principal.entry(principal.clone()).or_insert(0) += 1;
        }

        for collection in &session.subscribed_collections {
            inner
                .by_collection
                .entry(collection.clone())
                .or_default()
                .insert(session.client_id.clone());
        }
        inner.sessions.insert(session.client_id.clone(), session);
        Ok(())
    }

    /// Removes a session, returning it if present.
    pub fn deregister(&self, client_id: &str) -> Option<ClientSession> {
        let mut inner = self.inner.write();
        let session = inner.sessions.remove(client_id)?;

        for collection in &session.subscribed_collections {
            if let Some(clients) = inner.by_collection.get_mut(collection) {
                clients.remove(client_id);
                if clients.is_empty() {
                    inner.by_collection.remove(collection);
                }
            }
        }
        if let Some(principal) = &session.principal {
            if let Some(count) = inner.by_principal.get_mut(principal) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    inner.by_principal.remove(principal);
                }
            }
        }
        Some(session)
    }

    /// Returns the sessions subscribed to a collection.
    pub fn sessions_for_collection(&self, collection: &str) -> Vec<ClientSession> {
        let inner = self.inner.read();
        inner
            .by_collection
            .get(collection)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.sessions.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Returns a session by id.
    pub fn get(&self, client_id: &str) -> Option<ClientSession> {
        self.inner.read().sessions.get(client_id).cloned()
    }

    /// Marks inbound activity for a client.
    pub fn heartbeat(&self, client_id: &str) {
        if let Some(session) = self.inner.write().sessions.get_mut(client_id) {
            session.last_activity_at = now_millis();
        }
    }

    /// Evicts sessions idle for longer than `ttl` and returns their ids.
    pub fn prune_idle(&self, ttl: Duration) -> Vec<String> {
        let deadline = now_millis().saturating_sub(ttl.as_millis() as u64);
        let idle: Vec<String> = {
            let inner = self.inner.read();
            inner
                .sessions
                .values()
                .filter(|s| s.last_activity_at < deadline)
                .map(|s| s.client_id.clone())
                .collect()
        };
        for client_id in &idle {
            self.deregister(client_id);
        }
        idle
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.inner.read().sessions.len()
    }

    /// Returns true if no sessions are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(client_id: &str, principal: Option<&str>) -> ClientSession {
        ClientSession::new(
            client_id,
            format!("node-{client_id}"),
            principal.map(String::from),
            vec!["todos".to_string()],
        )
    }

    #[test]
    fn register_and_lookup_by_collection() {
        let registry = ClientRegistry::new(4);
        registry.register(session("c1", None)).unwrap();
        registry.register(session("c2", None)).unwrap();

        let sessions = registry.sessions_for_collection("todos");
        assert_eq!(sessions.len(), 2);
        assert!(registry.sessions_for_collection("notes").is_empty());
    }

    #[test]
    fn per_user_connection_limit() {
        let registry = ClientRegistry::new(1);
        registry.register(session("c1", Some("alice"))).unwrap();

        let err = registry.register(session("c2", Some("alice"))).unwrap_err();
        assert!(matches!(err, CoreError::TooManyConnections { max: 1 }));

        // Other users are unaffected.
        registry.register(session("c3", Some("bob"))).unwrap();

        // Disconnecting frees the slot.
        registry.deregister("c1");
        registry.register(session("c4", Some("alice"))).unwrap();
    }

    #[test]
    fn unauthenticated_sessions_bypass_user_cap() {
        let registry = ClientRegistry::new(1);
        registry.register(session("c1", None)).unwrap();
        registry.register(session("c2", None)).unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn deregister_cleans_collection_index() {
        let registry = ClientRegistry::new(4);
        registry.register(session("c1", None)).unwrap();
        registry.deregister("c1");
        assert!(registry.sessions_for_collection("todos").is_empty());
        assert!(registry.deregister("c1").is_none());
    }

    #[test]
    fn heartbeat_updates_activity() {
        let registry = ClientRegistry::new(4);
        registry.register(session("c1", None)).unwrap();
        let before = registry.get("c1").unwrap().last_activity_at;
        std::thread::sleep(Duration::from_millis(5));
        registry.heartbeat("c1");
        assert!(registry.get("c1").unwrap().last_activity_at >= before);
    }

    #[test]
    fn prune_evicts_only_idle_clients() {
        let registry = ClientRegistry::new(4);
        registry.register(session("c1", None)).unwrap();
        registry.register(session("c2", None)).unwrap();

        std::thread::sleep(Duration::from_millis(15));
        registry.heartbeat("c2");

        let evicted = registry.prune_idle(Duration::from_millis(10));
        assert_eq!(evicted, vec!["c1".to_string()]);
        assert!(registry.get("c1").is_none());
        assert!(registry.get("c2").is_some());
    }
}
