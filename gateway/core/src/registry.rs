//! Connection Registry - Who Is Reachable
//!
//! Authoritative index of live connections, keyed by user and by
//! conversation. Every component that needs to reach a client goes through
//! the registry; nothing keeps its own list of connections.
//!
//! # Architecture
//!
//! ```text
//!                        ConnectionRegistry
//!          ┌────────────────────────────────────────────────┐
//!          │ connections:     ConnectionId → Arc<Connection> │
//!          │ by_user:         user_id → {ConnectionId}       │
//!          │ by_conversation: conv_id → {ConnectionId}       │
//!          │   all three behind ONE Arc<RwLock<>>           │
//!          └────────────────────────────────────────────────┘
//! ```
//!
//! # Atomicity
//!
//! The three maps share a single lock, so `unregister` removes a connection
//! from every index in one critical section and prunes keys left empty. No
//! reader can observe a connection present in one index but not the other.
//! The registry is constructed once at server start and passed to every
//! component that needs it; [`ConnectionRegistry::close_all`] tears it down.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::connection::{Connection, ConnectionId, ConnectionState};

#[derive(Default)]
struct RegistryInner {
    connections: HashMap<ConnectionId, Arc<Connection>>,
    by_user: HashMap<String, HashSet<ConnectionId>>,
    by_conversation: HashMap<String, HashSet<ConnectionId>>,
}

impl RegistryInner {
    fn unindex_conversation(&mut self, id: ConnectionId, conversation_id: &str) {
        if let Some(set) = self.by_conversation.get_mut(conversation_id) {
            set.remove(&id);
            if set.is_empty() {
                self.by_conversation.remove(conversation_id);
            }
        }
    }

    fn resolve(&self, ids: Option<&HashSet<ConnectionId>>) -> Vec<Arc<Connection>> {
        ids.map(|ids| {
            ids.iter()
                .filter_map(|id| self.connections.get(id).cloned())
                .collect()
        })
        .unwrap_or_default()
    }
}

/// Live index of connections by user and conversation
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

impl ConnectionRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Index a connection under its user and (if bound) conversation
    ///
    /// Idempotent: registering an already registered connection changes
    /// nothing and returns `false`.
    pub fn register(&self, connection: &Arc<Connection>) -> bool {
        let id = connection.id();
        let conversation_id = connection.conversation_id();
        {
            let mut inner = self.inner.write();
            if inner.connections.contains_key(&id) {
                return false;
            }
            inner.connections.insert(id, Arc::clone(connection));
            inner
                .by_user
                .entry(connection.user_id().to_string())
                .or_default()
                .insert(id);
            if let Some(conversation) = &conversation_id {
                inner
                    .by_conversation
                    .entry(conversation.clone())
                    .or_default()
                    .insert(id);
            }
        }

        tracing::info!(
            connection_id = %id,
            user_id = %connection.user_id(),
            conversation_id = ?conversation_id,
            "Connection registered"
        );
        true
    }

    /// Remove a connection from every index
    ///
    /// Prunes keys left without connections, marks the connection `CLOSED`
    /// and stops its health monitor. Unknown ids are a no-op returning `None`.
    pub fn unregister(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let removed = {
            let mut inner = self.inner.write();
            let connection = inner.connections.remove(&id)?;

            let user_id = connection.user_id();
            if let Some(set) = inner.by_user.get_mut(user_id) {
                set.remove(&id);
                if set.is_empty() {
                    inner.by_user.remove(user_id);
                }
            }
            if let Some(conversation) = connection.conversation_id() {
                inner.unindex_conversation(id, &conversation);
            }
            connection
        };

        removed.transition(ConnectionState::Closed);
        removed.stop_monitor();
        tracing::info!(
            connection_id = %id,
            user_id = %removed.user_id(),
            "Connection unregistered"
        );
        Some(removed)
    }

    /// Move a connection to another conversation (or detach it)
    ///
    /// Returns `false` if the connection is not registered.
    pub fn rebind(&self, id: ConnectionId, conversation_id: Option<String>) -> bool {
        let mut inner = self.inner.write();
        let Some(connection) = inner.connections.get(&id).cloned() else {
            return false;
        };

        let previous = connection.conversation_id();
        if previous == conversation_id {
            return true;
        }
        if let Some(old) = &previous {
            inner.unindex_conversation(id, old);
        }
        if let Some(new) = &conversation_id {
            inner
                .by_conversation
                .entry(new.clone())
                .or_default()
                .insert(id);
        }
        connection.set_conversation_id(conversation_id.clone());
        drop(inner);

        tracing::debug!(
            connection_id = %id,
            from = ?previous,
            to = ?conversation_id,
            "Connection rebound"
        );
        true
    }

    /// Look up one connection
    #[must_use]
    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.inner.read().connections.get(&id).cloned()
    }

    /// Check if a connection is registered
    #[must_use]
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.inner.read().connections.contains_key(&id)
    }

    /// Snapshot of a user's connections
    #[must_use]
    pub fn connections_for_user(&self, user_id: &str) -> Vec<Arc<Connection>> {
        let inner = self.inner.read();
        inner.resolve(inner.by_user.get(user_id))
    }

    /// Snapshot of a conversation's connections
    #[must_use]
    pub fn connections_for_conversation(&self, conversation_id: &str) -> Vec<Arc<Connection>> {
        let inner = self.inner.read();
        inner.resolve(inner.by_conversation.get(conversation_id))
    }

    /// Users with at least one connection
    #[must_use]
    pub fn user_ids(&self) -> Vec<String> {
        self.inner.read().by_user.keys().cloned().collect()
    }

    /// Conversations with at least one connection
    #[must_use]
    pub fn conversation_ids(&self) -> Vec<String> {
        self.inner.read().by_conversation.keys().cloned().collect()
    }

    /// Whether `id` appears in any user or conversation index
    #[must_use]
    pub fn is_indexed(&self, id: ConnectionId) -> bool {
        let inner = self.inner.read();
        inner.by_user.values().any(|set| set.contains(&id))
            || inner.by_conversation.values().any(|set| set.contains(&id))
    }

    /// Number of registered connections
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().connections.len()
    }

    /// Whether no connection is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().connections.is_empty()
    }

    /// Get a summary of the registry state
    #[must_use]
    pub fn summary(&self) -> RegistrySummary {
        let inner = self.inner.read();
        RegistrySummary {
            total_connections: inner.connections.len(),
            users: inner.by_user.len(),
            conversations: inner.by_conversation.len(),
        }
    }

    /// Close and unregister every connection (server shutdown)
    ///
    /// Returns the number of connections closed.
    pub fn close_all(&self, reason: &str) -> usize {
        let ids: Vec<ConnectionId> = self.inner.read().connections.keys().copied().collect();
        let mut closed = 0;
        for id in ids {
            if let Some(connection) = self.get(id) {
                connection.close(reason);
            }
            if self.unregister(id).is_some() {
                closed += 1;
            }
        }
        closed
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let summary = self.summary();
        f.debug_struct("ConnectionRegistry")
            .field("connections", &summary.total_connections)
            .field("users", &summary.users)
            .field("conversations", &summary.conversations)
            .finish()
    }
}

/// Summary of registry state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegistrySummary {
    /// Total number of registered connections
    pub total_connections: usize,
    /// Distinct users connected
    pub users: usize,
    /// Distinct conversations with a connection
    pub conversations: usize,
}
