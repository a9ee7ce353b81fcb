//! Presence Registry
//!
//! Maps a username to the one connection currently speaking for it.

use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::ws::ConnId;

/// Result of binding an identity to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// Identity was offline.
    New,
    /// Same identity on the same connection again.
    Unchanged,
    /// Identity was bound to another connection, which is now stale.
    Replaced {
        /// Connection that lost the identity.
        previous: ConnId,
    },
}

#[derive(Default)]
struct PresenceIndex {
    by_identity: HashMap<String, ConnId>,
    by_connection: HashMap<ConnId, String>,
}

/// Bidirectional identity <-> connection map.
#[derive(Default)]
pub struct PresenceRegistry {
    index: RwLock<PresenceIndex>,
}

impl PresenceRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `identity` to `conn_id`. Last writer wins.
    pub async fn register(&self, identity: &str, conn_id: ConnId) -> Registration {
        let mut index = self.index.write().await;

        // A connection speaks for at most one identity.
        if let Some(held) = index.by_connection.get(&conn_id).cloned() {
            if held == identity {
                return Registration::Unchanged;
            }
            if index.by_identity.get(&held) == Some(&conn_id) {
                index.by_identity.remove(&held);
            }
        }

        let previous = index.by_identity.insert(identity.to_string(), conn_id);
        index.by_connection.insert(conn_id, identity.to_string());

        match previous {
            Some(previous) if previous != conn_id => {
                index.by_connection.remove(&previous);
                Registration::Replaced { previous }
            }
            _ => Registration::New,
        }
    }

    /// Connection currently bound to `identity`.
    pub async fn lookup(&self, identity: &str) -> Option<ConnId> {
        self.index.read().await.by_identity.get(identity).copied()
    }

    /// Drop whatever identity `conn_id` holds. Returns the released identity.
    ///
    /// A stale connection (identity taken over elsewhere) releases nothing.
    pub async fn remove(&self, conn_id: ConnId) -> Option<String> {
        let mut index = self.index.write().await;
        let identity = index.by_connection.remove(&conn_id)?;

        if index.by_identity.get(&identity) == Some(&conn_id) {
            index.by_identity.remove(&identity);
            Some(identity)
        } else {
            None
        }
    }

    /// Sorted list of online identities.
    pub async fn online(&self) -> Vec<String> {
        let index = self.index.read().await;
        let mut users: Vec<String> = index.by_identity.keys().cloned().collect();
        users.sort();
        users
    }

    /// Number of online identities.
    pub async fn len(&self) -> usize {
        self.index.read().await.by_identity.len()
    }

    /// Whether nobody is online.
    pub async fn is_empty(&self) -> bool {
        self.index.read().await.by_identity.is_empty()
    }
}
