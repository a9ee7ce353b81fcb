//! Per-connection session record, created at upgrade time and handed to
//! every dispatch for that socket.

use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use super::{ConnId, ServerEvent};

/// Context of one live socket.
#[derive(Debug, Clone)]
pub struct Session {
    /// Connection handle.
    pub conn_id: ConnId,
    /// Outbound channel to this socket.
    pub tx: mpsc::Sender<ServerEvent>,
    identity: Option<String>,
}

impl Session {
    /// Create a session with a fresh connection id.
    pub fn new(tx: mpsc::Sender<ServerEvent>) -> Self {
        Self::with_id(Uuid::now_v7(), tx)
    }

    /// Create a session for a known connection id.
    pub const fn with_id(conn_id: ConnId, tx: mpsc::Sender<ServerEvent>) -> Self {
        Self {
            conn_id,
            tx,
            identity: None,
        }
    }

    /// Verified username, once `set-identity` succeeded.
    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    /// Bind the username to this connection.
    pub fn set_identity(&mut self, identity: String) {
        self.identity = Some(identity);
    }

    /// Queue an event for this socket.
    pub async fn send(&self, event: ServerEvent) -> bool {
        if let Err(e) = self.tx.send(event).await {
            warn!(conn_id = %self.conn_id, error = %e, "Failed to queue event for connection");
            return false;
        }
        true
    }
}
