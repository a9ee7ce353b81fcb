//! Connection Hub
//!
//! Live outbound channels for every open socket, used for direct delivery
//! and server-wide fan-out. Delivery never waits on a peer's queue.

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use super::{ConnId, ServerEvent};

/// Registry of outbound event channels keyed by connection.
#[derive(Default)]
pub struct ConnectionHub {
    connections: DashMap<ConnId, mpsc::Sender<ServerEvent>>,
}

impl ConnectionHub {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a newly opened connection.
    pub fn register(&self, conn_id: ConnId, tx: mpsc::Sender<ServerEvent>) {
        self.connections.insert(conn_id, tx);
        debug!(conn_id = %conn_id, total = self.connections.len(), "Connection registered");
    }

    /// Forget a connection. Returns whether it was known.
    pub fn unregister(&self, conn_id: ConnId) -> bool {
        let removed = self.connections.remove(&conn_id).is_some();
        if removed {
            debug!(conn_id = %conn_id, total = self.connections.len(), "Connection unregistered");
        }
        removed
    }

    /// Send an event to one connection. Returns whether it was queued.
    pub async fn send_to(&self, conn_id: ConnId, event: ServerEvent) -> bool {
        let Some(tx) = self.connections.get(&conn_id).map(|entry| entry.value().clone()) else {
            return false;
        };

        Self::enqueue(conn_id, &tx, event)
    }

    /// Send an event to every connection except `exclude`. Returns the delivery count.
    pub async fn broadcast_except(&self, exclude: ConnId, event: ServerEvent) -> usize {
        let senders: Vec<(ConnId, mpsc::Sender<ServerEvent>)> = self
            .connections
            .iter()
            .filter(|entry| *entry.key() != exclude)
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        Self::fan_out(senders, event).await
    }

    async fn fan_out(senders: Vec<(ConnId, mpsc::Sender<ServerEvent>)>, event: ServerEvent) -> usize {
        senders
            .iter()
            .filter(|(conn_id, tx)| Self::enqueue(*conn_id, tx, event.clone()))
            .count()
    }

    /// Queue without waiting. A full queue drops the event for that connection.
    fn enqueue(conn_id: ConnId, tx: &mpsc::Sender<ServerEvent>, event: ServerEvent) -> bool {
        match tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(conn_id = %conn_id, "Outbound queue full, dropping event");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(conn_id = %conn_id, "Outbound channel closed");
                false
            }
        }
    }

    /// Number of open connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether no connection is open.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
