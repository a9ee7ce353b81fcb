//! Chat Relay
//!
//! Live fan-out of messages and reactions. Nothing is stored here; payloads
//! are forwarded verbatim to every other connection.

use tracing::debug;

use crate::ws::{ClientEvent, ConnId, ConnectionHub, ServerEvent};

/// Map a chat client event to the event other connections receive.
pub fn outbound(event: ClientEvent) -> Option<ServerEvent> {
    match event {
        ClientEvent::SendMessage(payload) => Some(ServerEvent::Message(payload)),
        ClientEvent::AddReaction(payload) => Some(ServerEvent::MessageReaction(payload)),
        ClientEvent::RemoveReaction(payload) => Some(ServerEvent::MessageReactionRemoved(payload)),
        _ => None,
    }
}

/// Broadcast a chat event to everyone except the sender. Returns the delivery count.
pub async fn relay(hub: &ConnectionHub, sender: ConnId, event: ClientEvent) -> usize {
    let name = event.name();
    let Some(outbound) = outbound(event) else {
        return 0;
    };

    let delivered = hub.broadcast_except(sender, outbound).await;
    debug!(conn_id = %sender, event = name, delivered, "Relayed chat event");
    delivered
}
