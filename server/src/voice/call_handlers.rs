//! Call signaling verbs arriving over the WebSocket.

use serde_json::{json, Value};
use tracing::{debug, warn};

use super::broker::CallError;
use super::call::{CallPhase, CallSession};
use crate::api::AppState;
use crate::ws::{ClientEvent, Session};

/// Handle a call signaling event for an identified session.
///
/// The session identity is the authoritative sender; a `from` field in the
/// payload is only checked for consistency.
pub async fn handle_call_event(
    state: &AppState,
    session: &Session,
    event: ClientEvent,
) -> Result<Value, CallError> {
    let identity = session.identity().ok_or(CallError::IdentityRequired)?;

    match event {
        ClientEvent::CallUser {
            from,
            to,
            room_id,
            signal,
        } => {
            warn_on_spoofed_from(session, from.as_deref());
            let call = state.broker.invite(identity, &to, room_id, signal).await?;
            Ok(json!({ "callId": call.id, "roomId": call.room_id }))
        }
        ClientEvent::CallAnswer { from, to, signal } => {
            warn_on_spoofed_from(session, from.as_deref());
            let call = state.broker.accept(identity, &to, signal).await?;
            Ok(json!({ "callId": call.id, "roomId": call.room_id }))
        }
        ClientEvent::CallFailed { to, message } => {
            let failed = state.broker.reject(identity, &to, message).await?;
            Ok(json!({ "callId": failed.map(|c| c.id) }))
        }
        ClientEvent::EndCall { to } => {
            let closed = state.broker.end(identity, &to).await?;
            let call_id = closed.as_ref().map(|c| c.session.id);
            if let Some(closed) = closed.filter(|c| c.previous == CallPhase::Accepted) {
                release_call_media(state, &closed.session).await;
            }
            Ok(json!({ "callId": call_id }))
        }
        ClientEvent::IceCandidate { to, candidate } => {
            state
                .broker
                .relay_ice_candidate(identity, &to, candidate)
                .await?;
            Ok(Value::Null)
        }
        other => {
            debug!(event = other.name(), "Non-call event routed to call handler");
            Ok(Value::Null)
        }
    }
}

/// Close both parties' media in the call's room.
pub async fn release_call_media(state: &AppState, call: &CallSession) {
    for party in [&call.caller, &call.callee] {
        let Some(conn_id) = state.presence.lookup(party).await else {
            continue;
        };
        let teardown = state.sfu.leave_room(conn_id, &call.room_id).await;
        debug!(
            call_id = %call.id,
            room_id = %call.room_id,
            party = %party,
            producers = teardown.producers,
            consumers = teardown.consumers,
            transports = teardown.transports,
            "Released call media"
        );
    }
}

fn warn_on_spoofed_from(session: &Session, from: Option<&str>) {
    if let (Some(claimed), Some(actual)) = (from, session.identity()) {
        if claimed != actual {
            warn!(
                conn_id = %session.conn_id,
                claimed = %claimed,
                identity = %actual,
                "Ignoring mismatched sender in call payload"
            );
        }
    }
}
