//! Call Signaling Broker
//!
//! Invite/accept/reject/end handshake between two online identities, with a
//! ring timeout per unordered pair.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::call::{CallEventType, CallPair, CallPhase, CallSession, CallStateError, EndReason};
use super::RoomId;
use crate::presence::PresenceRegistry;
use crate::ws::{ConnectionHub, ServerEvent};

pub const NOT_ONLINE_MESSAGE: &str = "User is not online";
pub const BUSY_MESSAGE: &str = "User is busy";
pub const TIMED_OUT_MESSAGE: &str = "Call timed out";
pub const REJECTED_MESSAGE: &str = "Call rejected";

/// Errors raised by the call broker.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("User is not online")]
    NotOnline(String),
    /// Relay target offline. Unlike `NotOnline`, the sender got no `call-failed`.
    #[error("User is not online")]
    Unreachable(String),
    #[error("User is busy")]
    Busy(String),
    #[error("Cannot call yourself")]
    SelfCall,
    #[error("No pending call with {0}")]
    NoSuchCall(String),
    #[error("Set an identity before calling")]
    IdentityRequired,
    #[error(transparent)]
    State(#[from] CallStateError),
}

impl CallError {
    /// Stable machine-readable code for the wire.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::NotOnline(_) | Self::Unreachable(_) => "not_online",
            Self::Busy(_) => "busy",
            Self::SelfCall => "self_call",
            Self::NoSuchCall(_) => "call_not_found",
            Self::IdentityRequired => "identity_required",
            Self::State(_) => "invalid_transition",
        }
    }

    /// Whether the caller was already told through a `call-failed` event.
    pub const fn is_notified(&self) -> bool {
        matches!(self, Self::NotOnline(_) | Self::Busy(_))
    }
}

/// A call removed from the broker, with the phase it had before.
#[derive(Debug, Clone)]
pub struct ClosedCall {
    pub previous: CallPhase,
    pub session: CallSession,
}

struct CallRecord {
    session: CallSession,
    timer: Option<JoinHandle<()>>,
    generation: u64,
}

impl CallRecord {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

type Outbox = Vec<(String, ServerEvent)>;

/// Owns every live call and its ring timer.
pub struct CallBroker {
    calls: Mutex<HashMap<CallPair, CallRecord>>,
    presence: Arc<PresenceRegistry>,
    hub: Arc<ConnectionHub>,
    timeout: Duration,
    next_generation: AtomicU64,
}

impl CallBroker {
    /// Create a broker ringing calls for at most `timeout`.
    pub fn new(presence: Arc<PresenceRegistry>, hub: Arc<ConnectionHub>, timeout: Duration) -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
            presence,
            hub,
            timeout,
            next_generation: AtomicU64::new(1),
        }
    }

    /// Ring `callee` on behalf of `caller`.
    ///
    /// A pending invite between the same pair is superseded. Offline or busy
    /// callees are reported to the caller with `call-failed` and no call is
    /// created.
    pub async fn invite(
        self: &Arc<Self>,
        caller: &str,
        callee: &str,
        room_id: Option<RoomId>,
        signal: Option<Value>,
    ) -> Result<CallSession, CallError> {
        if caller == callee {
            return Err(CallError::SelfCall);
        }

        let room_id = room_id
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| format!("{caller}-{callee}-{}", Utc::now().timestamp_millis()));
        let pair = CallPair::new(caller, callee);

        let session = {
            let mut calls = self.calls.lock().await;

            // Presence is read while the calls lock is held.
            if self.presence.lookup(callee).await.is_none() {
                drop(calls);
                debug!(caller = %caller, callee = %callee, "Invite to offline user");
                self.deliver(
                    caller,
                    ServerEvent::CallFailed {
                        from: Some(callee.to_string()),
                        message: NOT_ONLINE_MESSAGE.to_string(),
                    },
                )
                .await;
                return Err(CallError::NotOnline(callee.to_string()));
            }

            let busy = calls
                .values()
                .any(|r| r.session.phase() == CallPhase::Accepted && r.session.peer_of(callee).is_some());
            if busy {
                drop(calls);
                info!(caller = %caller, callee = %callee, "Callee busy");
                self.deliver(
                    caller,
                    ServerEvent::CallFailed {
                        from: Some(callee.to_string()),
                        message: BUSY_MESSAGE.to_string(),
                    },
                )
                .await;
                return Err(CallError::Busy(callee.to_string()));
            }

            if let Some(mut previous) = calls.remove(&pair) {
                previous.cancel_timer();
                debug!(pair = %pair, call_id = %previous.session.id, "Superseding pending invite");
            }

            let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
            let session = CallSession::new(caller, callee, room_id);
            let timer = self.arm_timer(pair.clone(), generation);

            calls.insert(
                pair,
                CallRecord {
                    session: session.clone(),
                    timer: Some(timer),
                    generation,
                },
            );
            session
        };

        info!(
            call_id = %session.id,
            caller = %caller,
            callee = %callee,
            room_id = %session.room_id,
            "Call ringing"
        );

        self.deliver(
            callee,
            ServerEvent::IncomingCall {
                from: caller.to_string(),
                room_id: session.room_id.clone(),
                signal,
            },
        )
        .await;

        Ok(session)
    }

    fn arm_timer(self: &Arc<Self>, pair: CallPair, generation: u64) -> JoinHandle<()> {
        let broker: Weak<Self> = Arc::downgrade(self);
        let timeout = self.timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(broker) = broker.upgrade() {
                broker.expire(&pair, generation).await;
            }
        })
    }

    /// Ring timeout fired. A no-op unless the same invite is still ringing.
    async fn expire(&self, pair: &CallPair, generation: u64) {
        let session = {
            let mut calls = self.calls.lock().await;
            let current = calls
                .get(pair)
                .is_some_and(|r| r.generation == generation && r.session.phase() == CallPhase::Ringing);
            if !current {
                return;
            }
            let Some(mut record) = calls.remove(pair) else {
                return;
            };
            record.timer = None;
            if let Err(e) = record.session.transition(&CallEventType::TimedOut) {
                warn!(pair = %pair, error = %e, "Timeout on call that left ringing");
                return;
            }
            record.session
        };

        info!(call_id = %session.id, pair = %pair, "Call timed out");

        let outbox: Outbox = vec![
            (
                session.caller.clone(),
                ServerEvent::CallFailed {
                    from: Some(session.callee.clone()),
                    message: TIMED_OUT_MESSAGE.to_string(),
                },
            ),
            (
                session.callee.clone(),
                ServerEvent::CallFailed {
                    from: Some(session.caller.clone()),
                    message: TIMED_OUT_MESSAGE.to_string(),
                },
            ),
        ];
        self.flush(outbox).await;
    }

    /// `callee` answers the invite from `caller`.
    ///
    /// Fails with `Busy` when either party already talks to someone else; the
    /// invite is dropped and both parties get `call-failed`. On success every
    /// other invite still ringing for either party is dropped the same way.
    pub async fn accept(
        &self,
        callee: &str,
        caller: &str,
        signal: Option<Value>,
    ) -> Result<CallSession, CallError> {
        let pair = CallPair::new(caller, callee);

        let (session, dropped) = {
            let mut calls = self.calls.lock().await;
            if !calls.get(&pair).is_some_and(|r| r.session.callee == callee) {
                return Err(CallError::NoSuchCall(caller.to_string()));
            }

            let busy = [callee, caller]
                .into_iter()
                .find(|party| Self::in_accepted_call(&calls, party, &pair));
            if let Some(busy) = busy {
                let busy = busy.to_string();
                let dropped: Vec<CallSession> = calls
                    .remove(&pair)
                    .into_iter()
                    .filter_map(Self::fail_busy)
                    .collect();
                drop(calls);
                info!(caller = %caller, callee = %callee, busy = %busy, "Accept refused, party busy");
                self.flush(Self::busy_notices(&dropped)).await;
                return Err(CallError::Busy(busy));
            }

            let Some(record) = calls.get_mut(&pair) else {
                return Err(CallError::NoSuchCall(caller.to_string()));
            };
            record.session.transition(&CallEventType::Accepted)?;
            record.cancel_timer();
            let session = record.session.clone();

            let superseded: Vec<CallPair> = calls
                .iter()
                .filter(|(other, r)| {
                    **other != pair
                        && r.session.phase() == CallPhase::Ringing
                        && (other.contains(caller) || other.contains(callee))
                })
                .map(|(other, _)| other.clone())
                .collect();
            let dropped: Vec<CallSession> = superseded
                .iter()
                .filter_map(|other| calls.remove(other))
                .filter_map(Self::fail_busy)
                .collect();

            (session, dropped)
        };

        info!(call_id = %session.id, caller = %caller, callee = %callee, "Call accepted");

        self.deliver(
            caller,
            ServerEvent::CallAccepted {
                from: callee.to_string(),
                signal,
            },
        )
        .await;

        if !dropped.is_empty() {
            debug!(call_id = %session.id, dropped = dropped.len(), "Dropped invites of now-busy parties");
        }
        self.flush(Self::busy_notices(&dropped)).await;

        Ok(session)
    }

    /// Whether `identity` has an accepted call on a pair other than `except`.
    fn in_accepted_call(calls: &HashMap<CallPair, CallRecord>, identity: &str, except: &CallPair) -> bool {
        calls.iter().any(|(pair, r)| {
            pair != except && pair.contains(identity) && r.session.phase() == CallPhase::Accepted
        })
    }

    /// Fail a removed ringing record because one side became busy.
    fn fail_busy(mut record: CallRecord) -> Option<CallSession> {
        record.cancel_timer();
        match record.session.transition(&CallEventType::Rejected {
            message: BUSY_MESSAGE.to_string(),
        }) {
            Ok(_) => Some(record.session),
            Err(e) => {
                warn!(call_id = %record.session.id, error = %e, "Dropping invite that left ringing");
                None
            }
        }
    }

    fn busy_notices(dropped: &[CallSession]) -> Outbox {
        dropped
            .iter()
            .flat_map(|session| {
                [
                    (session.caller.clone(), session.callee.clone()),
                    (session.callee.clone(), session.caller.clone()),
                ]
            })
            .map(|(to, from)| {
                (
                    to,
                    ServerEvent::CallFailed {
                        from: Some(from),
                        message: BUSY_MESSAGE.to_string(),
                    },
                )
            })
            .collect()
    }

    /// `from` declines or aborts the call with `to`.
    ///
    /// The failure is relayed to `to` even when no call is tracked.
    pub async fn reject(
        &self,
        from: &str,
        to: &str,
        message: Option<String>,
    ) -> Result<Option<CallSession>, CallError> {
        let message = message.unwrap_or_else(|| REJECTED_MESSAGE.to_string());
        let pair = CallPair::new(from, to);

        let failed = {
            let mut calls = self.calls.lock().await;
            let ringing = calls
                .get(&pair)
                .is_some_and(|r| r.session.phase() == CallPhase::Ringing);
            match ringing.then(|| calls.remove(&pair)).flatten() {
                Some(mut record) => {
                    record.cancel_timer();
                    record.session.transition(&CallEventType::Rejected {
                        message: message.clone(),
                    })?;
                    Some(record.session)
                }
                None => None,
            }
        };

        if let Some(session) = &failed {
            info!(call_id = %session.id, from = %from, to = %to, "Call rejected");
        }

        self.deliver(
            to,
            ServerEvent::CallFailed {
                from: Some(from.to_string()),
                message,
            },
        )
        .await;

        Ok(failed)
    }

    /// `from` hangs up on `to`. Relayed even when no call is tracked.
    pub async fn end(&self, from: &str, to: &str) -> Result<Option<ClosedCall>, CallError> {
        let pair = CallPair::new(from, to);

        let closed = {
            let mut calls = self.calls.lock().await;
            match calls.remove(&pair) {
                Some(mut record) => {
                    record.cancel_timer();
                    let previous = record.session.phase();
                    record.session.transition(&CallEventType::Ended {
                        reason: EndReason::Hangup,
                    })?;
                    Some(ClosedCall {
                        previous,
                        session: record.session,
                    })
                }
                None => None,
            }
        };

        if let Some(closed) = &closed {
            info!(call_id = %closed.session.id, from = %from, to = %to, "Call ended");
        }

        self.deliver(
            to,
            ServerEvent::CallEnded {
                from: Some(from.to_string()),
            },
        )
        .await;

        Ok(closed)
    }

    /// Forward an ICE candidate verbatim.
    pub async fn relay_ice_candidate(
        &self,
        from: &str,
        to: &str,
        candidate: Value,
    ) -> Result<(), CallError> {
        let delivered = self
            .deliver(
                to,
                ServerEvent::IceCandidate {
                    from: from.to_string(),
                    candidate,
                },
            )
            .await;

        if delivered {
            Ok(())
        } else {
            Err(CallError::Unreachable(to.to_string()))
        }
    }

    /// End every call `identity` takes part in and tell the other parties.
    pub async fn handle_disconnect(&self, identity: &str) -> Vec<ClosedCall> {
        let closed: Vec<ClosedCall> = {
            let mut calls = self.calls.lock().await;
            let pairs: Vec<CallPair> = calls
                .keys()
                .filter(|pair| pair.contains(identity))
                .cloned()
                .collect();

            pairs
                .into_iter()
                .filter_map(|pair| calls.remove(&pair))
                .filter_map(|mut record| {
                    record.cancel_timer();
                    let previous = record.session.phase();
                    match record.session.transition(&CallEventType::Ended {
                        reason: EndReason::Disconnected,
                    }) {
                        Ok(_) => Some(ClosedCall {
                            previous,
                            session: record.session,
                        }),
                        Err(e) => {
                            warn!(call_id = %record.session.id, error = %e, "Dropping call in terminal state");
                            None
                        }
                    }
                })
                .collect()
        };

        let outbox: Outbox = closed
            .iter()
            .filter_map(|c| {
                c.session.peer_of(identity).map(|peer| {
                    (
                        peer.to_string(),
                        ServerEvent::CallEnded {
                            from: Some(identity.to_string()),
                        },
                    )
                })
            })
            .collect();

        if !closed.is_empty() {
            info!(identity = %identity, calls = closed.len(), "Ended calls of disconnected user");
        }
        self.flush(outbox).await;

        closed
    }

    /// Abort every timer and forget every call.
    pub async fn shutdown(&self) {
        let mut calls = self.calls.lock().await;
        for record in calls.values_mut() {
            record.cancel_timer();
        }
        let drained = calls.len();
        calls.clear();
        info!(calls = drained, "Call broker drained");
    }

    /// Phase of the call between two identities, if any.
    pub async fn phase(&self, a: &str, b: &str) -> Option<CallPhase> {
        self.calls
            .lock()
            .await
            .get(&CallPair::new(a, b))
            .map(|r| r.session.phase())
    }

    /// Snapshot of the call between two identities.
    pub async fn session(&self, a: &str, b: &str) -> Option<CallSession> {
        self.calls
            .lock()
            .await
            .get(&CallPair::new(a, b))
            .map(|r| r.session.clone())
    }

    /// Number of tracked calls.
    pub async fn active_calls(&self) -> usize {
        self.calls.lock().await.len()
    }

    /// Number of armed ring timers.
    pub async fn pending_timers(&self) -> usize {
        self.calls
            .lock()
            .await
            .values()
            .filter(|r| r.timer.as_ref().is_some_and(|t| !t.is_finished()))
            .count()
    }

    async fn flush(&self, outbox: Outbox) {
        for (to, event) in outbox {
            self.deliver(&to, event).await;
        }
    }

    async fn deliver(&self, to: &str, event: ServerEvent) -> bool {
        match self.presence.lookup(to).await {
            Some(conn_id) => self.hub.send_to(conn_id, event).await,
            None => {
                debug!(to = %to, "Dropping signaling event for offline user");
                false
            }
        }
    }
}
