//! Two-Party Call State
//!
//! Phase machine for one call between a caller and a callee.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::RoomId;

/// Transitions a call can go through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallEventType {
    Accepted,
    Rejected { message: String },
    TimedOut,
    Ended { reason: EndReason },
}

/// Reason for call ending
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Hangup,       // Either party hung up an accepted call
    Cancelled,    // Hung up while still ringing
    Disconnected, // One side's connection dropped
}

/// Reason for call failing before it was accepted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FailReason {
    Rejected { message: String },
    TimedOut,
}

/// Current state of a call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CallState {
    Ringing {
        started_at: DateTime<Utc>,
    },
    Accepted {
        started_at: DateTime<Utc>,
        accepted_at: DateTime<Utc>,
    },
    Ended {
        reason: EndReason,
        duration_secs: Option<u32>,
        ended_at: DateTime<Utc>,
    },
    Failed {
        reason: FailReason,
        failed_at: DateTime<Utc>,
    },
}

/// Phase without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallPhase {
    Ringing,
    Accepted,
    Ended,
    Failed,
}

impl CallState {
    /// Create initial ringing state
    pub fn new_ringing() -> Self {
        Self::Ringing {
            started_at: Utc::now(),
        }
    }

    /// Apply an event to derive new state
    pub fn apply(self, event: &CallEventType) -> Result<Self, CallStateError> {
        let now = Utc::now();
        match (self, event) {
            (Self::Ringing { started_at }, CallEventType::Accepted) => Ok(Self::Accepted {
                started_at,
                accepted_at: now,
            }),

            (Self::Ringing { .. }, CallEventType::Rejected { message }) => Ok(Self::Failed {
                reason: FailReason::Rejected {
                    message: message.clone(),
                },
                failed_at: now,
            }),

            (Self::Ringing { .. }, CallEventType::TimedOut) => Ok(Self::Failed {
                reason: FailReason::TimedOut,
                failed_at: now,
            }),

            // Hanging up before anyone answered never has a duration
            (Self::Ringing { .. }, CallEventType::Ended { reason }) => {
                let reason = if *reason == EndReason::Hangup {
                    EndReason::Cancelled
                } else {
                    *reason
                };
                Ok(Self::Ended {
                    reason,
                    duration_secs: None,
                    ended_at: now,
                })
            }

            (Self::Accepted { accepted_at, .. }, CallEventType::Ended { reason }) => {
                let duration = now
                    .signed_duration_since(accepted_at)
                    .num_seconds()
                    .clamp(0, i64::from(u32::MAX)) as u32;
                Ok(Self::Ended {
                    reason: *reason,
                    duration_secs: Some(duration),
                    ended_at: now,
                })
            }

            // Terminal states
            (Self::Ended { .. } | Self::Failed { .. }, _) => Err(CallStateError::CallAlreadyEnded),

            (state, event) => Err(CallStateError::InvalidTransition {
                state: format!("{:?}", state.phase()),
                event: format!("{event:?}"),
            }),
        }
    }

    /// Phase of this state.
    pub const fn phase(&self) -> CallPhase {
        match self {
            Self::Ringing { .. } => CallPhase::Ringing,
            Self::Accepted { .. } => CallPhase::Accepted,
            Self::Ended { .. } => CallPhase::Ended,
            Self::Failed { .. } => CallPhase::Failed,
        }
    }
}

/// Errors for call state transitions
#[derive(Debug, thiserror::Error)]
pub enum CallStateError {
    #[error("Call has already ended")]
    CallAlreadyEnded,
    #[error("Invalid state transition: {state} + {event}")]
    InvalidTransition { state: String, event: String },
}

/// Unordered pair of identities, the key of a call.
///
/// `CallPair::new("b", "a") == CallPair::new("a", "b")`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallPair(String, String);

impl CallPair {
    /// Canonical key for two identities.
    pub fn new(a: &str, b: &str) -> Self {
        if a <= b {
            Self(a.to_string(), b.to_string())
        } else {
            Self(b.to_string(), a.to_string())
        }
    }

    /// Whether `identity` is one of the two parties.
    pub fn contains(&self, identity: &str) -> bool {
        self.0 == identity || self.1 == identity
    }
}

impl std::fmt::Display for CallPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.0, self.1)
    }
}

/// One call between two identities.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSession {
    pub id: Uuid,
    pub caller: String,
    pub callee: String,
    pub room_id: RoomId,
    pub state: CallState,
}

impl CallSession {
    /// Start ringing a new call.
    pub fn new(caller: impl Into<String>, callee: impl Into<String>, room_id: RoomId) -> Self {
        Self {
            id: Uuid::now_v7(),
            caller: caller.into(),
            callee: callee.into(),
            room_id,
            state: CallState::new_ringing(),
        }
    }

    /// Current phase.
    pub const fn phase(&self) -> CallPhase {
        self.state.phase()
    }

    /// The other party relative to `identity`.
    pub fn peer_of(&self, identity: &str) -> Option<&str> {
        if self.caller == identity {
            Some(&self.callee)
        } else if self.callee == identity {
            Some(&self.caller)
        } else {
            None
        }
    }

    /// Apply an event in place. On error the state is left untouched.
    pub fn transition(&mut self, event: &CallEventType) -> Result<CallPhase, CallStateError> {
        let next = self.state.clone().apply(event)?;
        self.state = next;
        Ok(self.state.phase())
    }
}
