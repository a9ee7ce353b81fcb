//! Presence
//!
//! Who is online, and the joined/left announcements around it.

pub mod registry;

pub use registry::{PresenceRegistry, Registration};

use tracing::{info, warn};

use crate::ws::{ConnectionHub, ServerEvent, Session};

/// Maximum length for a username.
pub const MAX_IDENTITY_LEN: usize = 64;

/// Errors raised while binding an identity.
#[derive(Debug, thiserror::Error)]
pub enum PresenceError {
    #[error("Username cannot be empty")]
    Empty,
    #[error("Username too long (max 64 characters)")]
    TooLong,
    #[error("Username contains invalid characters")]
    InvalidCharacters,
    #[error("Connection already registered as {0}")]
    AlreadyIdentified(String),
}

impl PresenceError {
    /// Stable machine-readable code for the wire.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Empty | Self::TooLong | Self::InvalidCharacters => "invalid_identity",
            Self::AlreadyIdentified(_) => "identity_locked",
        }
    }
}

/// Validate and normalize a username.
pub fn validate_identity(raw: &str) -> Result<String, PresenceError> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(PresenceError::Empty);
    }
    if name.chars().count() > MAX_IDENTITY_LEN {
        return Err(PresenceError::TooLong);
    }
    if name.chars().any(char::is_control) {
        return Err(PresenceError::InvalidCharacters);
    }
    Ok(name.to_string())
}

/// Bind the session to `raw_identity`, confirm it, and announce it.
pub async fn handle_set_identity(
    registry: &PresenceRegistry,
    hub: &ConnectionHub,
    session: &mut Session,
    raw_identity: &str,
) -> Result<Registration, PresenceError> {
    let identity = validate_identity(raw_identity)?;

    if let Some(current) = session.identity() {
        if current != identity {
            return Err(PresenceError::AlreadyIdentified(current.to_string()));
        }
    }

    let registration = registry.register(&identity, session.conn_id).await;
    session.set_identity(identity.clone());

    if let Registration::Replaced { previous } = registration {
        // The stale socket is left open; it simply stops receiving for this name.
        warn!(
            identity = %identity,
            previous_conn = %previous,
            conn_id = %session.conn_id,
            "Identity taken over by a new connection"
        );
    }

    info!(identity = %identity, conn_id = %session.conn_id, "Identity registered");

    session
        .send(ServerEvent::IdentityConfirmed {
            username: identity.clone(),
        })
        .await;

    if registration != Registration::Unchanged {
        hub.broadcast_except(
            session.conn_id,
            ServerEvent::PeerJoined {
                message: format!("{identity} has joined the chat"),
                username: identity,
            },
        )
        .await;
    }

    Ok(registration)
}

/// Release the session's identity and announce the departure.
///
/// Returns the released identity, or `None` when the connection never
/// registered or had already been superseded.
pub async fn handle_disconnect(
    registry: &PresenceRegistry,
    hub: &ConnectionHub,
    session: &Session,
) -> Option<String> {
    let identity = registry.remove(session.conn_id).await?;

    info!(identity = %identity, conn_id = %session.conn_id, "Identity went offline");

    hub.broadcast_except(
        session.conn_id,
        ServerEvent::PeerLeft {
            message: format!("{identity} has left the chat"),
            username: identity.clone(),
        },
    )
    .await;

    Some(identity)
}
