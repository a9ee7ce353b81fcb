//! Voice Service (SFU)
//!
//! Two-party call signaling and the selective forwarding unit behind it.
//!
//! Everything here is driven over the WebSocket (see ws/mod.rs):
//! - Call broker for invite/accept/reject/end between online identities
//! - SFU session manager for rooms, transports, producers and consumers
//! - Media engine seam the SFU allocates through

pub mod broker;
pub mod call;
pub mod call_handlers;
pub mod engine;
pub mod error;
pub mod router;
pub mod rtp;
pub mod sfu;
pub mod ws_handler;

use uuid::Uuid;

/// Room identifier chosen by the caller (or derived from the call pair).
pub type RoomId = String;
/// Transport handle.
pub type TransportId = Uuid;
/// Producer handle.
pub type ProducerId = Uuid;
/// Consumer handle.
pub type ConsumerId = Uuid;

// Re-exports
pub use broker::{CallBroker, CallError};
pub use engine::{InMemoryMediaEngine, MediaEngine, TransportOptions, WebRtcMediaEngine};
pub use error::VoiceError;
pub use router::MediaRouter;
pub use rtp::{MediaKind, RtpCapabilities, RtpParameters};
pub use sfu::{Room, SfuServer};
