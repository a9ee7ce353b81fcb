//! Huddle Server
//!
//! Presence, two-party call signaling and an audio SFU control plane behind
//! one WebSocket, plus a live chat relay.

pub mod api;
pub mod chat;
pub mod config;
pub mod presence;
pub mod voice;
pub mod ws;
