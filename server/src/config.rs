//! Server Configuration
//!
//! Loads configuration from environment variables.

use anyhow::{Context, Result};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server bind address (e.g., "0.0.0.0:3000")
    pub bind_address: String,

    /// Allowed CORS origin (any origin when unset)
    pub cors_origin: Option<String>,

    /// Seconds a call may ring before both parties are told it timed out (default: 30)
    pub call_timeout_secs: u64,

    /// Seconds between server keepalive pings (default: 25)
    pub ws_ping_interval_secs: u64,

    /// Seconds without any inbound frame before a socket is dropped (default: 60)
    pub ws_idle_timeout_secs: u64,

    /// Outbound event buffer per connection (default: 100)
    pub ws_event_buffer: usize,

    /// Maximum connections joined to one media room (default: 25)
    pub max_room_participants: usize,

    /// IP address advertised in ICE candidates
    pub rtc_announced_ip: String,

    /// Lowest UDP port handed out to transports
    pub rtc_min_port: u16,

    /// Highest UDP port handed out to transports
    pub rtc_max_port: u16,
}

fn parse_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} has an invalid value: {raw:?}")),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let config = Self {
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".into()),
            cors_origin: env::var("CORS_ORIGIN").ok().filter(|o| !o.trim().is_empty()),
            call_timeout_secs: parse_or("CALL_TIMEOUT_SECS", 30)?,
            ws_ping_interval_secs: parse_or("WS_PING_INTERVAL_SECS", 25)?,
            ws_idle_timeout_secs: parse_or("WS_IDLE_TIMEOUT_SECS", 60)?,
            ws_event_buffer: parse_or("WS_EVENT_BUFFER", 100)?,
            max_room_participants: parse_or("MAX_ROOM_PARTICIPANTS", 25)?,
            rtc_announced_ip: env::var("RTC_ANNOUNCED_IP").unwrap_or_else(|_| "127.0.0.1".into()),
            rtc_min_port: parse_or("RTC_MIN_PORT", 40000)?,
            rtc_max_port: parse_or("RTC_MAX_PORT", 49999)?,
        };

        anyhow::ensure!(
            config.rtc_min_port <= config.rtc_max_port,
            "RTC_MIN_PORT ({}) must not exceed RTC_MAX_PORT ({})",
            config.rtc_min_port,
            config.rtc_max_port
        );
        anyhow::ensure!(config.ws_event_buffer > 0, "WS_EVENT_BUFFER must be positive");

        Ok(config)
    }

    /// Call setup window.
    #[must_use]
    pub const fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    /// Keepalive ping interval.
    #[must_use]
    pub const fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ws_ping_interval_secs)
    }

    /// Idle window after which a silent socket is closed.
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.ws_idle_timeout_secs)
    }

    /// Create a default configuration for testing.
    #[must_use]
    pub fn default_for_test() -> Self {
        Self {
            bind_address: "127.0.0.1:0".into(),
            cors_origin: None,
            call_timeout_secs: 30,
            ws_ping_interval_secs: 25,
            ws_idle_timeout_secs: 60,
            ws_event_buffer: 100,
            max_room_participants: 25,
            rtc_announced_ip: "127.0.0.1".into(),
            rtc_min_port: 40000,
            rtc_max_port: 40099,
        }
    }
}
