use std::env;
use std::time::Duration;

use crate::channel::ReconnectPolicy;

/// Spyglass viewer configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Orchestrator address (defaults to "127.0.0.1:8080")
    pub server: String,
    /// Use TLS (wss/https) when talking to the orchestrator
    pub secure: bool,
    /// First reconnect delay in milliseconds
    pub reconnect_base_ms: u64,
    /// Reconnect delay ceiling in milliseconds
    pub reconnect_max_ms: u64,
    /// Event-channel reconnect attempt ceiling
    pub event_max_attempts: u32,
    /// Action tag used when an event carries none
    pub default_action: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let server =
            env::var("SPYGLASS_SERVER").unwrap_or_else(|_| "127.0.0.1:8080".to_string());
        // Normalize localhost to IPv4 to avoid IPv6 (::1) preference on macOS
        let server = if server.starts_with("localhost:") {
            server.replacen("localhost", "127.0.0.1", 1)
        } else {
            server
        };
        let secure = env::var("SPYGLASS_SECURE")
            .map(|v| v != "0" && !v.is_empty())
            .unwrap_or(false);
        Self {
            server,
            secure,
            reconnect_base_ms: env_u64("SPYGLASS_RECONNECT_BASE_MS", 1_000),
            reconnect_max_ms: env_u64("SPYGLASS_RECONNECT_MAX_MS", 30_000),
            event_max_attempts: env_u64("SPYGLASS_EVENT_MAX_ATTEMPTS", 5) as u32,
            default_action: "observing".to_string(),
        }
    }

    /// WebSocket URL of the JSON event channel
    pub fn event_url(&self) -> String {
        format!("{}://{}/ws/events", self.ws_scheme(), self.server)
    }

    /// WebSocket URL of the binary screencast channel
    pub fn frame_url(&self) -> String {
        format!("{}://{}/ws/frames", self.ws_scheme(), self.server)
    }

    /// Base URL of the REST read endpoints
    pub fn api_url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{scheme}://{}", self.server)
    }

    fn ws_scheme(&self) -> &'static str {
        if self.secure { "wss" } else { "ws" }
    }

    /// Backoff schedule for the event channel: capped attempts, terminal
    /// disconnect on exhaustion.
    pub fn event_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(self.reconnect_base_ms),
            max_delay: Duration::from_millis(self.reconnect_max_ms),
            max_attempts: Some(self.event_max_attempts),
        }
    }

    /// Backoff schedule for the screencast channel: retries forever, the
    /// screencast is best-effort.
    pub fn frame_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(self.reconnect_base_ms),
            max_delay: Duration::from_millis(self.reconnect_max_ms),
            max_attempts: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: "127.0.0.1:8080".to_string(),
            secure: false,
            reconnect_base_ms: 1_000,
            reconnect_max_ms: 30_000,
            event_max_attempts: 5,
            default_action: "observing".to_string(),
        }
    }
}

fn env_u64(var: &str, default: u64) -> u64 {
    env::var(var)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
