//! Runtime configuration for clients and the reference relay.
//!
//! Both configs carry sensible defaults and can be read from the environment
//! (binaries load `.env` through dotenvy before calling `from_env`).

use std::time::Duration;

use crate::sync::{CollaboratorId, DocumentId};

/// Fixed acknowledgment timeout for `connect()`
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Heartbeat period while connected
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Delay before the single reconnect attempt after an unexpected drop
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// A collaborator counts as active if seen within this window
pub const DEFAULT_ACTIVE_WINDOW: Duration = Duration::from_secs(30);

/// Client-side configuration
#[derive(Debug, Clone)]
pub struct CollabConfig {
    /// WebSocket URL of the relay endpoint
    pub relay_url: String,
    /// Stable collaborator id for this client
    pub user_id: CollaboratorId,
    /// Display name presented in the handshake
    pub user_name: String,
    /// Document to join
    pub document_id: DocumentId,
    /// How long to wait for `document:joined` after opening the link
    pub connect_timeout: Duration,
    /// Interval between `ping` frames
    pub heartbeat_interval: Duration,
    /// Delay before the reconnect attempt
    pub reconnect_delay: Duration,
    /// Presence activity window
    pub active_window: Duration,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:5000/ws".to_string(),
            user_id: uuid::Uuid::new_v4().to_string(),
            user_name: "Anonymous".to_string(),
            document_id: "default".to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            active_window: DEFAULT_ACTIVE_WINDOW,
        }
    }
}

impl CollabConfig {
    pub fn new(
        user_id: impl Into<String>,
        user_name: impl Into<String>,
        document_id: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            user_name: user_name.into(),
            document_id: document_id.into(),
            ..Default::default()
        }
    }

    /// Create from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            relay_url: std::env::var("COLLAB_RELAY_URL").unwrap_or(defaults.relay_url),
            user_id: std::env::var("COLLAB_USER_ID").unwrap_or(defaults.user_id),
            user_name: std::env::var("COLLAB_USER_NAME").unwrap_or(defaults.user_name),
            document_id: std::env::var("COLLAB_DOCUMENT_ID").unwrap_or(defaults.document_id),
            connect_timeout: env_secs("COLLAB_CONNECT_TIMEOUT_SECS")
                .unwrap_or(defaults.connect_timeout),
            heartbeat_interval: env_secs("COLLAB_HEARTBEAT_SECS")
                .unwrap_or(defaults.heartbeat_interval),
            reconnect_delay: env_secs("COLLAB_RECONNECT_DELAY_SECS")
                .unwrap_or(defaults.reconnect_delay),
            active_window: env_secs("COLLAB_ACTIVE_WINDOW_SECS")
                .unwrap_or(defaults.active_window),
        }
    }

    pub fn with_relay_url(mut self, url: impl Into<String>) -> Self {
        self.relay_url = url.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }
}

/// Configuration for the reference relay
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// TCP port to listen on
    pub port: u16,
    /// Number of sequenced changes kept per document for transforming late edits
    pub history_limit: usize,
    /// Maximum sessions per document
    pub max_sessions_per_document: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 5000,
            history_limit: 1024,
            max_sessions_per_document: 50,
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            history_limit: std::env::var("COLLAB_HISTORY_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.history_limit),
            max_sessions_per_document: defaults.max_sessions_per_document,
        }
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }
}

fn env_secs(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collab_config_defaults() {
        let config = CollabConfig::new("u-1", "Alice", "doc-1");
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.reconnect_delay, Duration::from_secs(5));
        assert_eq!(config.active_window, Duration::from_secs(30));
        assert_eq!(config.user_name, "Alice");
    }

    #[test]
    fn test_relay_config_builder() {
        let config = RelayConfig::default().with_history_limit(8);
        assert_eq!(config.history_limit, 8);
        assert_eq!(config.port, 5000);
    }
}
