//! Runtime configuration for sessions and the relay server.

use std::time::Duration;

/// Document session timing.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Quiet period after the last content change before it is written.
    pub save_quiet_period: Duration,
    /// Delay before the one-shot awareness republish.
    pub awareness_settle_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            save_quiet_period: Duration::from_millis(2000),
            awareness_settle_delay: Duration::from_millis(500),
        }
    }
}

impl SessionConfig {
    /// Short timings for tests.
    pub fn for_testing() -> Self {
        Self {
            save_quiet_period: Duration::from_millis(50),
            awareness_settle_delay: Duration::from_millis(10),
        }
    }
}

/// Relay server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum connections per room
    pub max_peers_per_room: usize,
    /// Interval between WebSocket pings on each connection
    pub heartbeat_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

impl RelayConfig {
    /// Ephemeral port on loopback.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            ..Self::default()
        }
    }
}
