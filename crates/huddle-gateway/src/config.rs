use std::time::Duration;

use huddle_types::events::RateLimits;

/// Limits applied to every WebSocket session.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Concurrent sockets per user, across all channel kinds.
    pub max_connections_per_user: usize,
    /// Frames larger than this close the socket with 1009.
    pub max_payload_bytes: usize,
    /// Message content ceiling, in characters, checked before sanitizing.
    pub max_message_length: usize,
    pub rate_limits: RateLimits,
    /// Safety expiry of the per-user connection counter.
    pub connection_ttl: Duration,
    /// Server ping cadence; two missed pongs drop the socket.
    pub heartbeat_interval: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_connections_per_user: 10,
            max_payload_bytes: 100 * 1024,
            max_message_length: 10_000,
            rate_limits: RateLimits::default(),
            connection_ttl: Duration::from_secs(3600),
            heartbeat_interval: Duration::from_secs(15),
        }
    }
}
