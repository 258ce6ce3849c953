use std::sync::Arc;

use huddle_chat::ChatServices;

use crate::auth::TokenVerifier;
use crate::bus::GroupBroadcastBus;
use crate::config::GatewayConfig;
use crate::counters::CounterStore;
use crate::presence::PresenceTracker;
use crate::rate_limit::RateLimiter;
use crate::registry::ConnectionRegistry;

/// Everything a WebSocket session needs, shared across all sockets.
pub struct Gateway {
    pub config: GatewayConfig,
    pub bus: GroupBroadcastBus,
    pub registry: ConnectionRegistry,
    pub limiter: RateLimiter,
    pub presence: PresenceTracker,
    pub verifier: Arc<dyn TokenVerifier>,
    pub services: ChatServices,
}

pub type SharedGateway = Arc<Gateway>;

impl Gateway {
    /// `bus` must be the publisher the `services` were built with, so that
    /// service events reach the sessions joined here.
    pub fn new(
        config: GatewayConfig,
        bus: GroupBroadcastBus,
        counters: Arc<dyn CounterStore>,
        verifier: Arc<dyn TokenVerifier>,
        services: ChatServices,
    ) -> SharedGateway {
        let registry = ConnectionRegistry::new(
            counters.clone(),
            config.max_connections_per_user,
            config.connection_ttl,
        );
        let limiter = RateLimiter::new(counters, config.rate_limits);
        Arc::new(Self {
            config,
            bus,
            registry,
            limiter,
            presence: PresenceTracker::new(),
            verifier,
            services,
        })
    }
}
