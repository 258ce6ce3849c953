//! Live transport: WebSocket sessions for threads, presence and personal
//! notification channels, fanned out through an in-process group bus.

pub mod auth;
pub mod bus;
pub mod config;
pub mod connection;
pub mod context;
pub mod counters;
pub mod notifications;
pub mod presence;
pub mod rate_limit;
pub mod registry;
pub mod routes;
pub mod session;

pub use auth::{JwtVerifier, TokenVerifier};
pub use bus::GroupBroadcastBus;
pub use config::GatewayConfig;
pub use context::{Gateway, SharedGateway};
pub use counters::{CounterStore, MemoryCounters};
pub use routes::router;
