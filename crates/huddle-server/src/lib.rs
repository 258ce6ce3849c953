//! Wires storage, services, the WebSocket gateway and the REST API into one
//! axum application.

pub mod config;

use std::sync::Arc;
use std::time::Duration;

use axum::{Json, Router, routing::get};
use huddle_api::AppStateInner;
use huddle_chat::ChatServices;
use huddle_db::Database;
use huddle_gateway::{
    CounterStore, Gateway, GroupBroadcastBus, JwtVerifier, MemoryCounters, SharedGateway,
    TokenVerifier,
};
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::config::{CounterBackend, ServerConfig};

const COUNTER_PURGE_INTERVAL: Duration = Duration::from_secs(60);

pub struct Huddle {
    pub router: Router,
    pub gateway: SharedGateway,
}

/// Builds the application and starts the counter purge task. Must be called
/// inside a tokio runtime.
pub fn build(config: &ServerConfig, db: Arc<Database>) -> Huddle {
    let verifier: Arc<dyn TokenVerifier> = Arc::new(JwtVerifier::new(&config.jwt_secret));
    build_with_verifier(config, db, verifier)
}

pub fn build_with_verifier(
    config: &ServerConfig,
    db: Arc<Database>,
    verifier: Arc<dyn TokenVerifier>,
) -> Huddle {
    let bus = GroupBroadcastBus::new();
    let services =
        ChatServices::new(db.clone(), Arc::new(bus.clone()), config.default_posting_mode);
    let counters = counter_store(config.counter_backend, db);

    let gateway = Gateway::new(
        config.gateway.clone(),
        bus,
        counters,
        verifier.clone(),
        services.clone(),
    );
    let api_state = Arc::new(AppStateInner {
        services,
        verifier,
        upload_dir: config.upload_dir.clone(),
        max_upload_bytes: config.max_upload_bytes,
        max_message_length: config.gateway.max_message_length,
    });

    let router = Router::new()
        .route("/health", get(health))
        .merge(huddle_gateway::router(gateway.clone()))
        .merge(huddle_api::router(api_state))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    Huddle { router, gateway }
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

fn counter_store(backend: CounterBackend, db: Arc<Database>) -> Arc<dyn CounterStore> {
    match backend {
        CounterBackend::Sqlite => {
            let purge_db = db.clone();
            spawn_purge(move || purge_db.purge_expired_counters());
            db as Arc<dyn CounterStore>
        }
        CounterBackend::Memory => {
            warn!("Using in-memory counters; limits are per process");
            let counters = Arc::new(MemoryCounters::new());
            let purge = counters.clone();
            spawn_purge(move || Ok(purge.purge_expired()));
            counters as Arc<dyn CounterStore>
        }
    }
}

fn spawn_purge<F>(purge: F)
where
    F: Fn() -> anyhow::Result<usize> + Send + Sync + 'static,
{
    let purge = Arc::new(purge);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(COUNTER_PURGE_INTERVAL);
        loop {
            interval.tick().await;
            let purge = purge.clone();
            match tokio::task::spawn_blocking(move || purge()).await {
                Ok(Ok(0)) => {}
                Ok(Ok(n)) => debug!("Purged {} expired counters", n),
                Ok(Err(e)) => warn!("Counter purge failed: {}", e),
                Err(e) => warn!("Counter purge task failed: {}", e),
            }
        }
    });
}
