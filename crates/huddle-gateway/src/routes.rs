use axum::{
    Router,
    extract::{Path, Query, State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use crate::connection::{reject, run_socket};
use crate::context::SharedGateway;
use crate::notifications::NotificationSession;
use crate::presence::PresenceSession;
use crate::session::ThreadSession;

/// Browsers can't set headers on a WebSocket handshake, so the bearer token
/// rides in the query string.
#[derive(Debug, Deserialize)]
pub struct WsAuthQuery {
    pub token: Option<String>,
}

pub fn router(gateway: SharedGateway) -> Router {
    Router::new()
        .route("/ws/threads/{thread_id}", get(thread_upgrade))
        .route("/ws/presence", get(presence_upgrade))
        .route("/ws/notifications/{user_id}", get(notifications_upgrade))
        .with_state(gateway)
}

async fn thread_upgrade(
    State(gateway): State<SharedGateway>,
    Path(thread_id): Path<Uuid>,
    Query(query): Query<WsAuthQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let heartbeat = gateway.config.heartbeat_interval;
        match ThreadSession::connect(gateway, query.token.as_deref(), thread_id).await {
            Ok((session, outbound)) => run_socket(socket, session, outbound, heartbeat).await,
            Err(rejection) => {
                debug!("Thread socket for {} refused: {}", thread_id, rejection);
                reject(socket, rejection).await;
            }
        }
    })
}

async fn presence_upgrade(
    State(gateway): State<SharedGateway>,
    Query(query): Query<WsAuthQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let heartbeat = gateway.config.heartbeat_interval;
        match PresenceSession::connect(gateway, query.token.as_deref()).await {
            Ok((session, outbound)) => run_socket(socket, session, outbound, heartbeat).await,
            Err(rejection) => reject(socket, rejection).await,
        }
    })
}

async fn notifications_upgrade(
    State(gateway): State<SharedGateway>,
    Path(user_id): Path<Uuid>,
    Query(query): Query<WsAuthQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let heartbeat = gateway.config.heartbeat_interval;
        match NotificationSession::connect(gateway, query.token.as_deref(), user_id).await {
            Ok((session, outbound)) => run_socket(socket, session, outbound, heartbeat).await,
            Err(rejection) => reject(socket, rejection).await,
        }
    })
}
