use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use huddle_types::Identity;
use huddle_types::api::{NotificationCountResponse, ReadAllResponse, UnreadCountResponse};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::{ApiResult, blocking};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct NotificationQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    50
}

/// Unread messages across all of the caller's threads.
pub async fn unread_count(
    State(state): State<AppState>,
    Extension(me): Extension<Identity>,
) -> ApiResult<impl IntoResponse> {
    let messaging = state.services.messaging.clone();
    let total_unread = blocking(move || messaging.total_unread(me.user_id)).await?;
    Ok(Json(UnreadCountResponse { total_unread }))
}

pub async fn list_notifications(
    State(state): State<AppState>,
    Query(query): Query<NotificationQuery>,
    Extension(me): Extension<Identity>,
) -> ApiResult<impl IntoResponse> {
    let notifications = state.services.notifications.clone();
    let list = blocking(move || notifications.list(me.user_id, query.limit)).await?;
    Ok(Json(list))
}

pub async fn notification_count(
    State(state): State<AppState>,
    Extension(me): Extension<Identity>,
) -> ApiResult<impl IntoResponse> {
    let notifications = state.services.notifications.clone();
    let count = blocking(move || notifications.unread_count(me.user_id)).await?;
    Ok(Json(NotificationCountResponse { count }))
}

pub async fn mark_read(
    State(state): State<AppState>,
    Path(notification_id): Path<Uuid>,
    Extension(me): Extension<Identity>,
) -> ApiResult<StatusCode> {
    let notifications = state.services.notifications.clone();
    blocking(move || notifications.mark_read(me.user_id, notification_id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn mark_all_read(
    State(state): State<AppState>,
    Extension(me): Extension<Identity>,
) -> ApiResult<impl IntoResponse> {
    let notifications = state.services.notifications.clone();
    let updated = blocking(move || notifications.mark_all_read(me.user_id)).await?;
    Ok(Json(ReadAllResponse { updated }))
}
