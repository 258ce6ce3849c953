use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use huddle_types::Identity;
use huddle_types::api::{EditMessageRequest, SendMessageRequest};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult, blocking};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    pub limit: Option<u32>,
    /// Cursor: pass the `created_at` of the oldest message already seen.
    pub before: Option<DateTime<Utc>>,
}

/// Newest first.
pub async fn list_messages(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
    Query(query): Query<MessageQuery>,
    Extension(me): Extension<Identity>,
) -> ApiResult<impl IntoResponse> {
    let messaging = state.services.messaging.clone();
    let messages = blocking(move || {
        messaging.list_messages(thread_id, me.user_id, query.before, query.limit)
    })
    .await?;
    Ok(Json(messages))
}

pub async fn send_message(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
    Extension(me): Extension<Identity>,
    Json(req): Json<SendMessageRequest>,
) -> ApiResult<impl IntoResponse> {
    check_length(&state, &req.content)?;
    let messaging = state.services.messaging.clone();
    let message = blocking(move || {
        messaging.create_message(thread_id, &me, &req.content, req.reply_to, &req.attachment_ids)
    })
    .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

pub async fn edit_message(
    State(state): State<AppState>,
    Path((thread_id, message_id)): Path<(Uuid, Uuid)>,
    Extension(me): Extension<Identity>,
    Json(req): Json<EditMessageRequest>,
) -> ApiResult<impl IntoResponse> {
    check_length(&state, &req.content)?;
    let messaging = state.services.messaging.clone();
    let message = blocking(move || {
        messaging.update_message(thread_id, message_id, me.user_id, &req.content)
    })
    .await?;
    Ok(Json(message))
}

pub async fn delete_message(
    State(state): State<AppState>,
    Path((thread_id, message_id)): Path<(Uuid, Uuid)>,
    Extension(me): Extension<Identity>,
) -> ApiResult<StatusCode> {
    let messaging = state.services.messaging.clone();
    blocking(move || messaging.delete_message(thread_id, message_id, me.user_id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn check_length(state: &AppState, content: &str) -> ApiResult<()> {
    if content.chars().count() > state.max_message_length {
        return Err(ApiError::BadRequest(format!(
            "message exceeds {} characters",
            state.max_message_length
        )));
    }
    Ok(())
}
