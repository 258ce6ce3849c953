use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
};
use huddle_types::Identity;
use huddle_types::api::AddReactionRequest;
use uuid::Uuid;

use crate::error::{ApiResult, blocking};
use crate::state::AppState;

/// Replaces any earlier reaction by the caller on this message.
pub async fn add_reaction(
    State(state): State<AppState>,
    Path((thread_id, message_id)): Path<(Uuid, Uuid)>,
    Extension(me): Extension<Identity>,
    Json(req): Json<AddReactionRequest>,
) -> ApiResult<StatusCode> {
    let messaging = state.services.messaging.clone();
    blocking(move || messaging.add_reaction(thread_id, message_id, me.user_id, &req.emoji)).await?;
    Ok(StatusCode::CREATED)
}

/// 204 whether or not a reaction was there.
pub async fn remove_reaction(
    State(state): State<AppState>,
    Path((thread_id, message_id, emoji)): Path<(Uuid, Uuid, String)>,
    Extension(me): Extension<Identity>,
) -> ApiResult<StatusCode> {
    let messaging = state.services.messaging.clone();
    blocking(move || messaging.remove_reaction(thread_id, message_id, me.user_id, &emoji)).await?;
    Ok(StatusCode::NO_CONTENT)
}
