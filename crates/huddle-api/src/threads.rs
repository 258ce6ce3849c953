use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use huddle_chat::Departure;
use huddle_types::Identity;
use huddle_types::api::{
    AddParticipantsRequest, AddParticipantsResponse, ChangeRoleRequest, CreateThreadRequest,
    CreateThreadResponse, DepartureResponse, MarkReadRequest, MarkReadResponse, MuteRequest,
    UpdateSettingsRequest, UpdateThreadRequest,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::{ApiResult, blocking};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ThreadListQuery {
    #[serde(default)]
    pub archived: bool,
}

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    #[serde(default = "default_audit_limit")]
    pub limit: u32,
}

fn default_audit_limit() -> u32 {
    50
}

/// `?archived=true` lists archived threads instead of live ones.
pub async fn list_threads(
    State(state): State<AppState>,
    Query(query): Query<ThreadListQuery>,
    Extension(me): Extension<Identity>,
) -> ApiResult<impl IntoResponse> {
    let threads = state.services.threads.clone();
    let summaries = blocking(move || threads.list_threads(me.user_id, query.archived)).await?;
    Ok(Json(summaries))
}

/// Direct threads are get-or-create: 201 when new, 200 when found.
pub async fn create_thread(
    State(state): State<AppState>,
    Extension(me): Extension<Identity>,
    Json(req): Json<CreateThreadRequest>,
) -> ApiResult<impl IntoResponse> {
    let threads = state.services.threads.clone();
    let (thread, created) = blocking(move || match req {
        CreateThreadRequest::Direct { user_id } => threads.get_or_create_direct(&me, user_id),
        CreateThreadRequest::Group {
            title,
            participant_ids,
        } => threads
            .create_group(&me, &title, &participant_ids)
            .map(|thread| (thread, true)),
    })
    .await?;

    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(CreateThreadResponse { thread, created })))
}

pub async fn update_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
    Extension(me): Extension<Identity>,
    Json(req): Json<UpdateThreadRequest>,
) -> ApiResult<impl IntoResponse> {
    let threads = state.services.threads.clone();
    let thread = blocking(move || threads.update_title(thread_id, me.user_id, &req.title)).await?;
    Ok(Json(thread))
}

/// The group owner archives; anyone else leaves.
pub async fn delete_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
    Extension(me): Extension<Identity>,
) -> ApiResult<impl IntoResponse> {
    let threads = state.services.threads.clone();
    let departure = blocking(move || threads.archive_or_leave(thread_id, me.user_id)).await?;
    let archived = matches!(departure, Departure::Archived(_));
    Ok(Json(DepartureResponse { archived }))
}

pub async fn list_members(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
    Extension(me): Extension<Identity>,
) -> ApiResult<impl IntoResponse> {
    let threads = state.services.threads.clone();
    let members = blocking(move || threads.list_members(thread_id, me.user_id)).await?;
    Ok(Json(members))
}

pub async fn audit_log(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
    Query(query): Query<AuditQuery>,
    Extension(me): Extension<Identity>,
) -> ApiResult<impl IntoResponse> {
    let threads = state.services.threads.clone();
    let limit = query.limit.clamp(1, 200);
    let entries = blocking(move || threads.audit_trail(thread_id, me.user_id, limit)).await?;
    Ok(Json(entries))
}

pub async fn leave_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
    Extension(me): Extension<Identity>,
) -> ApiResult<StatusCode> {
    let threads = state.services.threads.clone();
    blocking(move || threads.leave_thread(thread_id, me.user_id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn add_participants(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
    Extension(me): Extension<Identity>,
    Json(req): Json<AddParticipantsRequest>,
) -> ApiResult<impl IntoResponse> {
    let threads = state.services.threads.clone();
    let added =
        blocking(move || threads.add_participants(thread_id, me.user_id, &req.user_ids)).await?;
    Ok(Json(AddParticipantsResponse { added }))
}

pub async fn remove_participant(
    State(state): State<AppState>,
    Path((thread_id, user_id)): Path<(Uuid, Uuid)>,
    Extension(me): Extension<Identity>,
) -> ApiResult<StatusCode> {
    let threads = state.services.threads.clone();
    blocking(move || threads.remove_participant(thread_id, me.user_id, user_id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn change_role(
    State(state): State<AppState>,
    Path((thread_id, user_id)): Path<(Uuid, Uuid)>,
    Extension(me): Extension<Identity>,
    Json(req): Json<ChangeRoleRequest>,
) -> ApiResult<StatusCode> {
    let threads = state.services.threads.clone();
    blocking(move || threads.change_role(thread_id, me.user_id, user_id, req.role)).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn update_settings(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
    Extension(me): Extension<Identity>,
    Json(req): Json<UpdateSettingsRequest>,
) -> ApiResult<impl IntoResponse> {
    let threads = state.services.threads.clone();
    let settings =
        blocking(move || threads.update_group_settings(thread_id, me.user_id, &req)).await?;
    Ok(Json(settings))
}

pub async fn set_muted(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
    Extension(me): Extension<Identity>,
    Json(req): Json<MuteRequest>,
) -> ApiResult<StatusCode> {
    let threads = state.services.threads.clone();
    blocking(move || threads.set_muted(thread_id, me.user_id, req.muted)).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn mark_read(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
    Extension(me): Extension<Identity>,
    Json(req): Json<MarkReadRequest>,
) -> ApiResult<impl IntoResponse> {
    let messaging = state.services.messaging.clone();
    let last_read_at =
        blocking(move || messaging.mark_as_read(thread_id, me.user_id, req.message_id)).await?;
    Ok(Json(MarkReadResponse { last_read_at }))
}
