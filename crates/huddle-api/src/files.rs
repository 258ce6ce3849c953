use axum::{
    Extension, Json,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
};
use huddle_chat::sanitize::sanitize_file_name;
use huddle_types::Identity;
use huddle_types::models::Attachment;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult, blocking};
use crate::state::AppState;

pub const FILE_NAME_HEADER: &str = "x-file-name";

/// POST /threads/{id}/attachments: raw bytes in the body, original name in
/// `X-File-Name`. The returned id goes into `attachment_ids` of the message
/// that carries the file.
pub async fn upload_attachment(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
    Extension(me): Extension<Identity>,
    headers: HeaderMap,
    bytes: Bytes,
) -> ApiResult<impl IntoResponse> {
    if bytes.is_empty() {
        return Err(ApiError::BadRequest("empty upload".into()));
    }
    if bytes.len() > state.max_upload_bytes {
        return Err(ApiError::PayloadTooLarge);
    }

    let raw_name = headers
        .get(FILE_NAME_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("missing X-File-Name header".into()))?;
    let file_name = sanitize_file_name(raw_name)
        .ok_or_else(|| ApiError::BadRequest("invalid file name".into()))?;
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();

    let attachment = Attachment {
        id: Uuid::new_v4(),
        file_name,
        content_type,
        size: bytes.len() as i64,
        sha256: hex::encode(Sha256::digest(&bytes)),
    };

    tokio::fs::create_dir_all(&state.upload_dir).await.map_err(|e| {
        error!("Failed to create upload directory {}: {}", state.upload_dir.display(), e);
        ApiError::Internal
    })?;
    let path = state.upload_dir.join(attachment.id.to_string());
    let mut file = tokio::fs::File::create(&path).await.map_err(|e| {
        error!("Failed to create {}: {}", path.display(), e);
        ApiError::Internal
    })?;
    file.write_all(&bytes).await.map_err(|e| {
        error!("Failed to write {}: {}", path.display(), e);
        ApiError::Internal
    })?;

    let messaging = state.services.messaging.clone();
    let record = attachment.clone();
    let recorded =
        blocking(move || messaging.record_attachment(thread_id, me.user_id, &record)).await;
    if let Err(e) = recorded {
        if let Err(rm) = tokio::fs::remove_file(&path).await {
            warn!("Failed to remove orphaned upload {}: {}", path.display(), rm);
        }
        return Err(e);
    }

    info!(
        "Stored attachment {} ({} bytes) in thread {}",
        attachment.id, attachment.size, thread_id
    );
    Ok((StatusCode::CREATED, Json(attachment)))
}
