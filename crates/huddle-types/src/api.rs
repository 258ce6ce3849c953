use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{GroupSettings, PostingMode, Role, Thread};

// -- JWT Claims --

/// JWT claims shared by the REST middleware and the WebSocket upgrade path.
/// Tokens are issued elsewhere; this service only verifies them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub username: String,
    pub exp: usize,
}

// -- Threads --

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CreateThreadRequest {
    Direct {
        user_id: Uuid,
    },
    Group {
        title: String,
        #[serde(default)]
        participant_ids: Vec<Uuid>,
    },
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ThreadSummary {
    #[serde(flatten)]
    pub thread: Thread,
    pub role: Role,
    pub is_muted: bool,
    pub unread_count: i64,
    pub settings: Option<GroupSettings>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateThreadRequest {
    pub title: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateThreadResponse {
    pub thread: Thread,
    pub created: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AddParticipantsRequest {
    pub user_ids: Vec<Uuid>,
}

/// `DELETE /threads/{id}`: `archived` is false when the caller left instead.
#[derive(Debug, Serialize, Deserialize)]
pub struct DepartureResponse {
    pub archived: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AddParticipantsResponse {
    pub added: Vec<Uuid>,
}

/// Partial update; absent fields keep their current value.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateSettingsRequest {
    pub posting_mode: Option<PostingMode>,
    pub reactions_enabled: Option<bool>,
    pub members_can_add_others: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChangeRoleRequest {
    pub role: Role,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MuteRequest {
    pub muted: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MarkReadRequest {
    pub message_id: Option<Uuid>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MarkReadResponse {
    pub last_read_at: DateTime<Utc>,
}

// -- Messages --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    #[serde(default)]
    pub content: String,
    pub reply_to: Option<Uuid>,
    #[serde(default)]
    pub attachment_ids: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EditMessageRequest {
    pub content: String,
}

// -- Reactions --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AddReactionRequest {
    pub emoji: String,
}

// -- Counts --

#[derive(Debug, Serialize, Deserialize)]
pub struct UnreadCountResponse {
    pub total_unread: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NotificationCountResponse {
    pub count: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReadAllResponse {
    pub updated: usize,
}
