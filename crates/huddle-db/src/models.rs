//! Database row types that don't map one-to-one onto huddle-types models.
//! Threads, participants, settings and attachments are read straight into
//! the shared models.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// A message row joined with the sender's cached display name. Attachments
/// and reactions are batch-fetched separately.
#[derive(Debug, Clone)]
pub struct MessageRow {
    pub id: Uuid,
    pub thread_id: Uuid,
    pub sender_id: Option<Uuid>,
    pub sender_username: Option<String>,
    pub content: String,
    pub reply_to_id: Option<Uuid>,
    pub has_attachments: bool,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

pub struct NewMessage<'a> {
    pub id: Uuid,
    pub thread_id: Uuid,
    pub sender_id: Uuid,
    pub content: &'a str,
    pub reply_to_id: Option<Uuid>,
    pub has_attachments: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactionRow {
    pub message_id: Uuid,
    pub user_id: Uuid,
    pub emoji: String,
    pub created_at: DateTime<Utc>,
}

/// Post-increment state of one recipient, returned by the unread bump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnreadRow {
    pub user_id: Uuid,
    pub unread_count: i64,
    pub is_muted: bool,
}

pub struct NewNotification<'a> {
    pub id: Uuid,
    pub recipient_id: Uuid,
    pub kind: &'a str,
    pub title: &'a str,
    pub body: &'a str,
    pub thread_id: Option<Uuid>,
    pub message_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}
