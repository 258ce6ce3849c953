use std::sync::Arc;

use chrono::{DateTime, Utc};
use huddle_db::Database;
use huddle_db::models::NewNotification;
use huddle_db::queries::notifications;
use huddle_types::models::Notification;
use huddle_types::{Audience, Group, ServerEvent};
use uuid::Uuid;

use crate::error::{ChatError, ChatResult};
use crate::publisher::{EventPublisher, publish_logged};

pub const CHAT_MESSAGE_KIND: &str = "chat_message";
const BODY_PREVIEW_CHARS: usize = 100;

/// A notification built inside a transaction, before it is inserted.
pub(crate) struct PendingNotification {
    id: Uuid,
    recipient_id: Uuid,
    title: String,
    body: String,
    thread_id: Uuid,
    message_id: Uuid,
    created_at: DateTime<Utc>,
}

impl PendingNotification {
    pub(crate) fn as_new(&self) -> NewNotification<'_> {
        NewNotification {
            id: self.id,
            recipient_id: self.recipient_id,
            kind: CHAT_MESSAGE_KIND,
            title: &self.title,
            body: &self.body,
            thread_id: Some(self.thread_id),
            message_id: Some(self.message_id),
            created_at: self.created_at,
        }
    }
}

pub(crate) fn chat_message_notification(
    recipient_id: Uuid,
    thread_title: Option<&str>,
    thread_id: Uuid,
    message_id: Uuid,
    content: &str,
    now: DateTime<Utc>,
) -> PendingNotification {
    PendingNotification {
        id: Uuid::new_v4(),
        recipient_id,
        title: format!("New message in {}", thread_title.unwrap_or("Direct chat")),
        body: content.chars().take(BODY_PREVIEW_CHARS).collect(),
        thread_id,
        message_id,
        created_at: now,
    }
}

/// Badge counts and read state for persisted notifications.
pub struct NotificationService {
    db: Arc<Database>,
    publisher: Arc<dyn EventPublisher>,
}

impl NotificationService {
    pub fn new(db: Arc<Database>, publisher: Arc<dyn EventPublisher>) -> Self {
        Self { db, publisher }
    }

    pub fn unread_count(&self, user_id: Uuid) -> ChatResult<i64> {
        Ok(self.db.unread_notification_count(user_id)?)
    }

    pub fn list(&self, user_id: Uuid, limit: u32) -> ChatResult<Vec<Notification>> {
        Ok(self.db.list_notifications(user_id, limit.clamp(1, 100))?)
    }

    pub fn mark_read(&self, user_id: Uuid, notification_id: Uuid) -> ChatResult<()> {
        let changed = self.db.with_conn(|conn| {
            notifications::mark_notification_read(conn, user_id, notification_id)
        })?;
        if !changed {
            return Err(ChatError::NotFound("notification"));
        }
        self.publish_count(user_id)?;
        Ok(())
    }

    pub fn mark_all_read(&self, user_id: Uuid) -> ChatResult<usize> {
        let changed = self
            .db
            .with_conn(|conn| notifications::mark_all_notifications_read(conn, user_id))?;
        if changed > 0 {
            self.publish_count(user_id)?;
        }
        Ok(changed)
    }

    /// Reads the current badge count and pushes it to the user's channel.
    pub fn publish_count(&self, user_id: Uuid) -> ChatResult<i64> {
        let count = self.unread_count(user_id)?;
        Self::publish_count_value(self.publisher.as_ref(), user_id, count);
        Ok(count)
    }

    pub(crate) fn publish_count_value(publisher: &dyn EventPublisher, user_id: Uuid, count: i64) {
        publish_logged(
            publisher,
            Group::User(user_id),
            Audience::All,
            ServerEvent::NotificationCount {
                count,
                timestamp: Utc::now(),
            },
        );
    }
}
