use chrono::{DateTime, Utc};
use huddle_db::queries::audit;
use huddle_types::models::{AuditAction, AuditEntry};
use rusqlite::Connection;
use uuid::Uuid;

/// One audit row, written inside the transaction of the change it records.
pub(crate) struct Audit {
    action: AuditAction,
    actor: Uuid,
    thread_id: Uuid,
    target: Option<Uuid>,
    details: Option<String>,
}

impl Audit {
    pub(crate) fn new(action: AuditAction, actor: Uuid, thread_id: Uuid) -> Self {
        Self {
            action,
            actor,
            thread_id,
            target: None,
            details: None,
        }
    }

    pub(crate) fn target(mut self, user_id: Uuid) -> Self {
        self.target = Some(user_id);
        self
    }

    pub(crate) fn details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub(crate) fn write(self, conn: &Connection, at: DateTime<Utc>) -> anyhow::Result<()> {
        audit::insert_audit(
            conn,
            &AuditEntry {
                id: Uuid::new_v4(),
                actor_id: Some(self.actor),
                action: self.action,
                thread_id: Some(self.thread_id),
                target_user_id: self.target,
                details: self.details,
                created_at: at,
            },
        )
    }
}
