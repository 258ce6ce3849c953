use anyhow::Result;
use huddle_types::models::Notification;
use rusqlite::Connection;
use uuid::Uuid;

use crate::Database;
use crate::models::NewNotification;
use super::{opt_uuid_col, uuid_col};

pub fn insert_notification(conn: &Connection, n: &NewNotification<'_>) -> Result<()> {
    conn.execute(
        "INSERT INTO notifications
             (id, recipient_id, kind, title, body, thread_id, message_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        rusqlite::params![
            n.id.to_string(),
            n.recipient_id.to_string(),
            n.kind,
            n.title,
            n.body,
            n.thread_id.map(|id| id.to_string()),
            n.message_id.map(|id| id.to_string()),
            n.created_at,
        ],
    )?;
    Ok(())
}

pub fn unread_notification_count(conn: &Connection, recipient_id: Uuid) -> Result<i64> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM notifications WHERE recipient_id = ?1 AND is_read = 0",
        [recipient_id.to_string()],
        |row| row.get(0),
    )?;
    Ok(count)
}

pub fn list_notifications(
    conn: &Connection,
    recipient_id: Uuid,
    limit: u32,
) -> Result<Vec<Notification>> {
    let mut stmt = conn.prepare(
        "SELECT id, kind, title, body, thread_id, message_id, is_read, created_at
         FROM notifications WHERE recipient_id = ?1
         ORDER BY created_at DESC, rowid DESC
         LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(rusqlite::params![recipient_id.to_string(), limit], |row| {
            Ok(Notification {
                id: uuid_col(row, 0)?,
                kind: row.get(1)?,
                title: row.get(2)?,
                body: row.get(3)?,
                thread_id: opt_uuid_col(row, 4)?,
                message_id: opt_uuid_col(row, 5)?,
                is_read: row.get(6)?,
                created_at: row.get(7)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Returns false when the notification doesn't exist, belongs to someone
/// else, or was already read.
pub fn mark_notification_read(conn: &Connection, recipient_id: Uuid, id: Uuid) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE notifications SET is_read = 1 WHERE id = ?1 AND recipient_id = ?2 AND is_read = 0",
        [id.to_string(), recipient_id.to_string()],
    )?;
    Ok(changed == 1)
}

pub fn mark_all_notifications_read(conn: &Connection, recipient_id: Uuid) -> Result<usize> {
    let changed = conn.execute(
        "UPDATE notifications SET is_read = 1 WHERE recipient_id = ?1 AND is_read = 0",
        [recipient_id.to_string()],
    )?;
    Ok(changed)
}

impl Database {
    pub fn unread_notification_count(&self, recipient_id: Uuid) -> Result<i64> {
        self.with_conn(|conn| unread_notification_count(conn, recipient_id))
    }

    pub fn list_notifications(&self, recipient_id: Uuid, limit: u32) -> Result<Vec<Notification>> {
        self.with_conn(|conn| list_notifications(conn, recipient_id, limit))
    }
}
