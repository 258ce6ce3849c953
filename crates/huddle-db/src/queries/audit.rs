use anyhow::Result;
use huddle_types::models::AuditEntry;
use rusqlite::Connection;
use uuid::Uuid;

use super::{enum_col, opt_uuid_col, uuid_col};

pub fn insert_audit(conn: &Connection, entry: &AuditEntry) -> Result<()> {
    conn.execute(
        "INSERT INTO audit_log
             (id, actor_id, action, thread_id, target_user_id, details, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        rusqlite::params![
            entry.id.to_string(),
            entry.actor_id.map(|id| id.to_string()),
            entry.action.as_str(),
            entry.thread_id.map(|id| id.to_string()),
            entry.target_user_id.map(|id| id.to_string()),
            entry.details,
            entry.created_at,
        ],
    )?;
    Ok(())
}

/// Newest first.
pub fn list_audit_for_thread(
    conn: &Connection,
    thread_id: Uuid,
    limit: u32,
) -> Result<Vec<AuditEntry>> {
    let mut stmt = conn.prepare(
        "SELECT id, actor_id, action, thread_id, target_user_id, details, created_at
         FROM audit_log WHERE thread_id = ?1
         ORDER BY created_at DESC, rowid DESC
         LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(rusqlite::params![thread_id.to_string(), limit], |row| {
            Ok(AuditEntry {
                id: uuid_col(row, 0)?,
                actor_id: opt_uuid_col(row, 1)?,
                action: enum_col(row, 2)?,
                thread_id: opt_uuid_col(row, 3)?,
                target_user_id: opt_uuid_col(row, 4)?,
                details: row.get(5)?,
                created_at: row.get(6)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}
