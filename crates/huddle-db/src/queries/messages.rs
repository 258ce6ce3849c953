use anyhow::Result;
use chrono::{DateTime, Utc};
use huddle_types::models::Attachment;
use rusqlite::{Connection, Row};
use uuid::Uuid;

use crate::models::{MessageRow, NewMessage, UnreadRow};
use super::{OptionalExt, as_sql, id_params, opt_uuid_col, placeholders, uuid_col};

const MESSAGE_SELECT: &str = "SELECT m.id, m.thread_id, m.sender_id, u.username, m.content,
        m.reply_to_id, m.has_attachments, m.created_at, m.edited_at, m.deleted_at
     FROM messages m
     LEFT JOIN users u ON u.id = m.sender_id";

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: uuid_col(row, 0)?,
        thread_id: uuid_col(row, 1)?,
        sender_id: opt_uuid_col(row, 2)?,
        sender_username: row.get(3)?,
        content: row.get(4)?,
        reply_to_id: opt_uuid_col(row, 5)?,
        has_attachments: row.get(6)?,
        created_at: row.get(7)?,
        edited_at: row.get(8)?,
        deleted_at: row.get(9)?,
    })
}

// -- Messages --

pub fn insert_message(conn: &Connection, msg: &NewMessage<'_>) -> Result<()> {
    conn.execute(
        "INSERT INTO messages
             (id, thread_id, sender_id, content, reply_to_id, has_attachments, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        rusqlite::params![
            msg.id.to_string(),
            msg.thread_id.to_string(),
            msg.sender_id.to_string(),
            msg.content,
            msg.reply_to_id.map(|id| id.to_string()),
            msg.has_attachments,
            msg.created_at,
        ],
    )?;
    Ok(())
}

/// Looks a message up within its thread; a message from another thread is
/// reported as missing.
pub fn get_message(
    conn: &Connection,
    thread_id: Uuid,
    message_id: Uuid,
) -> Result<Option<MessageRow>> {
    conn.query_row(
        &format!("{} WHERE m.id = ?1 AND m.thread_id = ?2", MESSAGE_SELECT),
        [message_id.to_string(), thread_id.to_string()],
        message_from_row,
    )
    .optional()
}

/// Newest-first page of a thread's messages, optionally strictly older than
/// `before`.
pub fn list_messages(
    conn: &Connection,
    thread_id: Uuid,
    before: Option<DateTime<Utc>>,
    limit: u32,
) -> Result<Vec<MessageRow>> {
    let mut stmt = conn.prepare(&format!(
        "{} WHERE m.thread_id = ?1 AND (?2 IS NULL OR m.created_at < ?2)
         ORDER BY m.created_at DESC, m.rowid DESC
         LIMIT ?3",
        MESSAGE_SELECT
    ))?;
    let rows = stmt
        .query_map(rusqlite::params![thread_id.to_string(), before, limit], message_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn update_message_content(
    conn: &Connection,
    message_id: Uuid,
    content: &str,
    edited_at: DateTime<Utc>,
) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE messages SET content = ?2, edited_at = ?3 WHERE id = ?1 AND deleted_at IS NULL",
        rusqlite::params![message_id.to_string(), content, edited_at],
    )?;
    Ok(changed == 1)
}

/// Soft delete: the row stays so replies keep their anchor, content is cleared.
pub fn soft_delete_message(conn: &Connection, message_id: Uuid, at: DateTime<Utc>) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE messages SET content = '', deleted_at = ?2 WHERE id = ?1 AND deleted_at IS NULL",
        rusqlite::params![message_id.to_string(), at],
    )?;
    Ok(changed == 1)
}

// -- Attachments --

pub fn insert_attachment(
    conn: &Connection,
    thread_id: Uuid,
    uploader_id: Uuid,
    attachment: &Attachment,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO attachments
             (id, thread_id, uploader_id, file_name, content_type, size, sha256, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        rusqlite::params![
            attachment.id.to_string(),
            thread_id.to_string(),
            uploader_id.to_string(),
            attachment.file_name,
            attachment.content_type,
            attachment.size,
            attachment.sha256,
            now,
        ],
    )?;
    Ok(())
}

/// Attaches uploads to a message. Only files uploaded by the sender into the
/// same thread, and not yet linked, are taken; the rest are ignored.
pub fn link_attachments(
    conn: &Connection,
    message_id: Uuid,
    thread_id: Uuid,
    uploader_id: Uuid,
    attachment_ids: &[Uuid],
) -> Result<usize> {
    if attachment_ids.is_empty() {
        return Ok(0);
    }

    let mut params = vec![
        message_id.to_string(),
        thread_id.to_string(),
        uploader_id.to_string(),
    ];
    params.extend(id_params(attachment_ids));
    let in_list = (4..=params.len())
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ");

    let linked = conn.execute(
        &format!(
            "UPDATE attachments SET message_id = ?1
             WHERE thread_id = ?2 AND uploader_id = ?3 AND message_id IS NULL AND id IN ({})",
            in_list
        ),
        as_sql(&params).as_slice(),
    )?;
    Ok(linked)
}

pub fn set_has_attachments(conn: &Connection, message_id: Uuid, has: bool) -> Result<()> {
    conn.execute(
        "UPDATE messages SET has_attachments = ?2 WHERE id = ?1",
        rusqlite::params![message_id.to_string(), has],
    )?;
    Ok(())
}

/// Batch-fetch attachments for a set of message IDs, keyed by message.
pub fn attachments_for_messages(
    conn: &Connection,
    message_ids: &[Uuid],
) -> Result<Vec<(Uuid, Attachment)>> {
    if message_ids.is_empty() {
        return Ok(vec![]);
    }

    let params = id_params(message_ids);
    let mut stmt = conn.prepare(&format!(
        "SELECT message_id, id, file_name, content_type, size, sha256
         FROM attachments WHERE message_id IN ({})
         ORDER BY created_at",
        placeholders(params.len())
    ))?;
    let rows = stmt
        .query_map(as_sql(&params).as_slice(), |row| {
            Ok((
                uuid_col(row, 0)?,
                Attachment {
                    id: uuid_col(row, 1)?,
                    file_name: row.get(2)?,
                    content_type: row.get(3)?,
                    size: row.get(4)?,
                    sha256: row.get(5)?,
                },
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

// -- Unread counters --

/// Atomically increments the unread count of every active participant except
/// the sender and returns each recipient's post-increment state. Muted
/// participants are counted too.
pub fn increment_unread(
    conn: &Connection,
    thread_id: Uuid,
    sender_id: Uuid,
) -> Result<Vec<UnreadRow>> {
    let mut stmt = conn.prepare(
        "UPDATE participants SET unread_count = unread_count + 1
         WHERE thread_id = ?1 AND user_id != ?2 AND left_at IS NULL
         RETURNING user_id, unread_count, is_muted",
    )?;
    let rows = stmt
        .query_map([thread_id.to_string(), sender_id.to_string()], |row| {
            Ok(UnreadRow {
                user_id: uuid_col(row, 0)?,
                unread_count: row.get(1)?,
                is_muted: row.get(2)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Zeroes a participant's unread count. Returns false when the user is not an
/// active participant.
pub fn reset_unread(
    conn: &Connection,
    thread_id: Uuid,
    user_id: Uuid,
    read_at: DateTime<Utc>,
) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE participants SET unread_count = 0, last_read_at = ?3
         WHERE thread_id = ?1 AND user_id = ?2 AND left_at IS NULL",
        rusqlite::params![thread_id.to_string(), user_id.to_string(), read_at],
    )?;
    Ok(changed == 1)
}

/// Sum of unread counts over a user's active memberships.
pub fn total_unread(conn: &Connection, user_id: Uuid) -> Result<i64> {
    let total = conn.query_row(
        "SELECT COALESCE(SUM(unread_count), 0) FROM participants
         WHERE user_id = ?1 AND left_at IS NULL",
        [user_id.to_string()],
        |row| row.get(0),
    )?;
    Ok(total)
}
