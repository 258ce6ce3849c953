use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use uuid::Uuid;

use crate::models::ReactionRow;
use super::{as_sql, id_params, placeholders, uuid_col};

/// Sets the user's reaction on a message, replacing any previous emoji.
/// Delete and insert run on the caller's connection, so inside a transaction
/// the swap is atomic.
pub fn replace_reaction(
    conn: &Connection,
    message_id: Uuid,
    user_id: Uuid,
    emoji: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "DELETE FROM reactions WHERE message_id = ?1 AND user_id = ?2",
        [message_id.to_string(), user_id.to_string()],
    )?;
    conn.execute(
        "INSERT INTO reactions (message_id, user_id, emoji, created_at) VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![message_id.to_string(), user_id.to_string(), emoji, now],
    )?;
    Ok(())
}

/// Removes the user's reaction only if it is `emoji`. Returns whether a row
/// was deleted.
pub fn delete_reaction(
    conn: &Connection,
    message_id: Uuid,
    user_id: Uuid,
    emoji: &str,
) -> Result<bool> {
    let deleted = conn.execute(
        "DELETE FROM reactions WHERE message_id = ?1 AND user_id = ?2 AND emoji = ?3",
        rusqlite::params![message_id.to_string(), user_id.to_string(), emoji],
    )?;
    Ok(deleted == 1)
}

/// Batch-fetch reactions for a set of message IDs.
pub fn reactions_for_messages(conn: &Connection, message_ids: &[Uuid]) -> Result<Vec<ReactionRow>> {
    if message_ids.is_empty() {
        return Ok(vec![]);
    }

    let params = id_params(message_ids);
    let mut stmt = conn.prepare(&format!(
        "SELECT message_id, user_id, emoji, created_at FROM reactions
         WHERE message_id IN ({})
         ORDER BY created_at, rowid",
        placeholders(params.len())
    ))?;
    let rows = stmt
        .query_map(as_sql(&params).as_slice(), |row| {
            Ok(ReactionRow {
                message_id: uuid_col(row, 0)?,
                user_id: uuid_col(row, 1)?,
                emoji: row.get(2)?,
                created_at: row.get(3)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}
