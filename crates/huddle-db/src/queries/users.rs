use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use uuid::Uuid;

use crate::Database;
use super::OptionalExt;

/// Records the latest display name seen for a user. Identities come from
/// verified tokens, so this table is a cache, not an account store.
pub fn upsert_user(conn: &Connection, id: Uuid, username: &str, now: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "INSERT INTO users (id, username, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(id) DO UPDATE
             SET username = excluded.username, updated_at = excluded.updated_at",
        rusqlite::params![id.to_string(), username, now],
    )?;
    Ok(())
}

pub fn get_username(conn: &Connection, id: Uuid) -> Result<Option<String>> {
    conn.query_row(
        "SELECT username FROM users WHERE id = ?1",
        [id.to_string()],
        |row| row.get(0),
    )
    .optional()
}

impl Database {
    pub fn upsert_user(&self, id: Uuid, username: &str) -> Result<()> {
        self.with_conn(|conn| upsert_user(conn, id, username, Utc::now()))
    }

    pub fn get_username(&self, id: Uuid) -> Result<Option<String>> {
        self.with_conn(|conn| get_username(conn, id))
    }
}
