use anyhow::Result;
use chrono::{DateTime, Utc};
use huddle_types::models::{GroupSettings, Member, Participant, Role, Thread};
use rusqlite::{Connection, Row};
use uuid::Uuid;

use super::{OptionalExt, enum_col, opt_uuid_col, uuid_col};

const THREAD_COLUMNS: &str =
    "t.id, t.kind, t.title, t.is_archived, t.created_by, t.created_at, t.updated_at";
const PARTICIPANT_COLUMNS: &str =
    "p.thread_id, p.user_id, p.role, p.is_muted, p.unread_count, p.last_read_at, p.joined_at, \
     p.left_at";

fn thread_from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<Thread> {
    Ok(Thread {
        id: uuid_col(row, offset)?,
        kind: enum_col(row, offset + 1)?,
        title: row.get(offset + 2)?,
        is_archived: row.get(offset + 3)?,
        created_by: opt_uuid_col(row, offset + 4)?,
        created_at: row.get(offset + 5)?,
        updated_at: row.get(offset + 6)?,
    })
}

fn participant_from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<Participant> {
    Ok(Participant {
        thread_id: uuid_col(row, offset)?,
        user_id: uuid_col(row, offset + 1)?,
        role: enum_col(row, offset + 2)?,
        is_muted: row.get(offset + 3)?,
        unread_count: row.get(offset + 4)?,
        last_read_at: row.get(offset + 5)?,
        joined_at: row.get(offset + 6)?,
        left_at: row.get(offset + 7)?,
    })
}

// -- Threads --

pub fn insert_thread(conn: &Connection, thread: &Thread) -> Result<()> {
    conn.execute(
        "INSERT INTO threads (id, kind, title, is_archived, created_by, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        rusqlite::params![
            thread.id.to_string(),
            thread.kind.as_str(),
            thread.title,
            thread.is_archived,
            thread.created_by.map(|id| id.to_string()),
            thread.created_at,
            thread.updated_at,
        ],
    )?;
    Ok(())
}

pub fn get_thread(conn: &Connection, id: Uuid) -> Result<Option<Thread>> {
    conn.query_row(
        &format!("SELECT {} FROM threads t WHERE t.id = ?1", THREAD_COLUMNS),
        [id.to_string()],
        |row| thread_from_row(row, 0),
    )
    .optional()
}

/// Bumps `updated_at` so thread lists sort by latest activity.
pub fn touch_thread(conn: &Connection, id: Uuid, now: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "UPDATE threads SET updated_at = ?2 WHERE id = ?1",
        rusqlite::params![id.to_string(), now],
    )?;
    Ok(())
}

/// Returns false when the thread was already in the requested state.
pub fn set_thread_archived(
    conn: &Connection,
    id: Uuid,
    archived: bool,
    now: DateTime<Utc>,
) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE threads SET is_archived = ?2, updated_at = ?3 WHERE id = ?1 AND is_archived != ?2",
        rusqlite::params![id.to_string(), archived, now],
    )?;
    Ok(changed == 1)
}

pub fn set_thread_title(
    conn: &Connection,
    id: Uuid,
    title: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "UPDATE threads SET title = ?2, updated_at = ?3 WHERE id = ?1",
        rusqlite::params![id.to_string(), title, now],
    )?;
    Ok(())
}

// -- Group settings --

pub fn insert_group_settings(
    conn: &Connection,
    thread_id: Uuid,
    settings: &GroupSettings,
) -> Result<()> {
    conn.execute(
        "INSERT INTO group_settings
             (thread_id, posting_mode, reactions_enabled, members_can_add_others)
         VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![
            thread_id.to_string(),
            settings.posting_mode.as_str(),
            settings.reactions_enabled,
            settings.members_can_add_others,
        ],
    )?;
    Ok(())
}

pub fn get_group_settings(conn: &Connection, thread_id: Uuid) -> Result<Option<GroupSettings>> {
    conn.query_row(
        "SELECT posting_mode, reactions_enabled, members_can_add_others
         FROM group_settings WHERE thread_id = ?1",
        [thread_id.to_string()],
        |row| {
            Ok(GroupSettings {
                posting_mode: enum_col(row, 0)?,
                reactions_enabled: row.get(1)?,
                members_can_add_others: row.get(2)?,
            })
        },
    )
    .optional()
}

pub fn update_group_settings(
    conn: &Connection,
    thread_id: Uuid,
    settings: &GroupSettings,
) -> Result<usize> {
    let changed = conn.execute(
        "UPDATE group_settings
         SET posting_mode = ?2, reactions_enabled = ?3, members_can_add_others = ?4
         WHERE thread_id = ?1",
        rusqlite::params![
            thread_id.to_string(),
            settings.posting_mode.as_str(),
            settings.reactions_enabled,
            settings.members_can_add_others,
        ],
    )?;
    Ok(changed)
}

// -- Direct thread keys --

/// Orders a user pair so `(a, b)` and `(b, a)` map to the same key.
pub fn direct_key(a: Uuid, b: Uuid) -> (String, String) {
    let (a, b) = (a.to_string(), b.to_string());
    if a < b { (a, b) } else { (b, a) }
}

pub fn find_direct_thread(conn: &Connection, a: Uuid, b: Uuid) -> Result<Option<Uuid>> {
    let (low, high) = direct_key(a, b);
    conn.query_row(
        "SELECT thread_id FROM direct_thread_keys WHERE user_low = ?1 AND user_high = ?2",
        [low, high],
        |row| uuid_col(row, 0),
    )
    .optional()
}

/// Claims the pair key for `thread_id`. Returns false when another thread
/// already holds it.
pub fn insert_direct_key(conn: &Connection, a: Uuid, b: Uuid, thread_id: Uuid) -> Result<bool> {
    let (low, high) = direct_key(a, b);
    let inserted = conn.execute(
        "INSERT INTO direct_thread_keys (user_low, user_high, thread_id) VALUES (?1, ?2, ?3)
         ON CONFLICT(user_low, user_high) DO NOTHING",
        [low, high, thread_id.to_string()],
    )?;
    Ok(inserted == 1)
}

// -- Participants --

/// Adds `user_id` to the thread, or re-activates a participant who left.
/// Returns false when the user is already an active participant.
pub fn upsert_participant(
    conn: &Connection,
    thread_id: Uuid,
    user_id: Uuid,
    role: Role,
    now: DateTime<Utc>,
) -> Result<bool> {
    let changed = conn.execute(
        "INSERT INTO participants (thread_id, user_id, role, joined_at) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(thread_id, user_id) DO UPDATE
             SET left_at = NULL, joined_at = excluded.joined_at, unread_count = 0
             WHERE participants.left_at IS NOT NULL",
        rusqlite::params![thread_id.to_string(), user_id.to_string(), role.as_str(), now],
    )?;
    Ok(changed == 1)
}

/// The participant row in any state, including after leaving.
pub fn get_participant(
    conn: &Connection,
    thread_id: Uuid,
    user_id: Uuid,
) -> Result<Option<Participant>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM participants p WHERE p.thread_id = ?1 AND p.user_id = ?2",
            PARTICIPANT_COLUMNS
        ),
        [thread_id.to_string(), user_id.to_string()],
        |row| participant_from_row(row, 0),
    )
    .optional()
}

pub fn get_active_participant(
    conn: &Connection,
    thread_id: Uuid,
    user_id: Uuid,
) -> Result<Option<Participant>> {
    Ok(get_participant(conn, thread_id, user_id)?.filter(Participant::is_active))
}

pub fn active_participant_ids(conn: &Connection, thread_id: Uuid) -> Result<Vec<Uuid>> {
    let mut stmt = conn.prepare(
        "SELECT user_id FROM participants
         WHERE thread_id = ?1 AND left_at IS NULL
         ORDER BY joined_at",
    )?;
    let ids = stmt
        .query_map([thread_id.to_string()], |row| uuid_col(row, 0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(ids)
}

/// Active members with their cached names, in join order.
pub fn list_members(conn: &Connection, thread_id: Uuid) -> Result<Vec<Member>> {
    let mut stmt = conn.prepare(
        "SELECT p.user_id, u.username, p.role, p.is_muted, p.joined_at
         FROM participants p
         LEFT JOIN users u ON u.id = p.user_id
         WHERE p.thread_id = ?1 AND p.left_at IS NULL
         ORDER BY p.joined_at, p.rowid",
    )?;
    let members = stmt
        .query_map([thread_id.to_string()], |row| {
            Ok(Member {
                user_id: uuid_col(row, 0)?,
                username: row.get(1)?,
                role: enum_col(row, 2)?,
                is_muted: row.get(3)?,
                joined_at: row.get(4)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(members)
}

pub fn mark_participant_left(
    conn: &Connection,
    thread_id: Uuid,
    user_id: Uuid,
    now: DateTime<Utc>,
) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE participants SET left_at = ?3, unread_count = 0
         WHERE thread_id = ?1 AND user_id = ?2 AND left_at IS NULL",
        rusqlite::params![thread_id.to_string(), user_id.to_string(), now],
    )?;
    Ok(changed == 1)
}

pub fn set_participant_role(
    conn: &Connection,
    thread_id: Uuid,
    user_id: Uuid,
    role: Role,
) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE participants SET role = ?3
         WHERE thread_id = ?1 AND user_id = ?2 AND left_at IS NULL",
        rusqlite::params![thread_id.to_string(), user_id.to_string(), role.as_str()],
    )?;
    Ok(changed == 1)
}

pub fn set_participant_muted(
    conn: &Connection,
    thread_id: Uuid,
    user_id: Uuid,
    muted: bool,
) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE participants SET is_muted = ?3
         WHERE thread_id = ?1 AND user_id = ?2 AND left_at IS NULL",
        rusqlite::params![thread_id.to_string(), user_id.to_string(), muted],
    )?;
    Ok(changed == 1)
}

/// Active memberships of `user_id` in threads whose archive flag matches
/// `archived`, most recently active thread first.
pub fn list_threads_for_user(
    conn: &Connection,
    user_id: Uuid,
    archived: bool,
) -> Result<Vec<(Thread, Participant)>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {}, {}
         FROM participants p
         JOIN threads t ON t.id = p.thread_id
         WHERE p.user_id = ?1 AND p.left_at IS NULL AND t.is_archived = ?2
         ORDER BY t.updated_at DESC",
        THREAD_COLUMNS, PARTICIPANT_COLUMNS
    ))?;
    let rows = stmt
        .query_map(rusqlite::params![user_id.to_string(), archived], |row| {
            Ok((thread_from_row(row, 0)?, participant_from_row(row, 7)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}
