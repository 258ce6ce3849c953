use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id          TEXT PRIMARY KEY,
            username    TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS threads (
            id          TEXT PRIMARY KEY,
            kind        TEXT NOT NULL CHECK (kind IN ('direct', 'group')),
            title       TEXT,
            is_archived INTEGER NOT NULL DEFAULT 0,
            created_by  TEXT,
            created_at  TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS group_settings (
            thread_id               TEXT PRIMARY KEY REFERENCES threads(id) ON DELETE CASCADE,
            posting_mode            TEXT NOT NULL DEFAULT 'all'
                                    CHECK (posting_mode IN ('all', 'admins_only')),
            reactions_enabled       INTEGER NOT NULL DEFAULT 1,
            members_can_add_others  INTEGER NOT NULL DEFAULT 0
        );

        -- One direct thread per unordered user pair; user_low < user_high.
        CREATE TABLE IF NOT EXISTS direct_thread_keys (
            user_low    TEXT NOT NULL,
            user_high   TEXT NOT NULL,
            thread_id   TEXT NOT NULL UNIQUE REFERENCES threads(id) ON DELETE CASCADE,
            PRIMARY KEY (user_low, user_high),
            CHECK (user_low < user_high)
        );

        CREATE TABLE IF NOT EXISTS participants (
            thread_id       TEXT NOT NULL REFERENCES threads(id) ON DELETE CASCADE,
            user_id         TEXT NOT NULL,
            role            TEXT NOT NULL DEFAULT 'member'
                            CHECK (role IN ('owner', 'admin', 'member')),
            is_muted        INTEGER NOT NULL DEFAULT 0,
            unread_count    INTEGER NOT NULL DEFAULT 0 CHECK (unread_count >= 0),
            last_read_at    TEXT,
            joined_at       TEXT NOT NULL,
            left_at         TEXT,
            PRIMARY KEY (thread_id, user_id)
        );

        CREATE INDEX IF NOT EXISTS idx_participants_user
            ON participants(user_id, left_at);

        CREATE TABLE IF NOT EXISTS messages (
            id              TEXT PRIMARY KEY,
            thread_id       TEXT NOT NULL REFERENCES threads(id) ON DELETE CASCADE,
            sender_id       TEXT,
            content         TEXT NOT NULL,
            reply_to_id     TEXT REFERENCES messages(id) ON DELETE SET NULL,
            has_attachments INTEGER NOT NULL DEFAULT 0,
            created_at      TEXT NOT NULL,
            edited_at       TEXT,
            deleted_at      TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_messages_thread
            ON messages(thread_id, created_at);

        CREATE TABLE IF NOT EXISTS attachments (
            id              TEXT PRIMARY KEY,
            thread_id       TEXT NOT NULL REFERENCES threads(id) ON DELETE CASCADE,
            uploader_id     TEXT NOT NULL,
            message_id      TEXT REFERENCES messages(id) ON DELETE SET NULL,
            file_name       TEXT NOT NULL,
            content_type    TEXT NOT NULL,
            size            INTEGER NOT NULL,
            sha256          TEXT NOT NULL,
            created_at      TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_attachments_message
            ON attachments(message_id);

        -- At most one reaction per user per message.
        CREATE TABLE IF NOT EXISTS reactions (
            message_id  TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
            user_id     TEXT NOT NULL,
            emoji       TEXT NOT NULL,
            created_at  TEXT NOT NULL,
            PRIMARY KEY (message_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS notifications (
            id              TEXT PRIMARY KEY,
            recipient_id    TEXT NOT NULL,
            kind            TEXT NOT NULL,
            title           TEXT NOT NULL,
            body            TEXT NOT NULL,
            thread_id       TEXT REFERENCES threads(id) ON DELETE CASCADE,
            message_id      TEXT REFERENCES messages(id) ON DELETE CASCADE,
            is_read         INTEGER NOT NULL DEFAULT 0,
            created_at      TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_notifications_recipient
            ON notifications(recipient_id, is_read);

        CREATE TABLE IF NOT EXISTS audit_log (
            id              TEXT PRIMARY KEY,
            actor_id        TEXT,
            action          TEXT NOT NULL,
            thread_id       TEXT REFERENCES threads(id) ON DELETE CASCADE,
            target_user_id  TEXT,
            details         TEXT,
            created_at      TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_audit_thread
            ON audit_log(thread_id, created_at);

        -- Shared expiring counters (rate-limit buckets, connection counts).
        -- expires_at is unix milliseconds.
        CREATE TABLE IF NOT EXISTS counters (
            key         TEXT PRIMARY KEY,
            value       INTEGER NOT NULL,
            expires_at  INTEGER NOT NULL
        );
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
