//! Expiring integer counters kept in SQLite, so every process sharing the
//! database file sees the same rate-limit buckets and connection counts.

use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tracing::debug;

use crate::Database;
use crate::queries::OptionalExt;

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

impl Database {
    /// Atomically increments `key` and returns the new value. An expired or
    /// missing key starts again from 1. Every increment re-arms the expiry.
    pub fn incr_counter(&self, key: &str, ttl: Duration) -> Result<i64> {
        self.incr_counter_at(key, ttl, now_millis())
    }

    pub fn incr_counter_at(&self, key: &str, ttl: Duration, now_ms: i64) -> Result<i64> {
        let expires_at = now_ms.saturating_add(ttl_millis(ttl));
        self.with_conn(|conn| {
            let value = conn.query_row(
                "INSERT INTO counters (key, value, expires_at) VALUES (?1, 1, ?3)
                 ON CONFLICT(key) DO UPDATE SET
                     value = CASE WHEN counters.expires_at <= ?2 THEN 1 ELSE counters.value + 1 END,
                     expires_at = ?3
                 RETURNING value",
                rusqlite::params![key, now_ms, expires_at],
                |row| row.get(0),
            )?;
            Ok(value)
        })
    }

    /// Atomically decrements `key`, never below zero. Returns the new value;
    /// a missing or expired key reads as 0.
    pub fn decr_counter(&self, key: &str) -> Result<i64> {
        self.decr_counter_at(key, now_millis())
    }

    pub fn decr_counter_at(&self, key: &str, now_ms: i64) -> Result<i64> {
        self.with_conn(|conn| {
            let value: Option<i64> = conn
                .query_row(
                    "UPDATE counters SET value = MAX(value - 1, 0)
                     WHERE key = ?1 AND expires_at > ?2
                     RETURNING value",
                    rusqlite::params![key, now_ms],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(value.unwrap_or(0))
        })
    }

    pub fn get_counter(&self, key: &str) -> Result<i64> {
        self.get_counter_at(key, now_millis())
    }

    pub fn get_counter_at(&self, key: &str, now_ms: i64) -> Result<i64> {
        self.with_conn(|conn| {
            let value: Option<i64> = conn
                .query_row(
                    "SELECT value FROM counters WHERE key = ?1 AND expires_at > ?2",
                    rusqlite::params![key, now_ms],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(value.unwrap_or(0))
        })
    }

    /// Drops expired counters. Expired keys already read as 0, so this only
    /// reclaims space.
    pub fn purge_expired_counters(&self) -> Result<usize> {
        let removed = self.with_conn(|conn| {
            Ok(conn.execute("DELETE FROM counters WHERE expires_at <= ?1", [now_millis()])?)
        })?;
        if removed > 0 {
            debug!("Purged {} expired counters", removed);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn increments_until_expiry_then_restarts() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.incr_counter_at("k", MINUTE, 1_000).unwrap(), 1);
        assert_eq!(db.incr_counter_at("k", MINUTE, 2_000).unwrap(), 2);
        assert_eq!(db.get_counter_at("k", 2_000).unwrap(), 2);

        // past the re-armed expiry (2_000 + 60_000)
        assert_eq!(db.get_counter_at("k", 62_000).unwrap(), 0);
        assert_eq!(db.incr_counter_at("k", MINUTE, 62_000).unwrap(), 1);
    }

    #[test]
    fn decrement_floors_at_zero() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.decr_counter_at("missing", 0).unwrap(), 0);

        db.incr_counter_at("conn", MINUTE, 0).unwrap();
        assert_eq!(db.decr_counter_at("conn", 10).unwrap(), 0);
        assert_eq!(db.decr_counter_at("conn", 20).unwrap(), 0);
        assert_eq!(db.get_counter_at("conn", 30).unwrap(), 0);
    }
}
