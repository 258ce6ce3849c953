//! Shared expiring counters behind rate limits and connection caps.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use huddle_db::Database;

/// Atomic expiring counters. A missing or expired key reads as zero.
pub trait CounterStore: Send + Sync {
    /// Increments `key`, restarting from 1 if it expired, and re-arms its
    /// expiry to `ttl` from now. Returns the new value.
    fn incr(&self, key: &str, ttl: Duration) -> anyhow::Result<i64>;

    /// Decrements `key`, never below zero. Returns the new value.
    fn decr(&self, key: &str) -> anyhow::Result<i64>;

    fn get(&self, key: &str) -> anyhow::Result<i64>;
}

/// Counters in the SQLite database, shared by every process using the file.
impl CounterStore for Database {
    fn incr(&self, key: &str, ttl: Duration) -> anyhow::Result<i64> {
        self.incr_counter(key, ttl)
    }

    fn decr(&self, key: &str) -> anyhow::Result<i64> {
        self.decr_counter(key)
    }

    fn get(&self, key: &str) -> anyhow::Result<i64> {
        self.get_counter(key)
    }
}

/// Process-local counters. Only correct when a single server process runs;
/// use the database store otherwise.
#[derive(Default)]
pub struct MemoryCounters {
    entries: DashMap<String, (i64, Instant)>,
}

impl MemoryCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops expired entries and returns how many went. Keys inserted
    /// concurrently are neither counted nor lost.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut purged = 0;
        self.entries.retain(|_, (_, expires)| {
            let live = *expires > now;
            if !live {
                purged += 1;
            }
            live
        });
        purged
    }
}

impl CounterStore for MemoryCounters {
    fn incr(&self, key: &str, ttl: Duration) -> anyhow::Result<i64> {
        let now = Instant::now();
        let mut entry = self.entries.entry(key.to_string()).or_insert((0, now));
        let (value, expires) = entry.value_mut();
        if *expires <= now {
            *value = 0;
        }
        *value += 1;
        *expires = now + ttl;
        Ok(*value)
    }

    fn decr(&self, key: &str) -> anyhow::Result<i64> {
        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(mut entry) => {
                let (value, expires) = entry.value_mut();
                if *expires <= now {
                    *value = 0;
                } else if *value > 0 {
                    *value -= 1;
                }
                Ok(*value)
            }
            None => Ok(0),
        }
    }

    fn get(&self, key: &str) -> anyhow::Result<i64> {
        let now = Instant::now();
        Ok(self
            .entries
            .get(key)
            .filter(|entry| entry.1 > now)
            .map(|entry| entry.0)
            .unwrap_or(0))
    }
}
