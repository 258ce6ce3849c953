use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::counters::CounterStore;

pub const CLOSE_UNAUTHENTICATED: u16 = 4001;
pub const CLOSE_FORBIDDEN: u16 = 4003;
pub const CLOSE_CAPACITY_EXCEEDED: u16 = 4008;
pub const CLOSE_INTERNAL: u16 = 1011;

/// Why a socket was refused before it became active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("authentication required")]
    Unauthenticated,
    #[error("access denied")]
    Forbidden,
    #[error("too many connections")]
    CapacityExceeded,
    #[error("server error")]
    Internal,
}

impl Rejection {
    pub fn close_code(self) -> u16 {
        match self {
            Rejection::Unauthenticated => CLOSE_UNAUTHENTICATED,
            Rejection::Forbidden => CLOSE_FORBIDDEN,
            Rejection::CapacityExceeded => CLOSE_CAPACITY_EXCEEDED,
            Rejection::Internal => CLOSE_INTERNAL,
        }
    }
}

fn connection_key(user_id: Uuid) -> String {
    format!("conn:{}", user_id)
}

/// Caps concurrent sockets per user using a shared counter.
#[derive(Clone)]
pub struct ConnectionRegistry {
    store: Arc<dyn CounterStore>,
    max_per_user: usize,
    ttl: Duration,
}

impl ConnectionRegistry {
    pub fn new(store: Arc<dyn CounterStore>, max_per_user: usize, ttl: Duration) -> Self {
        Self {
            store,
            max_per_user,
            ttl,
        }
    }

    /// Counts the connection first, then backs it out if the user is over
    /// the cap. The returned permit gives the slot back when released or
    /// dropped.
    pub fn admit(&self, user_id: Uuid) -> Result<Permit, Rejection> {
        let key = connection_key(user_id);
        let count = self.store.incr(&key, self.ttl).map_err(|e| {
            warn!("Connection counter unavailable for {}: {}", user_id, e);
            Rejection::Internal
        })?;

        let permit = Permit {
            user_id,
            key,
            store: self.store.clone(),
            released: AtomicBool::new(false),
        };
        if count > self.max_per_user as i64 {
            warn!("{} rejected: {} connections (max {})", user_id, count, self.max_per_user);
            permit.release();
            return Err(Rejection::CapacityExceeded);
        }

        debug!("{} admitted ({} of {})", user_id, count, self.max_per_user);
        Ok(permit)
    }

    pub fn current(&self, user_id: Uuid) -> i64 {
        self.store.get(&connection_key(user_id)).unwrap_or(0)
    }
}

/// One admitted connection slot. Releasing is idempotent and also happens on
/// drop.
pub struct Permit {
    user_id: Uuid,
    key: String,
    store: Arc<dyn CounterStore>,
    released: AtomicBool,
}

impl Permit {
    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.store.decr(&self.key) {
            warn!("Failed to release connection slot for {}: {}", self.user_id, e);
        }
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Permit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Permit")
            .field("user_id", &self.user_id)
            .field("released", &self.released.load(Ordering::Acquire))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::MemoryCounters;

    fn registry(max: usize) -> ConnectionRegistry {
        ConnectionRegistry::new(Arc::new(MemoryCounters::new()), max, Duration::from_secs(3600))
    }

    #[test]
    fn eleventh_connection_is_rejected_until_one_is_released() {
        let registry = registry(10);
        let user = Uuid::new_v4();

        let mut permits: Vec<Permit> = (0..10).map(|_| registry.admit(user).unwrap()).collect();
        assert_eq!(registry.admit(user).unwrap_err(), Rejection::CapacityExceeded);
        assert_eq!(registry.current(user), 10);

        permits.pop().unwrap().release();
        assert_eq!(registry.current(user), 9);
        permits.push(registry.admit(user).unwrap());
        assert_eq!(registry.current(user), 10);
    }

    #[test]
    fn release_is_idempotent_and_drop_releases() {
        let registry = registry(2);
        let user = Uuid::new_v4();

        let permit = registry.admit(user).unwrap();
        permit.release();
        permit.release();
        assert_eq!(registry.current(user), 0);
        drop(permit);
        assert_eq!(registry.current(user), 0);

        {
            let _held = registry.admit(user).unwrap();
            assert_eq!(registry.current(user), 1);
        }
        assert_eq!(registry.current(user), 0);
    }

    #[test]
    fn caps_are_per_user() {
        let registry = registry(1);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let _a = registry.admit(a).unwrap();
        assert!(registry.admit(b).is_ok());
        assert_eq!(registry.admit(a).unwrap_err(), Rejection::CapacityExceeded);
    }

    #[test]
    fn rejections_map_to_close_codes() {
        assert_eq!(Rejection::Unauthenticated.close_code(), 4001);
        assert_eq!(Rejection::Forbidden.close_code(), 4003);
        assert_eq!(Rejection::CapacityExceeded.close_code(), 4008);
    }
}
