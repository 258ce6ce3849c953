use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use huddle_types::events::{RateLimit, RateLimits};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::counters::CounterStore;

/// Rate-limited client actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateAction {
    MessageSend,
    Reaction,
    Typing,
}

impl RateAction {
    pub fn as_str(self) -> &'static str {
        match self {
            RateAction::MessageSend => "message_send",
            RateAction::Reaction => "reaction",
            RateAction::Typing => "typing",
        }
    }

    fn limit(self, limits: &RateLimits) -> RateLimit {
        match self {
            RateAction::MessageSend => limits.message_send,
            RateAction::Reaction => limits.reaction,
            RateAction::Typing => limits.typing,
        }
    }
}

/// Fixed-window limiter over a shared [`CounterStore`]. Each window is its
/// own bucket key, so a burst straddling a boundary can reach twice the
/// limit. If the store fails the event is allowed.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    limits: RateLimits,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, limits: RateLimits) -> Self {
        Self { store, limits }
    }

    pub fn limits(&self) -> RateLimits {
        self.limits
    }

    /// Applies the configured limit for `action`.
    pub fn check(&self, user_id: Uuid, action: RateAction) -> bool {
        let RateLimit { limit, window_secs } = action.limit(&self.limits);
        self.allowed(user_id, action.as_str(), limit, window_secs)
    }

    /// Counts one event and reports whether it is within `limit` for the
    /// current window.
    pub fn allowed(&self, user_id: Uuid, action: &str, limit: u32, window_secs: u64) -> bool {
        self.allowed_at(user_id, action, limit, window_secs, Utc::now().timestamp())
    }

    /// [`allowed`](Self::allowed) with an explicit clock, in unix seconds.
    pub fn allowed_at(
        &self,
        user_id: Uuid,
        action: &str,
        limit: u32,
        window_secs: u64,
        now: i64,
    ) -> bool {
        let window = window_secs.max(1);
        let bucket = now.div_euclid(window as i64);
        let key = format!("rate:{}:{}:{}", action, user_id, bucket);

        match self.store.incr(&key, Duration::from_secs(window)) {
            Ok(count) if count <= i64::from(limit) => true,
            Ok(count) => {
                debug!("Rate limit hit: {} {} ({} > {})", user_id, action, count, limit);
                false
            }
            Err(e) => {
                warn!("Rate limiter store failed for {} {}, allowing: {}", user_id, action, e);
                true
            }
        }
    }
}
