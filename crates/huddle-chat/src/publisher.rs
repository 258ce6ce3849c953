use std::sync::Mutex;

use huddle_types::{Audience, Group, ServerEvent};
use thiserror::Error;
use tracing::{trace, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("broadcast bus unavailable: {0}")]
    Unavailable(String),
}

/// Outbound seam of the chat services. Implemented by the gateway's
/// broadcast bus; delivery is best-effort and at-most-once.
pub trait EventPublisher: Send + Sync {
    /// Returns how many live sessions the event was handed to.
    fn publish(
        &self,
        group: Group,
        audience: Audience,
        event: ServerEvent,
    ) -> Result<usize, PublishError>;

    /// Stops delivering `group` events to any live session of `user_id`.
    /// Returns how many sessions were detached.
    fn detach_user(&self, _group: Group, _user_id: Uuid) -> usize {
        0
    }
}

/// Publishes after a commit. Failures are logged and swallowed: the write
/// already happened and clients recover on their next fetch.
pub(crate) fn publish_logged(
    publisher: &dyn EventPublisher,
    group: Group,
    audience: Audience,
    event: ServerEvent,
) {
    let kind = event.kind();
    match publisher.publish(group, audience, event) {
        Ok(delivered) => trace!("{} -> {} ({} sessions)", kind, group, delivered),
        Err(e) => warn!("Dropping {} for {}: {}", kind, group, e),
    }
}

/// Keeps every published event in memory, in order.
#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<(Group, Audience, ServerEvent)>>,
    detached: Mutex<Vec<(Group, Uuid)>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<(Group, Audience, ServerEvent)> {
        match self.events.lock() {
            Ok(mut events) => std::mem::take(&mut *events),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }

    /// Users detached from groups, in order.
    pub fn detached(&self) -> Vec<(Group, Uuid)> {
        match self.detached.lock() {
            Ok(detached) => detached.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Events published to `group`, with their audience.
    pub fn to_group(&self, group: Group) -> Vec<(Audience, ServerEvent)> {
        let events = match self.events.lock() {
            Ok(events) => events,
            Err(poisoned) => poisoned.into_inner(),
        };
        events
            .iter()
            .filter(|(g, _, _)| *g == group)
            .map(|(_, a, e)| (*a, e.clone()))
            .collect()
    }
}

impl EventPublisher for RecordingPublisher {
    fn publish(
        &self,
        group: Group,
        audience: Audience,
        event: ServerEvent,
    ) -> Result<usize, PublishError> {
        let mut events = self
            .events
            .lock()
            .map_err(|_| PublishError::Unavailable("recorder poisoned".into()))?;
        events.push((group, audience, event));
        Ok(1)
    }

    fn detach_user(&self, group: Group, user_id: Uuid) -> usize {
        match self.detached.lock() {
            Ok(mut detached) => detached.push((group, user_id)),
            Err(poisoned) => poisoned.into_inner().push((group, user_id)),
        }
        1
    }
}
