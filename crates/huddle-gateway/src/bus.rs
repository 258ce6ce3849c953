use std::sync::Arc;

use dashmap::DashMap;
use huddle_chat::{EventPublisher, PublishError};
use huddle_types::{Audience, Group, ServerEvent};
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

/// What a session's writer task sends down the socket.
#[derive(Debug, Clone)]
pub enum Outbound {
    Event(ServerEvent),
    Close { code: u16, reason: String },
}

/// A live socket as seen by the bus: who it belongs to and where to push.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: Uuid,
    user_id: Uuid,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl SessionHandle {
    /// Creates a handle and the receiver its writer task drains.
    pub fn new(user_id: Uuid) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                id: Uuid::new_v4(),
                user_id,
                tx,
            },
            rx,
        )
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    /// Queues an event for this socket only. False once the writer is gone.
    pub fn send(&self, event: ServerEvent) -> bool {
        self.tx.send(Outbound::Event(event)).is_ok()
    }

    pub fn close(&self, code: u16, reason: impl Into<String>) -> bool {
        self.tx
            .send(Outbound::Close {
                code,
                reason: reason.into(),
            })
            .is_ok()
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// In-process fan-out of server events to named groups of sessions.
/// Delivery is at-most-once with no replay; each subscriber receives events
/// in publish order.
#[derive(Clone, Default)]
pub struct GroupBroadcastBus {
    inner: Arc<BusInner>,
}

#[derive(Default)]
struct BusInner {
    groups: DashMap<Group, Vec<SessionHandle>>,
}

impl GroupBroadcastBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a session to a group. Joining twice is a no-op.
    pub fn join(&self, group: Group, session: &SessionHandle) {
        let mut members = self.inner.groups.entry(group).or_default();
        if !members.iter().any(|m| m.id == session.id) {
            members.push(session.clone());
            trace!("session {} joined {}", session.id, group);
        }
    }

    pub fn leave(&self, group: Group, session_id: Uuid) {
        if let Some(mut members) = self.inner.groups.get_mut(&group) {
            members.retain(|m| m.id != session_id);
        }
        self.inner.groups.remove_if(&group, |_, members| members.is_empty());
        trace!("session {} left {}", session_id, group);
    }

    /// Drops every session of `user_id` from `group`. The sockets stay open;
    /// they just stop receiving the group's events. Returns how many were
    /// dropped.
    pub fn evict_user(&self, group: Group, user_id: Uuid) -> usize {
        let evicted = match self.inner.groups.get_mut(&group) {
            Some(mut members) => {
                let before = members.len();
                members.retain(|m| m.user_id != user_id);
                before - members.len()
            }
            None => 0,
        };
        self.inner.groups.remove_if(&group, |_, members| members.is_empty());
        if evicted > 0 {
            debug!("Evicted {} sessions of {} from {}", evicted, user_id, group);
        }
        evicted
    }

    /// Sends `event` to every member of `group` selected by `audience`.
    /// Members whose socket is gone are pruned. Returns the number of
    /// sessions the event was queued for.
    pub fn publish(&self, group: Group, audience: Audience, event: ServerEvent) -> usize {
        let delivered = match self.inner.groups.get_mut(&group) {
            Some(mut members) => {
                let mut delivered = 0;
                members.retain(|member| {
                    if member.is_closed() {
                        return false;
                    }
                    if audience.includes(member.user_id) && member.send(event.clone()) {
                        delivered += 1;
                    }
                    true
                });
                delivered
            }
            None => 0,
        };
        self.inner.groups.remove_if(&group, |_, members| members.is_empty());
        trace!("{} -> {} delivered to {}", event.kind(), group, delivered);
        delivered
    }

    /// Live sessions in a group.
    pub fn member_count(&self, group: Group) -> usize {
        self.inner.groups.get(&group).map(|m| m.len()).unwrap_or(0)
    }

    /// Groups with at least one member.
    pub fn group_count(&self) -> usize {
        self.inner.groups.len()
    }
}

impl EventPublisher for GroupBroadcastBus {
    fn publish(
        &self,
        group: Group,
        audience: Audience,
        event: ServerEvent,
    ) -> Result<usize, PublishError> {
        Ok(GroupBroadcastBus::publish(self, group, audience, event))
    }

    fn detach_user(&self, group: Group, user_id: Uuid) -> usize {
        self.evict_user(group, user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn typing(user_id: Uuid) -> ServerEvent {
        ServerEvent::TypingStop {
            thread_id: Uuid::nil(),
            user_id,
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<ServerEvent> {
        let mut out = Vec::new();
        while let Ok(Outbound::Event(e)) = rx.try_recv() {
            out.push(e);
        }
        out
    }

    #[test]
    fn events_arrive_in_publish_order() {
        let bus = GroupBroadcastBus::new();
        let group = Group::Thread(Uuid::new_v4());
        let (handle, mut rx) = SessionHandle::new(Uuid::new_v4());
        bus.join(group, &handle);

        let senders: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
        for s in &senders {
            bus.publish(group, Audience::All, typing(*s));
        }

        let received: Vec<Uuid> = drain(&mut rx)
            .into_iter()
            .map(|e| match e {
                ServerEvent::TypingStop { user_id, .. } => user_id,
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(received, senders);
    }

    #[test]
    fn audience_selects_members() {
        let bus = GroupBroadcastBus::new();
        let group = Group::Thread(Uuid::new_v4());
        let (alice, mut alice_rx) = SessionHandle::new(Uuid::new_v4());
        let (bob, mut bob_rx) = SessionHandle::new(Uuid::new_v4());
        bus.join(group, &alice);
        bus.join(group, &bob);

        let not_alice = Audience::AllExcept(alice.user_id());
        assert_eq!(bus.publish(group, not_alice, typing(alice.user_id())), 1);
        assert_eq!(bus.publish(group, Audience::Only(alice.user_id()), typing(bob.user_id())), 1);
        assert_eq!(drain(&mut alice_rx).len(), 1);
        assert_eq!(drain(&mut bob_rx).len(), 1);
    }

    #[test]
    fn closed_sessions_are_pruned_and_empty_groups_removed() {
        let bus = GroupBroadcastBus::new();
        let group = Group::User(Uuid::new_v4());
        let (handle, rx) = SessionHandle::new(Uuid::new_v4());
        bus.join(group, &handle);
        bus.join(group, &handle);
        assert_eq!(bus.member_count(group), 1);

        drop(rx);
        assert_eq!(bus.publish(group, Audience::All, typing(Uuid::nil())), 0);
        assert_eq!(bus.member_count(group), 0);
        assert_eq!(bus.group_count(), 0);
    }

    #[test]
    fn evicting_a_user_drops_all_their_sessions_only() {
        let bus = GroupBroadcastBus::new();
        let group = Group::Thread(Uuid::new_v4());
        let bob = Uuid::new_v4();
        let (phone, mut phone_rx) = SessionHandle::new(bob);
        let (laptop, mut laptop_rx) = SessionHandle::new(bob);
        let (alice, mut alice_rx) = SessionHandle::new(Uuid::new_v4());
        for handle in [&phone, &laptop, &alice] {
            bus.join(group, handle);
        }

        assert_eq!(bus.evict_user(group, bob), 2);
        assert_eq!(bus.evict_user(group, bob), 0);
        assert_eq!(bus.publish(group, Audience::All, typing(Uuid::nil())), 1);
        assert!(drain(&mut phone_rx).is_empty());
        assert!(drain(&mut laptop_rx).is_empty());
        assert_eq!(drain(&mut alice_rx).len(), 1);
    }

    #[test]
    fn leaving_stops_delivery() {
        let bus = GroupBroadcastBus::new();
        let group = Group::Presence;
        let (handle, mut rx) = SessionHandle::new(Uuid::new_v4());
        bus.join(group, &handle);
        bus.leave(group, handle.id());
        assert_eq!(bus.publish(group, Audience::All, typing(Uuid::nil())), 0);
        assert!(drain(&mut rx).is_empty());
    }
}
