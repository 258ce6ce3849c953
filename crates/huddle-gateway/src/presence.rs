use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use huddle_types::{Audience, ClientEvent, Group, Identity, ServerEvent};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::bus::{Outbound, SessionHandle};
use crate::connection::{Flow, SocketSession};
use crate::context::SharedGateway;
use crate::registry::{Permit, Rejection};
use crate::session::{Decoded, decode_frame, release_blocking};

/// Per-user count of live presence sockets. Only the 0 -> 1 and 1 -> 0
/// transitions are visible to other users.
#[derive(Default)]
pub struct PresenceTracker {
    online: DashMap<Uuid, usize>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when this is the user's first live socket.
    pub fn connect(&self, user_id: Uuid) -> bool {
        let mut count = self.online.entry(user_id).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Returns true when this was the user's last live socket.
    pub fn disconnect(&self, user_id: Uuid) -> bool {
        match self.online.entry(user_id) {
            Entry::Occupied(mut entry) => {
                if *entry.get() <= 1 {
                    entry.remove();
                    true
                } else {
                    *entry.get_mut() -= 1;
                    false
                }
            }
            Entry::Vacant(_) => false,
        }
    }

    pub fn is_online(&self, user_id: Uuid) -> bool {
        self.online.contains_key(&user_id)
    }

    pub fn online_users(&self) -> Vec<Uuid> {
        self.online.iter().map(|entry| *entry.key()).collect()
    }
}

/// The global online/offline channel.
pub struct PresenceSession {
    gateway: SharedGateway,
    identity: Identity,
    handle: SessionHandle,
    permit: Option<Permit>,
    counted: bool,
}

impl PresenceSession {
    pub async fn connect(
        gateway: SharedGateway,
        token: Option<&str>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Outbound>), Rejection> {
        let identity = token
            .and_then(|t| gateway.verifier.verify(t))
            .ok_or(Rejection::Unauthenticated)?;
        let user_id = identity.user_id;

        let gw = gateway.clone();
        let permit = tokio::task::spawn_blocking(move || gw.registry.admit(user_id))
            .await
            .map_err(|_| Rejection::Internal)??;

        let (handle, rx) = SessionHandle::new(user_id);
        Ok((
            Self {
                gateway,
                identity,
                handle,
                permit: Some(permit),
                counted: false,
            },
            rx,
        ))
    }

    /// Joins the presence group and counts this socket. The user is
    /// announced to everyone else on their first socket.
    pub fn subscribe(&mut self) {
        let user_id = self.identity.user_id;
        self.gateway.bus.join(Group::Presence, &self.handle);
        if self.counted {
            return;
        }
        self.counted = true;
        if self.gateway.presence.connect(user_id) {
            info!("{} is online", self.identity.username);
            self.gateway.bus.publish(
                Group::Presence,
                Audience::AllExcept(user_id),
                ServerEvent::UserOnline { user_id },
            );
        }
    }

    /// Sends `user.online` for everyone else already online. Taken after
    /// [`subscribe`](Self::subscribe), so an arrival in between shows up at
    /// least once.
    pub fn send_snapshot(&self) {
        let user_id = self.identity.user_id;
        for other in self.gateway.presence.online_users() {
            if other != user_id {
                self.handle.send(ServerEvent::UserOnline { user_id: other });
            }
        }
    }
}

#[async_trait]
impl SocketSession for PresenceSession {
    fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    fn describe(&self) -> String {
        format!("{} ({}) on presence", self.identity.username, self.identity.user_id)
    }

    async fn on_open(&mut self) {
        self.subscribe();
        self.send_snapshot();
    }

    async fn on_text(&mut self, text: &str) -> Flow {
        match decode_frame(text, self.gateway.config.max_payload_bytes) {
            Decoded::Close(code) => Flow::Close(code),
            Decoded::Reply(reply) => {
                self.handle.send(reply);
                Flow::Continue
            }
            Decoded::Event(ClientEvent::Ping) => {
                self.handle.send(ServerEvent::Pong { timestamp: Utc::now() });
                Flow::Continue
            }
            Decoded::Event(other) => {
                debug!("Ignoring {:?} on presence channel", other);
                Flow::Continue
            }
        }
    }

    async fn on_close(&mut self) {
        let user_id = self.identity.user_id;
        self.gateway.bus.leave(Group::Presence, self.handle.id());
        if std::mem::take(&mut self.counted) && self.gateway.presence.disconnect(user_id) {
            info!("{} is offline", self.identity.username);
            self.gateway.bus.publish(
                Group::Presence,
                Audience::AllExcept(user_id),
                ServerEvent::UserOffline { user_id },
            );
        }
        if let Some(permit) = self.permit.take() {
            release_blocking(permit).await;
        }
    }
}
