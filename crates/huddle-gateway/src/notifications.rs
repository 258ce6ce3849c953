use async_trait::async_trait;
use chrono::Utc;
use huddle_types::{ClientEvent, Group, Identity, ServerEvent};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bus::{Outbound, SessionHandle};
use crate::connection::{Flow, SocketSession};
use crate::context::SharedGateway;
use crate::registry::{Permit, Rejection};
use crate::session::{Decoded, SessionError, blocking, decode_frame, release_blocking};

/// A user's personal channel: notification badge and cross-thread unread
/// totals.
pub struct NotificationSession {
    gateway: SharedGateway,
    identity: Identity,
    handle: SessionHandle,
    permit: Option<Permit>,
}

impl NotificationSession {
    /// Only the owner of `user_id` may subscribe to it.
    pub async fn connect(
        gateway: SharedGateway,
        token: Option<&str>,
        user_id: Uuid,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Outbound>), Rejection> {
        let identity = token
            .and_then(|t| gateway.verifier.verify(t))
            .ok_or(Rejection::Unauthenticated)?;
        if identity.user_id != user_id {
            warn!("{} tried to subscribe to notifications of {}", identity.user_id, user_id);
            return Err(Rejection::Forbidden);
        }

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
            },
            rx,
        ))
    }

    async fn initial_counts(&self) -> Result<(i64, i64), SessionError> {
        let gw = self.gateway.clone();
        let user_id = self.identity.user_id;
        blocking(move || {
            let notifications = gw.services.notifications.unread_count(user_id)?;
            let unread = gw.services.messaging.total_unread(user_id)?;
            Ok((notifications, unread))
        })
        .await
    }

    /// Read-state actions. Count changes also reach every open notification
    /// socket of the user through the bus.
    async fn dispatch(&self, event: ClientEvent) -> Result<Option<ServerEvent>, SessionError> {
        let gw = self.gateway.clone();
        let user_id = self.identity.user_id;
        match event {
            ClientEvent::Ping => Ok(Some(ServerEvent::Pong { timestamp: Utc::now() })),
            ClientEvent::MarkRead { notification_id } => {
                let notification_id = notification_id
                    .ok_or_else(|| SessionError::Validation("notification_id is required".into()))?;
                blocking(move || {
                    gw.services.notifications.mark_read(user_id, notification_id)?;
                    Ok(())
                })
                .await?;
                Ok(Some(ServerEvent::NotificationMarkedRead { notification_id }))
            }
            ClientEvent::MarkAllRead => {
                let count =
                    blocking(move || Ok(gw.services.notifications.mark_all_read(user_id)?)).await?;
                Ok(Some(ServerEvent::AllNotificationsMarkedRead { count }))
            }
            ClientEvent::GetUnreadCount => {
                let count =
                    blocking(move || Ok(gw.services.notifications.unread_count(user_id)?)).await?;
                Ok(Some(ServerEvent::NotificationCount {
                    count,
                    timestamp: Utc::now(),
                }))
            }
            other => {
                debug!("Unsupported {} on notification channel", other.kind());
                Err(SessionError::Unsupported(other.kind()))
            }
        }
    }
}

#[async_trait]
impl SocketSession for NotificationSession {
    fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    fn describe(&self) -> String {
        format!("{} ({}) on notifications", self.identity.username, self.identity.user_id)
    }

    async fn on_open(&mut self) {
        self.gateway.bus.join(Group::User(self.identity.user_id), &self.handle);
        match self.initial_counts().await {
            Ok((count, total_unread)) => {
                self.handle.send(ServerEvent::NotificationCount {
                    count,
                    timestamp: Utc::now(),
                });
                self.handle.send(ServerEvent::UnreadCountsInitial { total_unread });
            }
            Err(e) => {
                self.handle.send(e.to_event());
            }
        }
    }

    async fn on_text(&mut self, text: &str) -> Flow {
        match decode_frame(text, self.gateway.config.max_payload_bytes) {
            Decoded::Close(code) => Flow::Close(code),
            Decoded::Reply(reply) => {
                self.handle.send(reply);
                Flow::Continue
            }
            Decoded::Event(event) => {
                match self.dispatch(event).await {
                    Ok(Some(reply)) => {
                        self.handle.send(reply);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        debug!("{} notification action failed: {}", self.identity.user_id, e);
                        self.handle.send(e.to_event());
                    }
                }
                Flow::Continue
            }
        }
    }

    async fn on_close(&mut self) {
        self.gateway.bus.leave(Group::User(self.identity.user_id), self.handle.id());
        if let Some(permit) = self.permit.take() {
            release_blocking(permit).await;
        }
    }
}
