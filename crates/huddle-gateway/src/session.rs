use async_trait::async_trait;
use chrono::Utc;
use huddle_chat::ChatError;
use huddle_chat::validation::validate_emoji;
use huddle_types::{Audience, ClientEvent, ErrorCode, Group, Identity, ServerEvent};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use crate::bus::{Outbound, SessionHandle};
use crate::connection::{CLOSE_MESSAGE_TOO_BIG, Flow, SocketSession};
use crate::context::SharedGateway;
use crate::rate_limit::RateAction;
use crate::registry::{Permit, Rejection};

/// Failure of a single inbound event. The socket stays open; the client gets
/// an `error` event carrying [`SessionError::code`].
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("rate limit exceeded")]
    RateLimited,
    #[error("message exceeds {0} characters")]
    MessageTooLong(usize),
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0} is not supported on this channel")]
    Unsupported(&'static str),
    #[error("internal error")]
    Internal,
}

impl SessionError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SessionError::RateLimited => ErrorCode::RateLimitExceeded,
            SessionError::MessageTooLong(_) => ErrorCode::MessageTooLong,
            SessionError::Validation(_) => ErrorCode::ValidationFailed,
            SessionError::Forbidden(_) => ErrorCode::Forbidden,
            SessionError::NotFound(_) => ErrorCode::NotFound,
            SessionError::Unsupported(_) => ErrorCode::UnknownEvent,
            SessionError::Internal => ErrorCode::InternalError,
        }
    }

    pub fn to_event(&self) -> ServerEvent {
        ServerEvent::error(self.code(), self.to_string())
    }
}

impl From<ChatError> for SessionError {
    fn from(err: ChatError) -> Self {
        match err {
            ChatError::Forbidden(msg) => SessionError::Forbidden(msg),
            ChatError::Invalid(msg) => SessionError::Validation(msg),
            ChatError::NotFound(what) => SessionError::NotFound(what),
            ChatError::Storage(e) => {
                error!("Storage failure during socket event: {:#}", e);
                SessionError::Internal
            }
        }
    }
}

/// Runs storage work on the blocking pool.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, SessionError>
where
    F: FnOnce() -> Result<T, SessionError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        error!("Blocking task failed: {}", e);
        SessionError::Internal
    })?
}

/// Outcome of decoding one text frame.
pub(crate) enum Decoded {
    Event(ClientEvent),
    Reply(ServerEvent),
    Close(u16),
}

/// Size check, then JSON, then event shape. Oversized frames are never
/// parsed.
pub(crate) fn decode_frame(text: &str, max_payload_bytes: usize) -> Decoded {
    if text.len() > max_payload_bytes {
        return Decoded::Close(CLOSE_MESSAGE_TOO_BIG);
    }
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(_) => return Decoded::Reply(ServerEvent::error(ErrorCode::InvalidJson, "invalid JSON")),
    };
    let kind = match value.get("type").and_then(|t| t.as_str()) {
        Some(kind) => kind.to_string(),
        None => {
            let reply = ServerEvent::error(ErrorCode::UnknownEvent, "missing event type");
            return Decoded::Reply(reply);
        }
    };
    match serde_json::from_value::<ClientEvent>(value) {
        Ok(ClientEvent::Unknown) => Decoded::Reply(ServerEvent::error(
            ErrorCode::UnknownEvent,
            format!("unknown event type: {}", kind),
        )),
        Ok(event) => Decoded::Event(event),
        Err(e) => Decoded::Reply(ServerEvent::error(
            ErrorCode::ValidationFailed,
            format!("invalid {} event: {}", kind, e),
        )),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Admitted,
    Active,
    Closed,
}

/// One socket viewing one thread.
pub struct ThreadSession {
    gateway: SharedGateway,
    identity: Identity,
    thread_id: Uuid,
    handle: SessionHandle,
    permit: Option<Permit>,
    state: SessionState,
}

impl ThreadSession {
    /// Authenticates, takes a connection slot and checks membership. On any
    /// failure after the slot was taken, the slot is given back.
    pub async fn connect(
        gateway: SharedGateway,
        token: Option<&str>,
        thread_id: Uuid,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Outbound>), Rejection> {
        let identity = token
            .and_then(|t| gateway.verifier.verify(t))
            .ok_or(Rejection::Unauthenticated)?;
        let user_id = identity.user_id;

        let gw = gateway.clone();
        let permit = tokio::task::spawn_blocking(move || gw.registry.admit(user_id))
            .await
            .map_err(|_| Rejection::Internal)??;

        let threads = gateway.services.threads.clone();
        let membership = tokio::task::spawn_blocking(move || {
            threads.active_participant(thread_id, user_id)
        })
        .await;
        match membership {
            Ok(Ok(Some(_))) => {}
            Ok(Ok(None)) => {
                warn!("{} is not a participant of thread {}", user_id, thread_id);
                release_blocking(permit).await;
                return Err(Rejection::Forbidden);
            }
            Ok(Err(e)) => {
                error!("Membership check failed for {} in {}: {}", user_id, thread_id, e);
                release_blocking(permit).await;
                return Err(Rejection::Internal);
            }
            Err(e) => {
                error!("Membership check panicked: {}", e);
                release_blocking(permit).await;
                return Err(Rejection::Internal);
            }
        }

        let (handle, rx) = SessionHandle::new(user_id);
        Ok((
            Self {
                gateway,
                identity,
                thread_id,
                handle,
                permit: Some(permit),
                state: SessionState::Admitted,
            },
            rx,
        ))
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Joins the thread group and announces the effective limits.
    pub fn activate(&mut self) {
        if self.state != SessionState::Admitted {
            return;
        }
        self.gateway.bus.join(Group::Thread(self.thread_id), &self.handle);
        let config = &self.gateway.config;
        self.handle.send(ServerEvent::ConnectionEstablished {
            thread_id: self.thread_id,
            user_id: self.identity.user_id,
            rate_limits: self.gateway.limiter.limits(),
            max_payload_bytes: config.max_payload_bytes,
            max_message_length: config.max_message_length,
        });
        self.state = SessionState::Active;
    }

    /// Handles one inbound text frame.
    pub async fn handle_text(&mut self, text: &str) -> Flow {
        if self.state != SessionState::Active {
            return Flow::Continue;
        }
        match decode_frame(text, self.gateway.config.max_payload_bytes) {
            Decoded::Close(code) => {
                warn!(
                    "{} sent {} bytes to thread {} (max {}), closing",
                    self.identity.user_id,
                    text.len(),
                    self.thread_id,
                    self.gateway.config.max_payload_bytes
                );
                Flow::Close(code)
            }
            Decoded::Reply(reply) => {
                debug!("{} sent a malformed frame: {}", self.identity.user_id, reply.kind());
                self.handle.send(reply);
                Flow::Continue
            }
            Decoded::Event(event) => {
                if let Err(e) = self.dispatch(event).await {
                    debug!("{} event failed: {}", self.identity.user_id, e);
                    self.handle.send(e.to_event());
                }
                Flow::Continue
            }
        }
    }

    async fn dispatch(&mut self, event: ClientEvent) -> Result<(), SessionError> {
        let user_id = self.identity.user_id;
        let thread_id = self.thread_id;

        match event {
            ClientEvent::MessageSend {
                content,
                reply_to,
                attachment_ids,
            } => {
                let gw = self.gateway.clone();
                let sender = self.identity.clone();
                blocking(move || {
                    if !gw.limiter.check(sender.user_id, RateAction::MessageSend) {
                        return Err(SessionError::RateLimited);
                    }
                    let max = gw.config.max_message_length;
                    if content.chars().count() > max {
                        return Err(SessionError::MessageTooLong(max));
                    }
                    gw.services
                        .messaging
                        .create_message(thread_id, &sender, &content, reply_to, &attachment_ids)?;
                    Ok(())
                })
                .await
            }

            ClientEvent::TypingStart => {
                let gw = self.gateway.clone();
                let allowed = blocking(move || {
                    require_member(&gw, thread_id, user_id)?;
                    Ok(gw.limiter.check(user_id, RateAction::Typing))
                })
                .await?;
                if !allowed {
                    trace!("Dropping typing.start from {}", user_id);
                    return Ok(());
                }
                self.gateway.bus.publish(
                    Group::Thread(thread_id),
                    Audience::AllExcept(user_id),
                    ServerEvent::TypingStart {
                        thread_id,
                        user_id,
                        username: self.identity.username.clone(),
                    },
                );
                Ok(())
            }

            ClientEvent::TypingStop => {
                let gw = self.gateway.clone();
                blocking(move || require_member(&gw, thread_id, user_id)).await?;
                self.publish_typing_stop();
                Ok(())
            }

            ClientEvent::MessageRead { message_id } => {
                let gw = self.gateway.clone();
                blocking(move || {
                    gw.services.messaging.mark_as_read(thread_id, user_id, message_id)?;
                    Ok(())
                })
                .await
            }

            ClientEvent::ReactionAdd { message_id, emoji } => {
                validate_emoji(&emoji)?;
                let gw = self.gateway.clone();
                blocking(move || {
                    if !gw.limiter.check(user_id, RateAction::Reaction) {
                        return Err(SessionError::RateLimited);
                    }
                    gw.services
                        .messaging
                        .add_reaction(thread_id, message_id, user_id, &emoji)?;
                    Ok(())
                })
                .await
            }

            ClientEvent::ReactionRemove { message_id, emoji } => {
                validate_emoji(&emoji)?;
                let gw = self.gateway.clone();
                blocking(move || {
                    gw.services
                        .messaging
                        .remove_reaction(thread_id, message_id, user_id, &emoji)?;
                    Ok(())
                })
                .await
            }

            ClientEvent::Ping => {
                self.handle.send(ServerEvent::Pong { timestamp: Utc::now() });
                Ok(())
            }

            other @ (ClientEvent::MarkRead { .. }
            | ClientEvent::MarkAllRead
            | ClientEvent::GetUnreadCount) => Err(SessionError::Unsupported(other.kind())),
            ClientEvent::Unknown => Err(SessionError::Validation("unknown event".into())),
        }
    }

    fn publish_typing_stop(&self) {
        self.gateway.bus.publish(
            Group::Thread(self.thread_id),
            Audience::AllExcept(self.identity.user_id),
            ServerEvent::TypingStop {
                thread_id: self.thread_id,
                user_id: self.identity.user_id,
            },
        );
    }

    /// Tears the session down: stop typing, leave the group, give the slot
    /// back. Each step runs regardless of the others. Safe to call twice.
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        if self.state == SessionState::Active {
            self.publish_typing_stop();
        }
        self.gateway.bus.leave(Group::Thread(self.thread_id), self.handle.id());
        if let Some(permit) = self.permit.take() {
            release_blocking(permit).await;
        }
        self.state = SessionState::Closed;
    }
}

/// Membership is re-checked per event: a member removed after connecting
/// keeps the socket but may not act in the thread.
fn require_member(gw: &SharedGateway, thread_id: Uuid, user_id: Uuid) -> Result<(), SessionError> {
    match gw.services.threads.active_participant(thread_id, user_id)? {
        Some(_) => Ok(()),
        None => Err(SessionError::Forbidden(
            "you are not a participant of this thread".into(),
        )),
    }
}

/// Gives a connection slot back off the async runtime. If the blocking pool
/// is gone the permit is dropped here, which releases it inline.
pub(crate) async fn release_blocking(permit: Permit) {
    if let Err(e) = tokio::task::spawn_blocking(move || permit.release()).await {
        warn!("Connection slot release task failed: {}", e);
    }
}

#[async_trait]
impl SocketSession for ThreadSession {
    fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    fn describe(&self) -> String {
        format!(
            "{} ({}) on thread {}",
            self.identity.username, self.identity.user_id, self.thread_id
        )
    }

    async fn on_open(&mut self) {
        self.activate();
    }

    async fn on_text(&mut self, text: &str) -> Flow {
        self.handle_text(text).await
    }

    async fn on_close(&mut self) {
        self.close().await;
    }
}
