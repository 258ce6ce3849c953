use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{GroupSettings, Message, Thread};

/// Broadcast groups a live session can join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Group {
    /// Every socket currently viewing a thread.
    Thread(Uuid),
    /// A user's personal channel (badge counts, unread totals).
    User(Uuid),
    /// Global online/offline channel.
    Presence,
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Group::Thread(id) => write!(f, "thread:{}", id),
            Group::User(id) => write!(f, "user:{}", id),
            Group::Presence => f.write_str("presence:global"),
        }
    }
}

/// Which members of a group receive a published event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    All,
    AllExcept(Uuid),
    Only(Uuid),
}

impl Audience {
    pub fn includes(&self, user_id: Uuid) -> bool {
        match self {
            Audience::All => true,
            Audience::AllExcept(excluded) => *excluded != user_id,
            Audience::Only(target) => *target == user_id,
        }
    }
}

/// A fixed-window limit: `limit` events per `window_secs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub limit: u32,
    pub window_secs: u64,
}

impl RateLimit {
    pub const fn new(limit: u32, window_secs: u64) -> Self {
        Self { limit, window_secs }
    }
}

/// Per-action limits applied to a thread session. Sent to the client on
/// connect so it can throttle itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimits {
    pub message_send: RateLimit,
    pub reaction: RateLimit,
    pub typing: RateLimit,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            message_send: RateLimit::new(60, 60),
            reaction: RateLimit::new(120, 60),
            typing: RateLimit::new(30, 60),
        }
    }
}

/// Stable error codes carried by `error` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    RateLimitExceeded,
    PayloadTooLarge,
    MessageTooLong,
    ValidationFailed,
    Forbidden,
    NotFound,
    UnknownEvent,
    InvalidJson,
    InternalError,
}

/// Events sent FROM client TO server over a WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "message.send")]
    MessageSend {
        #[serde(default)]
        content: String,
        #[serde(default)]
        reply_to: Option<Uuid>,
        #[serde(default)]
        attachment_ids: Vec<Uuid>,
    },

    #[serde(rename = "typing.start")]
    TypingStart,

    #[serde(rename = "typing.stop")]
    TypingStop,

    /// Mark the thread read, up to `message_id` when given.
    #[serde(rename = "message.read")]
    MessageRead {
        #[serde(default)]
        message_id: Option<Uuid>,
    },

    #[serde(rename = "reaction.add")]
    ReactionAdd { message_id: Uuid, emoji: String },

    #[serde(rename = "reaction.remove")]
    ReactionRemove { message_id: Uuid, emoji: String },

    /// Heartbeat used by the auxiliary channels.
    #[serde(rename = "ping")]
    Ping,

    /// Notification channel: mark one notification read.
    #[serde(rename = "mark_read")]
    MarkRead {
        #[serde(default)]
        notification_id: Option<Uuid>,
    },

    #[serde(rename = "mark_all_read")]
    MarkAllRead,

    #[serde(rename = "get_unread_count")]
    GetUnreadCount,

    #[serde(other)]
    Unknown,
}

impl ClientEvent {
    /// Wire name of the event. `Unknown` has none of its own.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MessageSend { .. } => "message.send",
            Self::TypingStart => "typing.start",
            Self::TypingStop => "typing.stop",
            Self::MessageRead { .. } => "message.read",
            Self::ReactionAdd { .. } => "reaction.add",
            Self::ReactionRemove { .. } => "reaction.remove",
            Self::Ping => "ping",
            Self::MarkRead { .. } => "mark_read",
            Self::MarkAllRead => "mark_all_read",
            Self::GetUnreadCount => "get_unread_count",
            Self::Unknown => "unknown",
        }
    }
}

/// Events sent FROM server TO clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// Thread session admitted; carries the caller's effective limits.
    #[serde(rename = "connection.established")]
    ConnectionEstablished {
        thread_id: Uuid,
        user_id: Uuid,
        rate_limits: RateLimits,
        max_payload_bytes: usize,
        max_message_length: usize,
    },

    #[serde(rename = "message.new")]
    MessageNew { message: Message },

    #[serde(rename = "message.updated")]
    MessageUpdated { message: Message },

    /// Deletions carry only the id; subscribers drop it from view.
    #[serde(rename = "message.deleted")]
    MessageDeleted { thread_id: Uuid, message_id: Uuid },

    #[serde(rename = "typing.start")]
    TypingStart {
        thread_id: Uuid,
        user_id: Uuid,
        username: String,
    },

    #[serde(rename = "typing.stop")]
    TypingStop { thread_id: Uuid, user_id: Uuid },

    #[serde(rename = "receipt.read")]
    ReceiptRead {
        thread_id: Uuid,
        user_id: Uuid,
        message_id: Option<Uuid>,
    },

    #[serde(rename = "reaction.added")]
    ReactionAdded {
        thread_id: Uuid,
        message_id: Uuid,
        user_id: Uuid,
        emoji: String,
    },

    #[serde(rename = "reaction.removed")]
    ReactionRemoved {
        thread_id: Uuid,
        message_id: Uuid,
        user_id: Uuid,
        emoji: String,
    },

    /// Per-thread unread count, delivered only to the owning user.
    #[serde(rename = "unread.count.update")]
    UnreadCountUpdate { thread_id: Uuid, unread_count: i64 },

    /// Personal-channel unread update with the cross-thread total.
    #[serde(rename = "chat.unread.update")]
    ChatUnreadUpdate {
        thread_id: Uuid,
        unread_count: i64,
        total_unread: i64,
    },

    #[serde(rename = "unread.counts.initial")]
    UnreadCountsInitial { total_unread: i64 },

    #[serde(rename = "notification.count")]
    NotificationCount {
        count: i64,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "user.online")]
    UserOnline { user_id: Uuid },

    #[serde(rename = "user.offline")]
    UserOffline { user_id: Uuid },

    #[serde(rename = "group.settings.updated")]
    GroupSettingsUpdated {
        thread_id: Uuid,
        settings: GroupSettings,
        updated_by: Uuid,
    },

    #[serde(rename = "member.added")]
    MemberAdded {
        thread_id: Uuid,
        user_id: Uuid,
        added_by: Uuid,
    },

    /// Sent to the thread before the removed user's sockets are detached,
    /// so they see it too. `removed_by` is absent when the user left.
    #[serde(rename = "member.removed")]
    MemberRemoved {
        thread_id: Uuid,
        user_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        removed_by: Option<Uuid>,
    },

    /// Title or archive state changed.
    #[serde(rename = "thread.updated")]
    ThreadUpdated { thread: Thread, updated_by: Uuid },

    #[serde(rename = "notification_marked_read")]
    NotificationMarkedRead { notification_id: Uuid },

    #[serde(rename = "all_notifications_marked_read")]
    AllNotificationsMarkedRead { count: usize },

    #[serde(rename = "pong")]
    Pong { timestamp: DateTime<Utc> },

    #[serde(rename = "error")]
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<ErrorCode>,
        message: String,
    },
}

impl ServerEvent {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code: Some(code),
            message: message.into(),
        }
    }

    /// Wire name of the event, as found in its `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionEstablished { .. } => "connection.established",
            Self::MessageNew { .. } => "message.new",
            Self::MessageUpdated { .. } => "message.updated",
            Self::MessageDeleted { .. } => "message.deleted",
            Self::TypingStart { .. } => "typing.start",
            Self::TypingStop { .. } => "typing.stop",
            Self::ReceiptRead { .. } => "receipt.read",
            Self::ReactionAdded { .. } => "reaction.added",
            Self::ReactionRemoved { .. } => "reaction.removed",
            Self::UnreadCountUpdate { .. } => "unread.count.update",
            Self::ChatUnreadUpdate { .. } => "chat.unread.update",
            Self::UnreadCountsInitial { .. } => "unread.counts.initial",
            Self::NotificationCount { .. } => "notification.count",
            Self::UserOnline { .. } => "user.online",
            Self::UserOffline { .. } => "user.offline",
            Self::GroupSettingsUpdated { .. } => "group.settings.updated",
            Self::MemberAdded { .. } => "member.added",
            Self::MemberRemoved { .. } => "member.removed",
            Self::ThreadUpdated { .. } => "thread.updated",
            Self::NotificationMarkedRead { .. } => "notification_marked_read",
            Self::AllNotificationsMarkedRead { .. } => "all_notifications_marked_read",
            Self::Pong { .. } => "pong",
            Self::Error { .. } => "error",
        }
    }
}
