//! Permission and input rules shared by the services and the gateway.

use huddle_types::models::{GroupSettings, Participant, PostingMode, Thread, ThreadKind};
use uuid::Uuid;

use crate::error::{ChatError, ChatResult};

pub const MAX_EMOJI_CHARS: usize = 10;

/// Reaction emoji: non-empty, at most ten characters, no angle brackets.
pub fn validate_emoji(emoji: &str) -> ChatResult<()> {
    if emoji.is_empty() {
        return Err(ChatError::invalid("emoji cannot be empty"));
    }
    if emoji.chars().count() > MAX_EMOJI_CHARS {
        return Err(ChatError::invalid("emoji is too long"));
    }
    if emoji.contains(['<', '>']) {
        return Err(ChatError::invalid("emoji contains invalid characters"));
    }
    Ok(())
}

/// Direct threads accept posts from any active participant; groups in
/// admins-only mode require an owner or admin.
pub fn can_post(
    thread: &Thread,
    participant: &Participant,
    settings: Option<&GroupSettings>,
) -> bool {
    if !participant.is_active() {
        return false;
    }
    match (thread.kind, settings) {
        (ThreadKind::Direct, _) | (ThreadKind::Group, None) => true,
        (ThreadKind::Group, Some(s)) => {
            s.posting_mode == PostingMode::All || participant.role.can_moderate()
        }
    }
}

/// The sender may edit or delete their own message; owners and admins may
/// edit or delete anyone's.
pub fn can_edit(
    sender_id: Option<Uuid>,
    editor: Uuid,
    editor_membership: Option<&Participant>,
) -> bool {
    if sender_id == Some(editor) {
        return true;
    }
    editor_membership.is_some_and(|p| p.is_active() && p.role.can_moderate())
}

/// Owners and admins can always add members; plain members only when the
/// group allows it.
pub fn can_add_members(participant: &Participant, settings: Option<&GroupSettings>) -> bool {
    if participant.role.can_moderate() {
        return true;
    }
    settings.is_some_and(|s| s.members_can_add_others)
}
