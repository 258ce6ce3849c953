use std::sync::Arc;

use chrono::Utc;
use huddle_db::Database;
use huddle_db::queries::{audit, threads, users};
use huddle_types::api::{ThreadSummary, UpdateSettingsRequest};
use huddle_types::models::{
    AuditAction, AuditEntry, GroupSettings, Member, Participant, PostingMode, Role, Thread,
    ThreadKind,
};
use huddle_types::{Audience, Group, Identity, ServerEvent};
use rusqlite::Connection;
use tracing::info;
use uuid::Uuid;

use crate::audit::Audit;
use crate::error::{ChatError, ChatResult};
use crate::publisher::{EventPublisher, publish_logged};
use crate::validation;

pub const MAX_TITLE_CHARS: usize = 200;

/// Outcome of `archive_or_leave`.
#[derive(Debug)]
pub enum Departure {
    /// The caller owns the group, so it was archived for everyone.
    Archived(Thread),
    Left,
}

/// Thread lifecycle and membership.
pub struct ThreadService {
    db: Arc<Database>,
    publisher: Arc<dyn EventPublisher>,
    default_posting_mode: PostingMode,
}

impl ThreadService {
    pub fn new(db: Arc<Database>, publisher: Arc<dyn EventPublisher>) -> Self {
        Self {
            db,
            publisher,
            default_posting_mode: PostingMode::All,
        }
    }

    /// Posting mode given to newly created groups.
    pub fn with_default_posting_mode(mut self, mode: PostingMode) -> Self {
        self.default_posting_mode = mode;
        self
    }

    /// Returns the one direct thread between the two users, creating it on
    /// first use. Either user who had left is brought back. The bool is true
    /// when the thread was created by this call.
    pub fn get_or_create_direct(&self, me: &Identity, other: Uuid) -> ChatResult<(Thread, bool)> {
        if me.user_id == other {
            return Err(ChatError::invalid("cannot create a direct thread with yourself"));
        }

        let now = Utc::now();
        let (thread, created) = self.db.with_tx(|tx| -> ChatResult<(Thread, bool)> {
            users::upsert_user(tx, me.user_id, &me.username, now)?;

            if let Some(thread_id) = threads::find_direct_thread(tx, me.user_id, other)? {
                for user in [me.user_id, other] {
                    threads::upsert_participant(tx, thread_id, user, Role::Member, now)?;
                }
                let thread = threads::get_thread(tx, thread_id)?
                    .ok_or(ChatError::NotFound("thread"))?;
                return Ok((thread, false));
            }

            let thread = Thread {
                id: Uuid::new_v4(),
                kind: ThreadKind::Direct,
                title: None,
                is_archived: false,
                created_by: Some(me.user_id),
                created_at: now,
                updated_at: now,
            };
            threads::insert_thread(tx, &thread)?;
            if !threads::insert_direct_key(tx, me.user_id, other, thread.id)? {
                let claimed = anyhow::anyhow!(
                    "direct thread key for {}/{} already claimed",
                    me.user_id,
                    other
                );
                return Err(claimed.into());
            }
            for user in [me.user_id, other] {
                threads::upsert_participant(tx, thread.id, user, Role::Member, now)?;
            }
            Ok((thread, true))
        })?;

        if created {
            info!("Direct thread {} created for {} and {}", thread.id, me.user_id, other);
        }
        Ok((thread, created))
    }

    /// Creates a group owned by `creator` with `members` as plain members.
    pub fn create_group(
        &self,
        creator: &Identity,
        title: &str,
        members: &[Uuid],
    ) -> ChatResult<Thread> {
        let title = checked_title(title)?;

        let now = Utc::now();
        let thread = Thread {
            id: Uuid::new_v4(),
            kind: ThreadKind::Group,
            title: Some(title.to_string()),
            is_archived: false,
            created_by: Some(creator.user_id),
            created_at: now,
            updated_at: now,
        };
        let settings = GroupSettings {
            posting_mode: self.default_posting_mode,
            ..GroupSettings::default()
        };

        self.db.with_tx(|tx| -> ChatResult<()> {
            users::upsert_user(tx, creator.user_id, &creator.username, now)?;
            threads::insert_thread(tx, &thread)?;
            threads::insert_group_settings(tx, thread.id, &settings)?;
            threads::upsert_participant(tx, thread.id, creator.user_id, Role::Owner, now)?;
            for member in members.iter().filter(|m| **m != creator.user_id) {
                threads::upsert_participant(tx, thread.id, *member, Role::Member, now)?;
            }
            Audit::new(AuditAction::ThreadCreated, creator.user_id, thread.id)
                .details(title)
                .write(tx, now)?;
            Ok(())
        })?;

        info!(
            "Group thread {} created by {} with {} members",
            thread.id,
            creator.user_id,
            members.len()
        );
        Ok(thread)
    }

    /// Adds users to a group. Returns the users that were actually added or
    /// re-activated; existing active members are skipped. Each added user is
    /// announced to the thread with `member.added`.
    pub fn add_participants(
        &self,
        thread_id: Uuid,
        actor: Uuid,
        user_ids: &[Uuid],
    ) -> ChatResult<Vec<Uuid>> {
        let now = Utc::now();
        let added = self.db.with_tx(|tx| -> ChatResult<Vec<Uuid>> {
            let thread = load_thread(tx, thread_id)?;
            let membership = threads::get_active_participant(tx, thread_id, actor)?;
            let settings = threads::get_group_settings(tx, thread_id)?;
            let allowed = membership
                .as_ref()
                .is_some_and(|p| validation::can_add_members(p, settings.as_ref()));
            if !allowed {
                return Err(ChatError::forbidden("you don't have permission to add members"));
            }
            if thread.kind == ThreadKind::Direct {
                return Err(ChatError::invalid("cannot add participants to a direct thread"));
            }

            let mut added = Vec::new();
            for user in user_ids {
                if threads::upsert_participant(tx, thread_id, *user, Role::Member, now)? {
                    Audit::new(AuditAction::MemberAdded, actor, thread_id)
                        .target(*user)
                        .write(tx, now)?;
                    added.push(*user);
                }
            }
            Ok(added)
        })?;

        info!("Added {} participants to thread {} by {}", added.len(), thread_id, actor);
        for user_id in &added {
            publish_logged(
                self.publisher.as_ref(),
                Group::Thread(thread_id),
                Audience::All,
                ServerEvent::MemberAdded {
                    thread_id,
                    user_id: *user_id,
                    added_by: actor,
                },
            );
        }
        Ok(added)
    }

    /// Removes a member from a group. The removed user's live sessions stop
    /// receiving the thread's events once `member.removed` is out.
    pub fn remove_participant(
        &self,
        thread_id: Uuid,
        actor: Uuid,
        user_id: Uuid,
    ) -> ChatResult<()> {
        self.db.with_tx(|tx| -> ChatResult<()> {
            let thread = load_thread(tx, thread_id)?;
            require_moderator(tx, thread_id, actor, "remove members")?;
            if thread.kind == ThreadKind::Direct {
                return Err(ChatError::invalid("cannot remove participants from a direct thread"));
            }
            let target = threads::get_active_participant(tx, thread_id, user_id)?
                .ok_or(ChatError::NotFound("participant"))?;
            if target.role == Role::Owner {
                return Err(ChatError::invalid("cannot remove the thread owner"));
            }
            let now = Utc::now();
            threads::mark_participant_left(tx, thread_id, user_id, now)?;
            Audit::new(AuditAction::MemberRemoved, actor, thread_id)
                .target(user_id)
                .write(tx, now)?;
            Ok(())
        })?;

        info!("Removed {} from thread {} by {}", user_id, thread_id, actor);
        self.announce_departure(thread_id, user_id, Some(actor));
        Ok(())
    }

    /// Promotes or demotes a member. Ownership cannot be granted or taken
    /// through this call.
    pub fn change_role(
        &self,
        thread_id: Uuid,
        actor: Uuid,
        user_id: Uuid,
        role: Role,
    ) -> ChatResult<()> {
        if role == Role::Owner {
            return Err(ChatError::invalid("ownership cannot be assigned"));
        }
        self.db.with_tx(|tx| -> ChatResult<()> {
            let thread = load_thread(tx, thread_id)?;
            require_moderator(tx, thread_id, actor, "change roles")?;
            if thread.kind == ThreadKind::Direct {
                return Err(ChatError::invalid("direct threads have no roles"));
            }
            let target = threads::get_active_participant(tx, thread_id, user_id)?
                .ok_or(ChatError::NotFound("participant"))?;
            if target.role == Role::Owner {
                return Err(ChatError::invalid("the owner's role cannot be changed"));
            }
            threads::set_participant_role(tx, thread_id, user_id, role)?;
            Audit::new(AuditAction::RoleChanged, actor, thread_id)
                .target(user_id)
                .details(format!("{} -> {}", target.role, role))
                .write(tx, Utc::now())?;
            Ok(())
        })?;

        info!("Role of {} in thread {} set to {} by {}", user_id, thread_id, role, actor);
        Ok(())
    }

    pub fn leave_thread(&self, thread_id: Uuid, user_id: Uuid) -> ChatResult<()> {
        self.db.with_tx(|tx| -> ChatResult<()> {
            let thread = load_thread(tx, thread_id)?;
            let participant = threads::get_active_participant(tx, thread_id, user_id)?
                .ok_or(ChatError::NotFound("participant"))?;
            if thread.kind == ThreadKind::Group && participant.role == Role::Owner {
                return Err(ChatError::invalid("the owner cannot leave the group"));
            }
            threads::mark_participant_left(tx, thread_id, user_id, Utc::now())?;
            Ok(())
        })?;

        info!("User {} left thread {}", user_id, thread_id);
        self.announce_departure(thread_id, user_id, None);
        Ok(())
    }

    /// `DELETE /threads/{id}`: the owner of a group archives it, anyone else
    /// leaves.
    pub fn archive_or_leave(&self, thread_id: Uuid, user_id: Uuid) -> ChatResult<Departure> {
        let owns_group = self.db.with_conn(|conn| {
            let thread = threads::get_thread(conn, thread_id)?;
            let membership = threads::get_active_participant(conn, thread_id, user_id)?;
            Ok(thread.is_some_and(|t| t.kind == ThreadKind::Group)
                && membership.is_some_and(|p| p.role == Role::Owner))
        })?;
        if owns_group {
            Ok(Departure::Archived(self.archive_thread(thread_id, user_id)?))
        } else {
            self.leave_thread(thread_id, user_id)?;
            Ok(Departure::Left)
        }
    }

    /// Archives a group. Only the owner may; archiving twice is a no-op that
    /// publishes nothing.
    pub fn archive_thread(&self, thread_id: Uuid, actor: Uuid) -> ChatResult<Thread> {
        let now = Utc::now();
        let (thread, changed) = self.db.with_tx(|tx| -> ChatResult<(Thread, bool)> {
            let thread = load_thread(tx, thread_id)?;
            let owner = threads::get_active_participant(tx, thread_id, actor)?
                .is_some_and(|p| p.role == Role::Owner);
            if !owner {
                return Err(ChatError::forbidden("only the owner can archive this thread"));
            }
            if thread.kind == ThreadKind::Direct {
                return Err(ChatError::invalid("direct threads cannot be archived"));
            }
            let changed = threads::set_thread_archived(tx, thread_id, true, now)?;
            if changed {
                Audit::new(AuditAction::ThreadArchived, actor, thread_id).write(tx, now)?;
            }
            Ok((load_thread(tx, thread_id)?, changed))
        })?;

        if changed {
            info!("Thread {} archived by {}", thread_id, actor);
            self.announce_update(&thread, actor);
        }
        Ok(thread)
    }

    /// Renames a group. Owners and admins only.
    pub fn update_title(&self, thread_id: Uuid, actor: Uuid, title: &str) -> ChatResult<Thread> {
        let title = checked_title(title)?;
        let now = Utc::now();
        let thread = self.db.with_tx(|tx| -> ChatResult<Thread> {
            let thread = load_thread(tx, thread_id)?;
            require_moderator(tx, thread_id, actor, "rename this thread")?;
            if thread.kind == ThreadKind::Direct {
                return Err(ChatError::invalid("direct threads have no title"));
            }
            threads::set_thread_title(tx, thread_id, title, now)?;
            Audit::new(AuditAction::TitleChanged, actor, thread_id)
                .details(title)
                .write(tx, now)?;
            load_thread(tx, thread_id)
        })?;

        info!("Thread {} renamed by {}", thread_id, actor);
        self.announce_update(&thread, actor);
        Ok(thread)
    }

    /// Active members of a thread. Only visible to participants.
    pub fn list_members(&self, thread_id: Uuid, user_id: Uuid) -> ChatResult<Vec<Member>> {
        self.db.with_tx(|tx| -> ChatResult<Vec<Member>> {
            load_thread(tx, thread_id)?;
            if threads::get_active_participant(tx, thread_id, user_id)?.is_none() {
                return Err(ChatError::forbidden("you are not a participant of this thread"));
            }
            Ok(threads::list_members(tx, thread_id)?)
        })
    }

    /// Recent audit entries for a thread, newest first. Owners and admins only.
    pub fn audit_trail(
        &self,
        thread_id: Uuid,
        actor: Uuid,
        limit: u32,
    ) -> ChatResult<Vec<AuditEntry>> {
        self.db.with_tx(|tx| -> ChatResult<Vec<AuditEntry>> {
            load_thread(tx, thread_id)?;
            require_moderator(tx, thread_id, actor, "view the audit log")?;
            Ok(audit::list_audit_for_thread(tx, thread_id, limit)?)
        })
    }

    pub fn set_muted(&self, thread_id: Uuid, user_id: Uuid, muted: bool) -> ChatResult<()> {
        let changed = self
            .db
            .with_conn(|conn| threads::set_participant_muted(conn, thread_id, user_id, muted))?;
        if !changed {
            return Err(ChatError::NotFound("participant"));
        }
        Ok(())
    }

    /// Applies a partial settings update and broadcasts the result.
    pub fn update_group_settings(
        &self,
        thread_id: Uuid,
        actor: Uuid,
        patch: &UpdateSettingsRequest,
    ) -> ChatResult<GroupSettings> {
        let settings = self.db.with_tx(|tx| -> ChatResult<GroupSettings> {
            let thread = load_thread(tx, thread_id)?;
            require_moderator(tx, thread_id, actor, "change settings")?;
            if thread.kind == ThreadKind::Direct {
                return Err(ChatError::invalid("direct threads have no group settings"));
            }
            let mut settings = threads::get_group_settings(tx, thread_id)?.unwrap_or_default();
            if let Some(mode) = patch.posting_mode {
                settings.posting_mode = mode;
            }
            if let Some(enabled) = patch.reactions_enabled {
                settings.reactions_enabled = enabled;
            }
            if let Some(allowed) = patch.members_can_add_others {
                settings.members_can_add_others = allowed;
            }
            if threads::update_group_settings(tx, thread_id, &settings)? == 0 {
                threads::insert_group_settings(tx, thread_id, &settings)?;
            }
            Audit::new(AuditAction::SettingsChanged, actor, thread_id)
                .details(settings_summary(&settings))
                .write(tx, Utc::now())?;
            Ok(settings)
        })?;

        info!("Settings of thread {} updated by {}", thread_id, actor);
        publish_logged(
            self.publisher.as_ref(),
            Group::Thread(thread_id),
            Audience::All,
            ServerEvent::GroupSettingsUpdated {
                thread_id,
                settings: settings.clone(),
                updated_by: actor,
            },
        );
        Ok(settings)
    }

    /// The user's active threads, most recently active first. `archived`
    /// selects archived threads instead of live ones.
    pub fn list_threads(&self, user_id: Uuid, archived: bool) -> ChatResult<Vec<ThreadSummary>> {
        Ok(self.db.with_conn(|conn| {
            threads::list_threads_for_user(conn, user_id, archived)?
                .into_iter()
                .map(|(thread, participant)| summarize(conn, thread, participant))
                .collect::<anyhow::Result<Vec<_>>>()
        })?)
    }

    /// The caller's active membership in a thread, if any.
    pub fn active_participant(
        &self,
        thread_id: Uuid,
        user_id: Uuid,
    ) -> ChatResult<Option<Participant>> {
        Ok(self
            .db
            .with_conn(|conn| threads::get_active_participant(conn, thread_id, user_id))?)
    }

    /// Tells the thread a member is gone, then detaches the member's live
    /// sessions so nothing more from the thread reaches them.
    fn announce_departure(&self, thread_id: Uuid, user_id: Uuid, removed_by: Option<Uuid>) {
        let group = Group::Thread(thread_id);
        publish_logged(
            self.publisher.as_ref(),
            group,
            Audience::All,
            ServerEvent::MemberRemoved {
                thread_id,
                user_id,
                removed_by,
            },
        );
        let detached = self.publisher.detach_user(group, user_id);
        if detached > 0 {
            info!("Detached {} sessions of {} from thread {}", detached, user_id, thread_id);
        }
    }

    fn announce_update(&self, thread: &Thread, actor: Uuid) {
        publish_logged(
            self.publisher.as_ref(),
            Group::Thread(thread.id),
            Audience::All,
            ServerEvent::ThreadUpdated {
                thread: thread.clone(),
                updated_by: actor,
            },
        );
    }
}

fn checked_title(title: &str) -> ChatResult<&str> {
    let title = title.trim();
    if title.is_empty() {
        return Err(ChatError::invalid("group thread must have a title"));
    }
    if title.chars().count() > MAX_TITLE_CHARS {
        return Err(ChatError::invalid("group title is too long"));
    }
    Ok(title)
}

fn settings_summary(settings: &GroupSettings) -> String {
    format!(
        "posting_mode={} reactions_enabled={} members_can_add_others={}",
        settings.posting_mode, settings.reactions_enabled, settings.members_can_add_others
    )
}

fn load_thread(conn: &Connection, thread_id: Uuid) -> ChatResult<Thread> {
    threads::get_thread(conn, thread_id)?.ok_or(ChatError::NotFound("thread"))
}

fn require_moderator(
    conn: &Connection,
    thread_id: Uuid,
    actor: Uuid,
    action: &str,
) -> ChatResult<Participant> {
    match threads::get_active_participant(conn, thread_id, actor)? {
        Some(p) if p.role.can_moderate() => Ok(p),
        _ => Err(ChatError::forbidden(format!(
            "you don't have permission to {}",
            action
        ))),
    }
}

fn summarize(
    conn: &Connection,
    thread: Thread,
    participant: Participant,
) -> anyhow::Result<ThreadSummary> {
    let settings = match thread.kind {
        ThreadKind::Group => threads::get_group_settings(conn, thread.id)?,
        ThreadKind::Direct => None,
    };
    Ok(ThreadSummary {
        thread,
        role: participant.role,
        is_muted: participant.is_muted,
        unread_count: participant.unread_count,
        settings,
    })
}
