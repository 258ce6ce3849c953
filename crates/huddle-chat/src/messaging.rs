use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use huddle_db::Database;
use huddle_db::models::{MessageRow, NewMessage};
use huddle_db::queries::{messages, notifications, reactions, threads, users};
use huddle_types::models::{
    Attachment, AuditAction, Message, Participant, ReactionGroup, ThreadKind,
};
use huddle_types::{Audience, Group, Identity, ServerEvent};
use rusqlite::Connection;
use tracing::{debug, info};
use uuid::Uuid;

use crate::audit::Audit;
use crate::error::{ChatError, ChatResult};
use crate::notifications::{NotificationService, chat_message_notification};
use crate::publisher::{EventPublisher, publish_logged};
use crate::sanitize::{HtmlSanitizer, Sanitizer};
use crate::validation;

pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 100;

/// Unread state of one recipient after a new message.
#[derive(Debug, Clone, Copy)]
struct UnreadChange {
    user_id: Uuid,
    unread_count: i64,
    total_unread: i64,
}

/// What `create_message` committed, kept until the events go out.
struct Created {
    message: Message,
    unread: Vec<UnreadChange>,
    notified: Vec<(Uuid, i64)>,
}

/// Sole writer of messages, reactions and unread counters.
pub struct MessagingService {
    db: Arc<Database>,
    publisher: Arc<dyn EventPublisher>,
    sanitizer: Arc<dyn Sanitizer>,
}

impl MessagingService {
    pub fn new(db: Arc<Database>, publisher: Arc<dyn EventPublisher>) -> Self {
        Self {
            db,
            publisher,
            sanitizer: Arc::new(HtmlSanitizer),
        }
    }

    pub fn with_sanitizer(mut self, sanitizer: Arc<dyn Sanitizer>) -> Self {
        self.sanitizer = sanitizer;
        self
    }

    /// Persists a new message and fans out the unread updates and
    /// `message.new`. Clients treat the `message.new` broadcast as their ack.
    pub fn create_message(
        &self,
        thread_id: Uuid,
        sender: &Identity,
        content: &str,
        reply_to: Option<Uuid>,
        attachment_ids: &[Uuid],
    ) -> ChatResult<Message> {
        let now = Utc::now();
        let created = self.db.with_tx(|tx| -> ChatResult<Created> {
            let thread = threads::get_thread(tx, thread_id)?.ok_or(ChatError::NotFound("thread"))?;
            let participant = threads::get_active_participant(tx, thread_id, sender.user_id)?
                .ok_or_else(|| ChatError::forbidden("you are not a participant of this thread"))?;
            let settings = match thread.kind {
                ThreadKind::Group => threads::get_group_settings(tx, thread_id)?,
                ThreadKind::Direct => None,
            };
            if !validation::can_post(&thread, &participant, settings.as_ref()) {
                return Err(ChatError::forbidden(
                    "you don't have permission to post in this thread",
                ));
            }

            let content = self.sanitizer.sanitize(content);
            if content.is_empty() && attachment_ids.is_empty() {
                return Err(ChatError::invalid("message cannot be empty"));
            }
            if let Some(reply_id) = reply_to {
                if messages::get_message(tx, thread_id, reply_id)?.is_none() {
                    return Err(ChatError::invalid("invalid reply_to message"));
                }
            }

            users::upsert_user(tx, sender.user_id, &sender.username, now)?;
            let message_id = Uuid::new_v4();
            messages::insert_message(
                tx,
                &NewMessage {
                    id: message_id,
                    thread_id,
                    sender_id: sender.user_id,
                    content: &content,
                    reply_to_id: reply_to,
                    has_attachments: false,
                    created_at: now,
                },
            )?;
            let linked = messages::link_attachments(
                tx,
                message_id,
                thread_id,
                sender.user_id,
                attachment_ids,
            )?;
            if linked > 0 {
                messages::set_has_attachments(tx, message_id, true)?;
            } else if content.is_empty() {
                return Err(ChatError::invalid("message cannot be empty"));
            }
            threads::touch_thread(tx, thread_id, now)?;

            let mut unread = Vec::new();
            let mut notified = Vec::new();
            for row in messages::increment_unread(tx, thread_id, sender.user_id)? {
                unread.push(UnreadChange {
                    user_id: row.user_id,
                    unread_count: row.unread_count,
                    total_unread: messages::total_unread(tx, row.user_id)?,
                });
                if !row.is_muted {
                    let note = chat_message_notification(
                        row.user_id,
                        thread.title.as_deref(),
                        thread_id,
                        message_id,
                        &content,
                        now,
                    );
                    notifications::insert_notification(tx, &note.as_new())?;
                    notified.push((
                        row.user_id,
                        notifications::unread_notification_count(tx, row.user_id)?,
                    ));
                }
            }

            let row = messages::get_message(tx, thread_id, message_id)?
                .ok_or(ChatError::NotFound("message"))?;
            let message = assemble(tx, vec![row])?
                .pop()
                .ok_or(ChatError::NotFound("message"))?;
            Ok(Created {
                message,
                unread,
                notified,
            })
        })?;

        info!(
            "Message {} created in thread {} by {} ({} recipients)",
            created.message.id,
            thread_id,
            sender.user_id,
            created.unread.len()
        );

        let publisher = self.publisher.as_ref();
        for change in &created.unread {
            publish_logged(
                publisher,
                Group::User(change.user_id),
                Audience::All,
                ServerEvent::ChatUnreadUpdate {
                    thread_id,
                    unread_count: change.unread_count,
                    total_unread: change.total_unread,
                },
            );
            publish_logged(
                publisher,
                Group::Thread(thread_id),
                Audience::Only(change.user_id),
                ServerEvent::UnreadCountUpdate {
                    thread_id,
                    unread_count: change.unread_count,
                },
            );
        }
        for (user_id, count) in &created.notified {
            NotificationService::publish_count_value(publisher, *user_id, *count);
        }
        publish_logged(
            publisher,
            Group::Thread(thread_id),
            Audience::All,
            ServerEvent::MessageNew {
                message: created.message.clone(),
            },
        );

        Ok(created.message)
    }

    pub fn update_message(
        &self,
        thread_id: Uuid,
        message_id: Uuid,
        editor: Uuid,
        content: &str,
    ) -> ChatResult<Message> {
        let now = Utc::now();
        let message = self.db.with_tx(|tx| -> ChatResult<Message> {
            let row = load_editable(tx, thread_id, message_id, editor, "edit")?;
            if row.deleted_at.is_some() {
                return Err(ChatError::invalid("cannot edit a deleted message"));
            }
            let content = self.sanitizer.sanitize(content);
            if content.is_empty() {
                return Err(ChatError::invalid("message content cannot be empty"));
            }
            messages::update_message_content(tx, message_id, &content, now)?;
            let row = messages::get_message(tx, thread_id, message_id)?
                .ok_or(ChatError::NotFound("message"))?;
            assemble(tx, vec![row])?
                .pop()
                .ok_or(ChatError::NotFound("message"))
        })?;

        debug!("Message {} edited by {}", message_id, editor);
        publish_logged(
            self.publisher.as_ref(),
            Group::Thread(thread_id),
            Audience::All,
            ServerEvent::MessageUpdated {
                message: message.clone(),
            },
        );
        Ok(message)
    }

    /// Soft-deletes a message. Deleting an already deleted message succeeds
    /// without a second broadcast.
    pub fn delete_message(
        &self,
        thread_id: Uuid,
        message_id: Uuid,
        deleter: Uuid,
    ) -> ChatResult<()> {
        let deleted = self.db.with_tx(|tx| -> ChatResult<bool> {
            let row = load_editable(tx, thread_id, message_id, deleter, "delete")?;
            let now = Utc::now();
            let deleted = messages::soft_delete_message(tx, message_id, now)?;
            if deleted {
                let mut entry = Audit::new(AuditAction::MessageDeleted, deleter, thread_id)
                    .details(format!("message {}", message_id));
                if let Some(sender) = row.sender_id {
                    entry = entry.target(sender);
                }
                entry.write(tx, now)?;
            }
            Ok(deleted)
        })?;

        if deleted {
            info!("Message {} deleted by {}", message_id, deleter);
            publish_logged(
                self.publisher.as_ref(),
                Group::Thread(thread_id),
                Audience::All,
                ServerEvent::MessageDeleted {
                    thread_id,
                    message_id,
                },
            );
        }
        Ok(())
    }

    /// Resets the caller's unread count for the thread. `last_read_at` becomes
    /// the timestamp of `upto` when given, otherwise now. Publishes the zeroed
    /// count to the user and a `receipt.read` to the thread.
    pub fn mark_as_read(
        &self,
        thread_id: Uuid,
        user_id: Uuid,
        upto: Option<Uuid>,
    ) -> ChatResult<DateTime<Utc>> {
        let (read_at, total_unread) = self.db.with_tx(|tx| -> ChatResult<(DateTime<Utc>, i64)> {
            require_participant(tx, thread_id, user_id)?;
            let read_at = match upto {
                Some(message_id) => {
                    messages::get_message(tx, thread_id, message_id)?
                        .ok_or(ChatError::NotFound("message"))?
                        .created_at
                }
                None => Utc::now(),
            };
            messages::reset_unread(tx, thread_id, user_id, read_at)?;
            Ok((read_at, messages::total_unread(tx, user_id)?))
        })?;

        let publisher = self.publisher.as_ref();
        publish_logged(
            publisher,
            Group::User(user_id),
            Audience::All,
            ServerEvent::ChatUnreadUpdate {
                thread_id,
                unread_count: 0,
                total_unread,
            },
        );
        publish_logged(
            publisher,
            Group::Thread(thread_id),
            Audience::Only(user_id),
            ServerEvent::UnreadCountUpdate {
                thread_id,
                unread_count: 0,
            },
        );
        publish_logged(
            publisher,
            Group::Thread(thread_id),
            Audience::All,
            ServerEvent::ReceiptRead {
                thread_id,
                user_id,
                message_id: upto,
            },
        );
        Ok(read_at)
    }

    /// Sets the user's reaction, replacing any earlier one on the message.
    pub fn add_reaction(
        &self,
        thread_id: Uuid,
        message_id: Uuid,
        user_id: Uuid,
        emoji: &str,
    ) -> ChatResult<()> {
        validation::validate_emoji(emoji)?;

        self.db.with_tx(|tx| -> ChatResult<()> {
            let thread = threads::get_thread(tx, thread_id)?.ok_or(ChatError::NotFound("thread"))?;
            let row = messages::get_message(tx, thread_id, message_id)?
                .ok_or(ChatError::NotFound("message"))?;
            if row.deleted_at.is_some() {
                return Err(ChatError::invalid("cannot react to a deleted message"));
            }
            if thread.kind == ThreadKind::Group {
                let enabled = threads::get_group_settings(tx, thread_id)?
                    .map(|s| s.reactions_enabled)
                    .unwrap_or(true);
                if !enabled {
                    return Err(ChatError::invalid("reactions are disabled for this thread"));
                }
            }
            threads::get_active_participant(tx, thread_id, user_id)?
                .ok_or_else(|| ChatError::forbidden("you must be a participant to react"))?;
            reactions::replace_reaction(tx, message_id, user_id, emoji, Utc::now())?;
            Ok(())
        })?;

        publish_logged(
            self.publisher.as_ref(),
            Group::Thread(thread_id),
            Audience::All,
            ServerEvent::ReactionAdded {
                thread_id,
                message_id,
                user_id,
                emoji: emoji.to_string(),
            },
        );
        Ok(())
    }

    /// Removes the user's reaction if it matches `emoji`. Returns whether one
    /// was removed; only then is `reaction.removed` published.
    pub fn remove_reaction(
        &self,
        thread_id: Uuid,
        message_id: Uuid,
        user_id: Uuid,
        emoji: &str,
    ) -> ChatResult<bool> {
        let removed = self.db.with_tx(|tx| -> ChatResult<bool> {
            messages::get_message(tx, thread_id, message_id)?
                .ok_or(ChatError::NotFound("message"))?;
            require_participant(tx, thread_id, user_id)?;
            Ok(reactions::delete_reaction(tx, message_id, user_id, emoji)?)
        })?;

        if removed {
            publish_logged(
                self.publisher.as_ref(),
                Group::Thread(thread_id),
                Audience::All,
                ServerEvent::ReactionRemoved {
                    thread_id,
                    message_id,
                    user_id,
                    emoji: emoji.to_string(),
                },
            );
        }
        Ok(removed)
    }

    /// Newest-first page of messages for a participant.
    pub fn list_messages(
        &self,
        thread_id: Uuid,
        user_id: Uuid,
        before: Option<DateTime<Utc>>,
        limit: Option<u32>,
    ) -> ChatResult<Vec<Message>> {
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        self.db.with_conn(|conn| {
            if threads::get_active_participant(conn, thread_id, user_id)?.is_none() {
                return Ok(None);
            }
            let rows = messages::list_messages(conn, thread_id, before, limit)?;
            Ok(Some(assemble(conn, rows)?))
        })?
        .ok_or_else(|| ChatError::forbidden("you are not a participant of this thread"))
    }

    /// Records an uploaded file so a later message from the same user in the
    /// same thread can link it.
    pub fn record_attachment(
        &self,
        thread_id: Uuid,
        uploader_id: Uuid,
        attachment: &Attachment,
    ) -> ChatResult<()> {
        self.db.with_tx(|tx| -> ChatResult<()> {
            require_participant(tx, thread_id, uploader_id)?;
            messages::insert_attachment(tx, thread_id, uploader_id, attachment, Utc::now())?;
            Ok(())
        })
    }

    pub fn total_unread(&self, user_id: Uuid) -> ChatResult<i64> {
        Ok(self.db.with_conn(|conn| messages::total_unread(conn, user_id))?)
    }
}

fn require_participant(
    conn: &Connection,
    thread_id: Uuid,
    user_id: Uuid,
) -> ChatResult<Participant> {
    threads::get_active_participant(conn, thread_id, user_id)?
        .ok_or_else(|| ChatError::forbidden("you are not a participant of this thread"))
}

/// Loads a message and checks that `actor` may edit or delete it.
fn load_editable(
    conn: &Connection,
    thread_id: Uuid,
    message_id: Uuid,
    actor: Uuid,
    action: &str,
) -> ChatResult<MessageRow> {
    let row = messages::get_message(conn, thread_id, message_id)?
        .ok_or(ChatError::NotFound("message"))?;
    let membership = threads::get_active_participant(conn, thread_id, actor)?;
    if !validation::can_edit(row.sender_id, actor, membership.as_ref()) {
        return Err(ChatError::forbidden(format!(
            "you don't have permission to {} this message",
            action
        )));
    }
    Ok(row)
}

/// Joins rows with their attachments and grouped reactions, preserving row
/// order. Deleted messages come back bare.
pub(crate) fn assemble(conn: &Connection, rows: Vec<MessageRow>) -> anyhow::Result<Vec<Message>> {
    let live: Vec<Uuid> = rows.iter().filter(|r| r.deleted_at.is_none()).map(|r| r.id).collect();

    let mut attachments: HashMap<Uuid, Vec<Attachment>> = HashMap::new();
    let with_files: Vec<Uuid> = rows
        .iter()
        .filter(|r| r.deleted_at.is_none() && r.has_attachments)
        .map(|r| r.id)
        .collect();
    for (message_id, attachment) in messages::attachments_for_messages(conn, &with_files)? {
        attachments.entry(message_id).or_default().push(attachment);
    }

    let mut grouped: HashMap<Uuid, Vec<ReactionGroup>> = HashMap::new();
    for reaction in reactions::reactions_for_messages(conn, &live)? {
        let groups = grouped.entry(reaction.message_id).or_default();
        match groups.iter_mut().find(|g| g.emoji == reaction.emoji) {
            Some(group) => {
                group.count += 1;
                group.user_ids.push(reaction.user_id);
            }
            None => groups.push(ReactionGroup {
                emoji: reaction.emoji,
                count: 1,
                user_ids: vec![reaction.user_id],
            }),
        }
    }

    Ok(rows
        .into_iter()
        .map(|row| Message {
            attachments: attachments.remove(&row.id).unwrap_or_default(),
            reactions: grouped.remove(&row.id).unwrap_or_default(),
            id: row.id,
            thread_id: row.thread_id,
            sender_id: row.sender_id,
            sender_username: row.sender_username,
            content: row.content,
            reply_to_id: row.reply_to_id,
            created_at: row.created_at,
            edited_at: row.edited_at,
            deleted_at: row.deleted_at,
        })
        .collect())
}
