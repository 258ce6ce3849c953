use chrono::Utc;
use huddle_db::Database;
use huddle_db::models::NewMessage;
use huddle_db::queries::{audit, messages, reactions, threads, users};
use huddle_types::models::{Attachment, AuditAction, AuditEntry, Role, Thread, ThreadKind};
use uuid::Uuid;

fn group_thread(db: &Database, owner: Uuid, members: &[Uuid]) -> Uuid {
    let now = Utc::now();
    let thread = Thread {
        id: Uuid::new_v4(),
        kind: ThreadKind::Group,
        title: Some("crew".into()),
        is_archived: false,
        created_by: Some(owner),
        created_at: now,
        updated_at: now,
    };
    db.with_conn(|conn| {
        threads::insert_thread(conn, &thread)?;
        threads::upsert_participant(conn, thread.id, owner, Role::Owner, now)?;
        for m in members {
            threads::upsert_participant(conn, thread.id, *m, Role::Member, now)?;
        }
        Ok(())
    })
    .unwrap();
    thread.id
}

fn post(db: &Database, thread_id: Uuid, sender: Uuid, content: &str) -> Uuid {
    let id = Uuid::new_v4();
    db.with_conn(|conn| {
        messages::insert_message(
            conn,
            &NewMessage {
                id,
                thread_id,
                sender_id: sender,
                content,
                reply_to_id: None,
                has_attachments: false,
                created_at: Utc::now(),
            },
        )
    })
    .unwrap();
    id
}

#[test]
fn migrations_are_idempotent_on_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("huddle.db");
    let owner = Uuid::new_v4();

    let thread_id = {
        let db = Database::open(&path).unwrap();
        group_thread(&db, owner, &[])
    };

    let db = Database::open(&path).unwrap();
    let thread = db
        .with_conn(|conn| threads::get_thread(conn, thread_id))
        .unwrap()
        .expect("thread survives reopen");
    assert_eq!(thread.kind, ThreadKind::Group);
}

#[test]
fn unread_bump_skips_sender_and_departed_members() {
    let db = Database::open_in_memory().unwrap();
    let (owner, bob, carol) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    let thread_id = group_thread(&db, owner, &[bob, carol]);

    db.with_conn(|conn| {
        threads::mark_participant_left(conn, thread_id, carol, Utc::now())?;
        threads::set_participant_muted(conn, thread_id, bob, true)?;
        Ok(())
    })
    .unwrap();

    let bumped = db
        .with_conn(|conn| messages::increment_unread(conn, thread_id, owner))
        .unwrap();
    assert_eq!(bumped.len(), 1);
    assert_eq!(bumped[0].user_id, bob);
    assert_eq!(bumped[0].unread_count, 1);
    assert!(bumped[0].is_muted);

    assert_eq!(db.with_conn(|c| messages::total_unread(c, bob)).unwrap(), 1);
    assert_eq!(db.with_conn(|c| messages::total_unread(c, carol)).unwrap(), 0);
}

#[test]
fn rejoining_reactivates_instead_of_duplicating() {
    let db = Database::open_in_memory().unwrap();
    let (owner, bob) = (Uuid::new_v4(), Uuid::new_v4());
    let thread_id = group_thread(&db, owner, &[bob]);

    db.with_conn(|conn| {
        assert!(!threads::upsert_participant(conn, thread_id, bob, Role::Member, Utc::now())?);
        assert!(threads::mark_participant_left(conn, thread_id, bob, Utc::now())?);
        assert!(threads::get_active_participant(conn, thread_id, bob)?.is_none());
        assert!(threads::upsert_participant(conn, thread_id, bob, Role::Member, Utc::now())?);
        assert!(threads::get_active_participant(conn, thread_id, bob)?.is_some());
        Ok(())
    })
    .unwrap();

    let ids = db
        .with_conn(|conn| threads::active_participant_ids(conn, thread_id))
        .unwrap();
    assert_eq!(ids.len(), 2);
}

#[test]
fn direct_key_is_order_independent() {
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
    assert_eq!(threads::direct_key(a, b), threads::direct_key(b, a));
}

#[test]
fn only_own_unlinked_uploads_are_linked() {
    let db = Database::open_in_memory().unwrap();
    let (owner, bob) = (Uuid::new_v4(), Uuid::new_v4());
    let thread_id = group_thread(&db, owner, &[bob]);

    let upload = |uploader: Uuid| {
        let attachment = Attachment {
            id: Uuid::new_v4(),
            file_name: "notes.txt".into(),
            content_type: "text/plain".into(),
            size: 5,
            sha256: "00".repeat(32),
        };
        db.with_conn(|conn| {
            messages::insert_attachment(conn, thread_id, uploader, &attachment, Utc::now())
        })
        .unwrap();
        attachment.id
    };
    let mine = upload(owner);
    let theirs = upload(bob);

    let first = post(&db, thread_id, owner, "see attached");
    let linked = db
        .with_conn(|conn| {
            messages::link_attachments(conn, first, thread_id, owner, &[mine, theirs])
        })
        .unwrap();
    assert_eq!(linked, 1);

    // already linked
    let second = post(&db, thread_id, owner, "again");
    let relinked = db
        .with_conn(|conn| messages::link_attachments(conn, second, thread_id, owner, &[mine]))
        .unwrap();
    assert_eq!(relinked, 0);

    let fetched = db
        .with_conn(|conn| messages::attachments_for_messages(conn, &[first, second]))
        .unwrap();
    assert_eq!(fetched.len(), 1);
    assert_eq!(fetched[0].0, first);
    assert_eq!(fetched[0].1.id, mine);
}

#[test]
fn a_user_holds_one_reaction_per_message() {
    let db = Database::open_in_memory().unwrap();
    let owner = Uuid::new_v4();
    let thread_id = group_thread(&db, owner, &[]);
    let msg = post(&db, thread_id, owner, "hello");

    db.with_conn(|conn| {
        reactions::replace_reaction(conn, msg, owner, "👍", Utc::now())?;
        reactions::replace_reaction(conn, msg, owner, "🎉", Utc::now())?;
        assert!(!reactions::delete_reaction(conn, msg, owner, "👍")?);
        Ok(())
    })
    .unwrap();

    let rows = db
        .with_conn(|conn| reactions::reactions_for_messages(conn, &[msg]))
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].emoji, "🎉");
}

#[test]
fn failed_transaction_rolls_back() {
    let db = Database::open_in_memory().unwrap();
    let owner = Uuid::new_v4();
    let thread_id = group_thread(&db, owner, &[]);

    let result: anyhow::Result<()> = db.with_tx(|tx| {
        post_in(tx, thread_id, owner);
        anyhow::bail!("abort")
    });
    assert!(result.is_err());

    let listed = db
        .with_conn(|conn| messages::list_messages(conn, thread_id, None, 50))
        .unwrap();
    assert!(listed.is_empty());
}

fn post_in(conn: &rusqlite::Connection, thread_id: Uuid, sender: Uuid) {
    messages::insert_message(
        conn,
        &NewMessage {
            id: Uuid::new_v4(),
            thread_id,
            sender_id: sender,
            content: "lost",
            reply_to_id: None,
            has_attachments: false,
            created_at: Utc::now(),
        },
    )
    .unwrap();
}

#[test]
fn archived_threads_are_listed_separately() {
    let db = Database::open_in_memory().unwrap();
    let owner = Uuid::new_v4();
    let live = group_thread(&db, owner, &[]);
    let shelved = group_thread(&db, owner, &[]);

    db.with_conn(|conn| {
        assert!(threads::set_thread_archived(conn, shelved, true, Utc::now())?);
        assert!(!threads::set_thread_archived(conn, shelved, true, Utc::now())?);
        let active = threads::list_threads_for_user(conn, owner, false)?;
        let archived = threads::list_threads_for_user(conn, owner, true)?;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].0.id, live);
        assert_eq!(archived.len(), 1);
        assert!(archived[0].0.is_archived);
        Ok(())
    })
    .unwrap();
}

#[test]
fn member_list_skips_departed_and_carries_names() {
    let db = Database::open_in_memory().unwrap();
    let (owner, bob, carol) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    let thread_id = group_thread(&db, owner, &[bob, carol]);

    let members = db
        .with_conn(|conn| {
            users::upsert_user(conn, bob, "bob", Utc::now())?;
            threads::mark_participant_left(conn, thread_id, carol, Utc::now())?;
            threads::list_members(conn, thread_id)
        })
        .unwrap();

    let ids: Vec<Uuid> = members.iter().map(|m| m.user_id).collect();
    assert_eq!(ids, vec![owner, bob]);
    assert_eq!(members[0].role, Role::Owner);
    assert_eq!(members[0].username, None);
    assert_eq!(members[1].username.as_deref(), Some("bob"));
}

#[test]
fn audit_entries_list_newest_first() {
    let db = Database::open_in_memory().unwrap();
    let (owner, bob) = (Uuid::new_v4(), Uuid::new_v4());
    let thread_id = group_thread(&db, owner, &[bob]);
    let now = Utc::now();

    let entries = db
        .with_conn(|conn| {
            for action in [AuditAction::MemberAdded, AuditAction::RoleChanged] {
                audit::insert_audit(
                    conn,
                    &AuditEntry {
                        id: Uuid::new_v4(),
                        actor_id: Some(owner),
                        action,
                        thread_id: Some(thread_id),
                        target_user_id: Some(bob),
                        details: None,
                        created_at: now,
                    },
                )?;
            }
            audit::list_audit_for_thread(conn, thread_id, 10)
        })
        .unwrap();

    let actions: Vec<AuditAction> = entries.iter().map(|e| e.action).collect();
    assert_eq!(actions, vec![AuditAction::RoleChanged, AuditAction::MemberAdded]);
    assert_eq!(entries[0].target_user_id, Some(bob));
}
