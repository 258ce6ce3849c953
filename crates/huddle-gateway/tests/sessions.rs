use std::sync::Arc;

use huddle_chat::ChatServices;
use huddle_db::Database;
use huddle_gateway::bus::Outbound;
use huddle_gateway::connection::{Flow, SocketSession};
use huddle_gateway::notifications::NotificationSession;
use huddle_gateway::presence::PresenceSession;
use huddle_gateway::registry::Rejection;
use huddle_gateway::session::{SessionState, ThreadSession};
use huddle_gateway::{
    Gateway, GatewayConfig, GroupBroadcastBus, MemoryCounters, SharedGateway, TokenVerifier,
};
use huddle_types::api::UpdateSettingsRequest;
use huddle_types::events::{RateLimit, RateLimits};
use huddle_types::models::PostingMode;
use huddle_types::{ErrorCode, Group, Identity, ServerEvent};
use serde_json::json;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

/// Tokens of the form `<uuid>:<username>`.
struct PlainTokens;

impl TokenVerifier for PlainTokens {
    fn verify(&self, token: &str) -> Option<Identity> {
        let (id, name) = token.split_once(':')?;
        Some(Identity::new(id.parse().ok()?, name))
    }
}

fn token(identity: &Identity) -> String {
    format!("{}:{}", identity.user_id, identity.username)
}

fn gateway(config: GatewayConfig) -> SharedGateway {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let bus = GroupBroadcastBus::new();
    let services = ChatServices::new(db, Arc::new(bus.clone()), PostingMode::All);
    Gateway::new(
        config,
        bus,
        Arc::new(MemoryCounters::new()),
        Arc::new(PlainTokens),
        services,
    )
}

fn drain(rx: &mut UnboundedReceiver<Outbound>) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(next) = rx.try_recv() {
        if let Outbound::Event(event) = next {
            events.push(event);
        }
    }
    events
}

fn error_codes(events: &[ServerEvent]) -> Vec<ErrorCode> {
    events
        .iter()
        .filter_map(|e| match e {
            ServerEvent::Error { code, .. } => *code,
            _ => None,
        })
        .collect()
}

async fn open(
    gw: &SharedGateway,
    who: &Identity,
    thread_id: Uuid,
) -> (ThreadSession, UnboundedReceiver<Outbound>) {
    let (mut session, mut rx) = ThreadSession::connect(gw.clone(), Some(&token(who)), thread_id)
        .await
        .unwrap();
    session.activate();
    assert_eq!(session.state(), SessionState::Active);
    let hello = drain(&mut rx);
    assert!(matches!(hello.as_slice(), [ServerEvent::ConnectionEstablished { .. }]));
    (session, rx)
}

fn send(content: &str) -> String {
    json!({ "type": "message.send", "content": content }).to_string()
}

#[tokio::test]
async fn messages_fan_out_to_every_session_in_the_thread() {
    let gw = gateway(GatewayConfig::default());
    let (alice, bob) =
        (Identity::new(Uuid::new_v4(), "alice"), Identity::new(Uuid::new_v4(), "bob"));
    let group = gw.services.threads.create_group(&alice, "team", &[bob.user_id]).unwrap();

    let (mut a, mut a_rx) = open(&gw, &alice, group.id).await;
    let (_b, mut b_rx) = open(&gw, &bob, group.id).await;

    assert_eq!(a.handle_text(&send("hello")).await, Flow::Continue);

    let to_alice = drain(&mut a_rx);
    let to_bob = drain(&mut b_rx);
    assert!(to_alice.iter().any(|e| matches!(e, ServerEvent::MessageNew { .. })));
    assert!(!to_alice.iter().any(|e| matches!(e, ServerEvent::UnreadCountUpdate { .. })));
    assert!(to_bob.iter().any(|e| {
        matches!(e, ServerEvent::MessageNew { message } if message.content == "hello")
    }));
    assert!(
        to_bob
            .iter()
            .any(|e| matches!(e, ServerEvent::UnreadCountUpdate { unread_count: 1, .. }))
    );
}

#[tokio::test]
async fn admins_only_groups_refuse_member_posts() {
    let gw = gateway(GatewayConfig::default());
    let (owner, member) =
        (Identity::new(Uuid::new_v4(), "owner"), Identity::new(Uuid::new_v4(), "member"));
    let group = gw.services.threads.create_group(&owner, "news", &[member.user_id]).unwrap();
    let patch = UpdateSettingsRequest {
        posting_mode: Some(PostingMode::AdminsOnly),
        ..Default::default()
    };
    gw.services.threads.update_group_settings(group.id, owner.user_id, &patch).unwrap();

    let (mut m, mut m_rx) = open(&gw, &member, group.id).await;
    let (mut o, mut o_rx) = open(&gw, &owner, group.id).await;

    m.handle_text(&send("can I post?")).await;
    assert_eq!(error_codes(&drain(&mut m_rx)), vec![ErrorCode::Forbidden]);
    assert!(drain(&mut o_rx).is_empty());

    o.handle_text(&send("announcement")).await;
    assert!(drain(&mut m_rx).iter().any(|e| matches!(e, ServerEvent::MessageNew { .. })));
    assert!(error_codes(&drain(&mut o_rx)).is_empty());
}

#[tokio::test]
async fn oversized_frames_close_the_socket_and_store_nothing() {
    let gw = gateway(GatewayConfig::default());
    let alice = Identity::new(Uuid::new_v4(), "alice");
    let bob = Identity::new(Uuid::new_v4(), "bob");
    let (direct, _) = gw.services.threads.get_or_create_direct(&alice, bob.user_id).unwrap();
    let (mut a, _a_rx) = open(&gw, &alice, direct.id).await;

    let frame = send(&"x".repeat(150_000));
    assert_eq!(a.handle_text(&frame).await, Flow::Close(1009));

    let stored = gw
        .services
        .messaging
        .list_messages(direct.id, alice.user_id, None, None)
        .unwrap();
    assert!(stored.is_empty());
}

#[tokio::test]
async fn bad_frames_are_answered_not_fatal() {
    let gw = gateway(GatewayConfig::default());
    let alice = Identity::new(Uuid::new_v4(), "alice");
    let bob = Identity::new(Uuid::new_v4(), "bob");
    let (direct, _) = gw.services.threads.get_or_create_direct(&alice, bob.user_id).unwrap();
    let (mut a, mut rx) = open(&gw, &alice, direct.id).await;

    a.handle_text("{oops").await;
    a.handle_text(r#"{"type":"screen.share"}"#).await;
    let reaction = json!({
        "type": "reaction.add",
        "message_id": Uuid::new_v4(),
        "emoji": "<script>",
    });
    assert_eq!(a.handle_text(&reaction.to_string()).await, Flow::Continue);

    assert_eq!(
        error_codes(&drain(&mut rx)),
        vec![ErrorCode::InvalidJson, ErrorCode::UnknownEvent, ErrorCode::ValidationFailed]
    );
    assert_eq!(a.state(), SessionState::Active);
}

#[tokio::test]
async fn overlong_messages_are_rejected_by_character_count() {
    let config = GatewayConfig {
        max_message_length: 5,
        ..Default::default()
    };
    let gw = gateway(config);
    let alice = Identity::new(Uuid::new_v4(), "alice");
    let bob = Identity::new(Uuid::new_v4(), "bob");
    let (direct, _) = gw.services.threads.get_or_create_direct(&alice, bob.user_id).unwrap();
    let (mut a, mut rx) = open(&gw, &alice, direct.id).await;

    a.handle_text(&send("héllo")).await;
    a.handle_text(&send("héllo!")).await;

    let events = drain(&mut rx);
    assert_eq!(error_codes(&events), vec![ErrorCode::MessageTooLong]);
    assert_eq!(
        events.iter().filter(|e| matches!(e, ServerEvent::MessageNew { .. })).count(),
        1
    );
}

#[tokio::test]
async fn sends_beyond_the_window_limit_are_refused() {
    let config = GatewayConfig {
        rate_limits: RateLimits {
            message_send: RateLimit::new(2, 3600),
            ..Default::default()
        },
        ..Default::default()
    };
    let gw = gateway(config);
    let alice = Identity::new(Uuid::new_v4(), "alice");
    let bob = Identity::new(Uuid::new_v4(), "bob");
    let (direct, _) = gw.services.threads.get_or_create_direct(&alice, bob.user_id).unwrap();
    let (mut a, mut rx) = open(&gw, &alice, direct.id).await;

    for i in 0..3 {
        a.handle_text(&send(&format!("msg {}", i))).await;
    }

    assert_eq!(error_codes(&drain(&mut rx)), vec![ErrorCode::RateLimitExceeded]);
    let stored = gw
        .services
        .messaging
        .list_messages(direct.id, alice.user_id, None, None)
        .unwrap();
    assert_eq!(stored.len(), 2);
}

#[tokio::test]
async fn admission_failures_leave_no_slot_behind() {
    let gw = gateway(GatewayConfig::default());
    let alice = Identity::new(Uuid::new_v4(), "alice");
    let outsider = Identity::new(Uuid::new_v4(), "mallory");
    let group = gw.services.threads.create_group(&alice, "private", &[]).unwrap();

    let refused = ThreadSession::connect(gw.clone(), Some(&token(&outsider)), group.id).await;
    assert_eq!(refused.err(), Some(Rejection::Forbidden));
    assert_eq!(gw.registry.current(outsider.user_id), 0);

    let refused = ThreadSession::connect(gw.clone(), Some("not-a-token"), group.id).await;
    assert_eq!(refused.err(), Some(Rejection::Unauthenticated));
    let refused = ThreadSession::connect(gw.clone(), None, group.id).await;
    assert_eq!(refused.err(), Some(Rejection::Unauthenticated));
}

#[tokio::test]
async fn per_user_connection_cap_applies() {
    let config = GatewayConfig {
        max_connections_per_user: 2,
        ..Default::default()
    };
    let gw = gateway(config);
    let alice = Identity::new(Uuid::new_v4(), "alice");
    let group = gw.services.threads.create_group(&alice, "solo", &[]).unwrap();

    let (mut first, _rx1) = open(&gw, &alice, group.id).await;
    let (_second, _rx2) = open(&gw, &alice, group.id).await;
    let third = ThreadSession::connect(gw.clone(), Some(&token(&alice)), group.id).await;
    assert_eq!(third.err(), Some(Rejection::CapacityExceeded));
    assert_eq!(gw.registry.current(alice.user_id), 2);

    first.close().await;
    assert_eq!(gw.registry.current(alice.user_id), 1);
    assert!(ThreadSession::connect(gw.clone(), Some(&token(&alice)), group.id).await.is_ok());
}

#[tokio::test]
async fn closing_stops_typing_and_leaves_the_thread() {
    let gw = gateway(GatewayConfig::default());
    let (alice, bob) =
        (Identity::new(Uuid::new_v4(), "alice"), Identity::new(Uuid::new_v4(), "bob"));
    let group = gw.services.threads.create_group(&alice, "team", &[bob.user_id]).unwrap();

    let (mut a, _a_rx) = open(&gw, &alice, group.id).await;
    let (_b, mut b_rx) = open(&gw, &bob, group.id).await;

    a.handle_text(r#"{"type":"typing.start"}"#).await;
    assert!(matches!(
        drain(&mut b_rx).as_slice(),
        [ServerEvent::TypingStart { username, .. }] if username == "alice"
    ));

    a.close().await;
    a.close().await;
    assert_eq!(a.state(), SessionState::Closed);
    assert!(matches!(
        drain(&mut b_rx).as_slice(),
        [ServerEvent::TypingStop { user_id, .. }] if *user_id == alice.user_id
    ));
    assert_eq!(gw.registry.current(alice.user_id), 0);
    assert_eq!(gw.bus.member_count(Group::Thread(group.id)), 1);
}

fn react(kind: &str, message_id: Uuid, emoji: &str) -> String {
    json!({ "type": kind, "message_id": message_id, "emoji": emoji }).to_string()
}

#[tokio::test]
async fn removed_members_stop_hearing_the_thread_and_cannot_type() {
    let gw = gateway(GatewayConfig::default());
    let (alice, bob) =
        (Identity::new(Uuid::new_v4(), "alice"), Identity::new(Uuid::new_v4(), "bob"));
    let group = gw.services.threads.create_group(&alice, "team", &[bob.user_id]).unwrap();
    let (mut a, mut a_rx) = open(&gw, &alice, group.id).await;
    let (mut b, mut b_rx) = open(&gw, &bob, group.id).await;

    gw.services
        .threads
        .remove_participant(group.id, alice.user_id, bob.user_id)
        .unwrap();

    // Both sides hear the removal, then bob is detached.
    for rx in [&mut a_rx, &mut b_rx] {
        assert!(matches!(
            drain(rx).as_slice(),
            [ServerEvent::MemberRemoved { user_id, removed_by: Some(by), .. }]
                if *user_id == bob.user_id && *by == alice.user_id
        ));
    }
    assert_eq!(gw.bus.member_count(Group::Thread(group.id)), 1);

    a.handle_text(&send("after you left")).await;
    assert!(drain(&mut a_rx).iter().any(|e| matches!(e, ServerEvent::MessageNew { .. })));
    assert!(drain(&mut b_rx).is_empty());

    b.handle_text(r#"{"type":"typing.start"}"#).await;
    b.handle_text(r#"{"type":"typing.stop"}"#).await;
    assert_eq!(
        error_codes(&drain(&mut b_rx)),
        vec![ErrorCode::Forbidden, ErrorCode::Forbidden]
    );
    assert!(drain(&mut a_rx).is_empty());
}

#[tokio::test]
async fn leaving_detaches_the_leaver_only() {
    let gw = gateway(GatewayConfig::default());
    let (alice, bob) =
        (Identity::new(Uuid::new_v4(), "alice"), Identity::new(Uuid::new_v4(), "bob"));
    let (direct, _) = gw.services.threads.get_or_create_direct(&alice, bob.user_id).unwrap();
    let (mut a, mut a_rx) = open(&gw, &alice, direct.id).await;
    let (_b, mut b_rx) = open(&gw, &bob, direct.id).await;

    gw.services.threads.leave_thread(direct.id, bob.user_id).unwrap();
    assert!(drain(&mut a_rx).iter().any(|e| matches!(
        e,
        ServerEvent::MemberRemoved { user_id, removed_by: None, .. } if *user_id == bob.user_id
    )));
    drain(&mut b_rx);

    a.handle_text(r#"{"type":"typing.start"}"#).await;
    assert!(drain(&mut b_rx).is_empty());
    assert!(error_codes(&drain(&mut a_rx)).is_empty());
}

#[tokio::test]
async fn typing_beyond_the_limit_is_dropped_silently() {
    let config = GatewayConfig {
        rate_limits: RateLimits {
            typing: RateLimit::new(1, 3600),
            ..Default::default()
        },
        ..Default::default()
    };
    let gw = gateway(config);
    let (alice, bob) =
        (Identity::new(Uuid::new_v4(), "alice"), Identity::new(Uuid::new_v4(), "bob"));
    let group = gw.services.threads.create_group(&alice, "team", &[bob.user_id]).unwrap();
    let (mut a, mut a_rx) = open(&gw, &alice, group.id).await;
    let (_b, mut b_rx) = open(&gw, &bob, group.id).await;

    for _ in 0..3 {
        assert_eq!(a.handle_text(r#"{"type":"typing.start"}"#).await, Flow::Continue);
    }

    let to_bob = drain(&mut b_rx);
    assert_eq!(
        to_bob.iter().filter(|e| matches!(e, ServerEvent::TypingStart { .. })).count(),
        1
    );
    assert!(drain(&mut a_rx).is_empty());
}

#[tokio::test]
async fn reactions_reach_the_whole_thread() {
    let gw = gateway(GatewayConfig::default());
    let (alice, bob) =
        (Identity::new(Uuid::new_v4(), "alice"), Identity::new(Uuid::new_v4(), "bob"));
    let (direct, _) = gw.services.threads.get_or_create_direct(&alice, bob.user_id).unwrap();
    let msg = gw
        .services
        .messaging
        .create_message(direct.id, &alice, "lunch?", None, &[])
        .unwrap();
    let (_a, mut a_rx) = open(&gw, &alice, direct.id).await;
    let (mut b, mut b_rx) = open(&gw, &bob, direct.id).await;

    b.handle_text(&react("reaction.add", msg.id, "👍")).await;

    for rx in [&mut a_rx, &mut b_rx] {
        assert!(matches!(
            drain(rx).as_slice(),
            [ServerEvent::ReactionAdded { message_id, user_id, emoji, .. }]
                if *message_id == msg.id && *user_id == bob.user_id && emoji == "👍"
        ));
    }
}

#[tokio::test]
async fn reactions_beyond_the_limit_are_refused() {
    let config = GatewayConfig {
        rate_limits: RateLimits {
            reaction: RateLimit::new(1, 3600),
            ..Default::default()
        },
        ..Default::default()
    };
    let gw = gateway(config);
    let (alice, bob) =
        (Identity::new(Uuid::new_v4(), "alice"), Identity::new(Uuid::new_v4(), "bob"));
    let (direct, _) = gw.services.threads.get_or_create_direct(&alice, bob.user_id).unwrap();
    let msg = gw
        .services
        .messaging
        .create_message(direct.id, &alice, "lunch?", None, &[])
        .unwrap();
    let (_a, mut a_rx) = open(&gw, &alice, direct.id).await;
    let (mut b, mut b_rx) = open(&gw, &bob, direct.id).await;

    b.handle_text(&react("reaction.add", msg.id, "👍")).await;
    b.handle_text(&react("reaction.add", msg.id, "🎉")).await;

    let to_bob = drain(&mut b_rx);
    assert_eq!(error_codes(&to_bob), vec![ErrorCode::RateLimitExceeded]);
    let added: Vec<ServerEvent> = drain(&mut a_rx);
    assert!(matches!(
        added.as_slice(),
        [ServerEvent::ReactionAdded { emoji, .. }] if emoji == "👍"
    ));
}

#[tokio::test]
async fn removing_an_absent_reaction_broadcasts_nothing() {
    let gw = gateway(GatewayConfig::default());
    let (alice, bob) =
        (Identity::new(Uuid::new_v4(), "alice"), Identity::new(Uuid::new_v4(), "bob"));
    let (direct, _) = gw.services.threads.get_or_create_direct(&alice, bob.user_id).unwrap();
    let msg = gw
        .services
        .messaging
        .create_message(direct.id, &alice, "lunch?", None, &[])
        .unwrap();
    let (_a, mut a_rx) = open(&gw, &alice, direct.id).await;
    let (mut b, mut b_rx) = open(&gw, &bob, direct.id).await;

    b.handle_text(&react("reaction.remove", msg.id, "👍")).await;

    assert!(drain(&mut a_rx).is_empty());
    assert!(drain(&mut b_rx).is_empty());
}

#[tokio::test]
async fn notification_channel_handles_read_state() {
    let gw = gateway(GatewayConfig::default());
    let (alice, bob) =
        (Identity::new(Uuid::new_v4(), "alice"), Identity::new(Uuid::new_v4(), "bob"));
    let (direct, _) = gw.services.threads.get_or_create_direct(&alice, bob.user_id).unwrap();
    for text in ["one", "two"] {
        gw.services
            .messaging
            .create_message(direct.id, &alice, text, None, &[])
            .unwrap();
    }

    let (mut n, mut rx) = NotificationSession::connect(gw.clone(), Some(&token(&bob)), bob.user_id)
        .await
        .unwrap();
    n.on_open().await;
    let opening = drain(&mut rx);
    assert!(matches!(opening.first(), Some(ServerEvent::NotificationCount { count: 2, .. })));

    n.on_text(r#"{"type":"get_unread_count"}"#).await;
    assert!(matches!(
        drain(&mut rx).as_slice(),
        [ServerEvent::NotificationCount { count: 2, .. }]
    ));

    let newest = gw.services.notifications.list(bob.user_id, 10).unwrap()[0].id;
    let mark = json!({ "type": "mark_read", "notification_id": newest }).to_string();
    n.on_text(&mark).await;
    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(e, ServerEvent::NotificationCount { count: 1, .. })));
    assert!(events.iter().any(|e| matches!(
        e,
        ServerEvent::NotificationMarkedRead { notification_id } if *notification_id == newest
    )));

    n.on_text(&mark).await;
    n.on_text(r#"{"type":"mark_read"}"#).await;
    n.on_text(&send("wrong channel")).await;
    assert_eq!(
        error_codes(&drain(&mut rx)),
        vec![ErrorCode::NotFound, ErrorCode::ValidationFailed, ErrorCode::UnknownEvent]
    );

    n.on_text(r#"{"type":"mark_all_read"}"#).await;
    let events = drain(&mut rx);
    assert!(
        events
            .iter()
            .any(|e| matches!(e, ServerEvent::AllNotificationsMarkedRead { count: 1 }))
    );
    assert!(events.iter().any(|e| matches!(e, ServerEvent::NotificationCount { count: 0, .. })));
    assert_eq!(gw.services.notifications.unread_count(bob.user_id).unwrap(), 0);

    n.on_close().await;
    assert_eq!(gw.registry.current(bob.user_id), 0);
}

#[tokio::test]
async fn presence_arrivals_during_subscribe_are_not_missed() {
    let gw = gateway(GatewayConfig::default());
    let (bob, carol, dave) = (
        Identity::new(Uuid::new_v4(), "bob"),
        Identity::new(Uuid::new_v4(), "carol"),
        Identity::new(Uuid::new_v4(), "dave"),
    );

    let (mut d, _d_rx) = PresenceSession::connect(gw.clone(), Some(&token(&dave))).await.unwrap();
    d.on_open().await;

    let (mut b, mut b_rx) = PresenceSession::connect(gw.clone(), Some(&token(&bob))).await.unwrap();
    b.subscribe();

    // carol comes online after bob joined the group but before his snapshot.
    let (mut c, _c_rx) = PresenceSession::connect(gw.clone(), Some(&token(&carol))).await.unwrap();
    c.on_open().await;

    b.send_snapshot();
    let seen: Vec<Uuid> = drain(&mut b_rx)
        .into_iter()
        .filter_map(|e| match e {
            ServerEvent::UserOnline { user_id } => Some(user_id),
            _ => None,
        })
        .collect();
    assert!(seen.contains(&dave.user_id));
    assert!(seen.contains(&carol.user_id));
    assert!(!seen.contains(&bob.user_id));
}
