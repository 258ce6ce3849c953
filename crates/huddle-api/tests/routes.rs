use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use huddle_api::{AppStateInner, router};
use huddle_chat::{ChatServices, RecordingPublisher};
use huddle_db::Database;
use huddle_gateway::TokenVerifier;
use huddle_types::models::PostingMode;
use huddle_types::{Group, Identity, ServerEvent};
use serde_json::{Value, json};
use tempfile::TempDir;
use tower::ServiceExt;
use uuid::Uuid;

/// Tokens of the form `<uuid>:<username>`.
struct PlainTokens;

impl TokenVerifier for PlainTokens {
    fn verify(&self, token: &str) -> Option<Identity> {
        let (id, name) = token.split_once(':')?;
        Some(Identity::new(id.parse().ok()?, name))
    }
}

struct Harness {
    app: Router,
    events: Arc<RecordingPublisher>,
    uploads: TempDir,
}

fn harness() -> Harness {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let events = Arc::new(RecordingPublisher::new());
    let uploads = TempDir::new().unwrap();
    let state = Arc::new(AppStateInner {
        services: ChatServices::new(db, events.clone(), PostingMode::All),
        verifier: Arc::new(PlainTokens),
        upload_dir: uploads.path().to_path_buf(),
        max_upload_bytes: 1024,
        max_message_length: 20,
    });
    Harness {
        app: router(state),
        events,
        uploads,
    }
}

fn user(name: &str) -> Identity {
    Identity::new(Uuid::new_v4(), name)
}

fn bearer(who: &Identity) -> String {
    format!("Bearer {}:{}", who.user_id, who.username)
}

async fn call(
    app: &Router,
    who: Option<&Identity>,
    method: &str,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut req = Request::builder().method(method).uri(uri);
    if let Some(who) = who {
        req = req.header(header::AUTHORIZATION, bearer(who));
    }
    let req = match body {
        Some(body) => req
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => req.body(Body::empty()).unwrap(),
    };
    let res = app.clone().oneshot(req).await.unwrap();
    let status = res.status();
    let bytes = res.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

async fn group(h: &Harness, owner: &Identity, members: &[&Identity]) -> Uuid {
    let ids: Vec<Uuid> = members.iter().map(|m| m.user_id).collect();
    let (status, body) = call(
        &h.app,
        Some(owner),
        "POST",
        "/threads",
        Some(json!({ "type": "group", "title": "team", "participant_ids": ids })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    body["thread"]["id"].as_str().unwrap().parse().unwrap()
}

#[tokio::test]
async fn requests_without_a_valid_token_are_unauthorized() {
    let h = harness();
    let (status, body) = call(&h.app, None, "GET", "/threads", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "authentication required");

    let req = Request::builder()
        .uri("/threads")
        .header(header::AUTHORIZATION, "Bearer garbage")
        .body(Body::empty())
        .unwrap();
    let res = h.app.clone().oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn direct_threads_are_created_once() {
    let h = harness();
    let (alice, bob) = (user("alice"), user("bob"));
    let body = json!({ "type": "direct", "user_id": bob.user_id });

    let (status, first) = call(&h.app, Some(&alice), "POST", "/threads", Some(body)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(first["created"], true);

    let back = json!({ "type": "direct", "user_id": alice.user_id });
    let (status, second) = call(&h.app, Some(&bob), "POST", "/threads", Some(back)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["created"], false);
    assert_eq!(first["thread"]["id"], second["thread"]["id"]);

    let (status, _) = call(
        &h.app,
        Some(&alice),
        "POST",
        "/threads",
        Some(json!({ "type": "direct", "user_id": alice.user_id })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn messages_flow_through_rest_and_update_unread() {
    let h = harness();
    let (alice, bob) = (user("alice"), user("bob"));
    let thread = group(&h, &alice, &[&bob]).await;
    h.events.take();

    let (status, sent) = call(
        &h.app,
        Some(&alice),
        "POST",
        &format!("/threads/{}/messages", thread),
        Some(json!({ "content": "<b>hi</b> <script>x</script>" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(sent["content"], "<b>hi</b>");
    assert!(
        h.events
            .to_group(Group::Thread(thread))
            .iter()
            .any(|(_, e)| matches!(e, ServerEvent::MessageNew { .. }))
    );

    let (_, count) = call(&h.app, Some(&bob), "GET", "/unread-count", None).await;
    assert_eq!(count["total_unread"], 1);
    let (_, notes) = call(&h.app, Some(&bob), "GET", "/notifications/unread-count", None).await;
    assert_eq!(notes["count"], 1);

    let (status, page) = call(
        &h.app,
        Some(&bob),
        "GET",
        &format!("/threads/{}/messages", thread),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page.as_array().unwrap().len(), 1);

    let (status, _) = call(
        &h.app,
        Some(&bob),
        "POST",
        &format!("/threads/{}/read", thread),
        Some(json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (_, count) = call(&h.app, Some(&bob), "GET", "/unread-count", None).await;
    assert_eq!(count["total_unread"], 0);
}

#[tokio::test]
async fn outsiders_cannot_read_or_post() {
    let h = harness();
    let (alice, mallory) = (user("alice"), user("mallory"));
    let thread = group(&h, &alice, &[]).await;
    let uri = format!("/threads/{}/messages", thread);

    let (status, _) = call(&h.app, Some(&mallory), "GET", &uri, None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, _) = call(
        &h.app,
        Some(&mallory),
        "POST",
        &uri,
        Some(json!({ "content": "hi" })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = call(
        &h.app,
        Some(&alice),
        "GET",
        &format!("/threads/{}/messages", Uuid::new_v4()),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn long_messages_and_bad_emoji_are_rejected() {
    let h = harness();
    let alice = user("alice");
    let thread = group(&h, &alice, &[]).await;
    let uri = format!("/threads/{}/messages", thread);

    let (status, _) = call(
        &h.app,
        Some(&alice),
        "POST",
        &uri,
        Some(json!({ "content": "x".repeat(21) })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, sent) = call(
        &h.app,
        Some(&alice),
        "POST",
        &uri,
        Some(json!({ "content": "ok" })),
    )
    .await;
    let message_id = sent["id"].as_str().unwrap().to_string();
    let reactions = format!("/threads/{}/messages/{}/reactions", thread, message_id);

    let (status, _) = call(
        &h.app,
        Some(&alice),
        "POST",
        &reactions,
        Some(json!({ "emoji": "<script>" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = call(
        &h.app,
        Some(&alice),
        "POST",
        &reactions,
        Some(json!({ "emoji": "👍" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (_, page) = call(&h.app, Some(&alice), "GET", &uri, None).await;
    assert_eq!(page[0]["reactions"][0]["emoji"], "👍");
    assert_eq!(page[0]["reactions"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn only_the_author_or_a_moderator_edits() {
    let h = harness();
    let (alice, bob) = (user("alice"), user("bob"));
    let thread = group(&h, &alice, &[&bob]).await;
    let uri = format!("/threads/{}/messages", thread);

    let (_, sent) = call(
        &h.app,
        Some(&bob),
        "POST",
        &uri,
        Some(json!({ "content": "draft" })),
    )
    .await;
    let message_uri = format!("{}/{}", uri, sent["id"].as_str().unwrap());

    let (_, own) = call(
        &h.app,
        Some(&alice),
        "POST",
        &uri,
        Some(json!({ "content": "owner" })),
    )
    .await;
    let own_uri = format!("{}/{}", uri, own["id"].as_str().unwrap());
    let (status, _) = call(
        &h.app,
        Some(&bob),
        "PATCH",
        &own_uri,
        Some(json!({ "content": "hacked" })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, edited) = call(
        &h.app,
        Some(&bob),
        "PATCH",
        &message_uri,
        Some(json!({ "content": "final" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(edited["content"], "final");
    assert!(!edited["edited_at"].is_null());

    let (status, _) = call(&h.app, Some(&alice), "DELETE", &message_uri, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn settings_and_roles_require_moderators() {
    let h = harness();
    let (alice, bob) = (user("alice"), user("bob"));
    let thread = group(&h, &alice, &[&bob]).await;
    let settings = format!("/threads/{}/settings", thread);
    let patch = json!({ "posting_mode": "admins_only" });

    let (status, _) = call(&h.app, Some(&bob), "PATCH", &settings, Some(patch.clone())).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let role_uri = format!("/threads/{}/participants/{}", thread, bob.user_id);
    let (status, _) = call(
        &h.app,
        Some(&alice),
        "PATCH",
        &role_uri,
        Some(json!({ "role": "admin" })),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = call(&h.app, Some(&bob), "PATCH", &settings, Some(patch)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["posting_mode"], "admins_only");

    let (status, _) = call(
        &h.app,
        Some(&alice),
        "POST",
        &format!("/threads/{}/leave", thread),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn uploads_are_hashed_stored_and_linkable() {
    let h = harness();
    let alice = user("alice");
    let thread = group(&h, &alice, &[]).await;

    let req = Request::builder()
        .method("POST")
        .uri(format!("/threads/{}/attachments", thread))
        .header(header::AUTHORIZATION, bearer(&alice))
        .header(header::CONTENT_TYPE, "text/plain")
        .header("X-File-Name", "../../etc/notes.txt")
        .body(Body::from("hello"))
        .unwrap();
    let res = h.app.clone().oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let bytes = res.into_body().collect().await.unwrap().to_bytes();
    let attachment: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(attachment["file_name"], "notes.txt");
    assert_eq!(
        attachment["sha256"],
        "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
    );
    let id = attachment["id"].as_str().unwrap();
    assert!(h.uploads.path().join(id).exists());

    let (status, message) = call(
        &h.app,
        Some(&alice),
        "POST",
        &format!("/threads/{}/messages", thread),
        Some(json!({ "attachment_ids": [id] })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(message["attachments"][0]["id"], id);
}

#[tokio::test]
async fn oversized_uploads_are_refused() {
    let h = harness();
    let alice = user("alice");
    let thread = group(&h, &alice, &[]).await;

    let req = Request::builder()
        .method("POST")
        .uri(format!("/threads/{}/attachments", thread))
        .header(header::AUTHORIZATION, bearer(&alice))
        .header("X-File-Name", "big.bin")
        .body(Body::from(vec![0u8; 4096]))
        .unwrap();
    let res = h.app.clone().oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn notifications_can_be_listed_and_cleared() {
    let h = harness();
    let (alice, bob) = (user("alice"), user("bob"));
    let thread = group(&h, &alice, &[&bob]).await;
    let uri = format!("/threads/{}/messages", thread);
    call(&h.app, Some(&alice), "POST", &uri, Some(json!({ "content": "one" }))).await;
    call(&h.app, Some(&alice), "POST", &uri, Some(json!({ "content": "two" }))).await;

    let (_, list) = call(&h.app, Some(&bob), "GET", "/notifications", None).await;
    let list = list.as_array().unwrap().clone();
    assert_eq!(list.len(), 2);
    assert_eq!(list[0]["body"], "two");

    let first = list[0]["id"].as_str().unwrap();
    let (status, _) = call(
        &h.app,
        Some(&alice),
        "POST",
        &format!("/notifications/{}/read", first),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = call(
        &h.app,
        Some(&bob),
        "POST",
        &format!("/notifications/{}/read", first),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, cleared) = call(&h.app, Some(&bob), "POST", "/notifications/read-all", None).await;
    assert_eq!(cleared["updated"], 1);
    let (_, count) = call(&h.app, Some(&bob), "GET", "/notifications/unread-count", None).await;
    assert_eq!(count["count"], 0);
}

#[tokio::test]
async fn owners_archive_groups_and_archived_threads_list_apart() {
    let h = harness();
    let (owner, bob) = (user("owner"), user("bob"));
    let thread_id = group(&h, &owner, &[&bob]).await;

    let (status, body) = call(
        &h.app,
        Some(&bob),
        "DELETE",
        &format!("/threads/{}", thread_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["archived"], false);

    let (status, body) = call(
        &h.app,
        Some(&owner),
        "DELETE",
        &format!("/threads/{}", thread_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["archived"], true);

    let (_, live) = call(&h.app, Some(&owner), "GET", "/threads", None).await;
    assert_eq!(live.as_array().unwrap().len(), 0);
    let (_, archived) = call(&h.app, Some(&owner), "GET", "/threads?archived=true", None).await;
    assert_eq!(archived.as_array().unwrap().len(), 1);
    assert_eq!(archived[0]["is_archived"], true);

    let archived_updates = h
        .events
        .to_group(Group::Thread(thread_id))
        .into_iter()
        .filter(|(_, e)| {
            matches!(e, ServerEvent::ThreadUpdated { thread, .. } if thread.is_archived)
        })
        .count();
    assert_eq!(archived_updates, 1);
}

#[tokio::test]
async fn titles_change_through_patch_for_moderators_only() {
    let h = harness();
    let (owner, bob) = (user("owner"), user("bob"));
    let thread_id = group(&h, &owner, &[&bob]).await;
    let uri = format!("/threads/{}", thread_id);

    let (status, _) = call(
        &h.app,
        Some(&bob),
        "PATCH",
        &uri,
        Some(json!({ "title": "bob's" })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = call(
        &h.app,
        Some(&owner),
        "PATCH",
        &uri,
        Some(json!({ "title": "renamed" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["title"], "renamed");

    let (status, _) = call(&h.app, Some(&owner), "PATCH", &uri, Some(json!({ "title": "" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn members_and_audit_trail_are_exposed() {
    let h = harness();
    let (owner, bob, carol) = (user("owner"), user("bob"), user("carol"));
    let thread_id = group(&h, &owner, &[&bob]).await;
    let members_uri = format!("/threads/{}/participants", thread_id);

    let (status, _) = call(
        &h.app,
        Some(&owner),
        "POST",
        &members_uri,
        Some(json!({ "user_ids": [carol.user_id] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let added = h
        .events
        .to_group(Group::Thread(thread_id))
        .into_iter()
        .filter(|(_, e)| {
            matches!(e, ServerEvent::MemberAdded { user_id, .. } if *user_id == carol.user_id)
        })
        .count();
    assert_eq!(added, 1);

    let (status, members) = call(&h.app, Some(&bob), "GET", &members_uri, None).await;
    assert_eq!(status, StatusCode::OK);
    let roles: Vec<&str> = members
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["role"].as_str().unwrap())
        .collect();
    assert_eq!(roles, vec!["owner", "member", "member"]);

    let outsider = user("outsider");
    let (status, _) = call(&h.app, Some(&outsider), "GET", &members_uri, None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let audit_uri = format!("/threads/{}/audit", thread_id);
    let (status, _) = call(&h.app, Some(&bob), "GET", &audit_uri, None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, trail) = call(&h.app, Some(&owner), "GET", &audit_uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(trail[0]["action"], "member_added");
    assert_eq!(trail[1]["action"], "thread_created");
}
