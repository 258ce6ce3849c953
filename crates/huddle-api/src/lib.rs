//! REST surface over the chat services. Every route requires a bearer token.

pub mod error;
pub mod files;
pub mod messages;
pub mod middleware;
pub mod notifications;
pub mod reactions;
pub mod state;
pub mod threads;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware::from_fn_with_state,
    routing::{delete, get, patch, post, put},
};
use tower_http::limit::RequestBodyLimitLayer;

pub use error::{ApiError, ApiResult};
pub use state::{AppState, AppStateInner};

pub fn router(state: AppState) -> Router {
    let uploads = Router::new()
        .route("/threads/{thread_id}/attachments", post(files::upload_attachment))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(state.max_upload_bytes));

    Router::new()
        .route("/threads", get(threads::list_threads).post(threads::create_thread))
        .route(
            "/threads/{thread_id}",
            patch(threads::update_thread).delete(threads::delete_thread),
        )
        .route("/threads/{thread_id}/leave", post(threads::leave_thread))
        .route(
            "/threads/{thread_id}/participants",
            get(threads::list_members).post(threads::add_participants),
        )
        .route(
            "/threads/{thread_id}/participants/{user_id}",
            delete(threads::remove_participant).patch(threads::change_role),
        )
        .route("/threads/{thread_id}/settings", patch(threads::update_settings))
        .route("/threads/{thread_id}/audit", get(threads::audit_log))
        .route("/threads/{thread_id}/mute", put(threads::set_muted))
        .route("/threads/{thread_id}/read", post(threads::mark_read))
        .route(
            "/threads/{thread_id}/messages",
            get(messages::list_messages).post(messages::send_message),
        )
        .route(
            "/threads/{thread_id}/messages/{message_id}",
            patch(messages::edit_message).delete(messages::delete_message),
        )
        .route(
            "/threads/{thread_id}/messages/{message_id}/reactions",
            post(reactions::add_reaction),
        )
        .route(
            "/threads/{thread_id}/messages/{message_id}/reactions/{emoji}",
            delete(reactions::remove_reaction),
        )
        .route("/unread-count", get(notifications::unread_count))
        .route("/notifications", get(notifications::list_notifications))
        .route("/notifications/unread-count", get(notifications::notification_count))
        .route("/notifications/read-all", post(notifications::mark_all_read))
        .route("/notifications/{notification_id}/read", post(notifications::mark_read))
        .merge(uploads)
        .layer(from_fn_with_state(state.clone(), middleware::require_auth))
        .with_state(state)
}
