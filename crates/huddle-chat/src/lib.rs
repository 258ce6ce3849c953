//! Chat domain services. Every mutation of threads, messages, reactions and
//! unread counters goes through these types, whichever transport the request
//! arrived on. Storage work happens in one transaction per operation and
//! events are published only after it commits.

use std::sync::Arc;

use huddle_db::Database;
use huddle_types::models::PostingMode;

mod audit;
pub mod error;
pub mod messaging;
pub mod notifications;
pub mod publisher;
pub mod sanitize;
pub mod threads;
pub mod validation;

pub use error::{ChatError, ChatResult};
pub use messaging::MessagingService;
pub use notifications::NotificationService;
pub use publisher::{EventPublisher, PublishError, RecordingPublisher};
pub use sanitize::{HtmlSanitizer, Sanitizer};
pub use threads::{Departure, ThreadService};

/// The three services wired to one database and one publisher, shared by
/// the REST handlers and the WebSocket sessions.
#[derive(Clone)]
pub struct ChatServices {
    pub messaging: Arc<MessagingService>,
    pub threads: Arc<ThreadService>,
    pub notifications: Arc<NotificationService>,
}

impl ChatServices {
    pub fn new(
        db: Arc<Database>,
        publisher: Arc<dyn EventPublisher>,
        default_posting_mode: PostingMode,
    ) -> Self {
        Self {
            messaging: Arc::new(MessagingService::new(db.clone(), publisher.clone())),
            threads: Arc::new(
                ThreadService::new(db.clone(), publisher.clone())
                    .with_default_posting_mode(default_posting_mode),
            ),
            notifications: Arc::new(NotificationService::new(db, publisher)),
        }
    }
}
