use std::path::PathBuf;
use std::sync::Arc;

use huddle_chat::ChatServices;
use huddle_gateway::TokenVerifier;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub services: ChatServices,
    pub verifier: Arc<dyn TokenVerifier>,
    /// Attachments land here as `<upload_dir>/<attachment id>`.
    pub upload_dir: PathBuf,
    pub max_upload_bytes: usize,
    /// Same ceiling the WebSocket path enforces, in characters.
    pub max_message_length: usize,
}
