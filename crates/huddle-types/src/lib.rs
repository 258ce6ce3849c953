pub mod api;
pub mod events;
pub mod models;

pub use events::{Audience, ClientEvent, ErrorCode, Group, ServerEvent};
pub use models::Identity;
