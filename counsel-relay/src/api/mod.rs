//! HTTP API handlers for counsel-relay

pub mod chat;
pub mod conversations;
pub mod health;

pub use chat::chat_stream;
pub use conversations::{create_conversation, get_conversation};
pub use health::health_routes;
