//! Persistent storage
//!
//! Per-model settings persistence and the conversation-store contract.

pub mod conversations;
pub mod settings;

pub use conversations::ConversationStore;
pub use settings::{JsonSettingsStore, SettingsStore};
