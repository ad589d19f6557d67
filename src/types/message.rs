//! Message types
//!
//! Chat message structures as read from the conversation store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role of a message sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// Delivery status of a stored message.
///
/// Only `Completed` messages are ever replayed into a session: in-flight or
/// abandoned content must not become part of what the model sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Completed,
    InProgress,
    Cancelled,
    Failed,
}

/// A single message from a conversation thread
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    pub status: MessageStatus,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    /// Create a completed message
    pub fn completed(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            status: MessageStatus::Completed,
            timestamp: Utc::now(),
        }
    }
}
