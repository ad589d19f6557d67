//! Conversation store contract
//!
//! Durable conversation history lives outside this crate; sessions only read
//! a thread's message list when they hydrate.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::ChatMessage;

/// Read access to stored conversation threads
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Prepare the store (open files, run migrations). Idempotent.
    async fn load(&self) -> Result<()>;

    /// Full message list of a thread, oldest first
    async fn thread_messages(&self, thread_id: &str) -> Result<Vec<ChatMessage>>;
}
