//! Session hydration
//!
//! The engine session holds conversation state natively. These helpers keep
//! it in sync with stored threads: replaying a thread's completed messages
//! into a session, and rebuilding the session from the model when its state
//! can no longer be trusted.

use crate::engine::HistoryEntry;
use crate::error::Result;
use crate::runtime::lifecycle::ActiveModel;
use crate::storage::ConversationStore;
use crate::types::{ChatMessage, MessageStatus, Role};

/// Convert stored messages to engine history.
///
/// Messages that never completed are dropped: replaying a cancelled or
/// failed turn would teach the model a truncated exchange. A trailing user
/// turn with no answer is dropped too, so an unanswered prompt is not
/// presented as already asked.
pub fn build_history(messages: &[ChatMessage]) -> Vec<HistoryEntry> {
    let mut history: Vec<HistoryEntry> = messages
        .iter()
        .filter(|m| m.status == MessageStatus::Completed)
        .map(|m| match m.role {
            Role::User => HistoryEntry::User(m.content.clone()),
            Role::Assistant => HistoryEntry::Assistant(vec![m.content.clone()]),
            Role::System => HistoryEntry::System(m.content.clone()),
        })
        .collect();
    if matches!(history.last(), Some(HistoryEntry::User(_))) {
        history.pop();
    }
    history
}

/// Replay a thread's history into the active session, unless the session
/// already mirrors that thread.
pub(crate) async fn hydrate_session(
    active: &mut ActiveModel,
    store: &dyn ConversationStore,
    thread_id: &str,
) -> Result<()> {
    if active.hydrated_thread.as_deref() == Some(thread_id) {
        return Ok(());
    }

    store.load().await?;
    let messages = store.thread_messages(thread_id).await?;
    let history = build_history(&messages);
    tracing::debug!(
        thread_id,
        entries = history.len(),
        "hydrating session from stored thread"
    );
    active.session.set_chat_history(history);
    active.hydrated_thread = Some(thread_id.to_string());
    Ok(())
}

/// Tear down the session and its context and rebuild both with the same
/// size/batch/thread configuration.
///
/// Used after a failed prompt, when the native state is undefined; a fresh
/// context is safer than attempting in-place repair. The hydration marker is
/// cleared so the next threaded request replays history from the store.
pub(crate) async fn recreate_session(active: &mut ActiveModel) -> Result<()> {
    let config = active.context.config();
    active.session.dispose();
    active.context.dispose().await;
    active.context = active
        .model
        .create_context(config.context_size, config.batch_size, config.threads)
        .await?;
    active.session = active.context.create_session()?;
    active.hydrated_thread = None;
    Ok(())
}
