//! Generation pipeline
//!
//! Runs prompts against the active session, bridging the engine's chunked
//! output into a pull-based stream, honoring a stop signal between chunks,
//! and repairing the session when a prompt fails so the next request starts
//! clean.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::engine::{EngineToolCall, PromptOptions, PromptOutcome, ToolSpec};
use crate::error::{ManagerError, Result};
use crate::runtime::lifecycle::ModelLifecycle;
use crate::runtime::session::{hydrate_session, recreate_session};
use crate::storage::ConversationStore;
use crate::system::InferenceActivity;
use crate::types::{ChatMessage, Role};

/// How often the stop signal is polled while waiting on the engine
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Source of tool specs offered to the model on each prompt
pub trait ToolProvider: Send + Sync {
    fn available_tools(&self) -> Vec<ToolSpec>;
}

/// Provider used when the embedder wires no tools
pub struct NoTools;

impl ToolProvider for NoTools {
    fn available_tools(&self) -> Vec<ToolSpec> {
        Vec::new()
    }
}

/// Per-request generation options
#[derive(Default)]
pub struct GenerateOptions {
    /// Conversation thread to hydrate the session from before prompting
    pub thread_id: Option<String>,
    pub max_tokens: Option<u32>,
    /// Overrides the model's configured temperature for this request
    pub temperature: Option<f32>,
    pub disable_tools: bool,
    /// Restore the session history to its pre-request state afterwards, so
    /// a speculative generation never persists into the conversation
    pub disable_chat_history: bool,
    /// Checked between chunks; setting it aborts the generation with
    /// [`ManagerError::Cancelled`]
    pub stop_signal: Option<Arc<AtomicBool>>,
}

/// A tool call surfaced to the caller with a correlation id attached.
///
/// Never executed by the pipeline; the caller runs the tool out-of-band.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

impl ToolInvocation {
    fn from_engine(call: EngineToolCall) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: call.name,
            arguments: call.arguments,
        }
    }
}

/// Outcome of one completed generation request
#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub text: String,
    pub tool_calls: Vec<ToolInvocation>,
}

/// A finite, non-restartable stream of generated text chunks.
///
/// Chunks are pulled with [`next_chunk`](Self::next_chunk) until it returns
/// `None`; [`finish`](Self::finish) then yields the final outcome (or the
/// error that ended the stream).
pub struct ResponseStream {
    chunks: mpsc::Receiver<String>,
    handle: JoinHandle<Result<GenerationResult>>,
}

impl ResponseStream {
    pub async fn next_chunk(&mut self) -> Option<String> {
        self.chunks.recv().await
    }

    pub async fn finish(mut self) -> Result<GenerationResult> {
        // Unread chunks would look like a vanished consumer to the producer
        while self.chunks.recv().await.is_some() {}
        match self.handle.await {
            Ok(result) => result,
            Err(err) => Err(ManagerError::Engine(format!(
                "generation task failed: {err}"
            ))),
        }
    }
}

/// Prompt execution against the active model
#[derive(Clone)]
pub struct GenerationPipeline {
    lifecycle: Arc<ModelLifecycle>,
    conversations: Arc<dyn ConversationStore>,
    tools: Arc<dyn ToolProvider>,
    activity: InferenceActivity,
}

impl GenerationPipeline {
    pub fn new(
        lifecycle: Arc<ModelLifecycle>,
        conversations: Arc<dyn ConversationStore>,
        tools: Arc<dyn ToolProvider>,
        activity: InferenceActivity,
    ) -> Self {
        Self {
            lifecycle,
            conversations,
            tools,
            activity,
        }
    }

    /// Run a prompt to completion, returning the full response text.
    ///
    /// The model is loaded first if it is not already active. The prompt is
    /// the most recent user message in `messages`.
    pub async fn generate_response(
        &self,
        id_or_name: &str,
        messages: &[ChatMessage],
        options: GenerateOptions,
    ) -> Result<GenerationResult> {
        self.run(id_or_name, messages, options, None).await
    }

    /// Run a prompt, returning chunks as a pull-based stream.
    ///
    /// The stream is bounded: an unread chunk backpressures the engine
    /// rather than being dropped. Errors, including cancellation, surface
    /// from [`ResponseStream::finish`].
    pub fn generate_stream_response(
        &self,
        id_or_name: &str,
        messages: Vec<ChatMessage>,
        options: GenerateOptions,
    ) -> ResponseStream {
        let (tx, rx) = mpsc::channel(1);
        let pipeline = self.clone();
        let id_or_name = id_or_name.to_string();
        let handle = tokio::spawn(async move {
            pipeline.run(&id_or_name, &messages, options, Some(tx)).await
        });
        ResponseStream { chunks: rx, handle }
    }

    async fn run(
        &self,
        id_or_name: &str,
        messages: &[ChatMessage],
        options: GenerateOptions,
        sink: Option<mpsc::Sender<String>>,
    ) -> Result<GenerationResult> {
        let prompt = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .ok_or_else(|| ManagerError::NotFound("no user message in request".to_string()))?;

        if !self.lifecycle.is_loaded(id_or_name).await {
            self.lifecycle.load_model(id_or_name).await?;
        }

        let _activity = self.activity.begin();

        let mut slot = self.lifecycle.active_slot().await;
        let active = slot
            .as_mut()
            .ok_or_else(|| ManagerError::Conflict("no model is loaded".to_string()))?;

        if !options.disable_chat_history {
            if let Some(thread_id) = &options.thread_id {
                hydrate_session(active, self.conversations.as_ref(), thread_id).await?;
            }
        }

        // Restored on failure, and on any outcome when history is disabled
        let snapshot = active.session.chat_history();

        let tools = if options.disable_tools {
            Vec::new()
        } else {
            self.tools.available_tools()
        };
        let temperature = options
            .temperature
            .unwrap_or(active.descriptor.settings.temperature);

        let (chunk_tx, mut chunk_rx) = mpsc::channel::<String>(1);
        let prompt_options = PromptOptions {
            temperature,
            max_tokens: options.max_tokens,
            tools,
            chunk_sink: Some(chunk_tx),
        };

        tracing::debug!(
            model = %active.descriptor.name,
            thread = options.thread_id.as_deref().unwrap_or("none"),
            "starting generation"
        );

        let stop = options.stop_signal.clone();
        let mut streamed = String::new();
        let mut cancelled = false;
        let mut chunks_done = false;
        let outcome: Result<PromptOutcome>;

        // The engine-side prompt is never force-killed on cancellation;
        // closing the chunk channel unwinds its output instead, and the
        // future is awaited to completion so session state stays coherent.
        {
            let mut prompt_future = std::pin::pin!(active.session.prompt(&prompt, prompt_options));
            loop {
                tokio::select! {
                    result = &mut prompt_future => {
                        outcome = result;
                        break;
                    }
                    chunk = chunk_rx.recv(), if !chunks_done => {
                        match chunk {
                            Some(text) if !cancelled => {
                                streamed.push_str(&text);
                                if let Some(sink) = &sink {
                                    if sink.send(text).await.is_err() {
                                        // Consumer went away mid-stream
                                        cancelled = true;
                                        chunk_rx.close();
                                    }
                                }
                                if !cancelled && stop_requested(&stop) {
                                    cancelled = true;
                                    chunk_rx.close();
                                }
                            }
                            Some(_) => {}
                            None => chunks_done = true,
                        }
                    }
                    _ = poll_stop(&stop), if stop.is_some() && !cancelled => {
                        cancelled = true;
                        chunk_rx.close();
                    }
                }
            }
        }

        if cancelled {
            if options.disable_chat_history {
                active.session.set_chat_history(snapshot);
            }
            tracing::info!(produced = streamed.len(), "generation cancelled");
            return Err(ManagerError::Cancelled);
        }

        match outcome {
            Ok(result) => {
                // Chunks still in flight when the prompt settled
                if !chunks_done {
                    while let Some(text) = chunk_rx.recv().await {
                        streamed.push_str(&text);
                        if let Some(sink) = &sink {
                            if sink.send(text).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                if options.disable_chat_history {
                    active.session.set_chat_history(snapshot);
                }
                tracing::debug!(
                    chars = result.text.len(),
                    tool_calls = result.tool_calls.len(),
                    "generation complete"
                );
                Ok(GenerationResult {
                    text: result.text,
                    tool_calls: result
                        .tool_calls
                        .into_iter()
                        .map(ToolInvocation::from_engine)
                        .collect(),
                })
            }
            Err(err) => {
                // Rebuild so the next request starts clean; the original
                // error is the one propagated even if the rebuild fails.
                tracing::error!(error = %err, "generation failed, rebuilding session");
                match recreate_session(active).await {
                    Ok(()) => active.session.set_chat_history(snapshot),
                    Err(rebuild_err) => {
                        tracing::warn!(error = %rebuild_err, "session rebuild failed");
                    }
                }
                Err(err)
            }
        }
    }

    /// Force a refresh of the active session's history from a stored thread
    pub async fn update_session_history(&self, id_or_name: &str, thread_id: &str) -> Result<()> {
        let mut slot = self.lifecycle.active_slot().await;
        let active = slot
            .as_mut()
            .filter(|a| {
                a.descriptor.id == id_or_name
                    || a.descriptor.name.eq_ignore_ascii_case(id_or_name)
                    || a.descriptor.filename == id_or_name
            })
            .ok_or_else(|| {
                ManagerError::Conflict(format!("model '{id_or_name}' is not loaded"))
            })?;

        active.hydrated_thread = None;
        hydrate_session(active, self.conversations.as_ref(), thread_id).await
    }

    /// Whether a generation is currently running
    pub fn is_generating(&self) -> bool {
        self.activity.is_active()
    }
}

fn stop_requested(stop: &Option<Arc<AtomicBool>>) -> bool {
    stop.as_ref().is_some_and(|s| s.load(Ordering::SeqCst))
}

async fn poll_stop(stop: &Option<Arc<AtomicBool>>) {
    let Some(stop) = stop else {
        // Branch is disabled by the select guard; never resolve
        std::future::pending::<()>().await;
        return;
    };
    loop {
        if stop.load(Ordering::SeqCst) {
            return;
        }
        tokio::time::sleep(STOP_POLL_INTERVAL).await;
    }
}
