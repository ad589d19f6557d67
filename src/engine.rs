//! Native inference engine contracts
//!
//! The tensor engine itself lives outside this crate. These traits describe
//! the surface the orchestrator calls: weight loading, context/session
//! creation, prompting with streamed chunks, and VRAM/GPU introspection.
//! Implementations typically wrap a llama.cpp binding.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::resources::{GpuTopology, ModelShape};

/// Free/total VRAM snapshot in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VramState {
    pub free: u64,
    pub total: u64,
}

/// GPU layer/batch recommendation produced by the engine's own
/// configuration routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuRecommendation {
    pub gpu_layers: u32,
    pub batch_size: u32,
}

/// Size/batch/thread configuration of a live context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextConfig {
    pub context_size: u32,
    pub batch_size: u32,
    pub threads: u32,
}

/// A tool exposed to the model as a callable
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// A tool invocation the model decided to make during a prompt.
///
/// The orchestrator never executes these; they are surfaced to the caller
/// with a correlation id attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineToolCall {
    pub name: String,
    pub arguments: serde_json::Value,
}

/// One entry of a session's chat history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HistoryEntry {
    User(String),
    /// Assistant turns are response lists; replayed turns carry one element
    Assistant(Vec<String>),
    System(String),
}

/// Options for a single prompt exchange
pub struct PromptOptions {
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    /// Tools the model may request; never executed by the engine
    pub tools: Vec<ToolSpec>,
    /// When set, generated text chunks are delivered here in arrival order.
    /// The channel is bounded so a slow consumer backpressures the engine.
    pub chunk_sink: Option<mpsc::Sender<String>>,
}

/// Outcome of one prompt exchange
#[derive(Debug, Clone)]
pub struct PromptOutcome {
    pub text: String,
    pub tool_calls: Vec<EngineToolCall>,
}

/// The native inference engine
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    /// Load weights with the given GPU layer count
    async fn load_model(&self, path: &Path, gpu_layers: u32) -> Result<Box<dyn LoadedModel>>;

    /// GPU type label (e.g. "cuda", "metal"), if one is in use
    fn gpu_type(&self) -> Option<String>;

    /// The engine's own optimal-configuration routine for layer/batch
    /// selection given hardware topology and model shape.
    fn recommend_gpu_settings(
        &self,
        topology: &GpuTopology,
        shape: &ModelShape,
    ) -> Result<GpuRecommendation>;
}

/// A model whose weights are resident
#[async_trait]
pub trait LoadedModel: Send + Sync {
    async fn create_context(
        &self,
        context_size: u32,
        batch_size: u32,
        threads: u32,
    ) -> Result<Box<dyn ModelContext>>;

    /// Layer count actually offloaded to the GPU
    fn actual_gpu_layers(&self) -> u32;
}

/// A live inference context bound to a loaded model
#[async_trait]
pub trait ModelContext: Send + Sync {
    /// Wrap the context's default sequence in a conversational session
    fn create_session(&self) -> Result<Box<dyn ChatSession>>;

    fn config(&self) -> ContextConfig;

    /// Release the context's native resources
    async fn dispose(&self);
}

/// A stateful conversational session
#[async_trait]
pub trait ChatSession: Send {
    async fn prompt(&mut self, text: &str, options: PromptOptions) -> Result<PromptOutcome>;

    fn chat_history(&self) -> Vec<HistoryEntry>;

    fn set_chat_history(&mut self, history: Vec<HistoryEntry>);

    fn dispose(&mut self);
}
