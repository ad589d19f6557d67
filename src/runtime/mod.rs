//! Model runtime
//!
//! Load/unload lifecycle for the single active model, session hydration from
//! stored conversations, and the streaming generation pipeline.

pub mod generation;
pub mod lifecycle;
pub mod session;

pub use generation::{
    GenerateOptions, GenerationPipeline, GenerationResult, NoTools, ResponseStream,
    ToolInvocation, ToolProvider,
};
pub use lifecycle::ModelLifecycle;
