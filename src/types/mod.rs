//! Shared data types
//!
//! Model descriptors, loading settings, and chat message structures.

pub mod message;
pub mod model;

pub use message::{ChatMessage, MessageStatus, Role};
pub use model::{LoadingSettings, ModelDescriptor, RuntimeInfo, UserSettings};
