//! API layer for the Bedrock proxy.
//!
//! This module contains the HTTP handlers, credential resolution, the
//! OpenAI-compatible wire models and the streaming coordinator.

pub mod auth;
pub mod disconnect;
pub mod handlers;
pub mod models;
pub mod streaming;

// Re-export commonly used types
pub use auth::{resolver_for, CredentialResolver, CredentialSet, CredentialSource};
pub use handlers::{chat_completions, create_router, health, list_models, metrics_handler, AppState};
pub use models::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ModelDescriptor, ModelList,
};
pub use streaming::{StreamCoordinator, StreamState};
