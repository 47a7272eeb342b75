//! Bedrock Proxy - an OpenAI-compatible gateway in front of AWS Bedrock
//!
//! Clients speak the OpenAI chat-completions protocol; the proxy translates
//! each request into a Bedrock Converse call, signs it with the caller's AWS
//! credentials and translates the answer back, including streamed responses.
//!
//! - **Chat Completions**: `/v1/chat/completions`, streaming and non-streaming
//! - **Model Listing**: `/v1/models`, merged from foundation models and inference profiles
//! - **Credential Pass-through**: `Bearer AK@SK[|AK@SK...]` or server-side API keys
//! - **Metrics & Monitoring**: Prometheus metrics at `/metrics`
//!
//! # Architecture
//!
//! - [`core`]: Configuration, errors, logging, metrics, middleware
//! - [`api`]: HTTP handlers, credential resolution, wire models, streaming
//! - [`transformer`]: Pure translation between OpenAI and Converse schemas
//! - [`services`]: Backend trait, Bedrock client, event-stream decoding, model catalog
//!
//! # Configuration
//!
//! Configuration comes from environment variables, optionally layered over a
//! YAML file named by `CONFIG_FILE`:
//! - `HOST` / `PORT`: bind address (default: 0.0.0.0:8080)
//! - `AWS_REGION`: default backend region (default: us-west-2)
//! - `AUTH_MODE`: `credential-pair` (default) or `api-key` with `API_KEYS`
//! - `REQUEST_TIMEOUT_SECS`, `STREAM_READ_TIMEOUT_SECS`: backend time bounds
//! - `MODEL_PREFIX`: routing prefix for model ids (default: `bedrock/converse/`)

pub mod api;
pub mod core;
pub mod services;
pub mod transformer;

// Re-export commonly used types for convenience
pub use api::{create_router, AppState, ChatCompletionRequest, ChatCompletionResponse};
pub use core::{AppConfig, AppError, Result};
pub use services::{Backend, BedrockBackend, ModelCatalog};
