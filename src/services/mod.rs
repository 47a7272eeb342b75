//! Backend services for the Bedrock proxy.
//!
//! This module contains the backend capability trait, its Bedrock HTTP
//! implementation (SigV4 signing, event-stream decoding) and the model catalog.

pub mod backend;
pub mod bedrock;
pub mod eventstream;
pub mod model_catalog;
pub mod sigv4;

// Re-export commonly used types
pub use backend::{Backend, BackendEventStream, BackendInvocation, ConverseStreamEvent};
pub use bedrock::BedrockBackend;
pub use model_catalog::ModelCatalog;
