//! Schema translation between the OpenAI chat API and Bedrock Converse.
//!
//! ```text
//! ChatCompletionRequest ──translate_request──▶ BackendInvocation
//!                                                    │
//!                                                 Backend
//!                                                    │
//! ChatCompletionResponse ◀──translate_response── ConverseResponse
//! ChatCompletionChunk    ◀──translate_chunk───── ConverseStreamEvent
//! ```
//!
//! All functions here are pure apart from id generation and timestamps.
//! Provider differences are expressed through [`ModelFamily`], dispatched by
//! model id namespace.

pub mod model_id;
pub mod request;
pub mod response;
pub mod stream;

pub use model_id::{
    normalize_model_id, provider_namespace, resolve_model, FamilyCapabilities, ModelFamily,
    ResolvedModel, DEFAULT_MODEL_PREFIX,
};
pub use request::{repair_tool_call_ids, translate_request, Translation, TranslationWarning};
pub use response::{map_stop_reason, map_usage, translate_response};
pub use stream::{translate_chunk, StreamContext};
