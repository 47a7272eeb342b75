//! Backend inference capability and the Bedrock Converse wire types.
//!
//! The [`Backend`] trait is the seam between the router and the model
//! service. [`crate::services::BedrockBackend`] implements it over HTTP; tests
//! substitute in-process fakes.

use crate::api::auth::CredentialSet;
use crate::core::error::Result;
use crate::core::AppError;
use crate::transformer::ModelFamily;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;

/// Lazily produced, finite sequence of backend stream events.
pub type BackendEventStream = Pin<Box<dyn Stream<Item = Result<ConverseStreamEvent>> + Send>>;

/// Backend inference capability.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Run one non-streaming completion.
    async fn invoke(
        &self,
        credentials: &CredentialSet,
        invocation: &BackendInvocation,
    ) -> Result<ConverseResponse>;

    /// Open a streaming completion. Errors here happen before any event is produced.
    async fn invoke_stream(
        &self,
        credentials: &CredentialSet,
        invocation: &BackendInvocation,
    ) -> Result<BackendEventStream>;

    async fn list_foundation_models(
        &self,
        credentials: &CredentialSet,
    ) -> Result<Vec<FoundationModelSummary>>;

    async fn list_inference_profiles(
        &self,
        credentials: &CredentialSet,
    ) -> Result<Vec<InferenceProfileSummary>>;
}

/// A chat request translated into the backend's native schema.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendInvocation {
    /// Backend model id with the routing prefix removed
    pub model_id: String,
    pub family: ModelFamily,
    pub request: ConverseRequest,
}

// ============================================================================
// Converse request
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConverseRequest {
    pub messages: Vec<ConverseMessage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub system: Vec<SystemBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inference_config: Option<InferenceConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_config: Option<ToolConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_model_request_fields: Option<Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConverseRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConverseMessage {
    pub role: ConverseRole,
    pub content: Vec<ContentBlock>,
}

/// One content block. Serialized externally tagged, e.g. `{"text": "..."}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum ContentBlock {
    Text(String),
    Image(ImageBlock),
    ToolUse(ToolUseBlock),
    ToolResult(ToolResultBlock),
    CachePoint(CachePointBlock),
    ReasoningContent(ReasoningContentBlock),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageBlock {
    /// png | jpeg | gif | webp
    pub format: String,
    pub source: ImageSource,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageSource {
    /// Base64 encoded image bytes
    pub bytes: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolUseBlock {
    pub tool_use_id: String,
    pub name: String,
    pub input: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultBlock {
    pub tool_use_id: String,
    pub content: Vec<ToolResultContent>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum ToolResultContent {
    Text(String),
    Json(Value),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachePointBlock {
    #[serde(rename = "type")]
    pub kind: String,
}

impl Default for CachePointBlock {
    fn default() -> Self {
        Self {
            kind: "default".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReasoningContentBlock {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_text: Option<ReasoningText>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReasoningText {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum SystemBlock {
    Text(String),
    CachePoint(CachePointBlock),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InferenceConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,
}

impl InferenceConfig {
    pub fn is_empty(&self) -> bool {
        self.max_tokens.is_none()
            && self.temperature.is_none()
            && self.top_p.is_none()
            && self.stop_sequences.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolConfig {
    pub tools: Vec<Tool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum Tool {
    ToolSpec(ToolSpec),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: ToolInputSchema,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolInputSchema {
    pub json: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum ToolChoice {
    Auto(EmptyObject),
    Any(EmptyObject),
    Tool(NamedTool),
}

/// Serializes as `{}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EmptyObject {}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NamedTool {
    pub name: String,
}

// ============================================================================
// Converse response
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConverseResponse {
    pub output: ConverseOutput,
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConverseOutput {
    #[serde(default)]
    pub message: Option<OutputMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputMessage {
    pub role: String,
    /// Kept raw so block types this proxy does not know are skipped instead of failing
    #[serde(default)]
    pub content: Vec<Value>,
}

impl OutputMessage {
    /// Content blocks this proxy understands, in order.
    pub fn blocks(&self) -> Vec<ContentBlock> {
        self.content
            .iter()
            .filter_map(|raw| serde_json::from_value(raw.clone()).ok())
            .collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: Option<u32>,
    #[serde(default)]
    pub output_tokens: Option<u32>,
    #[serde(default)]
    pub total_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_write_input_tokens: Option<u32>,
}

// ============================================================================
// Converse stream events
// ============================================================================

/// A typed event decoded from one `converse-stream` frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ConverseStreamEvent {
    MessageStart {
        role: String,
    },
    ContentBlockStart {
        index: u32,
        tool_use: Option<ToolUseStart>,
    },
    ContentBlockDelta {
        index: u32,
        delta: BlockDelta,
    },
    ContentBlockStop {
        index: u32,
    },
    MessageStop {
        stop_reason: Option<String>,
    },
    Metadata {
        usage: Option<TokenUsage>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolUseStart {
    pub tool_use_id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BlockDelta {
    Text(String),
    /// Fragment of the JSON-encoded tool input
    ToolUseInput(String),
    Reasoning(String),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessageStart {
    #[serde(default)]
    role: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawToolUseStart {
    tool_use_id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct RawBlockStartInner {
    #[serde(default, rename = "toolUse")]
    tool_use: Option<RawToolUseStart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBlockStart {
    #[serde(default)]
    content_block_index: u32,
    #[serde(default)]
    start: Option<RawBlockStartInner>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBlockDelta {
    #[serde(default)]
    content_block_index: u32,
    #[serde(default)]
    delta: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBlockStop {
    #[serde(default)]
    content_block_index: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessageStop {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawMetadata {
    #[serde(default)]
    usage: Option<TokenUsage>,
}

impl ConverseStreamEvent {
    /// Decode the JSON payload of an `event` frame.
    ///
    /// Returns `Ok(None)` for event types this proxy does not forward.
    pub fn from_event(event_type: &str, payload: &[u8]) -> Result<Option<Self>> {
        let event = match event_type {
            "messageStart" => {
                let raw: RawMessageStart = serde_json::from_slice(payload)?;
                ConverseStreamEvent::MessageStart {
                    role: raw.role.unwrap_or_else(|| "assistant".to_string()),
                }
            }
            "contentBlockStart" => {
                let raw: RawBlockStart = serde_json::from_slice(payload)?;
                ConverseStreamEvent::ContentBlockStart {
                    index: raw.content_block_index,
                    tool_use: raw
                        .start
                        .and_then(|s| s.tool_use)
                        .map(|t| ToolUseStart {
                            tool_use_id: t.tool_use_id,
                            name: t.name,
                        }),
                }
            }
            "contentBlockDelta" => {
                let raw: RawBlockDelta = serde_json::from_slice(payload)?;
                let Some(delta) = raw.delta.as_ref().and_then(parse_block_delta) else {
                    return Ok(None);
                };
                ConverseStreamEvent::ContentBlockDelta {
                    index: raw.content_block_index,
                    delta,
                }
            }
            "contentBlockStop" => {
                let raw: RawBlockStop = serde_json::from_slice(payload)?;
                ConverseStreamEvent::ContentBlockStop {
                    index: raw.content_block_index,
                }
            }
            "messageStop" => {
                let raw: RawMessageStop = serde_json::from_slice(payload)?;
                ConverseStreamEvent::MessageStop {
                    stop_reason: raw.stop_reason,
                }
            }
            "metadata" => {
                let raw: RawMetadata = serde_json::from_slice(payload)?;
                ConverseStreamEvent::Metadata { usage: raw.usage }
            }
            other => {
                tracing::debug!(event_type = other, "Skipping unknown converse-stream event");
                return Ok(None);
            }
        };
        Ok(Some(event))
    }
}

fn parse_block_delta(delta: &Value) -> Option<BlockDelta> {
    if let Some(text) = delta.get("text").and_then(|v| v.as_str()) {
        return Some(BlockDelta::Text(text.to_string()));
    }
    if let Some(input) = delta
        .get("toolUse")
        .and_then(|t| t.get("input"))
        .and_then(|v| v.as_str())
    {
        return Some(BlockDelta::ToolUseInput(input.to_string()));
    }
    delta
        .get("reasoningContent")
        .and_then(|r| r.get("text"))
        .and_then(|v| v.as_str())
        .map(|text| BlockDelta::Reasoning(text.to_string()))
}

/// Map a `converse-stream` exception frame to the error taxonomy.
pub fn exception_to_error(exception_type: &str, message: &str, read_timeout_secs: u64) -> AppError {
    let lower = exception_type.to_ascii_lowercase();
    if lower.contains("modeltimeout") {
        AppError::BackendTimeout {
            timeout_secs: read_timeout_secs,
        }
    } else if lower.contains("internalserver") || lower.contains("serviceunavailable") {
        AppError::BackendUnavailable(format!("{}: {}", exception_type, message))
    } else {
        AppError::BackendRejected {
            message: format!("Backend stream failed: {}", exception_type),
            upstream_detail: Some(message.to_string()),
        }
    }
}

// ============================================================================
// Control plane listings
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FoundationModelSummary {
    pub model_id: String,
    #[serde(default)]
    pub provider_name: Option<String>,
    #[serde(default)]
    pub output_modalities: Vec<String>,
    #[serde(default)]
    pub inference_types_supported: Vec<String>,
}

impl FoundationModelSummary {
    /// Text output and on-demand invocation, or unknown.
    pub fn is_invokable_chat_model(&self) -> bool {
        let text = self.output_modalities.is_empty()
            || self.output_modalities.iter().any(|m| m == "TEXT");
        let on_demand = self.inference_types_supported.is_empty()
            || self
                .inference_types_supported
                .iter()
                .any(|t| t == "ON_DEMAND");
        text && on_demand
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InferenceProfileSummary {
    pub inference_profile_id: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: Option<String>,
}

impl InferenceProfileSummary {
    pub fn is_active(&self) -> bool {
        self.status.as_deref().map_or(true, |s| s == "ACTIVE")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_content_block_wire_shape() {
        let blocks = vec![
            ContentBlock::Text("hi".to_string()),
            ContentBlock::CachePoint(CachePointBlock::default()),
            ContentBlock::ToolUse(ToolUseBlock {
                tool_use_id: "t1".to_string(),
                name: "lookup".to_string(),
                input: json!({"q": "x"}),
            }),
        ];
        let value = serde_json::to_value(&blocks).unwrap();
        assert_eq!(
            value,
            json!([
                {"text": "hi"},
                {"cachePoint": {"type": "default"}},
                {"toolUse": {"toolUseId": "t1", "name": "lookup", "input": {"q": "x"}}}
            ])
        );
    }

    #[test]
    fn test_tool_choice_wire_shape() {
        assert_eq!(
            serde_json::to_value(ToolChoice::Auto(EmptyObject::default())).unwrap(),
            json!({"auto": {}})
        );
        assert_eq!(
            serde_json::to_value(ToolChoice::Tool(NamedTool {
                name: "f".to_string()
            }))
            .unwrap(),
            json!({"tool": {"name": "f"}})
        );
    }

    #[test]
    fn test_request_omits_empty_sections() {
        let request = ConverseRequest {
            messages: vec![ConverseMessage {
                role: ConverseRole::User,
                content: vec![ContentBlock::Text("x".to_string())],
            }],
            ..Default::default()
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            json!({"messages": [{"role": "user", "content": [{"text": "x"}]}]})
        );
    }

    #[test]
    fn test_response_skips_unknown_blocks() {
        let response: ConverseResponse = serde_json::from_value(json!({
            "output": {"message": {"role": "assistant", "content": [
                {"text": "Hello"},
                {"guardContent": {"text": {"text": "x"}}}
            ]}},
            "stopReason": "end_turn",
            "usage": {"inputTokens": 3, "outputTokens": 5, "totalTokens": 8},
            "metrics": {"latencyMs": 12}
        }))
        .unwrap();

        let blocks = response.output.message.unwrap().blocks();
        assert_eq!(blocks, vec![ContentBlock::Text("Hello".to_string())]);
        assert_eq!(response.usage.unwrap().total_tokens, Some(8));
    }

    #[test]
    fn test_stream_event_decoding() {
        let event = ConverseStreamEvent::from_event(
            "contentBlockDelta",
            br#"{"contentBlockIndex":0,"delta":{"text":"Hi"},"p":"abc"}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            Some(ConverseStreamEvent::ContentBlockDelta {
                index: 0,
                delta: BlockDelta::Text("Hi".to_string())
            })
        );

        let event = ConverseStreamEvent::from_event(
            "contentBlockStart",
            br#"{"contentBlockIndex":1,"start":{"toolUse":{"toolUseId":"tu_1","name":"calc"}}}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            Some(ConverseStreamEvent::ContentBlockStart {
                index: 1,
                tool_use: Some(ToolUseStart {
                    tool_use_id: "tu_1".to_string(),
                    name: "calc".to_string()
                })
            })
        );

        let event =
            ConverseStreamEvent::from_event("messageStop", br#"{"stopReason":"tool_use"}"#)
                .unwrap();
        assert_eq!(
            event,
            Some(ConverseStreamEvent::MessageStop {
                stop_reason: Some("tool_use".to_string())
            })
        );
    }

    #[test]
    fn test_unknown_stream_event_skipped() {
        let event = ConverseStreamEvent::from_event("somethingNew", b"{}").unwrap();
        assert!(event.is_none());
    }

    #[test]
    fn test_exception_mapping() {
        let err = exception_to_error("throttlingException", "Too many requests", 60);
        assert_eq!(err.kind(), crate::core::ErrorKind::BackendRejected);
        assert_eq!(err.upstream_detail(), Some("Too many requests"));

        let err = exception_to_error("serviceUnavailableException", "down", 60);
        assert_eq!(err.kind(), crate::core::ErrorKind::BackendUnavailable);

        let err = exception_to_error("modelTimeoutException", "slow", 45);
        assert!(matches!(err, AppError::BackendTimeout { timeout_secs: 45 }));
    }

    #[test]
    fn test_foundation_model_filter() {
        let embed: FoundationModelSummary = serde_json::from_value(json!({
            "modelId": "amazon.titan-embed-text-v1",
            "outputModalities": ["EMBEDDING"],
            "inferenceTypesSupported": ["ON_DEMAND"]
        }))
        .unwrap();
        assert!(!embed.is_invokable_chat_model());

        let chat: FoundationModelSummary = serde_json::from_value(json!({
            "modelId": "anthropic.claude-3-haiku-20240307-v1:0",
            "providerName": "Anthropic",
            "outputModalities": ["TEXT"],
            "inferenceTypesSupported": ["ON_DEMAND"]
        }))
        .unwrap();
        assert!(chat.is_invokable_chat_model());
    }
}
