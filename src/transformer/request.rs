//! OpenAI chat request → Converse request.

use crate::api::models::{
    ChatCompletionRequest, ChatMessage, ContentPart, MessageContent, Role, ToolDefinition,
};
use crate::core::error::Result;
use crate::core::AppError;
use crate::services::backend::{
    BackendInvocation, CachePointBlock, ContentBlock, ConverseMessage, ConverseRequest,
    ConverseRole, EmptyObject, ImageBlock, ImageSource, InferenceConfig, NamedTool, SystemBlock,
    Tool, ToolChoice, ToolConfig, ToolInputSchema, ToolResultBlock, ToolResultContent, ToolSpec,
    ToolUseBlock,
};
use crate::transformer::model_id::{resolve_model, FamilyCapabilities, ModelFamily};
use base64::Engine as _;
use serde_json::{json, Value};

/// OpenAI parameters with no Converse equivalent.
pub const DROPPED_PARAMS: &[&str] = &[
    "frequency_penalty",
    "presence_penalty",
    "logit_bias",
    "logprobs",
    "top_logprobs",
    "seed",
    "user",
    "response_format",
    "parallel_tool_calls",
    "service_tier",
    "store",
    "metadata",
    "modalities",
    "prediction",
    "reasoning_effort",
    "audio",
];

/// A request field that was dropped instead of failing the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslationWarning {
    pub parameter: String,
    pub reason: String,
}

impl TranslationWarning {
    fn new(parameter: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            parameter: parameter.into(),
            reason: reason.into(),
        }
    }
}

/// Result of [`translate_request`].
#[derive(Debug, Clone)]
pub struct Translation {
    /// Model id with the routing prefix applied
    pub routed_model: String,
    pub invocation: BackendInvocation,
    pub warnings: Vec<TranslationWarning>,
}

/// Translate an OpenAI chat request into a backend invocation.
///
/// Fails without side effects on schema violations or unresolvable models.
/// Unsupported fields become [`TranslationWarning`]s.
pub fn translate_request(request: &ChatCompletionRequest, model_prefix: &str) -> Result<Translation> {
    if request.model.trim().is_empty() {
        return Err(AppError::MalformedRequest("'model' must not be empty".to_string()));
    }
    if request.messages.is_empty() {
        return Err(AppError::MalformedRequest(
            "'messages' must contain at least one message".to_string(),
        ));
    }

    let model = resolve_model(&request.model, model_prefix)?;
    let caps = model.family.capabilities(&model.backend_id);
    let mut warnings = Vec::new();

    let mut messages = request.messages.clone();
    repair_tool_call_ids(&mut messages);

    let (system, mut converse_messages) = convert_messages(&messages, caps, &mut warnings)?;
    let system = if caps.system_prompt {
        system
    } else {
        inline_system_prompt(system, &mut converse_messages);
        Vec::new()
    };

    if converse_messages.is_empty() {
        return Err(AppError::MalformedRequest(
            "'messages' contains no user or assistant content".to_string(),
        ));
    }

    let inference_config = build_inference_config(request);
    let tool_config = build_tool_config(request, &converse_messages, caps, &mut warnings);
    let additional_model_request_fields =
        translate_extra_params(request, model.family, caps, &mut warnings);

    Ok(Translation {
        routed_model: model.routed,
        invocation: BackendInvocation {
            model_id: model.backend_id,
            family: model.family,
            request: ConverseRequest {
                messages: converse_messages,
                system,
                inference_config: (!inference_config.is_empty()).then_some(inference_config),
                tool_config,
                additional_model_request_fields,
            },
        },
        warnings,
    })
}

/// Fill in missing tool-call ids and link orphan tool results.
///
/// Assistant tool calls without an id get a generated one; a `tool` message
/// without `tool_call_id` is linked to the most recent tool call id.
pub fn repair_tool_call_ids(messages: &mut [ChatMessage]) {
    let mut last_tool_call_id: Option<String> = None;

    for message in messages.iter_mut() {
        match message.role {
            Role::Assistant => {
                if let Some(calls) = message.tool_calls.as_mut() {
                    for call in calls.iter_mut() {
                        let id = call
                            .id
                            .get_or_insert_with(|| format!("call_{}", uuid::Uuid::new_v4().simple()));
                        last_tool_call_id = Some(id.clone());
                    }
                }
            }
            Role::Tool => {
                if message.tool_call_id.is_none() {
                    message.tool_call_id = last_tool_call_id.clone();
                }
            }
            _ => {}
        }
    }
}

fn convert_messages(
    messages: &[ChatMessage],
    caps: FamilyCapabilities,
    warnings: &mut Vec<TranslationWarning>,
) -> Result<(Vec<SystemBlock>, Vec<ConverseMessage>)> {
    let mut system = Vec::new();
    let mut converted: Vec<ConverseMessage> = Vec::new();

    for (position, message) in messages.iter().enumerate() {
        let cache = message.has_cache_directive();

        match message.role {
            Role::System | Role::Developer => {
                let text = message
                    .content
                    .as_ref()
                    .map(MessageContent::joined_text)
                    .unwrap_or_default();
                if !text.is_empty() {
                    system.push(SystemBlock::Text(text));
                }
                if cache {
                    if caps.prompt_caching {
                        system.push(SystemBlock::CachePoint(CachePointBlock::default()));
                    } else {
                        warnings.push(cache_warning());
                    }
                }
                continue;
            }
            Role::User => {
                let mut blocks = content_blocks(message.content.as_ref(), warnings)?;
                push_cache_point(&mut blocks, cache, caps, warnings);
                push_message(&mut converted, ConverseRole::User, blocks);
            }
            Role::Assistant => {
                let mut blocks = content_blocks(message.content.as_ref(), warnings)?;
                for call in message.tool_calls.iter().flatten() {
                    blocks.push(ContentBlock::ToolUse(ToolUseBlock {
                        tool_use_id: call.id.clone().unwrap_or_default(),
                        name: call.function.name.clone(),
                        input: parse_tool_arguments(&call.function.arguments, position)?,
                    }));
                }
                push_cache_point(&mut blocks, cache, caps, warnings);
                push_message(&mut converted, ConverseRole::Assistant, blocks);
            }
            Role::Tool => {
                let tool_use_id = message.tool_call_id.clone().ok_or_else(|| {
                    AppError::MalformedRequest(format!(
                        "messages[{}]: tool message has no tool_call_id and no preceding tool call",
                        position
                    ))
                })?;
                let text = message
                    .content
                    .as_ref()
                    .map(MessageContent::joined_text)
                    .unwrap_or_default();
                let mut blocks = vec![ContentBlock::ToolResult(ToolResultBlock {
                    tool_use_id,
                    content: vec![ToolResultContent::Text(text)],
                })];
                push_cache_point(&mut blocks, cache, caps, warnings);
                push_message(&mut converted, ConverseRole::User, blocks);
            }
        }
    }

    Ok((system, converted))
}

/// Append to the previous message when roles repeat; Converse requires alternation.
fn push_message(messages: &mut Vec<ConverseMessage>, role: ConverseRole, blocks: Vec<ContentBlock>) {
    if blocks.is_empty() {
        return;
    }
    match messages.last_mut() {
        Some(last) if last.role == role => last.content.extend(blocks),
        _ => messages.push(ConverseMessage {
            role,
            content: blocks,
        }),
    }
}

fn push_cache_point(
    blocks: &mut Vec<ContentBlock>,
    cache: bool,
    caps: FamilyCapabilities,
    warnings: &mut Vec<TranslationWarning>,
) {
    if !cache || blocks.is_empty() {
        return;
    }
    if caps.prompt_caching {
        blocks.push(ContentBlock::CachePoint(CachePointBlock::default()));
    } else {
        warnings.push(cache_warning());
    }
}

fn cache_warning() -> TranslationWarning {
    TranslationWarning::new("cache_control", "model family does not support prompt caching")
}

fn content_blocks(
    content: Option<&MessageContent>,
    warnings: &mut Vec<TranslationWarning>,
) -> Result<Vec<ContentBlock>> {
    let Some(content) = content else {
        return Ok(Vec::new());
    };

    let mut blocks = Vec::new();
    match content {
        MessageContent::Text(text) => {
            if !text.is_empty() {
                blocks.push(ContentBlock::Text(text.clone()));
            }
        }
        MessageContent::Parts(parts) => {
            for part in parts {
                match part {
                    ContentPart::Text { text, .. } => {
                        if !text.is_empty() {
                            blocks.push(ContentBlock::Text(text.clone()));
                        }
                    }
                    ContentPart::ImageUrl { image_url } => {
                        if image_url.url.starts_with("data:") {
                            blocks.push(ContentBlock::Image(parse_data_url(&image_url.url)?));
                        } else {
                            warnings.push(TranslationWarning::new(
                                "image_url",
                                "remote image URLs are not fetched; use a data: URL",
                            ));
                        }
                    }
                    ContentPart::Unsupported => {
                        warnings.push(TranslationWarning::new(
                            "content",
                            "unsupported content part type",
                        ));
                    }
                }
            }
        }
    }
    Ok(blocks)
}

/// Parse `data:image/<fmt>;base64,<payload>` into an image block.
fn parse_data_url(url: &str) -> Result<ImageBlock> {
    let invalid = || AppError::MalformedRequest("image_url is not a valid base64 data URL".to_string());

    let rest = url.strip_prefix("data:").ok_or_else(invalid)?;
    let (meta, payload) = rest.split_once(',').ok_or_else(invalid)?;
    let mime = meta.strip_suffix(";base64").ok_or_else(invalid)?;
    let subtype = mime.strip_prefix("image/").ok_or_else(invalid)?;

    let format = match subtype {
        "png" => "png",
        "jpeg" | "jpg" => "jpeg",
        "gif" => "gif",
        "webp" => "webp",
        other => {
            return Err(AppError::MalformedRequest(format!(
                "unsupported image format '{}'",
                other
            )))
        }
    };

    base64::engine::general_purpose::STANDARD
        .decode(payload)
        .map_err(|_| invalid())?;

    Ok(ImageBlock {
        format: format.to_string(),
        source: ImageSource {
            bytes: payload.to_string(),
        },
    })
}

fn parse_tool_arguments(arguments: &str, position: usize) -> Result<Value> {
    if arguments.trim().is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str(arguments).map_err(|e| {
        AppError::MalformedRequest(format!(
            "messages[{}]: tool call arguments are not valid JSON: {}",
            position, e
        ))
    })
}

/// Titan-style models take no system blocks; prefix the text to the first user turn.
fn inline_system_prompt(system: Vec<SystemBlock>, messages: &mut [ConverseMessage]) {
    let text = system
        .into_iter()
        .filter_map(|block| match block {
            SystemBlock::Text(t) => Some(t),
            SystemBlock::CachePoint(_) => None,
        })
        .collect::<Vec<_>>()
        .join("\n");
    if text.is_empty() {
        return;
    }
    if let Some(first_user) = messages.iter_mut().find(|m| m.role == ConverseRole::User) {
        first_user.content.insert(0, ContentBlock::Text(text));
    }
}

fn build_inference_config(request: &ChatCompletionRequest) -> InferenceConfig {
    InferenceConfig {
        max_tokens: request.max_completion_tokens.or(request.max_tokens),
        temperature: request.temperature,
        top_p: request.top_p,
        stop_sequences: request
            .stop
            .clone()
            .map(|s| s.into_vec())
            .unwrap_or_default(),
    }
}

fn build_tool_config(
    request: &ChatCompletionRequest,
    messages: &[ConverseMessage],
    caps: FamilyCapabilities,
    warnings: &mut Vec<TranslationWarning>,
) -> Option<ToolConfig> {
    let Some(tools) = request.tools.as_ref().filter(|t| !t.is_empty()) else {
        return history_tool_config(messages, caps, warnings);
    };

    if !caps.tools {
        warnings.push(TranslationWarning::new(
            "tools",
            "model family does not support tool use",
        ));
        return None;
    }

    let tool_choice = match request.tool_choice.as_ref() {
        None => None,
        // Converse has no "none" choice, and tool history needs the definitions.
        Some(Value::String(s)) if s == "none" => {
            warnings.push(TranslationWarning::new(
                "tool_choice",
                "'none' has no backend equivalent, tools stay available",
            ));
            None
        }
        Some(Value::String(s)) if s == "auto" => Some(ToolChoice::Auto(EmptyObject::default())),
        Some(Value::String(s)) if s == "required" => Some(ToolChoice::Any(EmptyObject::default())),
        Some(other) => match other
            .get("function")
            .and_then(|f| f.get("name"))
            .and_then(|n| n.as_str())
        {
            Some(name) => Some(ToolChoice::Tool(NamedTool {
                name: name.to_string(),
            })),
            None => {
                warnings.push(TranslationWarning::new(
                    "tool_choice",
                    "unrecognized tool_choice value",
                ));
                None
            }
        },
    };

    Some(ToolConfig {
        tools: tools.iter().map(tool_spec).collect(),
        tool_choice,
    })
}

/// Placeholder definitions for tools used in the history of a request that
/// declares none. The backend refuses tool blocks without a tool config.
fn history_tool_config(
    messages: &[ConverseMessage],
    caps: FamilyCapabilities,
    warnings: &mut Vec<TranslationWarning>,
) -> Option<ToolConfig> {
    if !caps.tools {
        return None;
    }

    let mut names: Vec<&str> = Vec::new();
    for block in messages.iter().flat_map(|m| &m.content) {
        if let ContentBlock::ToolUse(tool_use) = block {
            if !names.contains(&tool_use.name.as_str()) {
                names.push(&tool_use.name);
            }
        }
    }
    if names.is_empty() {
        return None;
    }

    warnings.push(TranslationWarning::new(
        "tools",
        "tool calls in history without tool definitions, using placeholders",
    ));
    Some(ToolConfig {
        tools: names
            .into_iter()
            .map(|name| {
                Tool::ToolSpec(ToolSpec {
                    name: name.to_string(),
                    description: None,
                    input_schema: ToolInputSchema {
                        json: json!({"type": "object", "properties": {}}),
                    },
                })
            })
            .collect(),
        tool_choice: None,
    })
}

fn tool_spec(tool: &ToolDefinition) -> Tool {
    let description = tool
        .function
        .description
        .as_ref()
        .filter(|d| !d.trim().is_empty())
        .cloned();
    Tool::ToolSpec(ToolSpec {
        name: tool.function.name.clone(),
        description,
        input_schema: ToolInputSchema {
            json: tool
                .function
                .parameters
                .clone()
                .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
        },
    })
}

/// Handle parameters outside the typed request fields.
///
/// `top_k` goes to `additionalModelRequestFields` in the family's own spelling;
/// everything else is dropped with a warning.
fn translate_extra_params(
    request: &ChatCompletionRequest,
    family: ModelFamily,
    caps: FamilyCapabilities,
    warnings: &mut Vec<TranslationWarning>,
) -> Option<Value> {
    let mut additional = serde_json::Map::new();

    let mut keys: Vec<&String> = request.extra.keys().collect();
    keys.sort();

    for key in keys {
        let value = &request.extra[key];
        match key.as_str() {
            "top_k" if caps.top_k => match family {
                ModelFamily::Amazon => {
                    additional.insert("inferenceConfig".to_string(), json!({ "topK": value }));
                }
                ModelFamily::Cohere => {
                    additional.insert("k".to_string(), value.clone());
                }
                _ => {
                    additional.insert("top_k".to_string(), value.clone());
                }
            },
            "top_k" => warnings.push(TranslationWarning::new(
                "top_k",
                format!("not supported by the {} family", family),
            )),
            "n" => {
                if value.as_u64().map_or(false, |n| n > 1) {
                    warnings.push(TranslationWarning::new(
                        "n",
                        "only a single choice can be generated",
                    ));
                }
            }
            name if DROPPED_PARAMS.contains(&name) => {
                if !value.is_null() {
                    warnings.push(TranslationWarning::new(name, "no backend equivalent"));
                }
            }
            name => warnings.push(TranslationWarning::new(name, "unknown parameter")),
        }
    }

    (!additional.is_empty()).then_some(Value::Object(additional))
}
