//! Converse response → OpenAI chat completion.

use crate::api::models::{
    ChatCompletionResponse, Choice, FunctionCall, PromptTokensDetails, ResponseMessage, ToolCall,
    Usage,
};
use crate::services::backend::{ContentBlock, ConverseResponse, TokenUsage};

/// Map a Converse stop reason to an OpenAI finish reason.
///
/// Unknown reasons pass through unchanged; an absent reason stays null.
pub fn map_stop_reason(stop_reason: Option<&str>) -> Option<String> {
    let reason = stop_reason?;
    let mapped = match reason {
        "end_turn" | "stop_sequence" => "stop",
        "max_tokens" | "model_context_window_exceeded" => "length",
        "tool_use" => "tool_calls",
        "content_filtered" | "guardrail_intervened" => "content_filter",
        other => other,
    };
    Some(mapped.to_string())
}

/// Map backend token usage. Fields the backend did not report stay null.
pub fn map_usage(usage: Option<&TokenUsage>) -> Option<Usage> {
    let usage = usage?;
    let total_tokens = usage.total_tokens.or_else(|| {
        usage
            .input_tokens
            .zip(usage.output_tokens)
            .map(|(i, o)| i + o)
    });
    Some(Usage {
        prompt_tokens: usage.input_tokens,
        completion_tokens: usage.output_tokens,
        total_tokens,
        prompt_tokens_details: usage.cache_read_input_tokens.map(|cached| PromptTokensDetails {
            cached_tokens: Some(cached),
        }),
    })
}

pub fn completion_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())
}

/// Translate a complete Converse response.
pub fn translate_response(response: &ConverseResponse, model: &str) -> ChatCompletionResponse {
    let blocks = response
        .output
        .message
        .as_ref()
        .map(|m| m.blocks())
        .unwrap_or_default();

    let mut text: Option<String> = None;
    let mut reasoning: Option<String> = None;
    let mut tool_calls = Vec::new();

    for block in blocks {
        match block {
            ContentBlock::Text(t) => text.get_or_insert_with(String::new).push_str(&t),
            ContentBlock::ReasoningContent(r) => {
                if let Some(rt) = r.reasoning_text {
                    reasoning.get_or_insert_with(String::new).push_str(&rt.text);
                }
            }
            ContentBlock::ToolUse(tool) => tool_calls.push(ToolCall {
                id: Some(tool.tool_use_id),
                kind: "function".to_string(),
                function: FunctionCall {
                    name: tool.name,
                    arguments: tool.input.to_string(),
                },
            }),
            ContentBlock::Image(_)
            | ContentBlock::ToolResult(_)
            | ContentBlock::CachePoint(_) => {}
        }
    }

    ChatCompletionResponse {
        id: completion_id(),
        object: "chat.completion".to_string(),
        created: chrono::Utc::now().timestamp(),
        model: model.to_string(),
        choices: vec![Choice {
            index: 0,
            message: ResponseMessage {
                role: "assistant".to_string(),
                content: text,
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                reasoning_content: reasoning,
            },
            finish_reason: map_stop_reason(response.stop_reason.as_deref()),
        }],
        usage: map_usage(response.usage.as_ref()),
    }
}
