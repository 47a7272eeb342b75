//! Converse stream events → OpenAI `chat.completion.chunk` objects.

use crate::api::models::{
    ChatCompletionChunk, Delta, FunctionCallDelta, StreamChoice, ToolCallDelta, Usage,
};
use crate::services::backend::{BlockDelta, ConverseStreamEvent};
use crate::transformer::response::{completion_id, map_stop_reason, map_usage};
use std::collections::HashMap;

/// Per-stream translation state.
///
/// Tool calls are numbered in order of appearance and keep the id they were
/// announced with, so every fragment of one call carries the same id.
#[derive(Debug)]
pub struct StreamContext {
    pub id: String,
    pub created: i64,
    pub model: String,
    include_usage: bool,
    role_sent: bool,
    /// content block index → (tool call index, tool call id)
    tools: HashMap<u32, (u32, String)>,
    usage: Option<Usage>,
    finish_reason: Option<String>,
}

impl StreamContext {
    pub fn new(model: impl Into<String>, include_usage: bool) -> Self {
        Self {
            id: completion_id(),
            created: chrono::Utc::now().timestamp(),
            model: model.into(),
            include_usage,
            role_sent: false,
            tools: HashMap::new(),
            usage: None,
            finish_reason: None,
        }
    }

    /// Usage reported by the backend so far.
    pub fn usage(&self) -> Option<&Usage> {
        self.usage.as_ref()
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.finish_reason.as_deref()
    }

    fn chunk(&self, delta: Delta, finish_reason: Option<String>) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![StreamChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            usage: None,
        }
    }

    /// The first emitted delta carries the assistant role.
    fn take_role(&mut self) -> Option<String> {
        if self.role_sent {
            None
        } else {
            self.role_sent = true;
            Some("assistant".to_string())
        }
    }

    /// Tool call slot for a content block, allocating one if the start event was missed.
    fn tool_slot(&mut self, block_index: u32) -> (u32, String, bool) {
        if let Some((index, id)) = self.tools.get(&block_index) {
            return (*index, id.clone(), false);
        }
        let index = self.tools.len() as u32;
        let id = format!("call_{}", uuid::Uuid::new_v4().simple());
        self.tools.insert(block_index, (index, id.clone()));
        (index, id, true)
    }
}

/// Translate one backend event into at most one client chunk.
pub fn translate_chunk(
    event: ConverseStreamEvent,
    ctx: &mut StreamContext,
) -> Option<ChatCompletionChunk> {
    match event {
        ConverseStreamEvent::MessageStart { role } => {
            ctx.role_sent = true;
            Some(ctx.chunk(
                Delta {
                    role: Some(role),
                    content: Some(String::new()),
                    ..Default::default()
                },
                None,
            ))
        }
        ConverseStreamEvent::ContentBlockStart {
            index,
            tool_use: Some(tool),
        } => {
            let call_index = ctx.tools.len() as u32;
            ctx.tools
                .insert(index, (call_index, tool.tool_use_id.clone()));
            let role = ctx.take_role();
            Some(ctx.chunk(
                Delta {
                    role,
                    tool_calls: Some(vec![ToolCallDelta {
                        index: call_index,
                        id: Some(tool.tool_use_id),
                        kind: Some("function".to_string()),
                        function: Some(FunctionCallDelta {
                            name: Some(tool.name),
                            arguments: Some(String::new()),
                        }),
                    }]),
                    ..Default::default()
                },
                None,
            ))
        }
        ConverseStreamEvent::ContentBlockStart { tool_use: None, .. } => None,
        ConverseStreamEvent::ContentBlockDelta { index, delta } => {
            let role = ctx.take_role();
            let delta = match delta {
                BlockDelta::Text(text) => Delta {
                    role,
                    content: Some(text),
                    ..Default::default()
                },
                BlockDelta::Reasoning(text) => Delta {
                    role,
                    reasoning_content: Some(text),
                    ..Default::default()
                },
                BlockDelta::ToolUseInput(arguments) => {
                    let (call_index, id, fresh) = ctx.tool_slot(index);
                    Delta {
                        role,
                        tool_calls: Some(vec![ToolCallDelta {
                            index: call_index,
                            id: Some(id),
                            kind: fresh.then(|| "function".to_string()),
                            function: Some(FunctionCallDelta {
                                name: None,
                                arguments: Some(arguments),
                            }),
                        }]),
                        ..Default::default()
                    }
                }
            };
            Some(ctx.chunk(delta, None))
        }
        ConverseStreamEvent::ContentBlockStop { .. } => None,
        ConverseStreamEvent::MessageStop { stop_reason } => {
            let finish_reason = map_stop_reason(stop_reason.as_deref());
            ctx.finish_reason = finish_reason.clone();
            let role = ctx.take_role();
            Some(ctx.chunk(
                Delta {
                    role,
                    ..Default::default()
                },
                finish_reason,
            ))
        }
        ConverseStreamEvent::Metadata { usage } => {
            ctx.usage = map_usage(usage.as_ref());
            if !ctx.include_usage {
                return None;
            }
            let mut chunk = ctx.chunk(Delta::default(), None);
            chunk.choices.clear();
            chunk.usage = ctx.usage.clone();
            Some(chunk)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::backend::{TokenUsage, ToolUseStart};

    fn text(index: u32, t: &str) -> ConverseStreamEvent {
        ConverseStreamEvent::ContentBlockDelta {
            index,
            delta: BlockDelta::Text(t.to_string()),
        }
    }

    #[test]
    fn test_text_stream() {
        let mut ctx = StreamContext::new("m", false);

        let first = translate_chunk(
            ConverseStreamEvent::MessageStart {
                role: "assistant".to_string(),
            },
            &mut ctx,
        )
        .unwrap();
        assert_eq!(first.choices[0].delta.role.as_deref(), Some("assistant"));

        let chunk = translate_chunk(text(0, "Hel"), &mut ctx).unwrap();
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("Hel"));
        assert!(chunk.choices[0].delta.role.is_none());
        assert_eq!(chunk.id, first.id);

        assert!(translate_chunk(ConverseStreamEvent::ContentBlockStop { index: 0 }, &mut ctx).is_none());

        let last = translate_chunk(
            ConverseStreamEvent::MessageStop {
                stop_reason: Some("end_turn".to_string()),
            },
            &mut ctx,
        )
        .unwrap();
        assert_eq!(last.choices[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(ctx.finish_reason(), Some("stop"));
    }

    #[test]
    fn test_role_on_first_chunk_without_message_start() {
        let mut ctx = StreamContext::new("m", false);
        let chunk = translate_chunk(text(0, "Hi"), &mut ctx).unwrap();
        assert_eq!(chunk.choices[0].delta.role.as_deref(), Some("assistant"));
        let chunk = translate_chunk(text(0, "!"), &mut ctx).unwrap();
        assert!(chunk.choices[0].delta.role.is_none());
    }

    #[test]
    fn test_tool_call_ids_stable() {
        let mut ctx = StreamContext::new("m", false);
        ctx.role_sent = true;

        let start = translate_chunk(
            ConverseStreamEvent::ContentBlockStart {
                index: 1,
                tool_use: Some(ToolUseStart {
                    tool_use_id: "tooluse_abc".to_string(),
                    name: "calc".to_string(),
                }),
            },
            &mut ctx,
        )
        .unwrap();
        let call = &start.choices[0].delta.tool_calls.as_ref().unwrap()[0];
        assert_eq!(call.index, 0);
        assert_eq!(call.function.as_ref().unwrap().name.as_deref(), Some("calc"));

        for fragment in ["{\"a\":", "1}"] {
            let chunk = translate_chunk(
                ConverseStreamEvent::ContentBlockDelta {
                    index: 1,
                    delta: BlockDelta::ToolUseInput(fragment.to_string()),
                },
                &mut ctx,
            )
            .unwrap();
            let call = &chunk.choices[0].delta.tool_calls.as_ref().unwrap()[0];
            assert_eq!(call.id.as_deref(), Some("tooluse_abc"));
            assert_eq!(call.index, 0);
            assert_eq!(
                call.function.as_ref().unwrap().arguments.as_deref(),
                Some(fragment)
            );
        }
    }

    #[test]
    fn test_tool_delta_without_start_gets_generated_id() {
        let mut ctx = StreamContext::new("m", false);
        let delta = |s: &str| ConverseStreamEvent::ContentBlockDelta {
            index: 2,
            delta: BlockDelta::ToolUseInput(s.to_string()),
        };

        let a = translate_chunk(delta("{"), &mut ctx).unwrap();
        let b = translate_chunk(delta("}"), &mut ctx).unwrap();
        let id_a = a.choices[0].delta.tool_calls.as_ref().unwrap()[0].id.clone();
        let id_b = b.choices[0].delta.tool_calls.as_ref().unwrap()[0].id.clone();
        assert!(id_a.is_some());
        assert_eq!(id_a, id_b);
    }

    #[test]
    fn test_usage_chunk_only_when_requested() {
        let usage = ConverseStreamEvent::Metadata {
            usage: Some(TokenUsage {
                input_tokens: Some(3),
                output_tokens: Some(4),
                total_tokens: Some(7),
                ..Default::default()
            }),
        };

        let mut ctx = StreamContext::new("m", false);
        assert!(translate_chunk(usage.clone(), &mut ctx).is_none());
        assert_eq!(ctx.usage().unwrap().total_tokens, Some(7));

        let mut ctx = StreamContext::new("m", true);
        let chunk = translate_chunk(usage, &mut ctx).unwrap();
        assert!(chunk.choices.is_empty());
        assert_eq!(chunk.usage.unwrap().prompt_tokens, Some(3));
    }
}
