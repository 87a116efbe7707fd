//! OpenAI-Compatible Protocol Adapter
//!
//! Re-emits the translated chunk stream as chat-completion chunks. Progress
//! and tool chunks become synthetic function-call deltas (under the tool's
//! own name or the `tool_messages` carrier); answer content becomes plain
//! content deltas with the `assistant` role attached exactly once. The stream
//! closes with a `finish_reason: stop` chunk and the `[DONE]` sentinel. A
//! collector consumes the same sequence for non-streaming callers.

use crate::stream::translator::{ChunkType, Role, StructuredChatStreamChunk};
use serde::{Deserialize, Serialize};

/// Function-call name used when a chunk is not a declared tool's output.
pub const TOOL_MESSAGES_CARRIER: &str = "tool_messages";

pub const DONE_SENTINEL: &str = "data: [DONE]\n\n";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallDelta {
    pub index: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: FunctionDelta,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Delta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: Delta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

/// Accumulated tool call on a final non-streaming message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: FunctionDelta,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionMessage {
    pub role: String,
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionChoice {
    pub index: u32,
    pub message: CompletionMessage,
    pub finish_reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletion {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
}

/// Payload serialized into the `tool_messages` carrier arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CarrierPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    datasets_used: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generated_sql_query: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Per-response streaming state machine.
pub struct OpenAiStreamAdapter {
    id: String,
    model: String,
    created: i64,
    tool_call_index: u32,
    first_content_sent: bool,
}

impl OpenAiStreamAdapter {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            model: model.into(),
            created: chrono::Utc::now().timestamp(),
            tool_call_index: 0,
            first_content_sent: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn chunk_with(&self, delta: Delta, finish_reason: Option<String>) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
        }
    }

    /// Translate one chunk. Role-less chunks and empty lifecycle markers
    /// produce nothing.
    pub fn on_chunk(&mut self, chunk: &StructuredChatStreamChunk) -> Option<ChatCompletionChunk> {
        let role = chunk.message.role?;

        let is_tool_shaped = chunk.has_metadata()
            || chunk.message.category.is_some()
            || role == Role::Intermediate;

        if is_tool_shaped {
            if chunk.message.content.is_empty() && !chunk.has_metadata() {
                return None;
            }
            let name = chunk
                .message
                .tool_name
                .clone()
                .unwrap_or_else(|| TOOL_MESSAGES_CARRIER.to_string());
            let payload = CarrierPayload {
                content: if chunk.message.content.is_empty() {
                    None
                } else {
                    Some(chunk.message.content.clone())
                },
                datasets_used: chunk.datasets_used.clone(),
                generated_sql_query: chunk.generated_sql_query.clone(),
                error: chunk.error.clone(),
            };
            let arguments = serde_json::to_string(&payload).unwrap_or_else(|_| "{}".to_string());
            let index = self.tool_call_index;
            self.tool_call_index += 1;
            let delta = Delta {
                role: None,
                content: None,
                tool_calls: Some(vec![ToolCallDelta {
                    index,
                    id: Some(format!("call_{}_{}", self.id, index)),
                    call_type: "function".to_string(),
                    function: FunctionDelta {
                        name: Some(name),
                        arguments,
                    },
                }]),
            };
            return Some(self.chunk_with(delta, None));
        }

        // Plain content delta; lifecycle markers carry no content.
        if chunk.message.content.is_empty() {
            return None;
        }
        let role_field = if self.first_content_sent {
            None
        } else {
            self.first_content_sent = true;
            Some("assistant".to_string())
        };
        let delta = Delta {
            role: role_field,
            content: Some(chunk.message.content.clone()),
            tool_calls: None,
        };
        Some(self.chunk_with(delta, None))
    }

    /// Closing chunk with `finish_reason: stop`. The caller then writes the
    /// `[DONE]` sentinel.
    pub fn finish(&self) -> ChatCompletionChunk {
        self.chunk_with(Delta::default(), Some("stop".to_string()))
    }

    pub fn sse_frame(chunk: &ChatCompletionChunk) -> String {
        format!(
            "data: {}\n\n",
            serde_json::to_string(chunk).unwrap_or_else(|_| "{}".to_string())
        )
    }
}

/// Accumulates the chunk sequence into one non-streaming completion.
pub struct CompletionCollector {
    adapter: OpenAiStreamAdapter,
    content: String,
    tool_calls: Vec<ToolCall>,
}

impl CompletionCollector {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            adapter: OpenAiStreamAdapter::new(model),
            content: String::new(),
            tool_calls: Vec::new(),
        }
    }

    pub fn on_chunk(&mut self, chunk: &StructuredChatStreamChunk) {
        let Some(completion_chunk) = self.adapter.on_chunk(chunk) else {
            return;
        };
        let delta = &completion_chunk.choices[0].delta;
        if let Some(ref content) = delta.content {
            self.content.push_str(content);
        }
        if let Some(ref calls) = delta.tool_calls {
            for call in calls {
                self.tool_calls.push(ToolCall {
                    id: call.id.clone().unwrap_or_default(),
                    call_type: call.call_type.clone(),
                    function: call.function.clone(),
                });
            }
        }
    }

    pub fn into_completion(self) -> ChatCompletion {
        ChatCompletion {
            id: self.adapter.id.clone(),
            object: "chat.completion".to_string(),
            created: self.adapter.created,
            model: self.adapter.model.clone(),
            choices: vec![CompletionChoice {
                index: 0,
                message: CompletionMessage {
                    role: "assistant".to_string(),
                    content: if self.content.is_empty() {
                        None
                    } else {
                        Some(self.content)
                    },
                    tool_calls: if self.tool_calls.is_empty() {
                        None
                    } else {
                        Some(self.tool_calls)
                    },
                },
                finish_reason: "stop".to_string(),
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::translator::ChunkMessage;

    fn content_chunk(content: &str) -> StructuredChatStreamChunk {
        StructuredChatStreamChunk {
            message: ChunkMessage {
                role: Some(Role::Ai),
                content: content.to_string(),
                chunk_type: ChunkType::Stream,
                category: None,
                tool_name: None,
            },
            datasets_used: None,
            generated_sql_query: None,
            error: None,
        }
    }

    fn intermediate_chunk(content: &str) -> StructuredChatStreamChunk {
        StructuredChatStreamChunk {
            message: ChunkMessage {
                role: Some(Role::Intermediate),
                content: content.to_string(),
                chunk_type: ChunkType::Body,
                category: None,
                tool_name: None,
            },
            datasets_used: None,
            generated_sql_query: None,
            error: None,
        }
    }

    #[test]
    fn test_assistant_role_appears_exactly_once() {
        let mut adapter = OpenAiStreamAdapter::new("test-model");
        let mut roles = 0;
        for content in ["a", "b", "c"] {
            let chunk = adapter.on_chunk(&content_chunk(content)).unwrap();
            if chunk.choices[0].delta.role.is_some() {
                roles += 1;
            }
        }
        let finish = adapter.finish();
        assert!(finish.choices[0].delta.role.is_none());
        assert_eq!(roles, 1);
    }

    #[test]
    fn test_intermediate_becomes_tool_messages_call() {
        let mut adapter = OpenAiStreamAdapter::new("test-model");
        let chunk = adapter
            .on_chunk(&intermediate_chunk("Looking for datasets..."))
            .unwrap();
        let calls = chunk.choices[0].delta.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].function.name.as_deref(), Some(TOOL_MESSAGES_CARRIER));
        let payload: serde_json::Value = serde_json::from_str(&calls[0].function.arguments).unwrap();
        assert_eq!(payload["content"], "Looking for datasets...");
    }

    #[test]
    fn test_tool_call_index_is_monotonic() {
        let mut adapter = OpenAiStreamAdapter::new("test-model");
        for i in 0..3 {
            let chunk = adapter.on_chunk(&intermediate_chunk("step")).unwrap();
            let calls = chunk.choices[0].delta.tool_calls.as_ref().unwrap();
            assert_eq!(calls[0].index, i);
        }
    }

    #[test]
    fn test_declared_tool_name_wins_over_carrier() {
        let mut adapter = OpenAiStreamAdapter::new("test-model");
        let mut chunk = intermediate_chunk("42");
        chunk.message.category = Some("tool".to_string());
        chunk.message.tool_name = Some("lookup".to_string());
        let out = adapter.on_chunk(&chunk).unwrap();
        let calls = out.choices[0].delta.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].function.name.as_deref(), Some("lookup"));
    }

    #[test]
    fn test_roleless_chunk_is_dropped() {
        let mut adapter = OpenAiStreamAdapter::new("test-model");
        let mut chunk = content_chunk("hidden");
        chunk.message.role = None;
        assert!(adapter.on_chunk(&chunk).is_none());
    }

    #[test]
    fn test_finish_then_sentinel() {
        let adapter = OpenAiStreamAdapter::new("test-model");
        let finish = adapter.finish();
        assert_eq!(finish.choices[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(DONE_SENTINEL, "data: [DONE]\n\n");
    }

    #[test]
    fn test_collector_concatenates_content_and_tool_calls() {
        let mut collector = CompletionCollector::new("test-model");
        collector.on_chunk(&intermediate_chunk("searching"));
        collector.on_chunk(&content_chunk("Total is "));
        collector.on_chunk(&content_chunk("42."));
        let completion = collector.into_completion();
        let message = &completion.choices[0].message;
        assert_eq!(message.content.as_deref(), Some("Total is 42."));
        assert_eq!(message.tool_calls.as_ref().unwrap().len(), 1);
        assert_eq!(completion.object, "chat.completion");
        assert_eq!(completion.choices[0].finish_reason, "stop");
    }
}
