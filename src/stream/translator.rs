//! Event Stream Translator
//!
//! Converts internal lifecycle events into client-facing chunks. A static
//! per-node table assigns each narrated node a role and a fallback progress
//! message; nodes missing from the table produce role-less chunks that every
//! adapter drops. This is how internal nodes stay invisible while designated
//! nodes narrate progress.

use crate::events::{EventKind, NodeEvent, StreamSignal};
use crate::nodes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Who a message is "from", for client rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Ai,
    System,
    Intermediate,
}

/// Position of a message in a node's emission lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChunkType {
    Start,
    Stream,
    Body,
    End,
}

/// One client-facing message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkMessage {
    pub role: Option<Role>,
    pub content: String,
    #[serde(rename = "type")]
    pub chunk_type: ChunkType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
}

/// One translated chunk: a message plus side-channel metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredChatStreamChunk {
    pub message: ChunkMessage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub datasets_used: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generated_sql_query: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StructuredChatStreamChunk {
    fn new(role: Option<Role>, content: impl Into<String>, chunk_type: ChunkType) -> Self {
        Self {
            message: ChunkMessage {
                role,
                content: content.into(),
                chunk_type,
                category: None,
                tool_name: None,
            },
            datasets_used: None,
            generated_sql_query: None,
            error: None,
        }
    }

    /// Role-less chunk; every adapter drops these.
    fn suppressed(chunk_type: ChunkType) -> Self {
        Self::new(None, "", chunk_type)
    }

    pub fn has_metadata(&self) -> bool {
        self.datasets_used.is_some() || self.generated_sql_query.is_some() || self.error.is_some()
    }
}

/// Static stream configuration for one narrated node.
#[derive(Debug, Clone, Copy)]
pub struct NodeStreamConfig {
    pub role: Role,
    /// Shown when the node span produced no content of its own.
    pub progress: &'static str,
}

lazy_static::lazy_static! {
    /// Narrated nodes. Anything absent here (including the replan router) is
    /// an internal node and stays invisible to clients.
    static ref NODE_STREAM_CONFIG: HashMap<&'static str, NodeStreamConfig> = {
        let mut m = HashMap::new();
        m.insert(nodes::SUBQUERY_PLANNER, NodeStreamConfig {
            role: Role::Intermediate,
            progress: "Breaking the question down...",
        });
        m.insert(nodes::DATASET_SELECTOR, NodeStreamConfig {
            role: Role::Intermediate,
            progress: "Looking for relevant datasets...",
        });
        m.insert(nodes::SQL_PLANNER, NodeStreamConfig {
            role: Role::Intermediate,
            progress: "Writing queries...",
        });
        m.insert(nodes::SQL_EXECUTOR, NodeStreamConfig {
            role: Role::Intermediate,
            progress: "Running queries...",
        });
        m.insert(nodes::RESPONSE_SYNTHESIZER, NodeStreamConfig {
            role: Role::Ai,
            progress: "Preparing the answer...",
        });
        m
    };
}

/// Per-session translation state machine.
pub struct EventTranslator {
    in_tool_call: bool,
    suppress_stream: bool,
    /// Whether the consolidated intermediate message for the current
    /// node-start/node-end span has been emitted. Intermediate content goes
    /// out as one message, never token-by-token.
    intermediate_sent: bool,
}

impl EventTranslator {
    pub fn new() -> Self {
        Self {
            in_tool_call: false,
            suppress_stream: false,
            intermediate_sent: false,
        }
    }

    /// Translate one event into zero or more chunks, in emission order.
    pub fn translate(&mut self, event: &NodeEvent) -> Vec<StructuredChatStreamChunk> {
        let config = NODE_STREAM_CONFIG.get(event.node.as_str()).copied();

        match &event.kind {
            EventKind::Signal { signal } => {
                match signal {
                    StreamSignal::StopStreaming => self.suppress_stream = true,
                    StreamSignal::ContinueStreaming => self.suppress_stream = false,
                }
                Vec::new()
            }
            EventKind::NodeStart => {
                self.intermediate_sent = false;
                let Some(config) = config else {
                    return vec![StructuredChatStreamChunk::suppressed(ChunkType::Start)];
                };
                vec![StructuredChatStreamChunk::new(
                    Some(config.role),
                    "",
                    ChunkType::Start,
                )]
            }
            EventKind::NodeDelta { delta } => {
                let Some(config) = config else {
                    return vec![StructuredChatStreamChunk::suppressed(ChunkType::Stream)];
                };
                if self.suppress_stream {
                    return vec![StructuredChatStreamChunk::suppressed(ChunkType::Stream)];
                }
                let mut chunk = match config.role {
                    Role::Intermediate => {
                        if self.intermediate_sent {
                            return vec![StructuredChatStreamChunk::suppressed(ChunkType::Stream)];
                        }
                        self.intermediate_sent = true;
                        let content = if delta.is_empty() {
                            config.progress
                        } else {
                            delta.as_str()
                        };
                        StructuredChatStreamChunk::new(
                            Some(Role::Intermediate),
                            content,
                            ChunkType::Body,
                        )
                    }
                    role => {
                        StructuredChatStreamChunk::new(Some(role), delta.as_str(), ChunkType::Stream)
                    }
                };
                if self.in_tool_call {
                    chunk.message.category = Some("tool".to_string());
                }
                vec![chunk]
            }
            EventKind::NodeEnd { payload } => {
                let Some(config) = config else {
                    self.intermediate_sent = false;
                    return vec![StructuredChatStreamChunk::suppressed(ChunkType::End)];
                };
                let mut chunks = Vec::new();
                // A narrated span that emitted nothing still narrates: fall
                // back to the static progress message.
                if config.role == Role::Intermediate && !self.intermediate_sent {
                    chunks.push(StructuredChatStreamChunk::new(
                        Some(Role::Intermediate),
                        config.progress,
                        ChunkType::Body,
                    ));
                }
                self.intermediate_sent = false;
                let mut end = StructuredChatStreamChunk::new(Some(config.role), "", ChunkType::End);
                if let Some(payload) = payload {
                    end.datasets_used = payload.datasets_used.clone();
                    end.generated_sql_query = payload.generated_sql.clone();
                    end.error = payload.error.clone();
                }
                chunks.push(end);
                chunks
            }
            EventKind::ToolStart { tool } => {
                self.in_tool_call = true;
                let Some(config) = config else {
                    return vec![StructuredChatStreamChunk::suppressed(ChunkType::Start)];
                };
                let mut chunk =
                    StructuredChatStreamChunk::new(Some(config.role), "", ChunkType::Start);
                chunk.message.category = Some("tool".to_string());
                chunk.message.tool_name = Some(tool.clone());
                vec![chunk]
            }
            EventKind::ToolEnd { tool, output } => {
                self.in_tool_call = false;
                let Some(config) = config else {
                    return vec![StructuredChatStreamChunk::suppressed(ChunkType::Body)];
                };
                let mut chunk = StructuredChatStreamChunk::new(
                    Some(config.role),
                    output.clone().unwrap_or_default(),
                    ChunkType::Body,
                );
                chunk.message.category = Some("tool".to_string());
                chunk.message.tool_name = Some(tool.clone());
                vec![chunk]
            }
        }
    }
}

impl Default for EventTranslator {
    fn default() -> Self {
        Self::new()
    }
}
