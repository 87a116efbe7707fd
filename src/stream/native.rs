//! Native Protocol Adapter
//!
//! Pass-through sink: each surviving chunk is wrapped with the run
//! identifiers and serialized as one SSE frame. The stream terminates by
//! closing; there is no sentinel frame.

use crate::stream::translator::{ChunkMessage, ChunkType, StructuredChatStreamChunk};
use serde::{Deserialize, Serialize};

/// One frame of the native streaming protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NativeStreamFrame {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    pub message: ChunkMessage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub datasets_used: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generated_sql_query: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct NativeSseAdapter {
    chat_id: Option<String>,
    trace_id: Option<String>,
}

impl NativeSseAdapter {
    pub fn new(chat_id: Option<String>, trace_id: Option<String>) -> Self {
        Self { chat_id, trace_id }
    }

    /// Serialize one chunk as an SSE frame. Role-less chunks and contentless
    /// stream deltas are dropped.
    pub fn frame(&self, chunk: &StructuredChatStreamChunk) -> Option<String> {
        chunk.message.role?;
        if chunk.message.chunk_type == ChunkType::Stream
            && chunk.message.content.is_empty()
            && !chunk.has_metadata()
        {
            return None;
        }

        let frame = NativeStreamFrame {
            chat_id: self.chat_id.clone(),
            trace_id: self.trace_id.clone(),
            message: chunk.message.clone(),
            datasets_used: chunk.datasets_used.clone(),
            generated_sql_query: chunk.generated_sql_query.clone(),
            error: chunk.error.clone(),
        };
        let json = serde_json::to_string(&frame).ok()?;
        Some(format!("data: {}\n\n", json))
    }
}
