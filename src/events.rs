//! Run Lifecycle Events
//!
//! Node-tagged events emitted by the pipeline while a run progresses. The
//! stream translator turns these into client-facing chunks; the pipeline never
//! talks to a protocol adapter directly.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Side-channel payload attached to a node-end event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodePayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub datasets_used: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generated_sql: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Stream-control signal carried by a custom-signal event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamSignal {
    StopStreaming,
    ContinueStreaming,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    NodeStart,
    NodeDelta {
        delta: String,
    },
    NodeEnd {
        #[serde(default)]
        payload: Option<NodePayload>,
    },
    ToolStart {
        tool: String,
    },
    ToolEnd {
        tool: String,
        #[serde(default)]
        output: Option<String>,
    },
    Signal {
        signal: StreamSignal,
    },
}

/// One lifecycle event, tagged with the node that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEvent {
    pub node: String,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Sender handle the pipeline emits through. A disabled sink swallows events
/// so the pipeline can run without a consumer (tests, non-streaming callers
/// that only want the final result).
#[derive(Clone)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<NodeEvent>>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<NodeEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Create a sink plus the receiving half of its channel.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<NodeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn emit(&self, node: &str, kind: EventKind) {
        if let Some(ref tx) = self.tx {
            // A closed receiver means the client went away; the run itself
            // continues and the result is still logged.
            let _ = tx.send(NodeEvent {
                node: node.to_string(),
                kind,
            });
        }
    }

    pub fn node_start(&self, node: &str) {
        self.emit(node, EventKind::NodeStart);
    }

    pub fn node_delta(&self, node: &str, delta: impl Into<String>) {
        self.emit(
            node,
            EventKind::NodeDelta {
                delta: delta.into(),
            },
        );
    }

    pub fn node_end(&self, node: &str) {
        self.emit(node, EventKind::NodeEnd { payload: None });
    }

    pub fn node_end_with(&self, node: &str, payload: NodePayload) {
        self.emit(
            node,
            EventKind::NodeEnd {
                payload: Some(payload),
            },
        );
    }

    pub fn tool_start(&self, node: &str, tool: impl Into<String>) {
        self.emit(node, EventKind::ToolStart { tool: tool.into() });
    }

    pub fn tool_end(&self, node: &str, tool: impl Into<String>, output: Option<String>) {
        self.emit(
            node,
            EventKind::ToolEnd {
                tool: tool.into(),
                output,
            },
        );
    }

    pub fn signal(&self, node: &str, signal: StreamSignal) {
        self.emit(node, EventKind::Signal { signal });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_delivers_in_order() {
        let (sink, mut rx) = EventSink::channel();
        sink.node_start("a");
        sink.node_delta("a", "x");
        sink.node_end("a");
        let mut nodes = Vec::new();
        while let Ok(event) = rx.try_recv() {
            nodes.push(event);
        }
        assert_eq!(nodes.len(), 3);
        assert!(matches!(nodes[0].kind, EventKind::NodeStart));
        assert!(matches!(nodes[2].kind, EventKind::NodeEnd { .. }));
    }

    #[test]
    fn test_disabled_sink_swallows() {
        let sink = EventSink::disabled();
        sink.node_start("a"); // must not panic
    }
}
