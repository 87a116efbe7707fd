//! Event-to-Protocol Streaming
//!
//! The translator turns node-tagged lifecycle events into role/type-tagged
//! chunks; two independent adapters turn chunks into wire formats (the native
//! structured SSE protocol and the OpenAI-compatible chat-completion
//! protocol). Each adapter keeps its own session state.

pub mod native;
pub mod openai;
pub mod translator;
