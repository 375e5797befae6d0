//! LLM domain: SSE framing, the streaming completion client and turn stats.

pub mod completion;
pub mod stats;
pub mod streaming;

pub use completion::{
    interpret_chunk, visible_reply, ChunkOutcome, CompletionClient, CompletionRequest, StreamEvent,
    StreamHandle, WireMessage,
};
pub use stats::{StatField, TurnStats, STAT_UNAVAILABLE};
