//! Streaming chat client for a locally hosted LLM inference backend.
//!
//! The core is [`StreamingChatSession`]: it sends a conversation to an
//! OpenAI-style `/v1/chat/completions` endpoint, parses the server-sent-event
//! body into text deltas and lets the caller cancel a reply at any point
//! (including by simply sending the next message). Around it sit the backend
//! status calls, transcript export, a small benchmark and the `studio` CLI.

pub mod backend;
pub mod benchmark;
pub mod cli;
pub mod config;
pub mod error;
pub mod history;
pub mod metrics;
pub mod session;
pub mod sse;
pub mod wire;

pub use error::{ChatError, Result, StudioError};
pub use metrics::{SessionStats, StreamMetrics};
pub use session::{
    ChatOptions, ChatStream, SessionConfig, StreamEvent, StreamPhase, StreamingChatSession,
};
pub use wire::{ChatMessage, Role};
