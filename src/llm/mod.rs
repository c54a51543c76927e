//! Reply generation
//!
//! This module provides:
//! - The `ReplyService` contract and a worker that runs it off the orchestrator thread
//! - An OpenAI-compatible chat completions client
//! - Host instructions and greeting text

pub mod openai;
pub mod prompts;
pub mod reply;

// Re-export commonly used types
pub use openai::{OpenAiReplyConfig, OpenAiReplyService};
pub use reply::{
    ChatMessage, ReplyCommand, ReplyEvent, ReplyHandle, ReplyRequest, ReplyRunner, ReplyService,
};
