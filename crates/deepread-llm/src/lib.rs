//! LLM-backed translation and analysis over external APIs (OpenAI-compatible, Anthropic).
//!
//! Requests stream over SSE; `complete` gathers the stream into one response.

pub mod client;
pub mod config;
pub mod prompts;
pub mod providers;
pub mod types;

pub use client::LlmClient;
pub use config::LlmConfig;
pub use types::*;
