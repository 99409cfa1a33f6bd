//! External LLM provider streaming implementations.
//!
//! Each provider streams tokens via SSE. OpenAI-compatible endpoints share one
//! format; Anthropic uses a different one.

use std::pin::Pin;

use futures::Stream;
use reqwest::Client;
use serde_json::json;
use tokio_stream::StreamExt;
use tracing::{debug, error};

use crate::types::{ChatMessage, LlmError, LlmProvider, ResolvedProvider, Sampling};

/// Boxed stream type for returning different stream implementations.
pub type BoxedStream = Pin<Box<dyn Stream<Item = StreamChunk> + Send>>;

/// A single streamed token or error.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    Token(String),
    Done { tokens_used: usize },
    Error(LlmErrorKind, String),
}

/// Coarse error kind carried through the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmErrorKind {
    Request,
    Api(u16),
    Stream,
}

fn chunk_error(kind: LlmErrorKind, message: String) -> LlmError {
    match kind {
        LlmErrorKind::Request => LlmError::Request(message),
        LlmErrorKind::Api(status) => LlmError::Api {
            status,
            body: message,
        },
        LlmErrorKind::Stream => LlmError::Stream(message),
    }
}

/// Stream tokens from the resolved provider.
pub fn stream_llm(
    client: &Client,
    provider: &ResolvedProvider,
    messages: Vec<ChatMessage>,
    sampling: Sampling,
) -> BoxedStream {
    match provider.provider {
        LlmProvider::OpenAI => Box::pin(stream_openai_compat(
            client.clone(),
            provider.clone(),
            messages,
            sampling,
        )),
        LlmProvider::Anthropic => Box::pin(stream_anthropic(
            client.clone(),
            provider.clone(),
            messages,
            sampling,
        )),
    }
}

/// Drain a stream into the full response text.
pub async fn collect_stream(mut stream: BoxedStream) -> Result<String, LlmError> {
    let mut out = String::new();
    while let Some(chunk) = stream.next().await {
        match chunk {
            StreamChunk::Token(t) => out.push_str(&t),
            StreamChunk::Done { tokens_used } => {
                debug!("LLM stream done ({} chunks)", tokens_used);
                break;
            }
            StreamChunk::Error(kind, msg) => return Err(chunk_error(kind, msg)),
        }
    }
    Ok(out)
}

/// Non-streaming convenience: stream and gather.
pub async fn complete(
    client: &Client,
    provider: &ResolvedProvider,
    messages: Vec<ChatMessage>,
    sampling: Sampling,
) -> Result<String, LlmError> {
    collect_stream(stream_llm(client, provider, messages, sampling)).await
}

/// What one OpenAI-compatible `data:` payload carried.
#[derive(Debug, PartialEq)]
enum OpenAiEvent {
    Delta(String),
    Done,
    Ignore,
}

fn parse_openai_data(data: &str) -> OpenAiEvent {
    if data.trim() == "[DONE]" {
        return OpenAiEvent::Done;
    }
    match serde_json::from_str::<serde_json::Value>(data) {
        Ok(parsed) => match parsed["choices"][0]["delta"]["content"].as_str() {
            Some(content) if !content.is_empty() => OpenAiEvent::Delta(content.to_string()),
            _ => OpenAiEvent::Ignore,
        },
        Err(_) => OpenAiEvent::Ignore,
    }
}

/// What one Anthropic `data:` payload carried.
#[derive(Debug, PartialEq)]
enum AnthropicEvent {
    Delta(String),
    Stop,
    Error(String),
    Ignore,
}

fn parse_anthropic_data(data: &str) -> AnthropicEvent {
    let Ok(parsed) = serde_json::from_str::<serde_json::Value>(data) else {
        return AnthropicEvent::Ignore;
    };
    match parsed["type"].as_str() {
        Some("content_block_delta") => match parsed["delta"]["text"].as_str() {
            Some(text) if !text.is_empty() => AnthropicEvent::Delta(text.to_string()),
            _ => AnthropicEvent::Ignore,
        },
        Some("message_stop") => AnthropicEvent::Stop,
        Some("error") => AnthropicEvent::Error(
            parsed["error"]["message"]
                .as_str()
                .unwrap_or("Unknown error")
                .to_string(),
        ),
        _ => AnthropicEvent::Ignore,
    }
}

/// Pop complete, non-comment SSE `data:` payloads from the buffer.
fn drain_data_lines(buffer: &mut String) -> Vec<String> {
    let mut out = Vec::new();
    while let Some(line_end) = buffer.find('\n') {
        let line = buffer[..line_end].trim().to_string();
        buffer.drain(..=line_end);
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        if let Some(data) = line.strip_prefix("data:") {
            out.push(data.trim_start().to_string());
        }
    }
    out
}

/// Stream from OpenAI-compatible APIs.
fn stream_openai_compat(
    client: Client,
    provider: ResolvedProvider,
    messages: Vec<ChatMessage>,
    sampling: Sampling,
) -> impl Stream<Item = StreamChunk> + Send + 'static {
    let msgs: Vec<serde_json::Value> = messages
        .iter()
        .map(|m| json!({"role": m.role, "content": m.content}))
        .collect();

    async_stream::stream! {
        let body = json!({
            "model": provider.model,
            "messages": msgs,
            "temperature": sampling.temperature,
            "max_tokens": sampling.max_tokens,
            "stream": true,
        });

        debug!("Streaming from {} with model {}", provider.endpoint, provider.model);

        let response = match client
            .post(&provider.endpoint)
            .header("Authorization", format!("Bearer {}", provider.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                yield StreamChunk::Error(LlmErrorKind::Request, e.to_string());
                return;
            }
        };

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            yield StreamChunk::Error(LlmErrorKind::Api(status), body);
            return;
        }

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        let mut token_count = 0usize;

        while let Some(chunk) = stream.next().await {
            let bytes = match chunk {
                Ok(b) => b,
                Err(e) => {
                    yield StreamChunk::Error(LlmErrorKind::Stream, e.to_string());
                    return;
                }
            };

            buffer.push_str(&String::from_utf8_lossy(&bytes));

            for data in drain_data_lines(&mut buffer) {
                match parse_openai_data(&data) {
                    OpenAiEvent::Delta(content) => {
                        token_count += 1;
                        yield StreamChunk::Token(content);
                    }
                    OpenAiEvent::Done => {
                        yield StreamChunk::Done { tokens_used: token_count };
                        return;
                    }
                    OpenAiEvent::Ignore => {}
                }
            }
        }

        yield StreamChunk::Done { tokens_used: token_count };
    }
}

/// Stream from Anthropic's Messages API.
fn stream_anthropic(
    client: Client,
    provider: ResolvedProvider,
    messages: Vec<ChatMessage>,
    sampling: Sampling,
) -> impl Stream<Item = StreamChunk> + Send + 'static {
    // Separate system message from conversation
    let system_msg: Option<String> = messages
        .iter()
        .find(|m| m.role == "system")
        .map(|m| m.content.clone());

    let conv_msgs: Vec<serde_json::Value> = messages
        .iter()
        .filter(|m| m.role != "system")
        .map(|m| json!({"role": m.role, "content": m.content}))
        .collect();

    async_stream::stream! {
        let mut body = json!({
            "model": provider.model,
            "messages": conv_msgs,
            "temperature": sampling.temperature,
            "max_tokens": sampling.max_tokens,
            "stream": true,
        });

        if let Some(sys) = system_msg {
            body["system"] = json!(sys);
        }

        debug!("Streaming from Anthropic with model {}", provider.model);

        let response = match client
            .post(&provider.endpoint)
            .header("x-api-key", &provider.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                yield StreamChunk::Error(LlmErrorKind::Request, e.to_string());
                return;
            }
        };

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            yield StreamChunk::Error(LlmErrorKind::Api(status), body);
            return;
        }

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        let mut token_count = 0usize;

        while let Some(chunk) = stream.next().await {
            let bytes = match chunk {
                Ok(b) => b,
                Err(e) => {
                    yield StreamChunk::Error(LlmErrorKind::Stream, e.to_string());
                    return;
                }
            };

            buffer.push_str(&String::from_utf8_lossy(&bytes));

            // Anthropic uses "event: " lines followed by "data: " lines
            for data in drain_data_lines(&mut buffer) {
                match parse_anthropic_data(&data) {
                    AnthropicEvent::Delta(text) => {
                        token_count += 1;
                        yield StreamChunk::Token(text);
                    }
                    AnthropicEvent::Stop => {
                        yield StreamChunk::Done { tokens_used: token_count };
                        return;
                    }
                    AnthropicEvent::Error(msg) => {
                        error!("Anthropic error: {}", msg);
                        yield StreamChunk::Error(LlmErrorKind::Stream, msg);
                        return;
                    }
                    AnthropicEvent::Ignore => {}
                }
            }
        }

        yield StreamChunk::Done { tokens_used: token_count };
    }
}
