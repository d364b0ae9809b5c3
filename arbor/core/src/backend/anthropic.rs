//! Anthropic Messages Dialect
//!
//! `POST {base}/messages` with the system prompt as a top-level field and a
//! mandatory `max_tokens`. Streaming replies are named server-sent events:
//! `content_block_delta` carries `text_delta` or `thinking_delta` payloads,
//! `message_stop` ends the reply and `error` reports a failure.

use serde::Deserialize;
use serde_json::{json, Value};

use super::traits::{GenerationResponse, StreamingToken, TransportError};
use crate::models::ModelConfig;
use crate::node::MessageRole;
use crate::path::Turn;

/// API version header value
pub(crate) const API_VERSION: &str = "2023-06-01";

/// `max_tokens` when the configuration leaves it unset
const DEFAULT_MAX_TOKENS: u32 = 4096;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockDelta {
    TextDelta { text: String },
    ThinkingDelta { thinking: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ContentBlockDelta {
    delta: BlockDelta,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

#[derive(Debug, Deserialize)]
struct SseError {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: String },
    Thinking { thinking: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    model: String,
    #[serde(default)]
    content: Vec<ContentBlock>,
}

/// Messages endpoint URL
pub(crate) fn chat_url(model: &ModelConfig) -> String {
    format!("{}/messages", model.base_url())
}

/// Models endpoint URL
pub(crate) fn health_url(model: &ModelConfig) -> String {
    format!("{}/models", model.base_url())
}

/// Build the request body
///
/// System turns in the history are folded into the top-level `system` field.
pub(crate) fn request_body(turns: &[Turn], model: &ModelConfig, stream: bool) -> Value {
    let mut system: Vec<&str> = model.system_prompt.iter().map(String::as_str).collect();
    let mut messages = Vec::with_capacity(turns.len());
    for turn in turns {
        match turn.role {
            MessageRole::System => system.push(&turn.content),
            MessageRole::User | MessageRole::Assistant => messages.push(json!({
                "role": turn.role.as_str(),
                "content": turn.content,
            })),
        }
    }

    let mut body = json!({
        "model": model.model,
        "messages": messages,
        "max_tokens": model.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        "stream": stream,
    });
    if !system.is_empty() {
        body["system"] = json!(system.join("\n\n"));
    }
    if let Some(temperature) = model.temperature {
        // Anthropic caps temperature at 1.0
        body["temperature"] = json!(temperature.min(1.0));
    }
    if let Some(top_p) = model.top_p {
        body["top_p"] = json!(top_p);
    }
    body
}

/// Decode one named SSE event into tokens
pub(crate) fn decode_event(event: &str, data: &str) -> Result<Vec<StreamingToken>, TransportError> {
    match event {
        "content_block_delta" => {
            let parsed: ContentBlockDelta = serde_json::from_str(data)
                .map_err(|e| TransportError::Decode(format!("{e}, data: {data}")))?;
            Ok(match parsed.delta {
                BlockDelta::TextDelta { text } if !text.is_empty() => {
                    vec![StreamingToken::Content(text)]
                }
                BlockDelta::ThinkingDelta { thinking } if !thinking.is_empty() => {
                    vec![StreamingToken::Reasoning(thinking)]
                }
                _ => Vec::new(),
            })
        }
        "message_stop" => Ok(vec![StreamingToken::Complete]),
        "error" => {
            let parsed: SseError = serde_json::from_str(data)
                .map_err(|e| TransportError::Decode(format!("{e}, data: {data}")))?;
            Err(TransportError::Stream(parsed.error.message))
        }
        // message_start, content_block_start/stop, message_delta, ping
        _ => Ok(Vec::new()),
    }
}

/// Decode a non-streaming response body
pub(crate) fn decode_response(data: Value) -> Result<GenerationResponse, TransportError> {
    let parsed: MessagesResponse =
        serde_json::from_value(data).map_err(|e| TransportError::Decode(e.to_string()))?;

    let mut content = String::new();
    let mut reasoning = String::new();
    for block in parsed.content {
        match block {
            ContentBlock::Text { text } => content.push_str(&text),
            ContentBlock::Thinking { thinking } => reasoning.push_str(&thinking),
            ContentBlock::Other => {}
        }
    }

    Ok(GenerationResponse {
        content,
        reasoning: (!reasoning.is_empty()).then_some(reasoning),
        model: parsed.model,
        duration_ms: None,
    })
}
