//! Ollama Chat Dialect
//!
//! Wire format for a local Ollama server.
//!
//! # Ollama API
//!
//! - `/api/chat` - Chat completions with message history
//! - `/api/tags` - List available models (used for health checks)
//!
//! Streaming replies arrive as newline-delimited JSON objects, each carrying
//! a `message` with `content` and optionally `thinking`, and a final object
//! with `done: true`.

use serde_json::{json, Value};

use super::traits::{GenerationResponse, StreamingToken, TransportError};
use crate::models::ModelConfig;
use crate::path::Turn;

/// Chat endpoint URL
pub(crate) fn chat_url(model: &ModelConfig) -> String {
    format!("{}/api/chat", model.base_url())
}

/// Tags endpoint URL
pub(crate) fn health_url(model: &ModelConfig) -> String {
    format!("{}/api/tags", model.base_url())
}

/// Build the request body
pub(crate) fn request_body(turns: &[Turn], model: &ModelConfig, stream: bool) -> Value {
    let mut messages = Vec::with_capacity(turns.len() + 1);
    if let Some(system) = &model.system_prompt {
        messages.push(json!({ "role": "system", "content": system }));
    }
    messages.extend(
        turns
            .iter()
            .map(|t| json!({ "role": t.role.as_str(), "content": t.content })),
    );

    let mut body = json!({
        "model": model.model,
        "messages": messages,
        "stream": stream,
    });

    let mut options = serde_json::Map::new();
    if let Some(temperature) = model.temperature {
        options.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(top_p) = model.top_p {
        options.insert("top_p".to_string(), json!(top_p));
    }
    if let Some(max_tokens) = model.max_tokens {
        options.insert("num_predict".to_string(), json!(max_tokens));
    }
    if !options.is_empty() {
        body["options"] = Value::Object(options);
    }
    body
}

/// Decode one NDJSON line into tokens
///
/// Blank lines produce nothing. A `done: true` object ends with `Complete`.
pub(crate) fn decode_line(line: &str) -> Result<Vec<StreamingToken>, TransportError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Vec::new());
    }

    let data: Value =
        serde_json::from_str(line).map_err(|e| TransportError::Decode(e.to_string()))?;

    if let Some(error) = data.get("error").and_then(Value::as_str) {
        return Err(TransportError::Stream(error.to_string()));
    }

    let mut tokens = Vec::new();
    if let Some(message) = data.get("message") {
        if let Some(thinking) = message.get("thinking").and_then(Value::as_str) {
            if !thinking.is_empty() {
                tokens.push(StreamingToken::Reasoning(thinking.to_string()));
            }
        }
        if let Some(content) = message.get("content").and_then(Value::as_str) {
            if !content.is_empty() {
                tokens.push(StreamingToken::Content(content.to_string()));
            }
        }
    }

    if data.get("done").and_then(Value::as_bool).unwrap_or(false) {
        tokens.push(StreamingToken::Complete);
    }
    Ok(tokens)
}

/// Decode a non-streaming response body
pub(crate) fn decode_response(data: &Value) -> Result<GenerationResponse, TransportError> {
    if let Some(error) = data.get("error").and_then(Value::as_str) {
        return Err(TransportError::Stream(error.to_string()));
    }

    let message = data
        .get("message")
        .ok_or_else(|| TransportError::Decode("response has no message".to_string()))?;

    let content = message
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let reasoning = message
        .get("thinking")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .map(String::from);
    let model = data
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    Ok(GenerationResponse {
        content,
        reasoning,
        model,
        duration_ms: None,
    })
}
