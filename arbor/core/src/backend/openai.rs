//! OpenAI Chat Dialect
//!
//! `POST {base}/chat/completions` for OpenAI, DeepSeek and compatible
//! endpoints. Streaming replies are server-sent events whose `data` is a
//! JSON chunk, terminated by a literal `[DONE]`. DeepSeek reasoning models
//! put their chain of thought in `delta.reasoning_content`.

use serde::Deserialize;
use serde_json::{json, Value};

use super::traits::{GenerationResponse, StreamingToken, TransportError};
use crate::models::ModelConfig;
use crate::path::Turn;

#[derive(Debug, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    delta: ChunkDelta,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

#[derive(Debug, Deserialize)]
struct SseData {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    error: Option<ErrorBody>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: String,
    #[serde(default)]
    choices: Vec<ResponseChoice>,
}

/// Chat endpoint URL
pub(crate) fn chat_url(model: &ModelConfig) -> String {
    format!("{}/chat/completions", model.base_url())
}

/// Models endpoint URL
pub(crate) fn health_url(model: &ModelConfig) -> String {
    format!("{}/models", model.base_url())
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
    if let Some(temperature) = model.temperature {
        body["temperature"] = json!(temperature);
    }
    if let Some(top_p) = model.top_p {
        body["top_p"] = json!(top_p);
    }
    if let Some(max_tokens) = model.max_tokens {
        body["max_tokens"] = json!(max_tokens);
    }
    body
}

/// Decode one SSE `data` payload into tokens
pub(crate) fn decode_event(data: &str) -> Result<Vec<StreamingToken>, TransportError> {
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(vec![StreamingToken::Complete]);
    }
    if data.is_empty() {
        return Ok(Vec::new());
    }

    let parsed: SseData = serde_json::from_str(data)
        .map_err(|e| TransportError::Decode(format!("{e}, data: {data}")))?;
    if let Some(error) = parsed.error {
        return Err(TransportError::Stream(error.message));
    }

    let mut tokens = Vec::new();
    // Usage-only chunks arrive with an empty choice list
    if let Some(choice) = parsed.choices.into_iter().next() {
        if let Some(reasoning) = choice.delta.reasoning_content.filter(|r| !r.is_empty()) {
            tokens.push(StreamingToken::Reasoning(reasoning));
        }
        if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
            tokens.push(StreamingToken::Content(content));
        }
    }
    Ok(tokens)
}

/// Decode a non-streaming response body
pub(crate) fn decode_response(data: Value) -> Result<GenerationResponse, TransportError> {
    let parsed: ChatResponse =
        serde_json::from_value(data).map_err(|e| TransportError::Decode(e.to_string()))?;
    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| TransportError::Decode("response has no choices".to_string()))?;

    Ok(GenerationResponse {
        content: choice.message.content.unwrap_or_default(),
        reasoning: choice.message.reasoning_content.filter(|r| !r.is_empty()),
        model: parsed.model,
        duration_ms: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProviderKind;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_request_body() {
        let mut model = ModelConfig::new("ds", ProviderKind::DeepSeek, "deepseek-reasoner");
        model.system_prompt = Some("Think first".to_string());
        model.max_tokens = Some(1024);

        let turns = vec![Turn::user("Q"), Turn::assistant("R"), Turn::user("Why?")];
        let body = request_body(&turns, &model, true);

        assert_eq!(chat_url(&model), "https://api.deepseek.com/v1/chat/completions");
        assert_eq!(body["messages"].as_array().unwrap().len(), 4);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][2]["role"], "assistant");
        assert_eq!(body["max_tokens"], 1024);
        assert!(body.get("temperature").is_none());
    }

    #[test]
    fn test_decode_content_and_reasoning() {
        let tokens = decode_event(
            r#"{"id":"c1","choices":[{"index":0,"delta":{"reasoning_content":"Let me see"}}]}"#,
        )
        .unwrap();
        assert_eq!(tokens, vec![StreamingToken::Reasoning("Let me see".to_string())]);

        let tokens = decode_event(
            r#"{"id":"c1","choices":[{"index":0,"delta":{"role":"assistant","content":"Hi"},"finish_reason":null}]}"#,
        )
        .unwrap();
        assert_eq!(tokens, vec![StreamingToken::Content("Hi".to_string())]);

        assert_eq!(decode_event("[DONE]").unwrap(), vec![StreamingToken::Complete]);
        assert!(decode_event(r#"{"choices":[],"usage":{"total_tokens":9}}"#)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_decode_error_payload() {
        assert_eq!(
            decode_event(r#"{"error":{"message":"rate limited","type":"requests"}}"#),
            Err(TransportError::Stream("rate limited".to_string()))
        );
        assert!(matches!(decode_event("nope"), Err(TransportError::Decode(_))));
    }

    #[test]
    fn test_decode_response() {
        let response = decode_response(json!({
            "model": "gpt-4o",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "Done."}}]
        }))
        .unwrap();
        assert_eq!(response.content, "Done.");
        assert_eq!(response.reasoning, None);

        assert!(decode_response(json!({"choices": []})).is_err());
    }
}
