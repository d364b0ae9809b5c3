//! Generation Backend Traits
//!
//! Trait definitions for generation transports. This abstraction lets the
//! coordinator drive OpenAI, Anthropic, DeepSeek and Ollama models (or a test
//! double) without changing core logic.
//!
//! # Design Philosophy
//!
//! The `GenerationBackend` trait provides a common interface for:
//! - Sending a conversation and receiving a reply (streaming or single payload)
//! - Observing cooperative cancellation mid-stream
//! - Health checking an endpoint
//!
//! Implementations handle provider-specific details (wire formats, auth).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::models::ModelConfig;
use crate::path::Turn;

/// Which side-channel a streamed chunk belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkKind {
    /// Model reasoning ("thinking") text
    Reasoning,
    /// Reply content
    Content,
}

/// Stream events from generation backends
#[derive(Clone, Debug, PartialEq)]
pub enum StreamingToken {
    /// A piece of reasoning text
    Reasoning(String),
    /// A piece of reply content
    Content(String),
    /// Response completed successfully
    Complete,
    /// Error occurred during streaming
    Error(TransportError),
}

impl StreamingToken {
    /// Whether this token ends the stream
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error(_))
    }

    /// The chunk kind and text for reasoning/content tokens
    #[must_use]
    pub fn chunk(&self) -> Option<(ChunkKind, &str)> {
        match self {
            Self::Reasoning(text) => Some((ChunkKind::Reasoning, text)),
            Self::Content(text) => Some((ChunkKind::Content, text)),
            Self::Complete | Self::Error(_) => None,
        }
    }
}

/// Transport failures, distinguishable by cause
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The model needs an API key and none is configured
    #[error("missing credentials for model '{model}'")]
    MissingCredentials {
        /// Model configuration id
        model: String,
    },

    /// The endpoint could not be reached (connect failure or timeout)
    #[error("endpoint unreachable: {0}")]
    Unreachable(String),

    /// The endpoint answered with a non-success status
    #[error("endpoint returned {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body
        body: String,
    },

    /// The response could not be decoded
    #[error("failed to decode response: {0}")]
    Decode(String),

    /// The stream broke or reported an error mid-way
    #[error("stream error: {0}")]
    Stream(String),

    /// Any other request failure
    #[error("request failed: {0}")]
    Request(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() {
            Self::Unreachable(e.to_string())
        } else if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Request(e.to_string())
        }
    }
}

/// Response from a non-streaming request
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GenerationResponse {
    /// The reply text
    pub content: String,
    /// Reasoning text, when the model exposes it
    pub reasoning: Option<String>,
    /// Provider-side model that answered
    pub model: String,
    /// Response generation time in milliseconds
    pub duration_ms: Option<u64>,
}

/// Generation backend trait
///
/// Implement this trait to add support for different transports.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Get the backend name
    fn name(&self) -> &str;

    /// Check if the model's endpoint is reachable
    async fn health_check(&self, model: &ModelConfig) -> bool;

    /// Send a conversation and get a streaming reply
    ///
    /// Returns as soon as the request is accepted locally; connecting and
    /// waiting for the response happen behind the channel, so a failure
    /// there arrives as an `Error` token. Tokens arrive in order, ending
    /// with exactly one `Complete` or `Error`. When `cancel` fires, the
    /// backend stops and drops the sender without a terminal token.
    async fn send_streaming(
        &self,
        turns: &[Turn],
        model: &ModelConfig,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<StreamingToken>, TransportError>;

    /// Send a conversation and wait for the complete reply
    async fn send(
        &self,
        turns: &[Turn],
        model: &ModelConfig,
    ) -> Result<GenerationResponse, TransportError>;
}

#[async_trait]
impl<B: GenerationBackend + ?Sized> GenerationBackend for std::sync::Arc<B> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn health_check(&self, model: &ModelConfig) -> bool {
        (**self).health_check(model).await
    }

    async fn send_streaming(
        &self,
        turns: &[Turn],
        model: &ModelConfig,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<StreamingToken>, TransportError> {
        (**self).send_streaming(turns, model, cancel).await
    }

    async fn send(
        &self,
        turns: &[Turn],
        model: &ModelConfig,
    ) -> Result<GenerationResponse, TransportError> {
        (**self).send(turns, model).await
    }
}
