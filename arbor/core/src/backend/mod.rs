//! Generation Backend Integration
//!
//! This module provides abstracted access to model endpoints (OpenAI,
//! Anthropic, DeepSeek, Ollama) through a common trait interface.
//!
//! # Available Dialects
//!
//! - **OpenAI chat**: OpenAI, DeepSeek and compatible endpoints (SSE)
//! - **Anthropic messages**: Claude models (SSE with named events)
//! - **Ollama chat**: Local server (newline-delimited JSON)
//!
//! # Usage
//!
//! ```ignore
//! use arbor_core::backend::{GenerationBackend, HttpBackend};
//! use arbor_core::path::Turn;
//!
//! let backend = HttpBackend::new(Duration::from_secs(120))?;
//! let mut rx = backend
//!     .send_streaming(&[Turn::user("Hello!")], &model, CancellationToken::new())
//!     .await?;
//! ```

mod anthropic;
mod http;
mod ollama;
mod openai;
mod traits;

pub use http::HttpBackend;
pub use traits::{ChunkKind, GenerationBackend, GenerationResponse, StreamingToken, TransportError};
