//! Arbor Core - Headless Branching Conversations
//!
//! This crate holds everything behind a branching chat canvas: the
//! conversation tree, its layout, model configuration, streamed generation
//! and session persistence. It has no UI dependencies; a canvas, a terminal
//! or a test harness drives it through the [`SessionCoordinator`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          UI Surfaces                             │
//! │        canvas / CLI / tests  ──ops──▶  ◀──CoordinatorEvent──     │
//! └────────────────────────────────┬─────────────────────────────────┘
//!                                  │
//! ┌────────────────────────────────┼─────────────────────────────────┐
//! │                         ARBOR CORE                               │
//! │  ┌─────────────────────────────┴──────────────────────────────┐  │
//! │  │                   SessionCoordinator                        │  │
//! │  │  ┌──────────┐  ┌──────────┐  ┌────────────┐  ┌───────────┐ │  │
//! │  │  │ Session  │  │  Layout  │  │  Stream    │  │  Model    │ │  │
//! │  │  │ NodeStore│  │  Engine  │  │  Manager   │  │  Registry │ │  │
//! │  │  └──────────┘  └──────────┘  └─────┬──────┘  └───────────┘ │  │
//! │  └────────────────────────────────────┼────────────────────────┘  │
//! │         │                             │                           │
//! │  SessionRepository            GenerationBackend                   │
//! │  (JSON files / memory)     (OpenAI / Anthropic / Ollama)          │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`SessionCoordinator`]: Owns sessions, selection and generations
//! - [`Session`]: One conversation tree plus metadata
//! - [`Node`]: A tree node (pending input, composite turn, ...)
//! - [`LayoutEngine`]: Tidy top-down tree layout
//! - [`ModelConfig`]: Endpoint, credentials and sampling for one model
//! - [`CoordinatorEvent`]: Events sent to UI surfaces
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use arbor_core::{
//!     config::load_config, backend::HttpBackend, persistence::JsonFileRepository,
//!     CoordinatorSettings, SessionCoordinator,
//! };
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config()?;
//!     let repository = JsonFileRepository::open(&config.data_dir).await?;
//!     let backend = HttpBackend::new(config.request_timeout)?;
//!     let models = Arc::new(config.model_registry()?);
//!
//!     let (tx, mut rx) = mpsc::unbounded_channel();
//!     let settings = CoordinatorSettings::from(&config);
//!     let mut coordinator = SessionCoordinator::new(repository, backend, models, settings, tx);
//!     coordinator.start().await?;
//!
//!     let root = coordinator.active_session().unwrap().root_id.clone();
//!     coordinator.send_message(&root, "Hello!", None).await?;
//!     let outcome = coordinator.wait_for_generation(&root).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`ids`]: Node and session identifiers
//! - [`node`]: Node kinds, positions and quotes
//! - [`store`]: The node tree with parent/child link maintenance
//! - [`session`]: Sessions (the unit of persistence)
//! - [`path`]: Root-to-node history resolution
//! - [`layout`]: Height estimation and tree layout
//! - [`models`]: Model configuration and registry
//! - [`backend`]: Generation transports
//! - [`streaming`]: In-flight generations and reply reconciliation
//! - [`persistence`]: Session repositories
//! - [`events`]: Events from the coordinator to UI surfaces
//! - [`config`]: TOML and environment configuration
//! - [`coordinator`]: The session coordinator

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod config;
pub mod coordinator;
pub mod events;
pub mod ids;
pub mod layout;
pub mod models;
pub mod node;
pub mod path;
pub mod persistence;
pub mod session;
pub mod store;
pub mod streaming;

// Re-exports for convenience
pub use backend::{
    ChunkKind, GenerationBackend, GenerationResponse, HttpBackend, StreamingToken, TransportError,
};
pub use config::{ArborConfig, ConfigError, ConfigOverrides, ConfigSource};
pub use coordinator::{
    CoordinatorError, CoordinatorSettings, GenerationOutcome, SessionCoordinator,
};
pub use events::{CoordinatorEvent, NotifyLevel};
pub use ids::{NodeId, SessionId};
pub use layout::{LayoutConfig, LayoutEngine, NodeBox, TreeLayout};
pub use models::{
    InMemoryModelRegistry, ModelConfig, ModelRegistry, ModelRegistryError, Protocol, ProviderKind,
};
pub use node::{MessageRole, Node, NodeKind, NodePatch, Position, QuotedContext};
pub use path::{resolve_path, user_content, Turn};
pub use persistence::{JsonFileRepository, MemoryRepository, SessionRepository};
pub use session::{Session, DEFAULT_SESSION_TITLE};
pub use store::{NodeStore, StoreError};
pub use streaming::GenerationPhase;
