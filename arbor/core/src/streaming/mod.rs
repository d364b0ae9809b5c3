//! Streaming Infrastructure for Generations
//!
//! This module connects backend token streams to the conversation tree.
//! Each in-flight generation writes into exactly one composite node, and the
//! `StreamManager` polls all of them without cross-contamination.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                       StreamManager                              │
//! │  ┌────────────────────────────────────────────────────────────┐  │
//! │  │                    Active Streams Map                      │  │
//! │  │  ┌──────────────────┐  ┌──────────────────┐                │  │
//! │  │  │ GenerationStream │  │ GenerationStream │  ...           │  │
//! │  │  │  (node: A)       │  │  (node: B)       │                │  │
//! │  │  │  [cancel token]  │  │  [cancel token]  │                │  │
//! │  │  └────────┬─────────┘  └────────┬─────────┘                │  │
//! │  └───────────┼─────────────────────┼──────────────────────────┘  │
//! │         poll_all() ────────────────┘                             │
//! │              │                                                   │
//! │              ▼                                                   │
//! │     StreamEvent { node_id, kind } ──► reconciler::apply_local    │
//! │                                   ──► reconciler::settle         │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Features
//!
//! - **Non-blocking polling**: `poll_all()` drains whatever has arrived
//! - **Awaiting**: `next_event()` suspends until one stream has news
//! - **Cancellation**: `cancel()` stops the reader and returns what it had already delivered
//! - **No cross-contamination**: Streams are isolated by target node

pub mod reconciler;
mod stream_manager;

pub use reconciler::GenerationPhase;
pub use stream_manager::{
    GenerationStream, StreamEvent, StreamEventKind, StreamManager, StreamManagerConfig,
    StreamRegisterError,
};
