//! Stream Manager Implementation
//!
//! Tracks one in-flight generation per target node. Each stream wraps the
//! backend's token receiver with the node it writes into, its cancellation
//! token and running statistics.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::backend::{ChunkKind, StreamingToken, TransportError};
use crate::ids::{NodeId, SessionId};

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the stream manager
#[derive(Clone, Debug)]
pub struct StreamManagerConfig {
    /// Maximum number of concurrent streams
    pub max_concurrent_streams: usize,
}

impl Default for StreamManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_streams: 16,
        }
    }
}

// ============================================================================
// Stream Events
// ============================================================================

/// An event from a generation stream
#[derive(Clone, Debug, PartialEq)]
pub struct StreamEvent {
    /// Session owning the target node
    pub session_id: SessionId,
    /// The node being generated into
    pub node_id: NodeId,
    /// The event kind
    pub kind: StreamEventKind,
}

/// Kind of stream event
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEventKind {
    /// A chunk of reasoning or content
    Chunk {
        /// Which payload the text belongs to
        kind: ChunkKind,
        /// The text
        text: String,
    },
    /// Stream completed successfully
    Complete {
        /// Chunks received
        chunk_count: u32,
        /// Duration of the stream
        duration: Duration,
    },
    /// Stream encountered an error
    Error {
        /// Error description
        error: TransportError,
    },
}

impl StreamEventKind {
    /// Whether this event ends the stream
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error { .. })
    }
}

// ============================================================================
// Generation Stream
// ============================================================================

/// Statistics for a generation stream
#[derive(Clone, Debug, Default)]
pub struct StreamStats {
    /// Content chunks received
    pub content_chunks: u32,
    /// Reasoning chunks received
    pub reasoning_chunks: u32,
    /// When streaming started
    pub started_at: Option<Instant>,
    /// Last chunk received timestamp
    pub last_chunk_at: Option<Instant>,
}

impl StreamStats {
    /// Total chunks of either kind
    #[must_use]
    pub fn total_chunks(&self) -> u32 {
        self.content_chunks + self.reasoning_chunks
    }
}

/// A stream wrapper for a single generation
pub struct GenerationStream {
    /// Session owning the target node
    session_id: SessionId,
    /// The node being generated into
    node_id: NodeId,
    /// Model configuration id used for the request
    model_id: String,
    /// The underlying token receiver
    receiver: mpsc::Receiver<StreamingToken>,
    /// Stops the backend reader task
    cancel: CancellationToken,
    /// Stream statistics
    stats: StreamStats,
    /// Whether the stream has reached a terminal event
    completed: bool,
}

impl GenerationStream {
    /// Create a new generation stream
    #[must_use]
    pub fn new(
        session_id: SessionId,
        node_id: NodeId,
        model_id: impl Into<String>,
        receiver: mpsc::Receiver<StreamingToken>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session_id,
            node_id,
            model_id: model_id.into(),
            receiver,
            cancel,
            stats: StreamStats {
                started_at: Some(Instant::now()),
                ..Default::default()
            },
            completed: false,
        }
    }

    /// Get the session ID
    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Get the target node ID
    #[must_use]
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Get the model configuration id
    #[must_use]
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Check if the stream has completed
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    fn event(&self, kind: StreamEventKind) -> StreamEvent {
        StreamEvent {
            session_id: self.session_id.clone(),
            node_id: self.node_id.clone(),
            kind,
        }
    }

    /// Translate a received token, updating stats
    fn accept(&mut self, token: StreamingToken) -> StreamEvent {
        self.stats.last_chunk_at = Some(Instant::now());
        let kind = match token {
            StreamingToken::Reasoning(text) => {
                self.stats.reasoning_chunks += 1;
                StreamEventKind::Chunk {
                    kind: ChunkKind::Reasoning,
                    text,
                }
            }
            StreamingToken::Content(text) => {
                self.stats.content_chunks += 1;
                StreamEventKind::Chunk {
                    kind: ChunkKind::Content,
                    text,
                }
            }
            StreamingToken::Complete => {
                self.completed = true;
                StreamEventKind::Complete {
                    chunk_count: self.stats.total_chunks(),
                    duration: self
                        .stats
                        .started_at
                        .map(|s| s.elapsed())
                        .unwrap_or_default(),
                }
            }
            StreamingToken::Error(error) => {
                self.completed = true;
                StreamEventKind::Error { error }
            }
        };
        self.event(kind)
    }

    fn disconnected(&mut self) -> StreamEvent {
        // Channel closed without proper completion
        self.completed = true;
        self.event(StreamEventKind::Error {
            error: TransportError::Stream("stream disconnected unexpectedly".to_string()),
        })
    }

    /// Poll the stream for new chunks (non-blocking)
    ///
    /// Returns events in arrival order. A terminal event, if any, is last.
    pub fn poll(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while !self.completed {
            match self.receiver.try_recv() {
                Ok(token) => events.push(self.accept(token)),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    events.push(self.disconnected());
                }
            }
        }
        events
    }

    /// Wait for the next event
    ///
    /// Returns `None` once the stream has completed.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        if self.completed {
            return None;
        }
        Some(match self.receiver.recv().await {
            Some(token) => self.accept(token),
            None => self.disconnected(),
        })
    }

    /// Signal the backend to stop and collect chunks already delivered
    ///
    /// Terminal tokens that raced the cancellation are dropped.
    pub fn cancel(&mut self) -> Vec<StreamEvent> {
        self.cancel.cancel();
        let mut delivered = Vec::new();
        while let Ok(token) = self.receiver.try_recv() {
            if !token.is_terminal() {
                delivered.push(self.accept(token));
            }
        }
        self.receiver.close();
        self.completed = true;
        delivered
    }
}

// ============================================================================
// Stream Manager
// ============================================================================

/// Manages concurrent generation streams, one per target node
pub struct StreamManager {
    /// Active streams by target node
    streams: HashMap<NodeId, GenerationStream>,
    /// Configuration
    config: StreamManagerConfig,
    /// Global statistics
    total_streams_created: u64,
    total_chunks_processed: u64,
}

impl Default for StreamManager {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamManager {
    /// Create a new stream manager with default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(StreamManagerConfig::default())
    }

    /// Create a new stream manager with custom configuration
    #[must_use]
    pub fn with_config(config: StreamManagerConfig) -> Self {
        Self {
            streams: HashMap::new(),
            config,
            total_streams_created: 0,
            total_chunks_processed: 0,
        }
    }

    /// Get the current configuration
    #[must_use]
    pub fn config(&self) -> &StreamManagerConfig {
        &self.config
    }

    /// Get the number of active streams
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.streams.len()
    }

    /// Check if a node has an active stream
    #[must_use]
    pub fn has_stream(&self, node_id: &NodeId) -> bool {
        self.streams.contains_key(node_id)
    }

    /// Get a reference to a stream
    #[must_use]
    pub fn get(&self, node_id: &NodeId) -> Option<&GenerationStream> {
        self.streams.get(node_id)
    }

    /// Register a new stream
    ///
    /// Returns `Err` if max concurrent streams reached or the node already has a stream.
    pub fn register(&mut self, stream: GenerationStream) -> Result<(), StreamRegisterError> {
        if self.streams.contains_key(stream.node_id()) {
            return Err(StreamRegisterError::StreamAlreadyExists(
                stream.node_id().clone(),
            ));
        }

        if self.streams.len() >= self.config.max_concurrent_streams {
            return Err(StreamRegisterError::MaxStreamsReached);
        }

        debug!(node_id = %stream.node_id(), session_id = %stream.session_id(), "Stream registered");
        self.streams.insert(stream.node_id().clone(), stream);
        self.total_streams_created += 1;

        Ok(())
    }

    /// Poll all active streams (non-blocking)
    ///
    /// Events for one stream keep their arrival order. Streams that reach a
    /// terminal event are removed.
    pub fn poll_all(&mut self) -> Vec<StreamEvent> {
        let mut all_events = Vec::new();
        let mut completed_ids = Vec::new();

        for (node_id, stream) in &mut self.streams {
            let events = stream.poll();
            self.total_chunks_processed += events
                .iter()
                .filter(|e| matches!(e.kind, StreamEventKind::Chunk { .. }))
                .count() as u64;
            if stream.is_completed() {
                completed_ids.push(node_id.clone());
            }
            all_events.extend(events);
        }

        for id in completed_ids {
            self.streams.remove(&id);
        }

        all_events
    }

    /// Wait for the next event of one stream
    ///
    /// Removes the stream once it yields a terminal event. Cancel safe:
    /// dropping the future before it resolves consumes nothing.
    pub async fn next_event(&mut self, node_id: &NodeId) -> Option<StreamEvent> {
        let stream = self.streams.get_mut(node_id)?;
        let event = stream.next_event().await;
        if let Some(StreamEvent {
            kind: StreamEventKind::Chunk { .. },
            ..
        }) = &event
        {
            self.total_chunks_processed += 1;
        }
        if stream.is_completed() {
            self.streams.remove(node_id);
        }
        event
    }

    /// Cancel and remove a stream, returning chunks it had already delivered
    pub fn cancel(&mut self, node_id: &NodeId) -> Option<Vec<StreamEvent>> {
        let mut stream = self.streams.remove(node_id)?;
        debug!(node_id = %node_id, "Stream cancelled");
        Some(stream.cancel())
    }

    /// Active stream IDs belonging to one session
    #[must_use]
    pub fn session_stream_ids(&self, session_id: &SessionId) -> Vec<NodeId> {
        self.streams
            .values()
            .filter(|s| s.session_id() == session_id)
            .map(|s| s.node_id().clone())
            .collect()
    }

    /// Get total number of streams created (lifetime)
    #[must_use]
    pub fn total_streams_created(&self) -> u64 {
        self.total_streams_created
    }

    /// Get total chunks processed (lifetime)
    #[must_use]
    pub fn total_chunks_processed(&self) -> u64 {
        self.total_chunks_processed
    }

    /// Check if any streams are active
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

/// Error when registering a stream
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum StreamRegisterError {
    /// Maximum concurrent streams reached
    #[error("maximum concurrent streams reached")]
    MaxStreamsReached,
    /// Node already has an active stream
    #[error("node {0} already has an active generation")]
    StreamAlreadyExists(NodeId),
}

// ============================================================================
// Tests
// ============================================================================
