//! Session Coordinator
//!
//! Owns every loaded session, the active session, the selection cursor and
//! the pending quote, and routes all tree mutations through one place.
//!
//! # Design Philosophy
//!
//! The coordinator is the single writer. Surfaces and transports never touch
//! a `Session` directly; they call coordinator operations, which run to
//! completion and end with one whole-session persist. Streamed output is the
//! one exception to "persist after every mutation": chunks are merged in
//! memory as they arrive and the session is persisted once when the
//! generation reaches a terminal phase.
//!
//! # Main Loop
//!
//! ```ignore
//! let (tx, mut rx) = mpsc::unbounded_channel();
//! let mut coordinator = SessionCoordinator::new(repository, backend, models, settings, tx);
//! coordinator.start().await?;
//!
//! coordinator.send_message(&node_id, "Hello!", None).await?;
//! loop {
//!     for outcome in coordinator.poll_streaming().await {
//!         // A generation finished
//!     }
//!     while let Ok(event) = rx.try_recv() {
//!         // Render event
//!     }
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{ChunkKind, GenerationBackend, TransportError};
use crate::config::{ArborConfig, DEFAULT_STOP_MARKER};
use crate::events::CoordinatorEvent;
use crate::ids::{NodeId, SessionId};
use crate::layout::{LayoutConfig, LayoutEngine};
use crate::models::{ModelConfig, ModelRegistry};
use crate::node::{Node, NodeKind, NodePatch, Position, QuotedContext};
use crate::path::{resolve_path, user_content, Turn};
use crate::persistence::SessionRepository;
use crate::session::{Session, DEFAULT_SESSION_TITLE};
use crate::store::StoreError;
use crate::streaming::reconciler::{self, GenerationPhase};
use crate::streaming::{
    GenerationStream, StreamEvent, StreamEventKind, StreamManager, StreamManagerConfig,
    StreamRegisterError,
};

// ============================================================================
// Errors
// ============================================================================

/// Errors from coordinator operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoordinatorError {
    /// No session is active (call `start` first)
    #[error("no active session")]
    NoActiveSession,

    /// The session does not exist
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    /// A node-level failure, including missing nodes
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The operation needs a pending-input node
    #[error("node {0} is not a pending input")]
    NotPendingInput(NodeId),

    /// The root node cannot be deleted
    #[error("the root node cannot be deleted")]
    RootDeletion,

    /// Blank messages are not sent
    #[error("message is empty")]
    EmptyMessage,

    /// The named model configuration does not exist
    #[error("model not found: {0}")]
    ModelNotFound(String),

    /// No model was named and there is no default
    #[error("no model selected and no default model configured")]
    NoModelConfigured,

    /// The node has no generation in flight
    #[error("node {0} has no generation in progress")]
    NotGenerating(NodeId),

    /// The generation could not be tracked
    #[error(transparent)]
    Stream(#[from] StreamRegisterError),

    /// The generation could not be started
    #[error(transparent)]
    Transport(#[from] TransportError),
}

// ============================================================================
// Settings and Outcomes
// ============================================================================

/// Coordinator tuning taken from configuration
#[derive(Clone, Debug)]
pub struct CoordinatorSettings {
    /// Layout metrics
    pub layout: LayoutConfig,
    /// Text appended to a stopped reply
    pub stop_marker: String,
    /// Maximum generations in flight at once
    pub max_concurrent_streams: usize,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            layout: LayoutConfig::default(),
            stop_marker: DEFAULT_STOP_MARKER.to_string(),
            max_concurrent_streams: StreamManagerConfig::default().max_concurrent_streams,
        }
    }
}

impl From<&ArborConfig> for CoordinatorSettings {
    fn from(config: &ArborConfig) -> Self {
        Self {
            layout: config.layout.clone(),
            stop_marker: config.stop_marker.clone(),
            max_concurrent_streams: config.max_concurrent_streams,
        }
    }
}

/// How a generation ended
#[derive(Clone, Debug, PartialEq)]
pub struct GenerationOutcome {
    /// Session owning the node
    pub session_id: SessionId,
    /// The composite node generated into
    pub node_id: NodeId,
    /// Terminal phase
    pub phase: GenerationPhase,
    /// Pending-input child created beneath the node
    pub child_id: Option<NodeId>,
    /// Failure cause for `Failed`
    pub error: Option<TransportError>,
}

// ============================================================================
// Coordinator
// ============================================================================

/// Application context for one user: sessions, selection and generations
pub struct SessionCoordinator<R, B> {
    /// Durable session storage
    repository: R,
    /// Generation transport
    backend: B,
    /// Model configurations
    models: Arc<dyn ModelRegistry>,
    /// Layout engine
    layout: LayoutEngine,
    /// Text appended to a stopped reply
    stop_marker: String,
    /// All loaded sessions
    sessions: HashMap<SessionId, Session>,
    /// The session surfaces are showing
    active: Option<SessionId>,
    /// Selection cursor within the active session
    selected: Option<NodeId>,
    /// Quote to attach to the next sent message
    pending_quote: Option<QuotedContext>,
    /// In-flight generations
    streams: StreamManager,
    /// Channel to UI surfaces
    tx: mpsc::UnboundedSender<CoordinatorEvent>,
}

impl<R, B> SessionCoordinator<R, B>
where
    R: SessionRepository,
    B: GenerationBackend,
{
    /// Create a coordinator; call [`Self::start`] before using it
    pub fn new(
        repository: R,
        backend: B,
        models: Arc<dyn ModelRegistry>,
        settings: CoordinatorSettings,
        tx: mpsc::UnboundedSender<CoordinatorEvent>,
    ) -> Self {
        Self {
            repository,
            backend,
            models,
            layout: LayoutEngine::new(settings.layout),
            stop_marker: settings.stop_marker,
            sessions: HashMap::new(),
            active: None,
            selected: None,
            pending_quote: None,
            streams: StreamManager::with_config(StreamManagerConfig {
                max_concurrent_streams: settings.max_concurrent_streams,
            }),
            tx,
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// The session repository
    #[must_use]
    pub fn repository(&self) -> &R {
        &self.repository
    }

    /// The generation backend
    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// The model registry
    #[must_use]
    pub fn models(&self) -> &Arc<dyn ModelRegistry> {
        &self.models
    }

    /// The layout engine
    #[must_use]
    pub fn layout_engine(&self) -> &LayoutEngine {
        &self.layout
    }

    /// The active session
    #[must_use]
    pub fn active_session(&self) -> Option<&Session> {
        self.active.as_ref().and_then(|id| self.sessions.get(id))
    }

    /// The active session's id
    #[must_use]
    pub fn active_session_id(&self) -> Option<&SessionId> {
        self.active.as_ref()
    }

    /// Any loaded session
    #[must_use]
    pub fn session(&self, id: &SessionId) -> Option<&Session> {
        self.sessions.get(id)
    }

    /// All loaded sessions, most recently updated first
    #[must_use]
    pub fn sessions(&self) -> Vec<&Session> {
        let mut sessions: Vec<&Session> = self.sessions.values().collect();
        sessions.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        sessions
    }

    /// The selected node in the active session
    #[must_use]
    pub fn selected_node(&self) -> Option<&NodeId> {
        self.selected.as_ref()
    }

    /// The quote waiting for the next sent message
    #[must_use]
    pub fn pending_quote(&self) -> Option<&QuotedContext> {
        self.pending_quote.as_ref()
    }

    /// Whether a generation is streaming into the node
    #[must_use]
    pub fn is_generating(&self, node_id: &NodeId) -> bool {
        self.streams.has_stream(node_id)
    }

    /// Current generation phase of a node (`Streaming` or `Idle`)
    #[must_use]
    pub fn generation_phase(&self, node_id: &NodeId) -> GenerationPhase {
        if self.streams.has_stream(node_id) {
            GenerationPhase::Streaming
        } else {
            GenerationPhase::Idle
        }
    }

    /// Number of generations in flight across all sessions
    #[must_use]
    pub fn active_generations(&self) -> usize {
        self.streams.active_count()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Load persisted sessions and activate the most recently updated one
    ///
    /// Creates a fresh session when nothing is stored (or storage is
    /// unreadable). Returns the active session id.
    pub async fn start(&mut self) -> Result<SessionId, CoordinatorError> {
        let loaded = match self.repository.list_sessions().await {
            Ok(sessions) => sessions,
            Err(e) => {
                warn!(error = %e, "Failed to load sessions, starting fresh");
                self.emit(CoordinatorEvent::warning(format!(
                    "Could not load saved sessions: {e}"
                )));
                Vec::new()
            }
        };

        for session in loaded {
            if session.is_well_formed() {
                self.sessions.insert(session.id.clone(), session);
            } else {
                warn!(session_id = %session.id, "Skipping malformed session");
            }
        }
        info!(count = self.sessions.len(), "Sessions loaded");

        let most_recent = self.sessions().first().map(|s| s.id.clone());
        match most_recent {
            Some(id) => {
                self.activate(&id)?;
                Ok(id)
            }
            None => self.create_session(DEFAULT_SESSION_TITLE).await,
        }
    }

    // ========================================================================
    // Session Operations
    // ========================================================================

    /// Make another session active
    pub async fn switch_session(&mut self, id: &SessionId) -> Result<(), CoordinatorError> {
        self.activate(id)
    }

    /// Create a session holding a single pending-input root and activate it
    pub async fn create_session(
        &mut self,
        title: impl Into<String>,
    ) -> Result<SessionId, CoordinatorError> {
        let mut title = title.into();
        if title.trim().is_empty() {
            title = DEFAULT_SESSION_TITLE.to_string();
        }
        let session = Session::new(title);
        let id = session.id.clone();

        if let Err(e) = self.repository.create_session(&session).await {
            self.persistence_failed(&id, &e);
        }
        info!(session_id = %id, title = %session.title, "Session created");
        self.emit(CoordinatorEvent::SessionCreated {
            session_id: id.clone(),
            title: session.title.clone(),
        });
        self.sessions.insert(id.clone(), session);
        self.activate(&id)?;
        Ok(id)
    }

    /// Delete a session, cancelling its generations
    ///
    /// If it was active, the most recently updated remaining session is
    /// activated, or a fresh one is created.
    pub async fn delete_session(&mut self, id: &SessionId) -> Result<(), CoordinatorError> {
        if !self.sessions.contains_key(id) {
            return Err(CoordinatorError::SessionNotFound(id.clone()));
        }

        for node_id in self.streams.session_stream_ids(id) {
            let _ = self.streams.cancel(&node_id);
        }
        self.sessions.remove(id);
        if let Err(e) = self.repository.delete_session(id).await {
            self.persistence_failed(id, &e);
        }
        info!(session_id = %id, "Session deleted");
        self.emit(CoordinatorEvent::SessionDeleted {
            session_id: id.clone(),
        });

        if self.active.as_ref() == Some(id) {
            self.active = None;
            self.selected = None;
            self.pending_quote = None;
            let next = self.sessions().first().map(|s| s.id.clone());
            match next {
                Some(next) => self.activate(&next)?,
                None => {
                    self.create_session(DEFAULT_SESSION_TITLE).await?;
                }
            }
        }
        Ok(())
    }

    /// Rename a session
    pub async fn rename_session(
        &mut self,
        id: &SessionId,
        title: impl Into<String>,
    ) -> Result<(), CoordinatorError> {
        let title = title.into();
        let session = self.session_mut(id)?;
        session.title = title.clone();
        session.touch();

        self.persist(id).await;
        self.emit(CoordinatorEvent::SessionRenamed {
            session_id: id.clone(),
            title,
        });
        Ok(())
    }

    /// Set or clear a session's default model
    pub async fn set_session_model(
        &mut self,
        id: &SessionId,
        model_id: Option<String>,
    ) -> Result<(), CoordinatorError> {
        if let Some(model_id) = &model_id {
            if self.models.get(model_id).is_none() {
                return Err(CoordinatorError::ModelNotFound(model_id.clone()));
            }
        }
        let session = self.session_mut(id)?;
        session.default_model = model_id;
        session.touch();

        self.persist(id).await;
        Ok(())
    }

    // ========================================================================
    // Selection and Quotes
    // ========================================================================

    /// Select a node in the active session
    pub fn select_node(&mut self, node_id: &NodeId) -> Result<(), CoordinatorError> {
        let session = self.active_session().ok_or(CoordinatorError::NoActiveSession)?;
        session.nodes.try_get(node_id)?;
        self.set_selection(Some(node_id.clone()));
        Ok(())
    }

    /// Stage a quote for the next sent message
    pub fn set_quote(&mut self, quote: QuotedContext) -> Result<(), CoordinatorError> {
        let session = self.active_session().ok_or(CoordinatorError::NoActiveSession)?;
        session.nodes.try_get(&quote.source_node)?;
        debug!(source = %quote.source_node, "Quote staged");
        self.pending_quote = Some(quote);
        Ok(())
    }

    /// Drop the staged quote
    pub fn clear_quote(&mut self) {
        self.pending_quote = None;
    }

    // ========================================================================
    // Node Operations
    // ========================================================================

    /// Recompute every position in the active session and persist them
    pub async fn rearrange(&mut self) -> Result<(), CoordinatorError> {
        let session_id = self.active_id()?;
        let session = self
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| CoordinatorError::SessionNotFound(session_id.clone()))?;
        let root = session.root_id.clone();
        let layout = self.layout.layout(&session.nodes, &root)?;
        layout.apply(&mut session.nodes)?;
        session.touch();
        debug!(session_id = %session_id, nodes = layout.len(), "Session rearranged");

        self.persist(&session_id).await;
        self.emit(CoordinatorEvent::LayoutUpdated { session_id });
        Ok(())
    }

    /// Move a node (user drag)
    pub async fn move_node(
        &mut self,
        node_id: &NodeId,
        position: Position,
    ) -> Result<(), CoordinatorError> {
        let session_id = self.active_id()?;
        let session = self.session_mut(&session_id)?;
        session
            .nodes
            .update(node_id, NodePatch::new().position(position))?;
        session.touch();

        self.persist(&session_id).await;
        self.emit_node_updated(&session_id, node_id);
        Ok(())
    }

    /// Edit a pending-input draft
    pub async fn update_draft(
        &mut self,
        node_id: &NodeId,
        text: impl Into<String>,
    ) -> Result<(), CoordinatorError> {
        let session_id = self.active_id()?;
        let session = self.session_mut(&session_id)?;
        if !session.nodes.try_get(node_id)?.is_pending_input() {
            return Err(CoordinatorError::NotPendingInput(node_id.clone()));
        }
        session.nodes.update(
            node_id,
            NodePatch::new().kind(NodeKind::PendingInput { draft: text.into() }),
        )?;
        session.touch();

        self.persist(&session_id).await;
        self.emit_node_updated(&session_id, node_id);
        Ok(())
    }

    /// Fork: add a pending-input child beneath any node and select it
    pub async fn branch_from(&mut self, node_id: &NodeId) -> Result<NodeId, CoordinatorError> {
        let session_id = self.active_id()?;
        let child_id = self.add_pending_child(&session_id, node_id)?;
        self.set_selection(Some(child_id.clone()));

        self.persist(&session_id).await;
        Ok(child_id)
    }

    /// Remove a node and its subtree, cancelling generations inside it
    ///
    /// Returns every removed id, subtree root first.
    pub async fn delete_node(&mut self, node_id: &NodeId) -> Result<Vec<NodeId>, CoordinatorError> {
        let session_id = self.active_id()?;
        let session = self.session_ref(&session_id)?;
        let node = session.nodes.try_get(node_id)?;
        if node.is_root() || *node_id == session.root_id {
            return Err(CoordinatorError::RootDeletion);
        }
        let parent = node.parent.clone();
        let subtree = session.nodes.descendants(node_id)?;

        for id in &subtree {
            if self.streams.cancel(id).is_some() {
                debug!(node_id = %id, "Generation cancelled by node deletion");
            }
        }

        let session = self.session_mut(&session_id)?;
        let removed = session.nodes.remove_subtree(node_id)?;
        session.touch();

        if self.selected.as_ref().is_some_and(|s| removed.contains(s)) {
            self.set_selection(parent);
        }
        if self
            .pending_quote
            .as_ref()
            .is_some_and(|q| removed.contains(&q.source_node))
        {
            self.pending_quote = None;
        }

        info!(session_id = %session_id, node_id = %node_id, removed = removed.len(), "Subtree deleted");
        self.persist(&session_id).await;
        self.emit(CoordinatorEvent::NodesRemoved {
            node_ids: removed.clone(),
        });
        Ok(removed)
    }

    // ========================================================================
    // Generation
    // ========================================================================

    /// Send a message from a pending-input node and start generating a reply
    ///
    /// The node becomes a composite turn holding `text` (with the staged
    /// quote attached and consumed) and no reply yet. The session is
    /// persisted, the history up to the node is resolved, and the reply
    /// streams in through [`Self::poll_streaming`] or
    /// [`Self::wait_for_generation`].
    ///
    /// Model precedence: `model_id`, then the session default, then the
    /// registry default.
    pub async fn send_message(
        &mut self,
        node_id: &NodeId,
        text: &str,
        model_id: Option<&str>,
    ) -> Result<(), CoordinatorError> {
        if text.trim().is_empty() {
            return Err(CoordinatorError::EmptyMessage);
        }
        let session_id = self.active_id()?;
        let session = self.session_ref(&session_id)?;
        if !session.nodes.try_get(node_id)?.is_pending_input() {
            return Err(CoordinatorError::NotPendingInput(node_id.clone()));
        }
        let model = self.resolve_model(model_id, session.default_model.as_deref())?;

        let quote = self.pending_quote.take();
        let session = self.session_mut(&session_id)?;
        session.nodes.update(
            node_id,
            NodePatch::new()
                .kind(NodeKind::composite(text))
                .model(Some(model.id.clone()))
                .quote(quote.clone()),
        )?;
        session.touch();

        let mut turns = resolve_path(&session.nodes, node_id)?;
        turns.push(Turn::user(user_content(text, quote.as_ref())));

        self.persist(&session_id).await;
        self.emit_node_updated(&session_id, node_id);

        let cancel = CancellationToken::new();
        let receiver = match self
            .backend
            .send_streaming(&turns, &model, cancel.clone())
            .await
        {
            Ok(receiver) => receiver,
            Err(e) => {
                error!(node_id = %node_id, model = %model.id, error = %e, "Generation failed to start");
                self.finish(&session_id, node_id, GenerationPhase::Failed, Some(e.clone()))
                    .await;
                return Err(e.into());
            }
        };

        let stream = GenerationStream::new(
            session_id.clone(),
            node_id.clone(),
            model.id.clone(),
            receiver,
            cancel.clone(),
        );
        if let Err(e) = self.streams.register(stream) {
            cancel.cancel();
            warn!(node_id = %node_id, error = %e, "Generation rejected");
            self.finish(
                &session_id,
                node_id,
                GenerationPhase::Failed,
                Some(TransportError::Stream(e.to_string())),
            )
            .await;
            return Err(e.into());
        }

        info!(
            session_id = %session_id,
            node_id = %node_id,
            model = %model.id,
            turns = turns.len(),
            "Generation started"
        );
        self.emit(CoordinatorEvent::GenerationStarted {
            node_id: node_id.clone(),
            model_id: model.id,
        });
        Ok(())
    }

    /// Merge whatever has arrived on every stream (non-blocking)
    ///
    /// Returns the generations that finished during this poll.
    pub async fn poll_streaming(&mut self) -> Vec<GenerationOutcome> {
        let mut outcomes = Vec::new();
        for event in self.streams.poll_all() {
            if let Some(outcome) = self.apply_generation_event(event).await {
                outcomes.push(outcome);
            }
        }
        outcomes
    }

    /// Merge one generation's chunks as they arrive until it finishes
    ///
    /// Dropping this future part-way can lose the final persist; surfaces
    /// that race it against user input should drive
    /// [`Self::next_generation_event`] and [`Self::apply_generation_event`]
    /// instead.
    pub async fn wait_for_generation(
        &mut self,
        node_id: &NodeId,
    ) -> Result<GenerationOutcome, CoordinatorError> {
        loop {
            let event = self.next_generation_event(node_id).await?;
            if let Some(outcome) = self.apply_generation_event(event).await {
                return Ok(outcome);
            }
        }
    }

    /// Wait for the next event of one generation without applying it
    ///
    /// Cancel safe: if the future is dropped before it resolves, no event is
    /// lost and the generation stays registered.
    pub async fn next_generation_event(
        &mut self,
        node_id: &NodeId,
    ) -> Result<StreamEvent, CoordinatorError> {
        self.streams
            .next_event(node_id)
            .await
            .ok_or_else(|| CoordinatorError::NotGenerating(node_id.clone()))
    }

    /// Merge a chunk, or settle and persist the node on a terminal event
    ///
    /// Returns the outcome when the event ended the generation.
    pub async fn apply_generation_event(
        &mut self,
        event: StreamEvent,
    ) -> Option<GenerationOutcome> {
        let StreamEvent {
            session_id,
            node_id,
            kind,
        } = event;
        match kind {
            StreamEventKind::Chunk { kind, text } => {
                self.merge_chunk(&session_id, &node_id, kind, text);
                None
            }
            StreamEventKind::Complete {
                chunk_count,
                duration,
            } => {
                info!(
                    node_id = %node_id,
                    chunks = chunk_count,
                    duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
                    "Generation completed"
                );
                Some(
                    self.finish(&session_id, &node_id, GenerationPhase::Completed, None)
                        .await,
                )
            }
            StreamEventKind::Error { error } => {
                error!(node_id = %node_id, error = %error, "Generation failed");
                Some(
                    self.finish(&session_id, &node_id, GenerationPhase::Failed, Some(error))
                        .await,
                )
            }
        }
    }

    /// Stop a generation, keeping what it produced plus the stop marker
    pub async fn cancel_generation(
        &mut self,
        node_id: &NodeId,
    ) -> Result<GenerationOutcome, CoordinatorError> {
        let stream = self
            .streams
            .get(node_id)
            .ok_or_else(|| CoordinatorError::NotGenerating(node_id.clone()))?;
        let session_id = stream.session_id().clone();
        let model_id = stream.model_id().to_string();
        let delivered = self.streams.cancel(node_id).unwrap_or_default();

        for event in delivered {
            if let StreamEventKind::Chunk { kind, text } = event.kind {
                self.merge_chunk(&session_id, node_id, kind, text);
            }
        }
        info!(node_id = %node_id, model = %model_id, "Generation cancelled");
        Ok(self
            .finish(&session_id, node_id, GenerationPhase::Cancelled, None)
            .await)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// In-memory merge of one chunk; never persists
    fn merge_chunk(&mut self, session_id: &SessionId, node_id: &NodeId, kind: ChunkKind, text: String) {
        let Some(session) = self.sessions.get_mut(session_id) else {
            return;
        };
        if let Err(e) = reconciler::apply_local(session, node_id, kind, &text) {
            debug!(node_id = %node_id, error = %e, "Dropping chunk for a removed node");
            return;
        }
        self.emit(CoordinatorEvent::Chunk {
            node_id: node_id.clone(),
            kind,
            text,
        });
    }

    /// Settle a node, add the follow-up child, persist once, notify
    async fn finish(
        &mut self,
        session_id: &SessionId,
        node_id: &NodeId,
        phase: GenerationPhase,
        error: Option<TransportError>,
    ) -> GenerationOutcome {
        let mut outcome = GenerationOutcome {
            session_id: session_id.clone(),
            node_id: node_id.clone(),
            phase,
            child_id: None,
            error,
        };

        let Some(session) = self.sessions.get_mut(session_id) else {
            return outcome;
        };
        let spawn_child = match reconciler::settle(session, node_id, phase, &self.stop_marker) {
            Ok(spawn) => spawn,
            Err(e) => {
                debug!(node_id = %node_id, error = %e, "Generation target vanished");
                return outcome;
            }
        };

        if spawn_child {
            match self.add_pending_child(session_id, node_id) {
                Ok(child) => {
                    if self.active.as_ref() == Some(session_id)
                        && self.selected.as_ref() == Some(node_id)
                    {
                        self.set_selection(Some(child.clone()));
                    }
                    outcome.child_id = Some(child);
                }
                Err(e) => warn!(node_id = %node_id, error = %e, "Could not add follow-up input"),
            }
        }

        self.persist(session_id).await;
        self.emit_node_updated(session_id, node_id);
        match &outcome.error {
            Some(error) => self.emit(CoordinatorEvent::GenerationFailed {
                node_id: node_id.clone(),
                error: error.to_string(),
            }),
            None => self.emit(CoordinatorEvent::GenerationFinished {
                node_id: node_id.clone(),
                phase,
                child_id: outcome.child_id.clone(),
            }),
        }
        outcome
    }

    /// Insert a pending-input child below `parent`, to the right of its siblings
    fn add_pending_child(
        &mut self,
        session_id: &SessionId,
        parent: &NodeId,
    ) -> Result<NodeId, CoordinatorError> {
        let config = self.layout.config();
        let session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| CoordinatorError::SessionNotFound(session_id.clone()))?;
        let parent_node = session.nodes.try_get(parent)?;
        let siblings = parent_node.children.len() as f64;
        let position = Position::new(
            parent_node.position.x + siblings * (config.node_width + config.horizontal_spacing),
            parent_node.position.y
                + self.layout.estimate_height(parent_node)
                + config.vertical_spacing,
        );

        let mut child = Node::pending_input();
        child.position = position;
        let child_id = session.nodes.insert_child(parent, child)?;
        session.touch();

        if let Some(node) = session.node(&child_id).cloned() {
            self.emit(CoordinatorEvent::NodeAdded { node });
        }
        Ok(child_id)
    }

    fn resolve_model(
        &self,
        explicit: Option<&str>,
        session_default: Option<&str>,
    ) -> Result<ModelConfig, CoordinatorError> {
        match explicit.or(session_default) {
            Some(id) => self
                .models
                .get(id)
                .ok_or_else(|| CoordinatorError::ModelNotFound(id.to_string())),
            None => self
                .models
                .default_model()
                .ok_or(CoordinatorError::NoModelConfigured),
        }
    }

    fn activate(&mut self, id: &SessionId) -> Result<(), CoordinatorError> {
        let session = self
            .sessions
            .get(id)
            .ok_or_else(|| CoordinatorError::SessionNotFound(id.clone()))?;
        let title = session.title.clone();
        let selection = default_selection(session);

        self.active = Some(id.clone());
        self.pending_quote = None;
        info!(session_id = %id, "Session activated");
        self.emit(CoordinatorEvent::SessionActivated {
            session_id: id.clone(),
            title,
        });
        self.set_selection(Some(selection));
        Ok(())
    }

    fn set_selection(&mut self, node_id: Option<NodeId>) {
        if self.selected != node_id {
            self.selected = node_id.clone();
            self.emit(CoordinatorEvent::NodeSelected { node_id });
        }
    }

    fn active_id(&self) -> Result<SessionId, CoordinatorError> {
        self.active.clone().ok_or(CoordinatorError::NoActiveSession)
    }

    fn session_ref(&self, id: &SessionId) -> Result<&Session, CoordinatorError> {
        self.sessions
            .get(id)
            .ok_or_else(|| CoordinatorError::SessionNotFound(id.clone()))
    }

    fn session_mut(&mut self, id: &SessionId) -> Result<&mut Session, CoordinatorError> {
        self.sessions
            .get_mut(id)
            .ok_or_else(|| CoordinatorError::SessionNotFound(id.clone()))
    }

    /// Save the whole session; failures keep the in-memory state
    async fn persist(&self, id: &SessionId) {
        let Some(session) = self.sessions.get(id) else {
            return;
        };
        if let Err(e) = self.repository.replace_session(session).await {
            self.persistence_failed(id, &e);
        }
    }

    fn persistence_failed(&self, id: &SessionId, e: &anyhow::Error) {
        warn!(session_id = %id, error = %e, "Failed to persist session");
        self.emit(CoordinatorEvent::warning(format!(
            "Changes to this conversation could not be saved: {e}"
        )));
    }

    fn emit_node_updated(&self, session_id: &SessionId, node_id: &NodeId) {
        if let Some(node) = self.sessions.get(session_id).and_then(|s| s.node(node_id)) {
            self.emit(CoordinatorEvent::NodeUpdated { node: node.clone() });
        }
    }

    fn emit(&self, event: CoordinatorEvent) {
        if let Err(e) = self.tx.send(event) {
            warn!("Failed to send event to surface: {}", e);
        }
    }
}

/// Newest pending-input node, or the root when there is none
fn default_selection(session: &Session) -> NodeId {
    session
        .pending_inputs()
        .into_iter()
        .max_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        })
        .map_or_else(|| session.root_id.clone(), |n| n.id.clone())
}

// ============================================================================
// Tests
// ============================================================================
