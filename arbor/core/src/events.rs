//! Coordinator Events
//!
//! Events sent from the session coordinator to UI surfaces. A surface renders
//! what these describe and calls back into the coordinator to change state.
//!
//! # Design Philosophy
//!
//! The coordinator owns the session tree; surfaces are renderers. Events
//! carry ids plus the changed node where that saves a lookup, so a surface
//! can keep a mirror of the tree without reading coordinator internals.

use serde::{Deserialize, Serialize};

use crate::backend::ChunkKind;
use crate::ids::{NodeId, SessionId};
use crate::node::Node;
use crate::streaming::GenerationPhase;

/// Severity of a user-facing notification
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyLevel {
    /// Informational
    Info,
    /// Something degraded but the app keeps working
    Warning,
    /// An operation failed
    Error,
}

/// Events from the coordinator to UI surfaces
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinatorEvent {
    // ============================================
    // Session Lifecycle
    // ============================================
    /// A session became the active one
    SessionActivated {
        /// The session
        session_id: SessionId,
        /// Its title
        title: String,
    },

    /// A session was created
    SessionCreated {
        /// The session
        session_id: SessionId,
        /// Its title
        title: String,
    },

    /// A session was deleted
    SessionDeleted {
        /// The session
        session_id: SessionId,
    },

    /// A session was renamed
    SessionRenamed {
        /// The session
        session_id: SessionId,
        /// New title
        title: String,
    },

    // ============================================
    // Tree Changes
    // ============================================
    /// The selection changed
    NodeSelected {
        /// Selected node, if any
        node_id: Option<NodeId>,
    },

    /// A node's content, model, quote or position changed
    NodeUpdated {
        /// The node after the change
        node: Node,
    },

    /// A node was added to the tree
    NodeAdded {
        /// The new node
        node: Node,
    },

    /// A subtree was removed
    NodesRemoved {
        /// Every removed id, subtree root first
        node_ids: Vec<NodeId>,
    },

    /// Positions were recomputed for the whole tree
    LayoutUpdated {
        /// The session laid out
        session_id: SessionId,
    },

    // ============================================
    // Generation
    // ============================================
    /// A generation started streaming into a node
    GenerationStarted {
        /// Target node
        node_id: NodeId,
        /// Model configuration id
        model_id: String,
    },

    /// A chunk was merged into a node
    Chunk {
        /// Target node
        node_id: NodeId,
        /// Reply or reasoning
        kind: ChunkKind,
        /// The chunk text
        text: String,
    },

    /// A generation ended as completed or cancelled
    GenerationFinished {
        /// Target node
        node_id: NodeId,
        /// Terminal phase
        phase: GenerationPhase,
        /// The pending-input child created beneath the node
        child_id: Option<NodeId>,
    },

    /// A generation failed
    GenerationFailed {
        /// Target node
        node_id: NodeId,
        /// Error description
        error: String,
    },

    // ============================================
    // Notifications
    // ============================================
    /// A message for the user
    Notify {
        /// Severity
        level: NotifyLevel,
        /// Text
        message: String,
    },
}

impl CoordinatorEvent {
    /// Warning notification
    pub fn warning(message: impl Into<String>) -> Self {
        Self::Notify {
            level: NotifyLevel::Warning,
            message: message.into(),
        }
    }

    /// Error notification
    pub fn error(message: impl Into<String>) -> Self {
        Self::Notify {
            level: NotifyLevel::Error,
            message: message.into(),
        }
    }
}
