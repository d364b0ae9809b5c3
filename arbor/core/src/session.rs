//! Session Management
//!
//! A session is one complete conversation tree plus metadata. It is the unit
//! of persistence: every mutation is saved by replacing the whole session.
//!
//! # Design Philosophy
//!
//! Sessions start with a single pending-input root so a surface always has
//! somewhere to type. The tree then grows by converting pending-input nodes
//! into composite turns and hanging fresh pending-input children beneath them.

use serde::{Deserialize, Serialize};

use crate::ids::{now_ms, NodeId, SessionId};
use crate::node::Node;
use crate::store::{NodeStore, StoreError};

/// Title given to sessions created without one
pub const DEFAULT_SESSION_TITLE: &str = "New conversation";

/// A conversation session
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Unique session ID
    pub id: SessionId,
    /// Display title
    pub title: String,
    /// Conversation tree
    pub nodes: NodeStore,
    /// Root node of the tree
    pub root_id: NodeId,
    /// When the session was created (Unix timestamp ms)
    pub created_at: u64,
    /// When the session was last changed (Unix timestamp ms)
    pub updated_at: u64,
    /// Model used when a send does not name one
    #[serde(default)]
    pub default_model: Option<String>,
}

impl Session {
    /// Create a new session holding a single pending-input root
    #[must_use]
    pub fn new(title: impl Into<String>) -> Self {
        Self::with_id(SessionId::new(), title)
    }

    /// Create a session with a specific ID
    #[must_use]
    pub fn with_id(id: SessionId, title: impl Into<String>) -> Self {
        let mut nodes = NodeStore::new();
        let root = Node::pending_input();
        let root_id = root.id.clone();
        // An empty store always accepts a root
        let _ = nodes.insert_root(root);

        let now = now_ms();
        Self {
            id,
            title: title.into(),
            nodes,
            root_id,
            created_at: now,
            updated_at: now,
            default_model: None,
        }
    }

    /// Get the root node
    pub fn root(&self) -> Result<&Node, StoreError> {
        self.nodes.try_get(&self.root_id)
    }

    /// Get a node
    #[must_use]
    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Number of nodes in the tree
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Update last-changed timestamp
    pub fn touch(&mut self) {
        self.updated_at = now_ms();
    }

    /// Pending-input leaves, in id order
    #[must_use]
    pub fn pending_inputs(&self) -> Vec<&Node> {
        self.nodes.iter().filter(|n| n.is_pending_input()).collect()
    }

    /// Check structural invariants: the recorded root exists and has no
    /// parent, links are symmetric, and every node is reachable from the root
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        let Ok(root) = self.root() else {
            return false;
        };
        if root.parent.is_some() || !self.nodes.links_consistent() {
            return false;
        }
        self.nodes
            .descendants(&self.root_id)
            .is_ok_and(|reachable| reachable.len() == self.nodes.len())
    }
}
