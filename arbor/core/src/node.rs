//! Conversation Nodes
//!
//! A node is one unit of the conversation tree: a turn, a pending input slot,
//! or a system marker. Links between nodes are plain ids resolved through the
//! owning [`NodeStore`](crate::store::NodeStore), never owning pointers.

use serde::{Deserialize, Serialize};

use crate::ids::{now_ms, NodeId};

/// Who authored a turn
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// User input
    User,
    /// AI assistant
    Assistant,
    /// System message
    System,
}

impl MessageRole {
    /// Wire name used by every provider dialect
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

/// 2-D position of a node's top-left corner
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Horizontal coordinate
    pub x: f64,
    /// Vertical coordinate
    pub y: f64,
}

impl Position {
    /// Create a position
    #[must_use]
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// An excerpt of a prior message attached to the next outgoing turn
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotedContext {
    /// The selected excerpt
    pub text: String,
    /// Node the excerpt was taken from
    pub source_node: NodeId,
    /// Role of the quoted message
    pub source_role: MessageRole,
    /// Full text of the quoted message
    pub source_text: String,
}

/// Discriminated node payload
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    /// Empty slot awaiting the next user message
    PendingInput {
        /// Unsent draft text
        #[serde(default)]
        draft: String,
    },
    /// Standalone user turn
    User {
        /// Message content
        content: String,
    },
    /// Standalone assistant turn
    Assistant {
        /// Message content
        content: String,
    },
    /// System marker, never sent as context
    System {
        /// Message content
        content: String,
    },
    /// Placeholder shown while a node is being materialized
    Loading,
    /// A user message and its assistant reply held as one unit
    Composite {
        /// The user's message
        user_message: String,
        /// The assistant reply, absent until generation produces content
        #[serde(default)]
        assistant_message: Option<String>,
        /// Reasoning side-channel text
        #[serde(default)]
        thinking: Option<String>,
    },
}

impl NodeKind {
    /// Fresh pending-input payload
    #[must_use]
    pub fn pending() -> Self {
        Self::PendingInput {
            draft: String::new(),
        }
    }

    /// Composite payload for a just-sent user message
    #[must_use]
    pub fn composite(user_message: impl Into<String>) -> Self {
        Self::Composite {
            user_message: user_message.into(),
            assistant_message: None,
            thinking: None,
        }
    }

    /// Short label for logs
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::PendingInput { .. } => "pending_input",
            Self::User { .. } => "user",
            Self::Assistant { .. } => "assistant",
            Self::System { .. } => "system",
            Self::Loading => "loading",
            Self::Composite { .. } => "composite",
        }
    }
}

/// A node in the conversation tree
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique node ID
    pub id: NodeId,
    /// Payload
    pub kind: NodeKind,
    /// Parent node (None only for the session root)
    pub parent: Option<NodeId>,
    /// Ordered child ids
    #[serde(default)]
    pub children: Vec<NodeId>,
    /// Model that produced (or will produce) this node's reply
    #[serde(default)]
    pub model: Option<String>,
    /// When the node was created (Unix timestamp ms)
    pub created_at: u64,
    /// When the node was last changed (Unix timestamp ms)
    pub updated_at: u64,
    /// Canvas position
    #[serde(default)]
    pub position: Position,
    /// Quoted excerpt attached to this node's user message
    #[serde(default)]
    pub quote: Option<QuotedContext>,
}

impl Node {
    /// Create a detached node with the given payload
    #[must_use]
    pub fn new(kind: NodeKind) -> Self {
        let now = now_ms();
        Self {
            id: NodeId::new(),
            kind,
            parent: None,
            children: Vec::new(),
            model: None,
            created_at: now,
            updated_at: now,
            position: Position::default(),
            quote: None,
        }
    }

    /// Create a detached pending-input node
    #[must_use]
    pub fn pending_input() -> Self {
        Self::new(NodeKind::pending())
    }

    /// Set the node ID
    #[must_use]
    pub fn with_id(mut self, id: NodeId) -> Self {
        self.id = id;
        self
    }

    /// Set the model
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Whether this is a pending-input slot
    #[must_use]
    pub fn is_pending_input(&self) -> bool {
        matches!(self.kind, NodeKind::PendingInput { .. })
    }

    /// Whether this node is the session root
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Text shown for this node, used for size estimation
    #[must_use]
    pub fn display_text(&self) -> String {
        match &self.kind {
            NodeKind::PendingInput { draft } => draft.clone(),
            NodeKind::User { content }
            | NodeKind::Assistant { content }
            | NodeKind::System { content } => content.clone(),
            NodeKind::Loading => String::new(),
            NodeKind::Composite {
                user_message,
                assistant_message,
                ..
            } => match assistant_message {
                Some(reply) if !reply.is_empty() => format!("{user_message}\n{reply}"),
                _ => user_message.clone(),
            },
        }
    }

    /// Update the modification timestamp
    pub fn touch(&mut self) {
        self.updated_at = now_ms();
    }
}

/// Partial-field update applied by [`NodeStore::update`](crate::store::NodeStore::update)
///
/// `None` leaves a field untouched. Link fields (parent, children) are not
/// patchable; they only change through store insert/remove.
#[derive(Clone, Debug, Default)]
pub struct NodePatch {
    /// Replace the payload
    pub kind: Option<NodeKind>,
    /// Replace the model (inner None clears it)
    pub model: Option<Option<String>>,
    /// Replace the position
    pub position: Option<Position>,
    /// Replace the quote (inner None clears it)
    pub quote: Option<Option<QuotedContext>>,
}

impl NodePatch {
    /// Empty patch
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the payload
    #[must_use]
    pub fn kind(mut self, kind: NodeKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Set the model
    #[must_use]
    pub fn model(mut self, model: Option<String>) -> Self {
        self.model = Some(model);
        self
    }

    /// Set the position
    #[must_use]
    pub fn position(mut self, position: Position) -> Self {
        self.position = Some(position);
        self
    }

    /// Set the quote
    #[must_use]
    pub fn quote(mut self, quote: Option<QuotedContext>) -> Self {
        self.quote = Some(quote);
        self
    }

    /// Merge this patch into a node
    pub fn apply(self, node: &mut Node) {
        if let Some(kind) = self.kind {
            node.kind = kind;
        }
        if let Some(model) = self.model {
            node.model = model;
        }
        if let Some(position) = self.position {
            node.position = position;
        }
        if let Some(quote) = self.quote {
            node.quote = quote;
        }
        node.touch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_input_defaults() {
        let node = Node::pending_input();
        assert!(node.is_pending_input());
        assert!(node.is_root());
        assert!(node.children.is_empty());
        assert_eq!(node.display_text(), "");
    }

    #[test]
    fn test_composite_display_text() {
        let mut node = Node::new(NodeKind::composite("Question"));
        assert_eq!(node.display_text(), "Question");

        node.kind = NodeKind::Composite {
            user_message: "Question".to_string(),
            assistant_message: Some("Answer".to_string()),
            thinking: Some("hmm".to_string()),
        };
        assert_eq!(node.display_text(), "Question\nAnswer");
    }

    #[test]
    fn test_patch_merges_only_set_fields() {
        let mut node = Node::pending_input().with_model("m1");
        NodePatch::new()
            .position(Position::new(10.0, 20.0))
            .apply(&mut node);

        assert_eq!(node.position, Position::new(10.0, 20.0));
        assert_eq!(node.model.as_deref(), Some("m1"));
        assert!(node.is_pending_input());

        NodePatch::new().model(None).apply(&mut node);
        assert!(node.model.is_none());
    }

    #[test]
    fn test_kind_serde_tagging() {
        let kind = NodeKind::composite("Hi");
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["type"], "composite");
        assert_eq!(json["user_message"], "Hi");

        let back: NodeKind = serde_json::from_value(serde_json::json!({
            "type": "pending_input"
        }))
        .unwrap();
        assert_eq!(back, NodeKind::pending());
    }
}
