//! Path Resolution
//!
//! Turns a position in the tree into the linear history sent as context for
//! the next generation request.

use serde::{Deserialize, Serialize};

use crate::ids::NodeId;
use crate::node::{MessageRole, Node, NodeKind, QuotedContext};
use crate::store::{NodeStore, StoreError};

/// One entry of a conversation history
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    /// Who said it
    pub role: MessageRole,
    /// What was said
    pub content: String,
}

impl Turn {
    /// Create a turn
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    /// User turn
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    /// Assistant turn
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }
}

/// Resolve the history from the root down to `target`, inclusive
///
/// Composite turns expand to a user entry followed by an assistant entry, but
/// only once the assistant reply is non-empty. System, pending-input and
/// loading nodes contribute nothing. Never mutates the store.
pub fn resolve_path(store: &NodeStore, target: &NodeId) -> Result<Vec<Turn>, StoreError> {
    let chain = store.ancestry(target)?;

    let mut turns = Vec::with_capacity(chain.len() * 2);
    for node in chain.into_iter().rev() {
        push_turns(node, &mut turns);
    }
    Ok(turns)
}

fn push_turns(node: &Node, turns: &mut Vec<Turn>) {
    match &node.kind {
        NodeKind::User { content } => turns.push(Turn::user(content.clone())),
        NodeKind::Assistant { content } => turns.push(Turn::assistant(content.clone())),
        NodeKind::Composite {
            user_message,
            assistant_message: Some(reply),
            ..
        } if !reply.is_empty() => {
            turns.push(Turn::user(user_content(user_message, node.quote.as_ref())));
            turns.push(Turn::assistant(reply.clone()));
        }
        NodeKind::Composite { .. }
        | NodeKind::System { .. }
        | NodeKind::PendingInput { .. }
        | NodeKind::Loading => {}
    }
}

/// Render a user message with an optional quoted excerpt prepended
///
/// The excerpt becomes a Markdown block quote, separated from the message by
/// a blank line.
#[must_use]
pub fn user_content(message: &str, quote: Option<&QuotedContext>) -> String {
    match quote {
        Some(quote) if !quote.text.trim().is_empty() => {
            let quoted: Vec<String> = quote.text.lines().map(|l| format!("> {l}")).collect();
            format!("{}\n\n{message}", quoted.join("\n"))
        }
        _ => message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_resolve_chain_with_composite() {
        let mut store = NodeStore::new();
        let root = store
            .insert_root(Node::new(NodeKind::System {
                content: "You are terse".to_string(),
            }))
            .unwrap();
        let a = store
            .insert_child(
                &root,
                Node::new(NodeKind::User {
                    content: "A.content".to_string(),
                }),
            )
            .unwrap();
        let b = store
            .insert_child(
                &a,
                Node::new(NodeKind::Composite {
                    user_message: "Q".to_string(),
                    assistant_message: Some("R".to_string()),
                    thinking: Some("ignored".to_string()),
                }),
            )
            .unwrap();
        let c = store.insert_child(&b, Node::pending_input()).unwrap();

        let before = store.clone();
        let turns = resolve_path(&store, &c).unwrap();

        assert_eq!(
            turns,
            vec![Turn::user("A.content"), Turn::user("Q"), Turn::assistant("R")]
        );
        // Re-entrant and side-effect-free
        assert_eq!(resolve_path(&store, &c).unwrap(), turns);
        assert_eq!(store, before);
    }

    #[test]
    fn test_composite_without_reply_is_elided() {
        let mut store = NodeStore::new();
        let root = store
            .insert_root(Node::new(NodeKind::composite("pending question")))
            .unwrap();
        assert!(resolve_path(&store, &root).unwrap().is_empty());

        store
            .modify(&root, |n| {
                n.kind = NodeKind::Composite {
                    user_message: "pending question".to_string(),
                    assistant_message: Some(String::new()),
                    thinking: None,
                };
            })
            .unwrap();
        assert!(resolve_path(&store, &root).unwrap().is_empty());
    }

    #[test]
    fn test_assistant_and_loading_nodes() {
        let mut store = NodeStore::new();
        let root = store
            .insert_root(Node::new(NodeKind::Assistant {
                content: "Hello!".to_string(),
            }))
            .unwrap();
        let loading = store.insert_child(&root, Node::new(NodeKind::Loading)).unwrap();

        assert_eq!(
            resolve_path(&store, &loading).unwrap(),
            vec![Turn::assistant("Hello!")]
        );
    }

    #[test]
    fn test_quoted_context_prefixes_user_entry() {
        let mut store = NodeStore::new();
        let mut node = Node::new(NodeKind::Composite {
            user_message: "Why?".to_string(),
            assistant_message: Some("Because.".to_string()),
            thinking: None,
        });
        node.quote = Some(QuotedContext {
            text: "line one\nline two".to_string(),
            source_node: NodeId::from("src"),
            source_role: MessageRole::Assistant,
            source_text: "line one\nline two\nline three".to_string(),
        });
        let id = store.insert_root(node).unwrap();

        let turns = resolve_path(&store, &id).unwrap();
        assert_eq!(turns[0].content, "> line one\n> line two\n\nWhy?");
        assert_eq!(turns[1], Turn::assistant("Because."));
    }

    #[test]
    fn test_missing_target() {
        let store = NodeStore::new();
        let missing = NodeId::from("missing");
        assert_eq!(
            resolve_path(&store, &missing),
            Err(StoreError::NodeNotFound(missing))
        );
    }
}
