//! Node Store
//!
//! Arena of conversation nodes for one session, keyed by [`NodeId`].
//!
//! # Invariants
//!
//! - A node's id appears in its parent's `children` iff its `parent` is set
//!   to that node. Only [`NodeStore::insert_child`] and
//!   [`NodeStore::remove_subtree`] change links, and both update the two
//!   directions together.
//! - Nodes are never re-parented.
//! - Operations on absent ids return [`StoreError::NodeNotFound`] instead of
//!   silently doing nothing.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::NodeId;
use crate::node::{Node, NodePatch};

/// Errors returned by node store operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The target node does not exist
    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    /// A node with this id already exists
    #[error("duplicate node id: {0}")]
    DuplicateNode(NodeId),

    /// A root was inserted into a store that already has one
    #[error("store already has a root node")]
    RootExists,

    /// Parent links are inconsistent (dangling parent or a cycle)
    #[error("broken parent link at node {0}")]
    BrokenLink(NodeId),
}

/// Arena of nodes
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeStore {
    nodes: BTreeMap<NodeId, Node>,
}

impl NodeStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nodes
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether a node exists
    #[must_use]
    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Get a node
    #[must_use]
    pub fn get(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Get a node or a not-found error
    pub fn try_get(&self, id: &NodeId) -> Result<&Node, StoreError> {
        self.nodes
            .get(id)
            .ok_or_else(|| StoreError::NodeNotFound(id.clone()))
    }

    /// Iterate over all nodes in id order
    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// The root node id, if any
    #[must_use]
    pub fn root_id(&self) -> Option<&NodeId> {
        self.nodes.values().find(|n| n.parent.is_none()).map(|n| &n.id)
    }

    /// Child ids of a node
    pub fn children(&self, id: &NodeId) -> Result<&[NodeId], StoreError> {
        Ok(&self.try_get(id)?.children)
    }

    /// Insert the root node
    pub fn insert_root(&mut self, mut node: Node) -> Result<NodeId, StoreError> {
        if self.root_id().is_some() {
            return Err(StoreError::RootExists);
        }
        if self.nodes.contains_key(&node.id) {
            return Err(StoreError::DuplicateNode(node.id));
        }

        node.parent = None;
        node.children.clear();
        let id = node.id.clone();
        self.nodes.insert(id.clone(), node);
        tracing::debug!(node_id = %id, "Inserted root node");
        Ok(id)
    }

    /// Insert a node as the last child of `parent`
    ///
    /// The node's parent link and the parent's child list are set together.
    pub fn insert_child(&mut self, parent: &NodeId, mut node: Node) -> Result<NodeId, StoreError> {
        if self.nodes.contains_key(&node.id) {
            return Err(StoreError::DuplicateNode(node.id));
        }
        let parent_node = self
            .nodes
            .get_mut(parent)
            .ok_or_else(|| StoreError::NodeNotFound(parent.clone()))?;

        let id = node.id.clone();
        parent_node.children.push(id.clone());
        parent_node.touch();

        node.parent = Some(parent.clone());
        node.children.clear();
        self.nodes.insert(id.clone(), node);

        tracing::debug!(node_id = %id, parent_id = %parent, "Inserted child node");
        Ok(id)
    }

    /// Merge a partial update into a node
    pub fn update(&mut self, id: &NodeId, patch: NodePatch) -> Result<&Node, StoreError> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| StoreError::NodeNotFound(id.clone()))?;
        patch.apply(node);
        Ok(node)
    }

    /// Mutate a node in place
    ///
    /// The closure must not touch `parent` or `children`; link changes go
    /// through insert/remove.
    pub fn modify<T>(&mut self, id: &NodeId, f: impl FnOnce(&mut Node) -> T) -> Result<T, StoreError> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| StoreError::NodeNotFound(id.clone()))?;
        let out = f(node);
        node.touch();
        Ok(out)
    }

    /// All ids in the subtree rooted at `id` (pre-order, `id` first)
    pub fn descendants(&self, id: &NodeId) -> Result<Vec<NodeId>, StoreError> {
        self.try_get(id)?;

        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut stack = vec![id.clone()];
        while let Some(current) = stack.pop() {
            if !seen.insert(current.clone()) {
                return Err(StoreError::BrokenLink(current));
            }
            if let Some(node) = self.nodes.get(&current) {
                stack.extend(node.children.iter().rev().cloned());
            }
            out.push(current);
        }
        Ok(out)
    }

    /// Remove a node and every descendant, detaching it from its parent
    ///
    /// Returns the removed ids in pre-order.
    pub fn remove_subtree(&mut self, id: &NodeId) -> Result<Vec<NodeId>, StoreError> {
        let removed = self.descendants(id)?;

        if let Some(parent_id) = self.nodes.get(id).and_then(|n| n.parent.clone()) {
            if let Some(parent) = self.nodes.get_mut(&parent_id) {
                parent.children.retain(|c| c != id);
                parent.touch();
            }
        }

        for node_id in &removed {
            self.nodes.remove(node_id);
        }

        tracing::debug!(node_id = %id, removed = removed.len(), "Removed subtree");
        Ok(removed)
    }

    /// Ancestor chain from `id` up to the root, `id` first
    pub fn ancestry(&self, id: &NodeId) -> Result<Vec<&Node>, StoreError> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut current = Some(self.try_get(id)?);

        while let Some(node) = current {
            if !seen.insert(&node.id) {
                return Err(StoreError::BrokenLink(node.id.clone()));
            }
            chain.push(node);
            current = match &node.parent {
                Some(parent) => Some(
                    self.nodes
                        .get(parent)
                        .ok_or_else(|| StoreError::BrokenLink(node.id.clone()))?,
                ),
                None => None,
            };
        }
        Ok(chain)
    }

    /// Check the parent/child symmetry invariant over the whole store
    #[must_use]
    pub fn links_consistent(&self) -> bool {
        let parents_ok = self.nodes.values().all(|node| match &node.parent {
            Some(parent) => self
                .nodes
                .get(parent)
                .is_some_and(|p| p.children.iter().filter(|c| *c == &node.id).count() == 1),
            None => true,
        });
        let children_ok = self.nodes.values().all(|node| {
            node.children.iter().all(|child| {
                self.nodes
                    .get(child)
                    .is_some_and(|c| c.parent.as_ref() == Some(&node.id))
            })
        });
        parents_ok && children_ok
    }
}
