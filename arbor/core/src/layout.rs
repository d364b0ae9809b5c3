//! Tree Layout
//!
//! Computes collision-free canvas positions for a session tree whose node
//! heights depend on their content.
//!
//! # Algorithm
//!
//! A simplified Reingold–Tilford pass with no contour merging:
//!
//! 1. **Measure** (post-order): a leaf's extent is the node width; an inner
//!    node's extent is the sum of its children's extents plus spacing
//!    between them, never narrower than the node itself.
//! 2. **Place** (pre-order): each node is centered within its extent, its
//!    children are packed left-to-right in a span centered under it, one
//!    row below the parent's bottom edge plus vertical spacing.
//!
//! Sibling subtrees occupy disjoint horizontal intervals by construction, and
//! the output depends only on content and child order, so re-running the
//! layout on an unchanged tree yields identical positions.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::ids::NodeId;
use crate::node::{Node, NodePatch, Position};
use crate::store::{NodeStore, StoreError};

/// Layout metrics
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    /// Width of every node box
    pub node_width: f64,
    /// Height of one rendered text line
    pub line_height: f64,
    /// Characters that fit on one line before soft wrapping
    pub chars_per_line: usize,
    /// Extra height for heading lines (`#` prefixed)
    pub heading_extra: f64,
    /// Height of one line inside a fenced code block
    pub code_line_height: f64,
    /// Padding added once per fenced code block
    pub code_block_padding: f64,
    /// Fixed height of node chrome (header, borders, controls)
    pub chrome_height: f64,
    /// Gap between sibling subtrees
    pub horizontal_spacing: f64,
    /// Gap between a parent's bottom edge and its children
    pub vertical_spacing: f64,
    /// Where the root is placed
    pub origin: Position,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            node_width: 320.0,
            line_height: 22.0,
            chars_per_line: 42,
            heading_extra: 10.0,
            code_line_height: 18.0,
            code_block_padding: 16.0,
            chrome_height: 56.0,
            horizontal_spacing: 48.0,
            vertical_spacing: 64.0,
            origin: Position::default(),
        }
    }
}

/// A placed node's bounding box
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeBox {
    /// Top-left corner
    pub position: Position,
    /// Box width
    pub width: f64,
    /// Estimated rendered height
    pub height: f64,
}

impl NodeBox {
    /// Right edge
    #[must_use]
    pub fn right(&self) -> f64 {
        self.position.x + self.width
    }

    /// Bottom edge
    #[must_use]
    pub fn bottom(&self) -> f64 {
        self.position.y + self.height
    }
}

/// Result of a layout pass
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TreeLayout {
    boxes: BTreeMap<NodeId, NodeBox>,
}

impl TreeLayout {
    /// Box for a node
    #[must_use]
    pub fn get(&self, id: &NodeId) -> Option<&NodeBox> {
        self.boxes.get(id)
    }

    /// Position for a node
    #[must_use]
    pub fn position(&self, id: &NodeId) -> Option<Position> {
        self.boxes.get(id).map(|b| b.position)
    }

    /// Number of placed nodes
    #[must_use]
    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    /// Whether nothing was placed
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }

    /// All boxes in id order
    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &NodeBox)> {
        self.boxes.iter()
    }

    /// Horizontal interval covered by the subtree rooted at `id`
    pub fn subtree_span(&self, store: &NodeStore, id: &NodeId) -> Result<(f64, f64), StoreError> {
        let mut left = f64::INFINITY;
        let mut right = f64::NEG_INFINITY;
        for node_id in store.descendants(id)? {
            if let Some(b) = self.boxes.get(&node_id) {
                left = left.min(b.position.x);
                right = right.max(b.right());
            }
        }
        Ok((left, right))
    }

    /// Write every computed position into the store
    pub fn apply(&self, store: &mut NodeStore) -> Result<(), StoreError> {
        for (id, b) in &self.boxes {
            store.update(id, NodePatch::new().position(b.position))?;
        }
        Ok(())
    }
}

/// Computes node positions for a tree
#[derive(Clone, Debug, Default)]
pub struct LayoutEngine {
    config: LayoutConfig,
}

impl LayoutEngine {
    /// Create an engine with the given metrics
    #[must_use]
    pub fn new(config: LayoutConfig) -> Self {
        Self { config }
    }

    /// Get the metrics
    #[must_use]
    pub fn config(&self) -> &LayoutConfig {
        &self.config
    }

    /// Estimated rendered height of a node
    #[must_use]
    pub fn estimate_height(&self, node: &Node) -> f64 {
        self.estimate_text_height(&node.display_text())
    }

    /// Estimated rendered height of a block of Markdown-ish text, chrome included
    #[must_use]
    pub fn estimate_text_height(&self, text: &str) -> f64 {
        let cfg = &self.config;
        let mut height = cfg.chrome_height;

        if text.trim().is_empty() {
            return height + cfg.line_height;
        }

        let mut code_lines: Option<usize> = None;
        for line in text.lines() {
            let trimmed = line.trim_start();

            if trimmed.starts_with("```") {
                code_lines = match code_lines {
                    Some(count) => {
                        height += self.code_block_height(count);
                        None
                    }
                    None => Some(0),
                };
                continue;
            }

            if let Some(count) = code_lines.as_mut() {
                *count += 1;
                continue;
            }

            if trimmed.starts_with('#') {
                height += cfg.line_height + cfg.heading_extra;
            } else {
                height += self.wrapped_lines(line) as f64 * cfg.line_height;
            }
        }

        // Unterminated fence still renders as a code block
        if let Some(count) = code_lines {
            height += self.code_block_height(count);
        }

        height
    }

    fn code_block_height(&self, lines: usize) -> f64 {
        self.config.code_block_padding + lines.max(1) as f64 * self.config.code_line_height
    }

    fn wrapped_lines(&self, line: &str) -> usize {
        let per_line = self.config.chars_per_line.max(1);
        line.chars().count().div_ceil(per_line).max(1)
    }

    /// Lay out every node reachable from `root`
    pub fn layout(&self, store: &NodeStore, root: &NodeId) -> Result<TreeLayout, StoreError> {
        store.try_get(root)?;

        let extents = self.measure(store, root)?;
        let extent = extents.get(root).copied().unwrap_or(self.config.node_width);

        // Shift so the root itself lands exactly on the origin
        let left = self.config.origin.x - (extent - self.config.node_width) / 2.0;
        let layout = self.place(store, root, left, self.config.origin.y, &extents);

        tracing::debug!(root = %root, nodes = layout.len(), "Computed tree layout");
        Ok(layout)
    }

    /// Subtree extents, children before parents
    ///
    /// Walks with an explicit stack so long conversation chains cannot
    /// exhaust the thread stack.
    fn measure(&self, store: &NodeStore, root: &NodeId) -> Result<HashMap<NodeId, f64>, StoreError> {
        let mut extents = HashMap::new();
        let mut visited = HashSet::new();
        // (node, children already queued)
        let mut stack = vec![(root.clone(), false)];

        while let Some((id, expanded)) = stack.pop() {
            let node = store
                .get(&id)
                .ok_or_else(|| StoreError::BrokenLink(id.clone()))?;

            if expanded {
                let gaps = node.children.len().saturating_sub(1) as f64;
                let span = node
                    .children
                    .iter()
                    .filter_map(|c| extents.get(c))
                    .sum::<f64>()
                    + gaps * self.config.horizontal_spacing;
                extents.insert(id, span.max(self.config.node_width));
                continue;
            }

            if !visited.insert(id.clone()) {
                return Err(StoreError::BrokenLink(id));
            }
            stack.push((id, true));
            stack.extend(node.children.iter().rev().map(|c| (c.clone(), false)));
        }

        Ok(extents)
    }

    fn place(
        &self,
        store: &NodeStore,
        root: &NodeId,
        left: f64,
        top: f64,
        extents: &HashMap<NodeId, f64>,
    ) -> TreeLayout {
        let extent_of = |id: &NodeId| extents.get(id).copied().unwrap_or(self.config.node_width);
        let mut layout = TreeLayout::default();
        let mut stack = vec![(root.clone(), left, top)];

        while let Some((id, left, top)) = stack.pop() {
            let Some(node) = store.get(&id) else {
                continue;
            };
            let extent = extent_of(&id);
            let height = self.estimate_height(node);

            let gaps = node.children.len().saturating_sub(1) as f64;
            let span: f64 = node.children.iter().map(extent_of).sum::<f64>()
                + gaps * self.config.horizontal_spacing;
            let mut cursor = left + (extent - span) / 2.0;
            let child_top = top + height + self.config.vertical_spacing;

            let mut children = Vec::with_capacity(node.children.len());
            for child in &node.children {
                children.push((child.clone(), cursor, child_top));
                cursor += extent_of(child) + self.config.horizontal_spacing;
            }
            stack.extend(children.into_iter().rev());

            layout.boxes.insert(
                id,
                NodeBox {
                    position: Position::new(left + (extent - self.config.node_width) / 2.0, top),
                    width: self.config.node_width,
                    height,
                },
            );
        }

        layout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeKind;
    use pretty_assertions::assert_eq;

    fn text_node(text: &str) -> Node {
        Node::new(NodeKind::User {
            content: text.to_string(),
        })
    }

    fn engine() -> LayoutEngine {
        LayoutEngine::new(LayoutConfig::default())
    }

    #[test]
    fn test_root_only_at_origin() {
        let mut store = NodeStore::new();
        let root = store.insert_root(Node::pending_input()).unwrap();

        let layout = engine().layout(&store, &root).unwrap();
        assert_eq!(layout.len(), 1);
        assert_eq!(layout.position(&root), Some(Position::new(0.0, 0.0)));
    }

    #[test]
    fn test_custom_origin() {
        let mut store = NodeStore::new();
        let root = store.insert_root(Node::pending_input()).unwrap();
        store.insert_child(&root, Node::pending_input()).unwrap();
        store.insert_child(&root, Node::pending_input()).unwrap();

        let engine = LayoutEngine::new(LayoutConfig {
            origin: Position::new(100.0, 50.0),
            ..LayoutConfig::default()
        });
        let layout = engine.layout(&store, &root).unwrap();
        assert_eq!(layout.position(&root), Some(Position::new(100.0, 50.0)));
    }

    #[test]
    fn test_height_estimation() {
        let engine = engine();
        let cfg = engine.config().clone();

        assert_eq!(
            engine.estimate_text_height(""),
            cfg.chrome_height + cfg.line_height
        );
        assert_eq!(
            engine.estimate_text_height("one\ntwo"),
            cfg.chrome_height + 2.0 * cfg.line_height
        );
        assert_eq!(
            engine.estimate_text_height("# Title"),
            cfg.chrome_height + cfg.line_height + cfg.heading_extra
        );

        let long_line = "x".repeat(cfg.chars_per_line * 2 + 1);
        assert_eq!(
            engine.estimate_text_height(&long_line),
            cfg.chrome_height + 3.0 * cfg.line_height
        );

        let code = "intro\n```rust\nfn a() {}\nfn b() {}\nfn c() {}\n```";
        assert_eq!(
            engine.estimate_text_height(code),
            cfg.chrome_height
                + cfg.line_height
                + cfg.code_block_padding
                + 3.0 * cfg.code_line_height
        );
    }

    #[test]
    fn test_unterminated_fence_counts_as_code() {
        let engine = engine();
        let cfg = engine.config().clone();
        assert_eq!(
            engine.estimate_text_height("```\na\nb"),
            cfg.chrome_height + cfg.code_block_padding + 2.0 * cfg.code_line_height
        );
    }

    #[test]
    fn test_children_below_parent_and_centered() {
        let mut store = NodeStore::new();
        let root = store.insert_root(text_node("# Heading\nbody")).unwrap();
        let a = store.insert_child(&root, text_node("a")).unwrap();
        let b = store.insert_child(&root, text_node("b")).unwrap();

        let engine = engine();
        let cfg = engine.config().clone();
        let layout = engine.layout(&store, &root).unwrap();

        let root_box = *layout.get(&root).unwrap();
        let a_box = *layout.get(&a).unwrap();
        let b_box = *layout.get(&b).unwrap();

        let expected_top = root_box.bottom() + cfg.vertical_spacing;
        assert_eq!(a_box.position.y, expected_top);
        assert_eq!(b_box.position.y, expected_top);

        let children_center = (a_box.position.x + b_box.right()) / 2.0;
        let root_center = root_box.position.x + root_box.width / 2.0;
        assert!((children_center - root_center).abs() < 1e-9);

        assert_eq!(b_box.position.x - a_box.right(), cfg.horizontal_spacing);
    }

    #[test]
    fn test_sibling_subtrees_do_not_overlap() {
        let mut store = NodeStore::new();
        let root = store.insert_root(text_node("root")).unwrap();
        let a = store.insert_child(&root, text_node("a")).unwrap();
        let b = store.insert_child(&root, text_node("b")).unwrap();
        let c = store.insert_child(&root, text_node("c")).unwrap();
        // Make the middle subtree wide and the left one deep
        for i in 0..4 {
            let child = store.insert_child(&b, text_node(&format!("b{i}"))).unwrap();
            store.insert_child(&child, text_node("leaf")).unwrap();
        }
        let a1 = store.insert_child(&a, text_node("a1")).unwrap();
        store.insert_child(&a1, text_node("a2")).unwrap();
        store.insert_child(&a1, text_node("a3")).unwrap();

        let layout = engine().layout(&store, &root).unwrap();
        assert_eq!(layout.len(), store.len());

        let spans: Vec<_> = [a, b, c]
            .iter()
            .map(|id| layout.subtree_span(&store, id).unwrap())
            .collect();
        for pair in spans.windows(2) {
            assert!(pair[0].1 < pair[1].0, "subtrees overlap: {pair:?}");
        }

        // No two boxes in the same row overlap horizontally
        let boxes: Vec<_> = layout.iter().map(|(_, b)| *b).collect();
        for (i, x) in boxes.iter().enumerate() {
            for y in &boxes[i + 1..] {
                let same_row = x.position.y < y.bottom() && y.position.y < x.bottom();
                let overlap_x = x.position.x < y.right() && y.position.x < x.right();
                assert!(!(same_row && overlap_x), "boxes overlap: {x:?} {y:?}");
            }
        }
    }

    #[test]
    fn test_layout_is_idempotent() {
        let mut store = NodeStore::new();
        let root = store.insert_root(text_node("root")).unwrap();
        let a = store.insert_child(&root, text_node("```\ncode\n```")).unwrap();
        store.insert_child(&a, text_node("x")).unwrap();
        store.insert_child(&root, text_node(&"long ".repeat(40))).unwrap();

        let engine = engine();
        let first = engine.layout(&store, &root).unwrap();
        first.apply(&mut store).unwrap();
        let second = engine.layout(&store, &root).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_long_chain_is_laid_out() {
        let mut store = NodeStore::new();
        let root = store.insert_root(text_node("root")).unwrap();
        let mut chain = vec![root.clone()];
        for i in 0..50_000 {
            let parent = chain.last().unwrap().clone();
            chain.push(store.insert_child(&parent, text_node(&format!("turn {i}"))).unwrap());
        }

        let layout = engine().layout(&store, &root).unwrap();
        assert_eq!(layout.len(), chain.len());
        for pair in chain.windows(2) {
            let parent = layout.get(&pair[0]).unwrap();
            let child = layout.get(&pair[1]).unwrap();
            assert_eq!(child.position.x, 0.0);
            assert!(child.position.y > parent.bottom());
        }
    }

    #[test]
    fn test_missing_root() {
        let store = NodeStore::new();
        let missing = NodeId::from("none");
        assert_eq!(
            engine().layout(&store, &missing).unwrap_err(),
            StoreError::NodeNotFound(missing)
        );
    }
}
