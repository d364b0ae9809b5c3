//! Streaming Reconciler
//!
//! Merges generation chunks into a composite node and settles the node when
//! the generation ends.
//!
//! Merging ([`apply_local`]) only touches in-memory state. Persisting is the
//! caller's job and happens once, after [`settle`] has produced the node's
//! final state.

use serde::{Deserialize, Serialize};

use crate::backend::ChunkKind;
use crate::ids::NodeId;
use crate::node::NodeKind;
use crate::session::Session;
use crate::store::StoreError;

/// Lifecycle of one generation
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationPhase {
    /// Nothing in flight
    #[default]
    Idle,
    /// Chunks are arriving
    Streaming,
    /// The reply finished normally
    Completed,
    /// The user stopped the reply
    Cancelled,
    /// The transport failed
    Failed,
}

impl GenerationPhase {
    /// Whether this phase ends a generation
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    /// Whether a fresh pending-input child follows this phase
    #[must_use]
    pub fn spawns_child(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

/// Append one chunk to the node's reply or reasoning payload
///
/// Non-composite nodes are left unchanged.
pub fn apply_local(
    session: &mut Session,
    node_id: &NodeId,
    kind: ChunkKind,
    text: &str,
) -> Result<(), StoreError> {
    session.nodes.modify(node_id, |node| {
        if let NodeKind::Composite {
            assistant_message,
            thinking,
            ..
        } = &mut node.kind
        {
            let target = match kind {
                ChunkKind::Content => assistant_message,
                ChunkKind::Reasoning => thinking,
            };
            target.get_or_insert_with(String::new).push_str(text);
        }
    })
}

/// Put the node into its final state for a terminal phase
///
/// - `Completed` keeps the merged payloads as they are.
/// - `Cancelled` keeps them and appends `stop_marker` to the reply.
/// - `Failed` discards the reply and the reasoning.
///
/// Returns whether a pending-input child should follow.
pub fn settle(
    session: &mut Session,
    node_id: &NodeId,
    phase: GenerationPhase,
    stop_marker: &str,
) -> Result<bool, StoreError> {
    session.nodes.modify(node_id, |node| {
        if let NodeKind::Composite {
            assistant_message,
            thinking,
            ..
        } = &mut node.kind
        {
            match phase {
                GenerationPhase::Cancelled => {
                    assistant_message
                        .get_or_insert_with(String::new)
                        .push_str(stop_marker);
                }
                GenerationPhase::Failed => {
                    *assistant_message = None;
                    *thinking = None;
                }
                GenerationPhase::Idle | GenerationPhase::Streaming | GenerationPhase::Completed => {}
            }
        }
    })?;
    session.touch();
    Ok(phase.spawns_child())
}
